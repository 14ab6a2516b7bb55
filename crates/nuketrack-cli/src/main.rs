use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nuketrack_storage::Store;
use nuketrack_sync::{Scheduler, SyncConfig};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "nuketrack")]
#[command(about = "US nuclear infrastructure tracker")]
struct Cli {
    /// Overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every source once and send the digest.
    Run,
    /// Run cycles forever on a fixed interval.
    Daemon {
        /// Overrides SCHEDULER_INTERVAL_HOURS.
        #[arg(long)]
        interval_hours: Option<u64>,
    },
    /// Apply database migrations.
    Migrate,
    /// Show recent run logs, newest first.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Show changes not yet notified, or those recorded by one run.
    Changes {
        #[arg(long)]
        run: Option<i64>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = matches!(
        std::env::var("NUKETRACK_LOG_JSON").as_deref(),
        Ok("1" | "true")
    );
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<Store> {
    let store = Store::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    store.migrate().await.context("running migrations")?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let mut scheduler = Scheduler::from_config(&config).await?;
            scheduler.prepare().await?;
            let summary = scheduler.run_cycle().await;
            print_json(&summary)?;
        }
        Commands::Daemon { interval_hours } => {
            if let Some(hours) = interval_hours {
                config.interval_hours = hours;
            }
            let mut scheduler = Scheduler::from_config(&config).await?;
            scheduler.prepare().await?;
            scheduler.run_daemon(config.interval()).await?;
        }
        Commands::Migrate => {
            open_store(&config).await?;
            info!(database_url = %config.database_url, "migrations applied");
        }
        Commands::Runs { limit } => {
            let store = open_store(&config).await?;
            print_json(&store.recent_runs(limit).await?)?;
        }
        Commands::Changes { run } => {
            let store = open_store(&config).await?;
            let changes = match run {
                Some(run_log_id) => store.changes_for_run(run_log_id).await?,
                None => store.pending_changes().await?,
            };
            print_json(&changes)?;
        }
    }

    Ok(())
}
