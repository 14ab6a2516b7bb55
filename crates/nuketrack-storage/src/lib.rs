//! SQLite persistence for the ingestion pipeline: run logs, entity upserts,
//! field-level change records, plus the retrying HTTP fetcher shared by sources.

use std::str::FromStr;

use nuketrack_core::{EntityTable, RunStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::info;

mod changes;
mod http;
mod lookup;
mod runs;
mod upsert;

pub use http::{
    is_transient_error, is_transient_status, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, RetryPolicy, DEFAULT_USER_AGENT,
};
pub use lookup::ReactorRef;
pub use upsert::RecordedUpsert;

pub const CRATE_NAME: &str = "nuketrack-storage";

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("integrity error on {table}: {message}")]
    Integrity { table: String, message: String },
    #[error("run log {0} is not in the started state")]
    RunNotOpen(i64),
    #[error("run log {0} not found")]
    RunNotFound(i64),
    #[error("status `{0}` cannot finish a run")]
    NonTerminalStatus(RunStatus),
    #[error("invalid SQL identifier `{0}`")]
    InvalidIdentifier(String),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, StoreError::Integrity { .. })
    }

    /// Maps constraint violations to [`StoreError::Integrity`], everything else to `Database`.
    pub(crate) fn from_write(table: &EntityTable, err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let integrity = matches!(
                db_err.kind(),
                sqlx::error::ErrorKind::UniqueViolation
                    | sqlx::error::ErrorKind::ForeignKeyViolation
                    | sqlx::error::ErrorKind::NotNullViolation
                    | sqlx::error::ErrorKind::CheckViolation
            );
            if integrity {
                return StoreError::Integrity {
                    table: table.table.to_string(),
                    message: db_err.message().to_string(),
                };
            }
        }
        StoreError::Database(err)
    }
}

/// Handle to the relational store. Cheap to clone; all clones share one pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        info!(database_url, "connected to store");
        Ok(Self { pool })
    }

    /// Private in-memory database, migrated and ready. Used by tests and dry runs.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // a single never-recycled connection keeps the in-memory database alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn validate_identifier(ident: &str) -> Result<(), StoreError> {
    let mut chars = ident.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(ident.to_string()))
    }
}
