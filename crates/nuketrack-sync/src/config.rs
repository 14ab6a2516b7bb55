use std::fmt;
use std::time::Duration;

use nuketrack_storage::{HttpClientConfig, DEFAULT_USER_AGENT};
use tracing::warn;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://nuclear.db";
pub const DEFAULT_INTERVAL_HOURS: u64 = 168;
pub const DEFAULT_STALE_RUN_HOURS: u64 = 24;

#[derive(Clone, PartialEq, Eq)]
pub struct EmailSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
}

impl fmt::Debug for EmailSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("from", &self.from)
            .field("to", &self.to)
            .finish()
    }
}

/// The single delivery channel for cycle digests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyChannel {
    Log,
    Email(EmailSettings),
    Webhook { url: String },
}

impl NotifyChannel {
    pub fn name(&self) -> &'static str {
        match self {
            NotifyChannel::Log => "log",
            NotifyChannel::Email(_) => "email",
            NotifyChannel::Webhook { .. } => "webhook",
        }
    }

    /// Resolves `NOTIFY_METHOD` and its settings. A channel whose required
    /// settings are missing falls back to `Log` with a warning.
    fn resolve(get: &impl Fn(&str) -> Option<String>) -> Self {
        let method = get("NOTIFY_METHOD")
            .unwrap_or_else(|| "log".to_string())
            .to_ascii_lowercase();
        match method.as_str() {
            "log" => NotifyChannel::Log,
            "email" => {
                let host = get("SMTP_HOST");
                let from = get("NOTIFY_EMAIL_FROM");
                let to = get("NOTIFY_EMAIL_TO")
                    .map(|raw| {
                        raw.split(',')
                            .map(str::trim)
                            .filter(|addr| !addr.is_empty())
                            .map(str::to_string)
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                match (host, from) {
                    (Some(host), Some(from)) if !to.is_empty() => NotifyChannel::Email(EmailSettings {
                        host,
                        port: get("SMTP_PORT").and_then(|p| p.parse().ok()).unwrap_or(587),
                        username: get("SMTP_USER"),
                        password: get("SMTP_PASSWORD"),
                        from,
                        to,
                    }),
                    _ => {
                        warn!("email notifications need SMTP_HOST, NOTIFY_EMAIL_FROM and NOTIFY_EMAIL_TO; falling back to log");
                        NotifyChannel::Log
                    }
                }
            }
            "slack" | "webhook" => match get("SLACK_WEBHOOK_URL").or_else(|| get("NOTIFY_WEBHOOK_URL")) {
                Some(url) => NotifyChannel::Webhook { url },
                None => {
                    warn!("webhook notifications need SLACK_WEBHOOK_URL; falling back to log");
                    NotifyChannel::Log
                }
            },
            other => {
                warn!(method = other, "unknown NOTIFY_METHOD; falling back to log");
                NotifyChannel::Log
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub interval_hours: u64,
    pub stale_run_hours: u64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub notify: NotifyChannel,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |key: &str, default: u64| {
            get(key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Self {
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            interval_hours: number("SCHEDULER_INTERVAL_HOURS", DEFAULT_INTERVAL_HOURS),
            stale_run_hours: number("NUKETRACK_STALE_RUN_HOURS", DEFAULT_STALE_RUN_HOURS),
            user_agent: get("NUKETRACK_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: number("NUKETRACK_HTTP_TIMEOUT_SECS", 30),
            notify: NotifyChannel::resolve(&get),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours.max(1).saturating_mul(3600))
    }

    /// Age after which a `started` run log is treated as orphaned, or `None`
    /// when the startup sweep is disabled.
    pub fn stale_run_threshold(&self) -> Option<chrono::Duration> {
        match self.stale_run_hours {
            0 => None,
            hours => Some(chrono::Duration::hours(hours as i64)),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}
