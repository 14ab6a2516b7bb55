//! Scheduled ingestion cycles and their change digests.

mod config;
mod notifier;
mod scheduler;
#[cfg(test)]
mod test_support;

pub use config::{
    EmailSettings, NotifyChannel, SyncConfig, DEFAULT_DATABASE_URL, DEFAULT_INTERVAL_HOURS,
    DEFAULT_STALE_RUN_HOURS,
};
pub use notifier::{
    Digest, EmailTransport, LogTransport, Notifier, NotifyResult, Transport, WebhookTransport,
};
pub use scheduler::{CycleSummary, Scheduler, SchedulerState, SourceOutcome};

pub const CRATE_NAME: &str = "nuketrack-sync";
