//! Ingestion sources: each one fetches a public data set and feeds it through
//! the store's upsert and change recording.

use std::sync::Arc;

use async_trait::async_trait;
use nuketrack_core::{EntityTable, Record, RunCounts, UpsertResult};
use nuketrack_storage::{FetchError, HttpFetcher, Store, StoreError};
use thiserror::Error;
use tracing::{debug, warn};

mod decommissioning;
mod html;
mod nrc_events;
mod nrc_reactors;
mod text;
mod trust_funds;
mod uranium;
mod usaspending;

pub use decommissioning::{parse_decommissioning_table, DecommissioningEntry, NrcDecommissioning};
pub use nrc_events::{parse_news_page, NewsItem, NrcEvents};
pub use nrc_reactors::{parse_reactor_table, NrcReactors, OperatingReactor};
pub use trust_funds::{
    find_latest_report, parse_funding_table, NrcTrustFunds, ReportLink, TrustFundEntry,
    NRC_TRUST_FUND_REPORTS_URL,
};
pub use uranium::{parse_spot_prices, SpotPrice, UraniumPrices};
pub use usaspending::{award_payload, parse_awards, ContractAward, UsaSpendingContracts};

pub const CRATE_NAME: &str = "nuketrack-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unexpected page layout: {0}")]
    Layout(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait IngestionSource: Send + Sync {
    /// Stable identifier, recorded as the run log's script name.
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut IngestContext) -> Result<(), SourceError>;
}

/// Per-run handle given to a source. Owns clones of the shared store and
/// fetcher so the run can live on its own task.
#[derive(Debug)]
pub struct IngestContext {
    store: Store,
    http: Arc<HttpFetcher>,
    run_log_id: i64,
    counts: RunCounts,
    changes_recorded: u64,
}

impl IngestContext {
    pub fn new(store: Store, http: Arc<HttpFetcher>, run_log_id: i64) -> Self {
        Self {
            store,
            http,
            run_log_id,
            counts: RunCounts::default(),
            changes_recorded: 0,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn http(&self) -> &HttpFetcher {
        &self.http
    }

    pub fn run_log_id(&self) -> i64 {
        self.run_log_id
    }

    pub fn counts(&self) -> RunCounts {
        self.counts
    }

    pub fn changes_recorded(&self) -> u64 {
        self.changes_recorded
    }

    /// Upserts one record and persists any changed fields against this run.
    ///
    /// Integrity violations only cost the offending record: they are logged,
    /// counted as skipped, and reported as `Ok(None)`. Any other store error
    /// fails the run.
    pub async fn upsert(
        &mut self,
        table: &EntityTable,
        record: &Record,
    ) -> Result<Option<UpsertResult>, SourceError> {
        let recorded = match self
            .store
            .upsert_recording(table, record, Some(self.run_log_id))
            .await
        {
            Ok(recorded) => recorded,
            Err(err) if err.is_integrity() => {
                warn!(
                    table = table.table,
                    natural_key = %record.natural_key,
                    error = %err,
                    "skipping record"
                );
                self.count_skip();
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        self.changes_recorded += recorded.changes.len() as u64;
        self.counts.observe(&recorded.result);
        Ok(Some(recorded.result))
    }

    /// Counts a record that was seen but deliberately not written.
    pub fn skip(&mut self, reason: &str) {
        debug!(run_log_id = self.run_log_id, reason, "record skipped");
        self.count_skip();
    }

    fn count_skip(&mut self) {
        self.counts.processed += 1;
        self.counts.skipped += 1;
    }
}

/// Every production source, in the order a cycle runs them. Reactors come
/// before events so that events can link to dockets seen in the same cycle,
/// and site-producing sources come before trust funds so report names match.
pub fn default_sources() -> Vec<Arc<dyn IngestionSource>> {
    vec![
        Arc::new(NrcReactors::default()),
        Arc::new(NrcDecommissioning::default()),
        Arc::new(UsaSpendingContracts::default()),
        Arc::new(NrcTrustFunds::default()),
        Arc::new(NrcEvents::default()),
        Arc::new(UraniumPrices::default()),
    ]
}
