//! Cycle orchestration: every source once, in order, then one digest.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use nuketrack_core::{RunCounts, RunLog, RunStatus};
use nuketrack_sources::{default_sources, IngestContext, IngestionSource};
use nuketrack_storage::{HttpFetcher, Store};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::notifier::{Notifier, NotifyResult};

/// What the scheduler is doing right now. Starts `Idle`; only [`Scheduler`]
/// changes it. A cycle holds `Running` from its first source until the
/// digest has been handed to the notifier, then goes back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running {
        source: &'static str,
        index: usize,
        total: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source: &'static str,
    /// `None` when the run log could not even be opened; the source was not run.
    pub run_log_id: Option<i64>,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub changes_recorded: u64,
    pub error: Option<String>,
}

impl SourceOutcome {
    fn not_started(source: &'static str, error: String) -> Self {
        Self {
            source,
            run_log_id: None,
            status: RunStatus::Failure,
            counts: RunCounts::default(),
            changes_recorded: 0,
            error: Some(error),
        }
    }

    /// The run as the cycle saw it, for when the stored row is unavailable
    /// or was left unfinished.
    fn as_run_log(&self, started_at: DateTime<Utc>) -> RunLog {
        RunLog {
            id: self.run_log_id.unwrap_or_default(),
            script_name: self.source.to_string(),
            status: self.status,
            started_at,
            finished_at: Some(Utc::now()),
            records_processed: self.counts.processed,
            records_inserted: self.counts.inserted,
            records_updated: self.counts.updated,
            records_skipped: self.counts.skipped,
            error_message: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    pub changes_reported: usize,
    pub notification: NotifyResult,
}

/// One per process. Readers that live elsewhere in the process follow the
/// state through [`Scheduler::subscribe_state`].
pub struct Scheduler {
    store: Store,
    http: Arc<HttpFetcher>,
    sources: Vec<Arc<dyn IngestionSource>>,
    notifier: Notifier,
    stale_run_threshold: Option<chrono::Duration>,
    state: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        http: Arc<HttpFetcher>,
        sources: Vec<Arc<dyn IngestionSource>>,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            http,
            sources,
            notifier,
            stale_run_threshold: None,
            state: watch::Sender::new(SchedulerState::Idle),
        }
    }

    /// Production wiring: the configured store, fetcher, notifier and every
    /// default source.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = Store::connect(&config.database_url)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        let http = HttpFetcher::new(config.http_client_config())?;
        let notifier = Notifier::from_channel(&config.notify)?;
        info!(
            channel = notifier.channel(),
            interval_hours = config.interval_hours,
            "scheduler configured"
        );
        Ok(Self::new(store, Arc::new(http), default_sources(), notifier)
            .with_stale_run_threshold(config.stale_run_threshold()))
    }

    pub fn with_stale_run_threshold(mut self, threshold: Option<chrono::Duration>) -> Self {
        self.stale_run_threshold = threshold;
        self
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Startup work done once per process: migrations, then the orphaned-run
    /// sweep when enabled.
    pub async fn prepare(&self) -> Result<u64> {
        self.store.migrate().await.context("running migrations")?;
        let Some(threshold) = self.stale_run_threshold else {
            return Ok(0);
        };
        self.store
            .fail_stale_runs(threshold)
            .await
            .context("closing orphaned run logs")
    }

    /// Runs every source once in declared order, then sends one digest.
    ///
    /// Nothing a source or the run logger does can stop the cycle: an error,
    /// a panic, or a failed run-log write becomes that source's failure, and
    /// the digest is always attempted.
    pub async fn run_cycle(&mut self) -> CycleSummary {
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("cycle", %cycle_id);
        let total = self.sources.len();
        info!(parent: &span, total, "cycle started");

        let mut outcomes = Vec::with_capacity(total);
        for (index, source) in self.sources.iter().enumerate() {
            self.state.send_replace(SchedulerState::Running {
                source: source.name(),
                index,
                total,
            });
            let outcome = self.run_source(Arc::clone(source)).instrument(span.clone()).await;
            outcomes.push(outcome);
        }

        let summary = self.report(cycle_id, started_at, outcomes).instrument(span).await;
        self.state.send_replace(SchedulerState::Idle);
        summary
    }

    async fn run_source(&self, source: Arc<dyn IngestionSource>) -> SourceOutcome {
        let name = source.name();
        let run_log_id = match self.store.start_run(name).await {
            Ok(id) => id,
            Err(err) => {
                error!(source = name, error = %err, "could not open run log; source skipped");
                return SourceOutcome::not_started(name, format!("could not open run log: {err}"));
            }
        };
        info!(source = name, run_log_id, "source started");

        let mut ctx = IngestContext::new(self.store.clone(), Arc::clone(&self.http), run_log_id);
        let task = tokio::spawn(
            async move {
                let result = source.run(&mut ctx).await;
                (ctx.counts(), ctx.changes_recorded(), result)
            }
            .instrument(info_span!("source", source = name, run_log_id)),
        );

        let (status, counts, changes_recorded, error) = match task.await {
            Ok((counts, changes, Ok(()))) => (RunStatus::Success, counts, changes, None),
            Ok((counts, changes, Err(err))) => {
                (RunStatus::Failure, counts, changes, Some(err.to_string()))
            }
            Err(join_err) => (
                RunStatus::Failure,
                RunCounts::default(),
                0,
                Some(join_error_message(join_err)),
            ),
        };
        let (status, error) = self.close_run(name, run_log_id, status, counts, error).await;

        match &error {
            None => info!(
                source = name,
                run_log_id,
                processed = counts.processed,
                inserted = counts.inserted,
                updated = counts.updated,
                skipped = counts.skipped,
                changes = changes_recorded,
                "source succeeded"
            ),
            Some(message) => error!(source = name, run_log_id, error = %message, "source failed"),
        }

        SourceOutcome {
            source: name,
            run_log_id: Some(run_log_id),
            status,
            counts,
            changes_recorded,
            error,
        }
    }

    /// Finishes the run log. If that write fails the run counts as failed and
    /// one more attempt is made to store it that way; a row that still stays
    /// `started` is left for the startup sweep.
    async fn close_run(
        &self,
        name: &'static str,
        run_log_id: i64,
        status: RunStatus,
        counts: RunCounts,
        error: Option<String>,
    ) -> (RunStatus, Option<String>) {
        let Err(err) = self
            .store
            .finish_run(run_log_id, status, counts, error.as_deref())
            .await
        else {
            return (status, error);
        };
        error!(source = name, run_log_id, error = %err, "could not close run log");

        let message = match error {
            Some(source_error) => format!("{source_error}; closing run log failed: {err}"),
            None => format!("closing run log failed: {err}"),
        };
        if let Err(retry_err) = self
            .store
            .finish_run(run_log_id, RunStatus::Failure, counts, Some(&message))
            .await
        {
            error!(source = name, run_log_id, error = %retry_err, "run log left in started state");
        }
        (RunStatus::Failure, Some(message))
    }

    async fn report(
        &self,
        cycle_id: Uuid,
        started_at: DateTime<Utc>,
        outcomes: Vec<SourceOutcome>,
    ) -> CycleSummary {
        let mut runs: Vec<RunLog> = Vec::with_capacity(outcomes.len());
        for outcome in &outcomes {
            runs.push(self.stored_run(outcome, started_at).await);
        }
        let pending = match self.store.pending_changes().await {
            Ok(pending) => pending,
            Err(err) => {
                error!(error = %err, "could not load pending changes; digest covers runs only");
                Vec::new()
            }
        };

        let notification = self.notifier.notify(&self.store, &runs, &pending).await;

        let succeeded = outcomes.iter().filter(|o| o.status == RunStatus::Success).count();
        let summary = CycleSummary {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            succeeded,
            failed: outcomes.len() - succeeded,
            changes_reported: pending.len(),
            sources: outcomes,
            notification,
        };
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            changes = summary.changes_reported,
            delivered = summary.notification.delivered,
            "cycle finished"
        );
        summary
    }

    async fn stored_run(&self, outcome: &SourceOutcome, started_at: DateTime<Utc>) -> RunLog {
        if let Some(run_log_id) = outcome.run_log_id {
            match self.store.get_run(run_log_id).await {
                Ok(Some(run)) if run.status == outcome.status => return run,
                Ok(_) => warn!(run_log_id, "stored run log does not match the cycle outcome"),
                Err(err) => warn!(run_log_id, error = %err, "could not load run log"),
            }
        }
        outcome.as_run_log(started_at)
    }

    /// Runs a cycle now, then one per `interval` measured start to start. A
    /// cycle that overruns delays the next start; cycles never overlap.
    /// Returns only when `interval` cannot be represented as a deadline.
    pub async fn run_daemon(&mut self, interval: Duration) -> Result<()> {
        if Instant::now().checked_add(interval).is_none() {
            bail!("daemon interval of {}s is out of range", interval.as_secs());
        }
        info!(interval_secs = interval.as_secs(), "daemon started");
        loop {
            let cycle_started = Instant::now();
            let summary = self.run_cycle().await;
            info!(cycle_id = %summary.cycle_id, "daemon cycle complete");

            let Some(next_start) = cycle_started.checked_add(interval) else {
                bail!("daemon interval of {}s is out of range", interval.as_secs());
            };
            if Instant::now() >= next_start {
                warn!("cycle overran the interval; starting the next one immediately");
            } else {
                info!(
                    sleep_secs = (next_start - Instant::now()).as_secs(),
                    "sleeping until next cycle"
                );
            }
            tokio::time::sleep_until(next_start).await;
        }
    }
}

fn join_error_message(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("source task did not complete: {err}");
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("source panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingTransport;
    use async_trait::async_trait;
    use nuketrack_core::{Record, REACTORS};
    use nuketrack_sources::SourceError;
    use nuketrack_storage::HttpClientConfig;
    use std::sync::Mutex;

    /// Upserts one reactor whose status can be changed between cycles.
    struct ReactorFeed {
        name: &'static str,
        docket: &'static str,
        status: Arc<Mutex<&'static str>>,
    }

    #[async_trait]
    impl IngestionSource for ReactorFeed {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, ctx: &mut IngestContext) -> Result<(), SourceError> {
            let status = *self.status.lock().unwrap();
            let record = Record::new(self.docket)
                .with("name", "Test Unit 1")
                .with("status", status);
            ctx.upsert(&REACTORS, &record).await?;
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl IngestionSource for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn run(&self, _ctx: &mut IngestContext) -> Result<(), SourceError> {
            Err(SourceError::Message("upstream returned garbage".into()))
        }
    }

    struct Panicky;

    #[async_trait]
    impl IngestionSource for Panicky {
        fn name(&self) -> &'static str {
            "panicky"
        }

        async fn run(&self, _ctx: &mut IngestContext) -> Result<(), SourceError> {
            panic!("index out of bounds in parser");
        }
    }

    fn feed(name: &'static str, docket: &'static str, status: &Arc<Mutex<&'static str>>) -> Arc<dyn IngestionSource> {
        Arc::new(ReactorFeed {
            name,
            docket,
            status: Arc::clone(status),
        })
    }

    async fn scheduler(sources: Vec<Arc<dyn IngestionSource>>, transport: &RecordingTransport) -> Scheduler {
        let store = Store::connect_in_memory().await.unwrap();
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        Scheduler::new(store, http, sources, Notifier::new(Box::new(transport.clone())))
    }

    #[tokio::test]
    async fn failing_sources_are_isolated_and_notifier_runs_once() {
        let status = Arc::new(Mutex::new("operating"));
        let transport = RecordingTransport::default();
        let mut scheduler = scheduler(
            vec![
                feed("feed-a", "05000001", &status),
                Arc::new(Broken),
                Arc::new(Panicky),
                feed("feed-b", "05000002", &status),
            ],
            &transport,
        )
        .await;
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let summary = scheduler.run_cycle().await;
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(summary.sources.len(), 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(transport.calls(), 1);
        assert_eq!(
            transport.last_subject().as_deref(),
            Some("Nuclear DB: 2/4 sources succeeded, 0 change(s)")
        );

        let runs = scheduler.store().recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 4);
        let by_name = |name: &str| runs.iter().find(|r| r.script_name == name).unwrap().clone();
        assert_eq!(by_name("feed-a").status, RunStatus::Success);
        assert_eq!(by_name("feed-a").records_inserted, 1);
        assert_eq!(by_name("feed-b").status, RunStatus::Success);
        let broken = by_name("broken");
        assert_eq!(broken.status, RunStatus::Failure);
        assert_eq!(broken.error_message.as_deref(), Some("upstream returned garbage"));
        let panicky = by_name("panicky");
        assert_eq!(panicky.status, RunStatus::Failure);
        assert!(panicky
            .error_message
            .unwrap()
            .contains("index out of bounds in parser"));
        assert!(runs.iter().all(|r| r.finished_at.is_some()));
    }

    #[tokio::test]
    async fn status_change_is_reported_then_marked_notified() {
        let status = Arc::new(Mutex::new("operating"));
        let transport = RecordingTransport::default();
        let mut scheduler = scheduler(vec![feed("feed", "NRC-123", &status)], &transport).await;

        let first = scheduler.run_cycle().await;
        assert_eq!(first.changes_reported, 0);

        *status.lock().unwrap() = "extended-outage";
        let second = scheduler.run_cycle().await;
        assert_eq!(second.changes_reported, 1);
        assert!(second.notification.delivered);

        let changes = scheduler
            .store()
            .changes_for_run(second.sources[0].run_log_id.unwrap())
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].entity_type, "reactor");
        assert_eq!(changes[0].field_name, "status");
        assert_eq!(changes[0].old_value.as_deref(), Some("operating"));
        assert_eq!(changes[0].new_value, "extended-outage");
        assert!(scheduler.store().pending_changes().await.unwrap().is_empty());

        let third = scheduler.run_cycle().await;
        assert_eq!(third.changes_reported, 0);
    }

    #[tokio::test]
    async fn undelivered_changes_carry_over_to_next_digest() {
        let status = Arc::new(Mutex::new("operating"));
        let transport = RecordingTransport::default();
        let mut scheduler = scheduler(vec![feed("feed", "NRC-123", &status)], &transport).await;
        scheduler.run_cycle().await;

        *status.lock().unwrap() = "extended-outage";
        transport.set_failing(true);
        let failed = scheduler.run_cycle().await;
        assert!(!failed.notification.delivered);
        assert_eq!(failed.changes_reported, 1);
        assert_eq!(failed.failed, 0);
        let pending = scheduler.store().pending_changes().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].notified);

        transport.set_failing(false);
        let retried = scheduler.run_cycle().await;
        assert!(retried.notification.delivered);
        assert_eq!(retried.changes_reported, 1);
        assert!(transport
            .last_body()
            .unwrap()
            .contains("status changed from 'operating' to 'extended-outage'"));
        assert!(scheduler.store().pending_changes().await.unwrap().is_empty());

        let quiet = scheduler.run_cycle().await;
        assert_eq!(quiet.changes_reported, 0);
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn prepare_sweeps_orphaned_runs_when_enabled() {
        let transport = RecordingTransport::default();
        let scheduler = scheduler(vec![], &transport)
            .await
            .with_stale_run_threshold(Some(chrono::Duration::hours(24)));
        let orphan = scheduler.store().start_run("nrc-reactors").await.unwrap();
        backdate_run(scheduler.store(), orphan).await;

        assert_eq!(scheduler.prepare().await.unwrap(), 1);
        let run = scheduler.store().get_run(orphan).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failure);

        let disabled = scheduler.with_stale_run_threshold(None);
        assert_eq!(disabled.prepare().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_cycle_still_sends_digest() {
        let transport = RecordingTransport::default();
        let mut scheduler = scheduler(vec![], &transport).await;
        let summary = scheduler.run_cycle().await;
        assert_eq!(summary.sources.len(), 0);
        assert_eq!(transport.calls(), 1);
    }

    async fn install_trigger(store: &Store, sql: &str) {
        sqlx::query(sql).execute(store.pool()).await.unwrap();
    }

    #[tokio::test]
    async fn unclosable_run_log_fails_only_that_source() {
        let status = Arc::new(Mutex::new("operating"));
        let transport = RecordingTransport::default();
        let mut scheduler = scheduler(
            vec![feed("feed-a", "05000001", &status), feed("feed-b", "05000002", &status)],
            &transport,
        )
        .await;
        install_trigger(
            scheduler.store(),
            "CREATE TRIGGER stuck_run BEFORE UPDATE ON run_logs WHEN OLD.script_name = 'feed-a' \
             BEGIN SELECT RAISE(ABORT, 'disk hiccup'); END",
        )
        .await;

        let summary = scheduler.run_cycle().await;
        assert_eq!(summary.sources.len(), 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 1);
        let stuck = &summary.sources[0];
        assert_eq!(stuck.status, RunStatus::Failure);
        assert!(stuck.error.as_deref().unwrap().contains("disk hiccup"));
        assert_eq!(summary.sources[1].status, RunStatus::Success);

        assert_eq!(transport.calls(), 1);
        assert_eq!(
            transport.last_subject().as_deref(),
            Some("Nuclear DB: 1/2 sources succeeded, 0 change(s)")
        );
        assert!(transport.last_body().unwrap().contains("- feed-a (run #"));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn unopenable_run_log_skips_the_source_but_not_the_cycle() {
        let status = Arc::new(Mutex::new("operating"));
        let transport = RecordingTransport::default();
        let mut scheduler = scheduler(
            vec![feed("feed-a", "05000001", &status), feed("feed-b", "05000002", &status)],
            &transport,
        )
        .await;
        install_trigger(
            scheduler.store(),
            "CREATE TRIGGER no_runs BEFORE INSERT ON run_logs WHEN NEW.script_name = 'feed-a' \
             BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .await;

        let summary = scheduler.run_cycle().await;
        assert_eq!(summary.sources[0].run_log_id, None);
        assert_eq!(summary.sources[0].status, RunStatus::Failure);
        assert!(summary.sources[0]
            .error
            .as_deref()
            .unwrap()
            .starts_with("could not open run log"));
        assert_eq!(summary.sources[1].status, RunStatus::Success);
        assert_eq!(transport.calls(), 1);

        let runs = scheduler.store().recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].script_name, "feed-b");
    }

    /// Records the scheduler state it observes while running.
    struct StateWatcher {
        state: Arc<Mutex<Option<watch::Receiver<SchedulerState>>>>,
        seen: Arc<Mutex<Vec<SchedulerState>>>,
    }

    #[async_trait]
    impl IngestionSource for StateWatcher {
        fn name(&self) -> &'static str {
            "state-watcher"
        }

        async fn run(&self, _ctx: &mut IngestContext) -> Result<(), SourceError> {
            let current = self.state.lock().unwrap().as_ref().map(|rx| *rx.borrow());
            if let Some(current) = current {
                self.seen.lock().unwrap().push(current);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn state_is_running_for_the_whole_cycle_then_idle() {
        let status = Arc::new(Mutex::new("operating"));
        let receiver = Arc::new(Mutex::new(None));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let transport = RecordingTransport::default();
        let mut scheduler = scheduler(
            vec![
                feed("feed-a", "05000001", &status),
                Arc::new(StateWatcher {
                    state: Arc::clone(&receiver),
                    seen: Arc::clone(&seen),
                }),
            ],
            &transport,
        )
        .await;
        *receiver.lock().unwrap() = Some(scheduler.subscribe_state());
        let mut outside = scheduler.subscribe_state();
        assert_eq!(*outside.borrow_and_update(), SchedulerState::Idle);

        scheduler.run_cycle().await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![SchedulerState::Running {
                source: "state-watcher",
                index: 1,
                total: 2,
            }]
        );
        assert!(outside.has_changed().unwrap());
        assert_eq!(*outside.borrow_and_update(), SchedulerState::Idle);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn daemon_refuses_an_unrepresentable_interval() {
        let transport = RecordingTransport::default();
        let mut scheduler = scheduler(vec![], &transport).await;
        let err = scheduler.run_daemon(Duration::MAX).await.unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
        assert_eq!(transport.calls(), 0);
    }

    async fn backdate_run(store: &Store, run_log_id: i64) {
        sqlx::query("UPDATE run_logs SET started_at = ? WHERE id = ?")
            .bind(Utc::now() - chrono::Duration::hours(48))
            .bind(run_log_id)
            .execute(store.pool())
            .await
            .unwrap();
    }
}
