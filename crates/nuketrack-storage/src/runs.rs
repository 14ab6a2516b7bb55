use chrono::{DateTime, Duration, Utc};
use nuketrack_core::{RunCounts, RunLog, RunStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{info, warn};

use crate::{Store, StoreError};

const RUN_COLUMNS: &str = "id, script_name, status, started_at, finished_at, records_processed, \
     records_inserted, records_updated, records_skipped, error_message";

pub(crate) const ORPHANED_RUN_MESSAGE: &str =
    "orphaned: process exited before the run was finished";

impl Store {
    /// Opens a run log in the `started` state and returns its id.
    pub async fn start_run(&self, script_name: &str) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO run_logs (script_name, status, started_at) VALUES (?, 'started', ?)",
        )
        .bind(script_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Closes a started run. A run can only be finished once.
    pub async fn finish_run(
        &self,
        run_log_id: i64,
        status: RunStatus,
        counts: RunCounts,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::NonTerminalStatus(status));
        }
        let result = sqlx::query(
            r#"
            UPDATE run_logs
               SET status = ?,
                   finished_at = ?,
                   records_processed = ?,
                   records_inserted = ?,
                   records_updated = ?,
                   records_skipped = ?,
                   error_message = ?
             WHERE id = ?
               AND status = 'started'
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(counts.processed as i64)
        .bind(counts.inserted as i64)
        .bind(counts.updated as i64)
        .bind(counts.skipped as i64)
        .bind(error_message)
        .bind(run_log_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_run(run_log_id).await? {
                Some(_) => Err(StoreError::RunNotOpen(run_log_id)),
                None => Err(StoreError::RunNotFound(run_log_id)),
            };
        }
        Ok(())
    }

    pub async fn get_run(&self, run_log_id: i64) -> Result<Option<RunLog>, StoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM run_logs WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(run_log_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_log_from_row).transpose().map_err(Into::into)
    }

    /// Most recent runs first.
    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<RunLog>, StoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM run_logs ORDER BY id DESC LIMIT ?");
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_log_from_row).collect::<Result<_, _>>().map_err(Into::into)
    }

    /// Marks `started` runs older than `older_than` as failed. Returns how many were closed.
    pub async fn fail_stale_runs(&self, older_than: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - older_than;
        let rows = sqlx::query("SELECT id, script_name, started_at FROM run_logs WHERE status = 'started'")
            .fetch_all(&self.pool)
            .await?;

        let mut closed = 0;
        for row in rows {
            let started_at: DateTime<Utc> = row.try_get("started_at")?;
            if started_at >= cutoff {
                continue;
            }
            let id: i64 = row.try_get("id")?;
            let script_name: String = row.try_get("script_name")?;
            match self
                .finish_run(id, RunStatus::Failure, RunCounts::default(), Some(ORPHANED_RUN_MESSAGE))
                .await
            {
                Ok(()) => {
                    warn!(run_log_id = id, script_name, %started_at, "closed orphaned run log");
                    closed += 1;
                }
                // finished concurrently by its owner between the select and the update
                Err(StoreError::RunNotOpen(_)) => {}
                Err(err) => return Err(err),
            }
        }
        if closed > 0 {
            info!(closed, "stale run sweep complete");
        }
        Ok(closed)
    }
}

fn run_log_from_row(row: &SqliteRow) -> Result<RunLog, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<RunStatus>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    Ok(RunLog {
        id: row.try_get("id")?,
        script_name: row.try_get("script_name")?,
        status,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        records_processed: row.try_get::<i64, _>("records_processed")?.max(0) as u64,
        records_inserted: row.try_get::<i64, _>("records_inserted")?.max(0) as u64,
        records_updated: row.try_get::<i64, _>("records_updated")?.max(0) as u64,
        records_skipped: row.try_get::<i64, _>("records_skipped")?.max(0) as u64,
        error_message: row.try_get("error_message")?,
    })
}
