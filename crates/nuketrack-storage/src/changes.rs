use chrono::Utc;
use nuketrack_core::{DataChange, FieldChange};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use crate::{Store, StoreError};

const CHANGE_COLUMNS: &str = "id, run_log_id, entity_type, entity_id, field_name, old_value, \
     new_value, detected_at, notified";

// Stays well under SQLite's bound-parameter limit.
const MARK_CHUNK: usize = 500;

impl Store {
    /// Persists the field changes reported by an upsert. No comparison happens here.
    pub async fn record_changes(
        &self,
        run_log_id: Option<i64>,
        entity_type: &str,
        entity_id: i64,
        changes: &[FieldChange],
    ) -> Result<Vec<DataChange>, StoreError> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let recorded = insert_changes(&mut tx, run_log_id, entity_type, entity_id, changes).await?;
        tx.commit().await?;
        Ok(recorded)
    }

    /// Every change not yet covered by a successful notification, oldest first.
    pub async fn pending_changes(&self) -> Result<Vec<DataChange>, StoreError> {
        let sql = format!("SELECT {CHANGE_COLUMNS} FROM data_changes WHERE notified = 0 ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(data_change_from_row).collect::<Result<_, _>>().map_err(Into::into)
    }

    pub async fn changes_for_run(&self, run_log_id: i64) -> Result<Vec<DataChange>, StoreError> {
        let sql = format!("SELECT {CHANGE_COLUMNS} FROM data_changes WHERE run_log_id = ? ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(run_log_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(data_change_from_row).collect::<Result<_, _>>().map_err(Into::into)
    }

    /// Flips `notified` for the given changes in one transaction. Already-notified
    /// rows are left alone, so the returned count only covers real transitions.
    pub async fn mark_notified(&self, change_ids: &[i64]) -> Result<u64, StoreError> {
        if change_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut flipped = 0;
        for chunk in change_ids.chunks(MARK_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "UPDATE data_changes SET notified = 1 WHERE notified = 0 AND id IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(*id);
            }
            flipped += query.execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(flipped)
    }
}

/// Writes change rows on the caller's connection, so an upsert can record its
/// changes inside its own transaction.
pub(crate) async fn insert_changes(
    conn: &mut SqliteConnection,
    run_log_id: Option<i64>,
    entity_type: &str,
    entity_id: i64,
    changes: &[FieldChange],
) -> Result<Vec<DataChange>, StoreError> {
    let detected_at = Utc::now();
    let mut recorded = Vec::with_capacity(changes.len());
    for change in changes {
        let result = sqlx::query(
            r#"
            INSERT INTO data_changes
                (run_log_id, entity_type, entity_id, field_name, old_value, new_value, detected_at, notified)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(run_log_id)
        .bind(entity_type)
        .bind(entity_id)
        .bind(&change.field)
        .bind(change.old.as_deref())
        .bind(&change.new)
        .bind(detected_at)
        .execute(&mut *conn)
        .await?;

        recorded.push(DataChange {
            id: result.last_insert_rowid(),
            run_log_id,
            entity_type: entity_type.to_string(),
            entity_id,
            field_name: change.field.clone(),
            old_value: change.old.clone(),
            new_value: change.new.clone(),
            detected_at,
            notified: false,
        });
    }
    Ok(recorded)
}

fn data_change_from_row(row: &SqliteRow) -> Result<DataChange, sqlx::Error> {
    Ok(DataChange {
        id: row.try_get("id")?,
        run_log_id: row.try_get("run_log_id")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        field_name: row.try_get("field_name")?,
        old_value: row.try_get("old_value")?,
        new_value: row.try_get("new_value")?,
        detected_at: row.try_get("detected_at")?,
        notified: row.try_get("notified")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nuketrack_core::{Record, REACTORS};

    fn status_change(old: &str, new: &str) -> FieldChange {
        FieldChange {
            field: "status".into(),
            old: Some(old.into()),
            new: new.into(),
        }
    }

    #[tokio::test]
    async fn changes_are_recorded_against_the_run() {
        let store = Store::connect_in_memory().await.unwrap();
        let run = store.start_run("nrc-reactors").await.unwrap();

        let recorded = store
            .record_changes(Some(run), "reactor", 7, &[status_change("operating", "extended-outage")])
            .await
            .unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(!recorded[0].notified);

        let stored = store.changes_for_run(run).await.unwrap();
        assert_eq!(stored, recorded);
        assert_eq!(stored[0].field_name, "status");
        assert_eq!(stored[0].old_value.as_deref(), Some("operating"));
        assert_eq!(stored[0].new_value, "extended-outage");
    }

    #[tokio::test]
    async fn empty_change_list_writes_nothing() {
        let store = Store::connect_in_memory().await.unwrap();
        let recorded = store.record_changes(None, "site", 1, &[]).await.unwrap();
        assert!(recorded.is_empty());
        assert!(store.pending_changes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_notified_flips_each_change_once() {
        let store = Store::connect_in_memory().await.unwrap();
        let recorded = store
            .record_changes(
                None,
                "reactor",
                1,
                &[status_change("a", "b"), status_change("b", "c")],
            )
            .await
            .unwrap();
        let ids = recorded.iter().map(|c| c.id).collect::<Vec<_>>();

        assert_eq!(store.pending_changes().await.unwrap().len(), 2);
        assert_eq!(store.mark_notified(&ids).await.unwrap(), 2);
        assert!(store.pending_changes().await.unwrap().is_empty());
        assert_eq!(store.mark_notified(&ids).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn change_survives_run_log_deletion() {
        let store = Store::connect_in_memory().await.unwrap();
        let run = store.start_run("nrc-reactors").await.unwrap();
        store
            .record_changes(Some(run), "reactor", 1, &[status_change("a", "b")])
            .await
            .unwrap();

        sqlx::query("DELETE FROM run_logs WHERE id = ?")
            .bind(run)
            .execute(store.pool())
            .await
            .unwrap();

        let pending = store.pending_changes().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].run_log_id, None);
    }

    #[tokio::test]
    async fn upsert_output_feeds_the_recorder() {
        let store = Store::connect_in_memory().await.unwrap();
        let run = store.start_run("nrc-reactors").await.unwrap();
        let base = Record::new("NRC-123").with("name", "Test Unit 1");

        let first = store
            .upsert(&REACTORS, &base.clone().with("status", "operating"))
            .await
            .unwrap();
        let none = store
            .record_changes(Some(run), REACTORS.entity_type, first.entity_id, &first.changed_fields)
            .await
            .unwrap();
        assert!(none.is_empty());

        let second = store
            .upsert(&REACTORS, &base.with("status", "extended-outage"))
            .await
            .unwrap();
        let recorded = store
            .record_changes(Some(run), REACTORS.entity_type, second.entity_id, &second.changed_fields)
            .await
            .unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].entity_type, "reactor");
        assert_eq!(recorded[0].entity_id, first.entity_id);
    }
}
