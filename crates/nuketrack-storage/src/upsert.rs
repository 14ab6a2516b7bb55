//! Insert-or-update of domain rows identified by a natural key.
//!
//! Comparison lives here, next to the write, so the type-aware equality of
//! [`FieldValue::same_as`] is the single definition of "changed". The diff
//! recorder in `changes.rs` only persists what this module reports.

use chrono::Utc;
use nuketrack_core::{DataChange, EntityTable, FieldChange, FieldValue, Record, UpsertResult};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnection, SqliteRow};
use sqlx::{Row, TypeInfo, ValueRef};
use tracing::debug;

use crate::changes::insert_changes;
use crate::{validate_identifier, Store, StoreError};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

const RESERVED_COLUMNS: [&str; 3] = ["id", "created_at", "updated_at"];

/// An upsert together with the change rows written in the same transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedUpsert {
    pub result: UpsertResult,
    pub changes: Vec<DataChange>,
}

impl Store {
    pub async fn upsert(&self, table: &EntityTable, record: &Record) -> Result<UpsertResult, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = upsert_on(&mut tx, table, record).await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Upsert plus Diff Detector in one transaction: either the row write and
    /// every `data_changes` row for it commit together, or neither does.
    pub async fn upsert_recording(
        &self,
        table: &EntityTable,
        record: &Record,
        run_log_id: Option<i64>,
    ) -> Result<RecordedUpsert, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = upsert_on(&mut tx, table, record).await?;
        let changes = insert_changes(
            &mut tx,
            run_log_id,
            table.entity_type,
            result.entity_id,
            &result.changed_fields,
        )
        .await?;
        tx.commit().await?;
        Ok(RecordedUpsert { result, changes })
    }
}

async fn upsert_on(
    conn: &mut SqliteConnection,
    table: &EntityTable,
    record: &Record,
) -> Result<UpsertResult, StoreError> {
    validate_identifier(table.table)?;
    validate_identifier(table.key_column)?;
    for field in record.fields.keys() {
        validate_identifier(field)?;
        if field == table.key_column || RESERVED_COLUMNS.contains(&field.as_str()) {
            return Err(StoreError::InvalidIdentifier(field.clone()));
        }
    }

    let natural_key = record.natural_key.trim();
    let select = format!("SELECT * FROM {} WHERE {} = ?", table.table, table.key_column);
    let rows = sqlx::query(&select)
        .bind(natural_key)
        .fetch_all(&mut *conn)
        .await?;

    match rows.as_slice() {
        [] => insert_row(conn, table, natural_key, record).await,
        [existing] => update_row(conn, table, natural_key, record, existing).await,
        many => Err(StoreError::Integrity {
            table: table.table.to_string(),
            message: format!(
                "natural key {}={natural_key} matches {} rows",
                table.key_column,
                many.len()
            ),
        }),
    }
}

async fn insert_row(
    conn: &mut SqliteConnection,
    table: &EntityTable,
    natural_key: &str,
    record: &Record,
) -> Result<UpsertResult, StoreError> {
    let present = record
        .fields
        .iter()
        .filter(|(_, value)| !value.is_null())
        .collect::<Vec<_>>();

    let mut columns = vec![table.key_column];
    columns.extend(present.iter().map(|(name, _)| name.as_str()));
    columns.extend(["created_at", "updated_at"]);
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        table.table,
        columns.join(", ")
    );

    let now = Utc::now();
    let mut query = sqlx::query(&sql).bind(natural_key);
    for (_, value) in &present {
        query = bind_value(query, *value);
    }
    let result = query
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::from_write(table, e))?;

    let entity_id = result.last_insert_rowid();
    debug!(table = table.table, natural_key, entity_id, "inserted row");
    Ok(UpsertResult {
        entity_id,
        inserted: true,
        updated: false,
        changed_fields: Vec::new(),
    })
}

async fn update_row(
    conn: &mut SqliteConnection,
    table: &EntityTable,
    natural_key: &str,
    record: &Record,
    existing: &SqliteRow,
) -> Result<UpsertResult, StoreError> {
    let entity_id: i64 = existing.try_get("id")?;

    let mut changed_fields = Vec::new();
    let mut writes = Vec::new();
    for (field, incoming) in &record.fields {
        if incoming.is_null() {
            continue;
        }
        let stored = read_column(existing, field)?;
        if incoming.same_as(&stored) {
            continue;
        }
        changed_fields.push(FieldChange {
            field: field.clone(),
            old: stored.render(),
            new: incoming.render().unwrap_or_default(),
        });
        writes.push((field.as_str(), incoming));
    }

    if writes.is_empty() {
        return Ok(UpsertResult {
            entity_id,
            inserted: false,
            updated: false,
            changed_fields,
        });
    }

    let assignments = writes
        .iter()
        .map(|(field, _)| format!("{field} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE {} SET {assignments}, updated_at = ? WHERE id = ?",
        table.table
    );
    let mut query = sqlx::query(&sql);
    for (_, value) in &writes {
        query = bind_value(query, *value);
    }
    query
        .bind(Utc::now())
        .bind(entity_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::from_write(table, e))?;

    debug!(
        table = table.table,
        natural_key,
        entity_id,
        changed = changed_fields.len(),
        "updated row"
    );
    Ok(UpsertResult {
        entity_id,
        inserted: false,
        updated: true,
        changed_fields,
    })
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &'q FieldValue) -> SqliteQuery<'q> {
    match value {
        FieldValue::Null => query.bind(None::<String>),
        FieldValue::Integer(v) => query.bind(*v),
        FieldValue::Real(v) => query.bind(*v),
        FieldValue::Text(s) => query.bind(s.trim()),
    }
}

/// Reads a column using the storage class of the stored value, not the declared type.
fn read_column(row: &SqliteRow, column: &str) -> Result<FieldValue, sqlx::Error> {
    let raw = row.try_get_raw(column)?;
    if raw.is_null() {
        return Ok(FieldValue::Null);
    }
    let storage_class = raw.type_info().name().to_string();
    match storage_class.as_str() {
        "INTEGER" | "BOOLEAN" => Ok(FieldValue::Integer(row.try_get(column)?)),
        "REAL" => Ok(FieldValue::Real(row.try_get(column)?)),
        _ => Ok(FieldValue::Text(row.try_get(column)?)),
    }
}
