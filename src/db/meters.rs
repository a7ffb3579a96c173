//! Meter registry. Deletion is destructive: it cascades to the meter's
//! readings and conservatively re-derives deltas for every session from the
//! earliest affected one onward.

use time::OffsetDateTime;

use crate::domain::Meter;
use crate::error::StoreError;

use super::{from_micros, map_constraint, recalculate_deltas, to_micros, Store};

#[derive(sqlx::FromRow)]
struct MeterRow {
    id: i64,
    name: String,
    unit: Option<String>,
    created_at: i64,
}

fn meter_from_row(row: MeterRow) -> Result<Meter, StoreError> {
    Ok(Meter {
        id: row.id,
        name: row.name,
        unit: row.unit,
        created_at: from_micros(row.created_at)?,
    })
}

impl Store {
    pub async fn meters(&self) -> Result<Vec<Meter>, StoreError> {
        let rows: Vec<MeterRow> = sqlx::query_as(
            "SELECT id, name, unit, created_at FROM meters ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(meter_from_row).collect()
    }

    pub async fn meter(&self, id: i64) -> Result<Meter, StoreError> {
        let row: Option<MeterRow> =
            sqlx::query_as("SELECT id, name, unit, created_at FROM meters WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        meter_from_row(row.ok_or_else(|| StoreError::not_found("meter", id))?)
    }

    /// Register a meter. Names are unique; a duplicate is a conflict.
    pub async fn create_meter(&self, name: &str, unit: Option<&str>) -> Result<Meter, StoreError> {
        let created_at = to_micros(OffsetDateTime::now_utc());
        let inserted = sqlx::query("INSERT INTO meters (name, unit, created_at) VALUES (?1, ?2, ?3)")
            .bind(name)
            .bind(unit)
            .bind(created_at)
            .execute(self.pool())
            .await
            .map_err(|e| {
                map_constraint(e, &format!("meter name {name:?} already exists"), "meter insert")
            })?;

        let id = inserted.last_insert_rowid();
        tracing::info!(meter_id = id, name, "meter created");
        self.meter(id).await
    }

    pub async fn rename_meter(&self, id: i64, name: &str) -> Result<Meter, StoreError> {
        let updated = sqlx::query("UPDATE meters SET name = ?1 WHERE id = ?2")
            .bind(name)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| {
                map_constraint(e, &format!("meter name {name:?} already exists"), "meter update")
            })?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::not_found("meter", id));
        }
        self.meter(id).await
    }

    /// Remove a meter and all its readings, then re-derive deltas for every
    /// session at or after the earliest one that held a reading for it.
    ///
    /// Other meters' chains never referenced the removed readings, so the
    /// sweep cannot change their deltas; recomputation is a pure function of
    /// "nearest earlier reading of the same meter" and is idempotent.
    pub async fn delete_meter(&self, id: i64) -> Result<(), StoreError> {
        self.with_tx(move |conn| {
            Box::pin(async move {
                let first: Option<(i64, i64)> = sqlx::query_as(
                    r#"
                    SELECT s.timestamp, s.id
                    FROM reading_sessions s
                    JOIN readings r ON r.session_id = s.id
                    WHERE r.meter_id = ?1
                    ORDER BY s.timestamp ASC, s.id ASC
                    LIMIT 1
                    "#,
                )
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?;

                let deleted = sqlx::query("DELETE FROM meters WHERE id = ?1")
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
                if deleted.rows_affected() == 0 {
                    return Err(StoreError::not_found("meter", id));
                }

                if let Some((first_ts, first_id)) = first {
                    let affected: Vec<i64> = sqlx::query_scalar(
                        r#"
                        SELECT id
                        FROM reading_sessions
                        WHERE timestamp > ?1 OR (timestamp = ?1 AND id >= ?2)
                        ORDER BY timestamp ASC, id ASC
                        "#,
                    )
                    .bind(first_ts)
                    .bind(first_id)
                    .fetch_all(&mut *conn)
                    .await?;

                    for sid in affected {
                        recalculate_deltas(conn, sid).await?;
                    }
                }

                Ok(())
            })
        })
        .await?;

        metrics::counter!("meters_deleted_total").increment(1);
        tracing::info!(meter_id = id, "meter deleted");
        Ok(())
    }
}
