//! Session store and delta maintenance.
//!
//! Sessions are totally ordered by `(timestamp, id)`; "previous" and "next"
//! always mean that order. Every reading's delta is the difference from the
//! nearest strictly-earlier reading of the same meter, so any mutation that
//! inserts, moves, or removes a reading re-derives the chain downstream of
//! the change. Cascades are iterative ascending scans inside one
//! transaction; a failure at any step rolls the whole mutation back.

use sqlx::SqliteConnection;
use time::OffsetDateTime;

use crate::domain::{Reading, ReadingInput, Session, SessionDetails};
use crate::error::StoreError;

use super::{from_micros, map_constraint, to_micros, Store};

/// Value of the nearest strictly-earlier reading for a meter, under the
/// `(timestamp, id)` session order.
async fn previous_value(
    conn: &mut SqliteConnection,
    meter_id: i64,
    ts_us: i64,
    session_id: i64,
) -> Result<Option<f64>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT r.value
        FROM readings r
        JOIN reading_sessions s ON r.session_id = s.id
        WHERE r.meter_id = ?1
          AND (s.timestamp < ?2 OR (s.timestamp = ?2 AND s.id < ?3))
        ORDER BY s.timestamp DESC, s.id DESC
        LIMIT 1
        "#,
    )
    .bind(meter_id)
    .bind(ts_us)
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await
}

/// Id of the single nearest later session, if any.
async fn next_session(
    conn: &mut SqliteConnection,
    ts_us: i64,
    session_id: i64,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT id
        FROM reading_sessions
        WHERE timestamp > ?1 OR (timestamp = ?1 AND id > ?2)
        ORDER BY timestamp ASC, id ASC
        LIMIT 1
        "#,
    )
    .bind(ts_us)
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await
}

async fn ensure_meter_exists(conn: &mut SqliteConnection, meter_id: i64) -> Result<(), StoreError> {
    let known: Option<i64> = sqlx::query_scalar("SELECT id FROM meters WHERE id = ?1")
        .bind(meter_id)
        .fetch_optional(&mut *conn)
        .await?;
    if known.is_none() {
        return Err(StoreError::InvalidReference(format!(
            "reading references unknown meter {meter_id}"
        )));
    }
    Ok(())
}

/// Re-derive every delta in the given session from the current table state.
///
/// Pure function of "nearest earlier reading per meter": idempotent, touches
/// only the target session's readings, and a no-op for a vanished session.
pub(crate) async fn recalculate_deltas(
    conn: &mut SqliteConnection,
    session_id: i64,
) -> Result<(), StoreError> {
    let ts_us: Option<i64> = sqlx::query_scalar("SELECT timestamp FROM reading_sessions WHERE id = ?1")
        .bind(session_id)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(ts_us) = ts_us else {
        return Ok(());
    };

    let readings: Vec<(i64, f64)> =
        sqlx::query_as("SELECT meter_id, value FROM readings WHERE session_id = ?1")
            .bind(session_id)
            .fetch_all(&mut *conn)
            .await?;

    for (meter_id, value) in readings {
        let prev = previous_value(conn, meter_id, ts_us, session_id).await?;
        let delta = prev.map(|p| value - p);
        sqlx::query("UPDATE readings SET delta = ?1 WHERE session_id = ?2 AND meter_id = ?3")
            .bind(delta)
            .bind(session_id)
            .bind(meter_id)
            .execute(&mut *conn)
            .await?;
    }

    metrics::counter!("delta_recalculations_total").increment(1);
    tracing::debug!(session_id, "recalculated session deltas");
    Ok(())
}

/// Reject empty sets and duplicate meters before touching the database.
fn check_reading_set(readings: &[ReadingInput]) -> Result<(), StoreError> {
    if readings.is_empty() {
        return Err(StoreError::InvalidReference(
            "session requires at least one reading".to_string(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for r in readings {
        if !seen.insert(r.meter_id) {
            return Err(StoreError::Conflict(format!(
                "duplicate meter {} in reading set",
                r.meter_id
            )));
        }
    }
    Ok(())
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: i64,
    price: f64,
    notes: Option<String>,
    timestamp: i64,
    meter_count: i64,
    total_delta: f64,
    total_cost: f64,
}

const SESSION_AGGREGATE_COLS: &str = r#"
    s.id, s.price, s.notes, s.timestamp,
    COUNT(r.id) AS meter_count,
    COALESCE(SUM(r.delta), 0.0) AS total_delta,
    COALESCE(SUM(r.delta * s.price), 0.0) AS total_cost
"#;

impl Store {
    /// Create a session plus one reading per listed meter, then relink the
    /// nearest later session, all in one transaction.
    pub async fn create_session(
        &self,
        price: f64,
        readings: Vec<ReadingInput>,
        notes: Option<String>,
        timestamp: Option<OffsetDateTime>,
    ) -> Result<SessionDetails, StoreError> {
        check_reading_set(&readings)?;
        let ts_us = to_micros(timestamp.unwrap_or_else(OffsetDateTime::now_utc));

        let session_id = self
            .with_tx(move |conn| {
                Box::pin(async move {
                    let inserted =
                        sqlx::query("INSERT INTO reading_sessions (price, notes, timestamp) VALUES (?1, ?2, ?3)")
                            .bind(price)
                            .bind(notes.as_deref())
                            .bind(ts_us)
                            .execute(&mut *conn)
                            .await?;
                    let session_id = inserted.last_insert_rowid();

                    for r in &readings {
                        ensure_meter_exists(conn, r.meter_id).await?;
                        let prev = previous_value(conn, r.meter_id, ts_us, session_id).await?;
                        sqlx::query(
                            "INSERT INTO readings (session_id, meter_id, value, delta) VALUES (?1, ?2, ?3, ?4)",
                        )
                        .bind(session_id)
                        .bind(r.meter_id)
                        .bind(r.value)
                        .bind(prev.map(|p| r.value - p))
                        .execute(&mut *conn)
                        .await
                        .map_err(|e| {
                            map_constraint(
                                e,
                                "duplicate meter in reading set",
                                "reading references unknown meter",
                            )
                        })?;
                    }

                    // Inserting in the middle of the series changes the next
                    // session's "previous reading" per affected meter.
                    if let Some(next) = next_session(conn, ts_us, session_id).await? {
                        recalculate_deltas(conn, next).await?;
                    }

                    Ok(session_id)
                })
            })
            .await?;

        metrics::counter!("sessions_created_total").increment(1);
        tracing::info!(session_id, "session created");
        self.session(session_id).await
    }

    /// Core primitive exposed on the store: re-derive one session's deltas
    /// from current table state, in its own transaction.
    pub async fn recalculate_session(&self, session_id: i64) -> Result<(), StoreError> {
        self.with_tx(move |conn| Box::pin(async move { recalculate_deltas(conn, session_id).await }))
            .await
    }

    /// Rewrite a session's price, notes, readings, and optionally its
    /// timestamp. Moving the timestamp re-derives every session from the
    /// earlier of the two positions onward, in ascending order.
    pub async fn update_session(
        &self,
        id: i64,
        price: f64,
        readings: Vec<ReadingInput>,
        notes: Option<String>,
        timestamp: Option<OffsetDateTime>,
    ) -> Result<SessionDetails, StoreError> {
        check_reading_set(&readings)?;
        let new_ts = timestamp.map(to_micros);

        self.with_tx(move |conn| {
            Box::pin(async move {
                let old_ts: Option<i64> =
                    sqlx::query_scalar("SELECT timestamp FROM reading_sessions WHERE id = ?1")
                        .bind(id)
                        .fetch_optional(&mut *conn)
                        .await?;
                let old_ts = old_ts.ok_or_else(|| StoreError::not_found("session", id))?;
                let ts_us = new_ts.unwrap_or(old_ts);

                sqlx::query(
                    "UPDATE reading_sessions SET price = ?1, notes = ?2, timestamp = ?3 WHERE id = ?4",
                )
                .bind(price)
                .bind(notes.as_deref())
                .bind(ts_us)
                .bind(id)
                .execute(&mut *conn)
                .await?;

                for r in &readings {
                    ensure_meter_exists(conn, r.meter_id).await?;
                    let prev = previous_value(conn, r.meter_id, ts_us, id).await?;
                    sqlx::query(
                        r#"
                        INSERT INTO readings (session_id, meter_id, value, delta)
                        VALUES (?1, ?2, ?3, ?4)
                        ON CONFLICT (session_id, meter_id)
                        DO UPDATE SET value = excluded.value, delta = excluded.delta
                        "#,
                    )
                    .bind(id)
                    .bind(r.meter_id)
                    .bind(r.value)
                    .bind(prev.map(|p| r.value - p))
                    .execute(&mut *conn)
                    .await?;
                }

                if ts_us != old_ts {
                    // Nearest-neighbor relationships may have shifted for any
                    // session between the old and new positions; this session
                    // itself was already recomputed directly above.
                    let affected: Vec<i64> = sqlx::query_scalar(
                        "SELECT id FROM reading_sessions WHERE timestamp >= ?1 AND id != ?2 ORDER BY timestamp ASC, id ASC",
                    )
                    .bind(old_ts.min(ts_us))
                    .bind(id)
                    .fetch_all(&mut *conn)
                    .await?;

                    metrics::histogram!("delta_cascade_sessions").record(affected.len() as f64);
                    for sid in affected {
                        recalculate_deltas(conn, sid).await?;
                    }
                } else if let Some(next) = next_session(conn, ts_us, id).await? {
                    recalculate_deltas(conn, next).await?;
                }

                Ok(())
            })
        })
        .await?;

        tracing::info!(session_id = id, "session updated");
        self.session(id).await
    }

    /// Delete a session and relink the nearest later session across the gap:
    /// each of its readings re-derives from the nearest surviving earlier
    /// reading, dropping to null when it is now first in its meter's chain.
    pub async fn delete_session(&self, id: i64) -> Result<(), StoreError> {
        self.with_tx(move |conn| {
            Box::pin(async move {
                let ts_us: Option<i64> =
                    sqlx::query_scalar("SELECT timestamp FROM reading_sessions WHERE id = ?1")
                        .bind(id)
                        .fetch_optional(&mut *conn)
                        .await?;
                let ts_us = ts_us.ok_or_else(|| StoreError::not_found("session", id))?;

                sqlx::query("DELETE FROM reading_sessions WHERE id = ?1")
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;

                if let Some(next) = next_session(conn, ts_us, id).await? {
                    recalculate_deltas(conn, next).await?;
                }

                Ok(())
            })
        })
        .await?;

        metrics::counter!("sessions_deleted_total").increment(1);
        tracing::info!(session_id = id, "session deleted");
        Ok(())
    }

    pub async fn session(&self, id: i64) -> Result<SessionDetails, StoreError> {
        let sql = format!(
            r#"
            SELECT {SESSION_AGGREGATE_COLS}
            FROM reading_sessions s
            LEFT JOIN readings r ON r.session_id = s.id
            WHERE s.id = ?1
            GROUP BY s.id
            "#
        );
        let row: Option<SessionRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        let row = row.ok_or_else(|| StoreError::not_found("session", id))?;
        self.details_from_row(row).await
    }

    /// Sessions most-recent-first, with readings and aggregates.
    pub async fn sessions(&self, limit: u32, offset: u32) -> Result<Vec<SessionDetails>, StoreError> {
        let sql = format!(
            r#"
            SELECT {SESSION_AGGREGATE_COLS}
            FROM reading_sessions s
            LEFT JOIN readings r ON r.session_id = s.id
            GROUP BY s.id
            ORDER BY s.timestamp DESC, s.id DESC
            LIMIT ?1 OFFSET ?2
            "#
        );
        let rows: Vec<SessionRow> = sqlx::query_as(&sql)
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(self.pool())
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(self.details_from_row(row).await?);
        }
        Ok(out)
    }

    async fn details_from_row(&self, row: SessionRow) -> Result<SessionDetails, StoreError> {
        let readings: Vec<Reading> = sqlx::query_as(
            r#"
            SELECT r.id, r.session_id, r.meter_id, r.value, r.delta,
                   m.name AS meter_name, m.unit AS meter_unit
            FROM readings r
            JOIN meters m ON m.id = r.meter_id
            WHERE r.session_id = ?1
            ORDER BY m.name ASC
            "#,
        )
        .bind(row.id)
        .fetch_all(self.pool())
        .await?;

        Ok(SessionDetails {
            session: Session {
                id: row.id,
                price: row.price,
                notes: row.notes,
                timestamp: from_micros(row.timestamp)?,
            },
            meter_count: row.meter_count,
            total_delta: row.total_delta,
            total_cost: row.total_cost,
            readings,
        })
    }
}
