//! Read-side aggregation: range statistics and time-bucketed trends.
//! Stateless over the store; null deltas (first reading in a meter's chain)
//! are excluded from every sum and average.

use std::collections::HashSet;

use time::OffsetDateTime;

use crate::domain::{MeterStatistics, Statistics, TrendBucket, TrendPoint};
use crate::error::StoreError;

use super::{from_micros, to_micros, Store};

#[derive(sqlx::FromRow)]
struct StatsRow {
    total_sessions: i64,
    total_readings: i64,
    total_consumption: f64,
    total_cost: f64,
    avg_consumption: Option<f64>,
    avg_price: Option<f64>,
    min_price: Option<f64>,
    max_price: Option<f64>,
}

/// Bucket key for a UTC timestamp at the given granularity. Weeks follow
/// ISO-8601 week-dates, so the year component is the ISO week-based year.
fn bucket_key(ts: OffsetDateTime, bucket: TrendBucket) -> String {
    let d = ts.date();
    match bucket {
        TrendBucket::Hour => format!(
            "{:04}-{:02}-{:02} {:02}:00",
            d.year(),
            u8::from(d.month()),
            d.day(),
            ts.hour()
        ),
        TrendBucket::Day => format!("{:04}-{:02}-{:02}", d.year(), u8::from(d.month()), d.day()),
        TrendBucket::Week => {
            let (year, week, _) = d.to_iso_week_date();
            format!("{year:04}-W{week:02}")
        }
        TrendBucket::Month => format!("{:04}-{:02}", d.year(), u8::from(d.month())),
    }
}

struct BucketAccum {
    period: String,
    consumption: f64,
    cost: f64,
    price_sum: f64,
    sessions: HashSet<i64>,
    reading_count: i64,
}

impl Store {
    /// Totals and averages across all meters, optionally bounded by session
    /// timestamp (inclusive on both ends).
    pub async fn statistics(
        &self,
        start: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
    ) -> Result<Statistics, StoreError> {
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT
                COUNT(DISTINCT s.id) AS total_sessions,
                COUNT(r.id) AS total_readings,
                COALESCE(SUM(r.delta), 0.0) AS total_consumption,
                COALESCE(SUM(r.delta * s.price), 0.0) AS total_cost,
                AVG(r.delta) AS avg_consumption,
                AVG(s.price) AS avg_price,
                MIN(s.price) AS min_price,
                MAX(s.price) AS max_price
            FROM reading_sessions s
            JOIN readings r ON r.session_id = s.id
            WHERE r.delta IS NOT NULL
              AND (?1 IS NULL OR s.timestamp >= ?1)
              AND (?2 IS NULL OR s.timestamp <= ?2)
            "#,
        )
        .bind(start.map(to_micros))
        .bind(end.map(to_micros))
        .fetch_one(self.pool())
        .await?;

        Ok(Statistics {
            total_sessions: row.total_sessions,
            total_readings: row.total_readings,
            total_consumption: row.total_consumption,
            total_cost: row.total_cost,
            avg_consumption_per_meter: row.avg_consumption,
            avg_price: row.avg_price,
            min_price: row.min_price,
            max_price: row.max_price,
        })
    }

    /// Same shape restricted to one meter's readings, priced through their
    /// session.
    pub async fn meter_statistics(
        &self,
        meter_id: i64,
        start: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
    ) -> Result<MeterStatistics, StoreError> {
        // Distinguish "no such meter" from "meter with no consumption yet".
        self.meter(meter_id).await?;

        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT
                0 AS total_sessions,
                COUNT(r.id) AS total_readings,
                COALESCE(SUM(r.delta), 0.0) AS total_consumption,
                COALESCE(SUM(r.delta * s.price), 0.0) AS total_cost,
                AVG(r.delta) AS avg_consumption,
                AVG(s.price) AS avg_price,
                MIN(s.price) AS min_price,
                MAX(s.price) AS max_price
            FROM readings r
            JOIN reading_sessions s ON r.session_id = s.id
            WHERE r.meter_id = ?1
              AND r.delta IS NOT NULL
              AND (?2 IS NULL OR s.timestamp >= ?2)
              AND (?3 IS NULL OR s.timestamp <= ?3)
            "#,
        )
        .bind(meter_id)
        .bind(start.map(to_micros))
        .bind(end.map(to_micros))
        .fetch_one(self.pool())
        .await?;

        Ok(MeterStatistics {
            total_readings: row.total_readings,
            total_consumption: row.total_consumption,
            total_cost: row.total_cost,
            avg_consumption: row.avg_consumption,
            avg_price: row.avg_price,
            min_price: row.min_price,
            max_price: row.max_price,
        })
    }

    /// Consumption trend bucketed at the given granularity, most-recent-first,
    /// capped at `limit` buckets.
    ///
    /// Bucketing happens here rather than in SQL so the week scheme is
    /// explicit (ISO-8601) instead of whatever the datastore's formatter
    /// picks. Rows arrive in descending session order, and truncation is
    /// monotone, so each bucket is a contiguous run of rows.
    pub async fn trend(&self, bucket: TrendBucket, limit: u32) -> Result<Vec<TrendPoint>, StoreError> {
        let rows: Vec<(i64, i64, f64, f64)> = sqlx::query_as(
            r#"
            SELECT s.id, s.timestamp, r.delta, s.price
            FROM reading_sessions s
            JOIN readings r ON r.session_id = s.id
            WHERE r.delta IS NOT NULL
            ORDER BY s.timestamp DESC, s.id DESC
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        let mut buckets: Vec<BucketAccum> = Vec::new();
        for (session_id, ts_us, delta, price) in rows {
            let period = bucket_key(from_micros(ts_us)?, bucket);
            match buckets.last_mut() {
                Some(b) if b.period == period => {
                    b.consumption += delta;
                    b.cost += delta * price;
                    b.price_sum += price;
                    b.sessions.insert(session_id);
                    b.reading_count += 1;
                }
                _ => {
                    if buckets.len() as u32 == limit {
                        break;
                    }
                    buckets.push(BucketAccum {
                        period,
                        consumption: delta,
                        cost: delta * price,
                        price_sum: price,
                        sessions: HashSet::from([session_id]),
                        reading_count: 1,
                    });
                }
            }
        }

        Ok(buckets
            .into_iter()
            .map(|b| TrendPoint {
                period: b.period,
                consumption: b.consumption,
                cost: b.cost,
                avg_price: b.price_sum / b.reading_count as f64,
                session_count: b.sessions.len() as i64,
                reading_count: b.reading_count,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn bucket_keys_truncate_per_granularity() {
        let ts = datetime!(2024-03-07 14:35:12 UTC);
        assert_eq!(bucket_key(ts, TrendBucket::Hour), "2024-03-07 14:00");
        assert_eq!(bucket_key(ts, TrendBucket::Day), "2024-03-07");
        assert_eq!(bucket_key(ts, TrendBucket::Week), "2024-W10");
        assert_eq!(bucket_key(ts, TrendBucket::Month), "2024-03");
    }

    #[test]
    fn week_bucket_uses_iso_week_year() {
        // 2024-12-30 is a Monday belonging to ISO week 1 of 2025.
        let ts = datetime!(2024-12-30 08:00:00 UTC);
        assert_eq!(bucket_key(ts, TrendBucket::Week), "2025-W01");
    }
}
