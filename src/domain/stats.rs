/// Aggregates over all meters in a timestamp range.
///
/// Readings whose delta is still null (first in their meter's chain) are
/// excluded from every sum and average.
#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    pub total_sessions: i64,
    pub total_readings: i64,
    pub total_consumption: f64,
    pub total_cost: f64,
    pub avg_consumption_per_meter: Option<f64>,
    pub avg_price: Option<f64>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
}

/// Same shape restricted to a single meter, priced through its sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterStatistics {
    pub total_readings: i64,
    pub total_consumption: f64,
    pub total_cost: f64,
    pub avg_consumption: Option<f64>,
    pub avg_price: Option<f64>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
}

/// Granularity for trend bucketing. Weeks use ISO-8601 week-dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendBucket {
    Hour,
    Day,
    Week,
    Month,
}

/// One time bucket of the consumption trend, most-recent-first in results.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendPoint {
    pub period: String,
    pub consumption: f64,
    pub cost: f64,
    pub avg_price: f64,
    pub session_count: i64,
    pub reading_count: i64,
}
