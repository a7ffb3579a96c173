use time::OffsetDateTime;

/// One snapshot in time across the tracked meters, sharing one price.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: i64,
    /// Cost rate in monetary units per unit of consumption.
    pub price: f64,
    pub notes: Option<String>,
    pub timestamp: OffsetDateTime,
}

/// One meter's counter value within one session, joined with meter details.
///
/// `delta` is consumption since the chronologically previous reading of the
/// same meter, or `None` when no earlier reading exists.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Reading {
    pub id: i64,
    pub session_id: i64,
    pub meter_id: i64,
    pub value: f64,
    pub delta: Option<f64>,
    pub meter_name: String,
    pub meter_unit: Option<String>,
}

impl Reading {
    /// Cost is derived, never stored.
    pub fn cost(&self, price: f64) -> Option<f64> {
        self.delta.map(|d| d * price)
    }
}

/// Input pair for session create/update.
#[derive(Debug, Clone, Copy)]
pub struct ReadingInput {
    pub meter_id: i64,
    pub value: f64,
}

/// A session with its readings and per-session aggregates.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDetails {
    pub session: Session,
    pub meter_count: i64,
    /// Sum of member deltas; 0 when every member delta is still null.
    pub total_delta: f64,
    pub total_cost: f64,
    pub readings: Vec<Reading>,
}
