mod meter;
mod session;
mod stats;

pub use meter::Meter;
pub use session::{Reading, ReadingInput, Session, SessionDetails};
pub use stats::{MeterStatistics, Statistics, TrendBucket, TrendPoint};
