pub mod rate;
pub mod stats;

pub use rate::{RateEstimator, RateSample};
pub use stats::{StatsAggregator, StatsSnapshot};
