// Session client counters

mod collector;

pub use collector::{MetricsSnapshot, SessionMetrics};
