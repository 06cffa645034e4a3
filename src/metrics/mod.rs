// Metrics module
// Run-scoped counters and loss trend tracking

pub mod run_context;
mod trends;

pub use run_context::{IngestCounters, RunContext};
pub use trends::{LossTrend, Trend};
