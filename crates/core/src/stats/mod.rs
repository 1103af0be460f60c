//! Per-batch run statistics and cumulative per-engine process statistics.

mod history;
mod process;
mod types;

pub use history::StatsHistory;
pub use process::{ErrorRecord, EtlProcessStatistics, MAX_RECENT_ERRORS};
pub use types::{EtlRunStats, TypeCounts};
