//! Process-wide resource signals consulted by admission control.

mod budget;
mod signals;

pub use budget::{MemoryBudget, ResourceToken, SharedMemoryBudget};
pub use signals::{CpuCreditsSignal, LowMemoryMonitor, LowMemoryObserver};
