//! The uniform change unit flowing through a pipeline and its payload accounting.

mod buffer;
mod types;

pub use buffer::{AllocationTracker, PayloadBuffer};
pub use types::*;
