//! Per-batch memory budgeting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::item::AllocationTracker;

/// Shared pool that batches borrow extra memory from.
pub trait MemoryBudget: Send + Sync {
    /// Ask for `bytes` more. Returns false when the process cannot spare them.
    fn try_grow(&self, bytes: u64) -> bool;

    fn release(&self, bytes: u64);
}

/// A fixed process-wide pool.
#[derive(Debug)]
pub struct SharedMemoryBudget {
    limit: u64,
    granted: AtomicU64,
}

impl SharedMemoryBudget {
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            limit: limit_bytes,
            granted: AtomicU64::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(u64::MAX)
    }

    pub fn granted_bytes(&self) -> u64 {
        self.granted.load(Ordering::Acquire)
    }
}

impl MemoryBudget for SharedMemoryBudget {
    fn try_grow(&self, bytes: u64) -> bool {
        self.granted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(bytes)
                    .filter(|total| *total <= self.limit)
            })
            .is_ok()
    }

    fn release(&self, bytes: u64) {
        let _ = self
            .granted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }
}

/// Memory allowance of one batch.
///
/// Starts at the default ceiling and grows in increments borrowed from the
/// shared budget. Borrowed bytes are returned on reset and on drop.
pub struct ResourceToken {
    budget: Arc<dyn MemoryBudget>,
    tracker: Arc<AllocationTracker>,
    default_ceiling: u64,
    ceiling: u64,
    borrowed: u64,
    increment: u64,
}

impl ResourceToken {
    pub fn acquire(
        budget: Arc<dyn MemoryBudget>,
        tracker: Arc<AllocationTracker>,
        default_ceiling: u64,
        increment: u64,
    ) -> Self {
        Self {
            budget,
            tracker,
            default_ceiling,
            ceiling: default_ceiling,
            borrowed: 0,
            increment,
        }
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.tracker.allocated_bytes()
    }

    /// Whether tracked allocations plus `overhead` fit, growing the ceiling if
    /// the shared budget allows. False means the budget refused to grow.
    pub fn within_budget(&mut self, overhead: u64) -> bool {
        let used = self.tracker.allocated_bytes().saturating_add(overhead);
        if used <= self.ceiling {
            return true;
        }

        let needed = used - self.ceiling;
        let request = if self.increment == 0 {
            needed
        } else {
            needed.div_ceil(self.increment).saturating_mul(self.increment)
        };

        if !self.budget.try_grow(request) {
            debug!(used, ceiling = self.ceiling, request, "Memory budget refused to grow");
            return false;
        }
        self.borrowed += request;
        self.ceiling = self.ceiling.saturating_add(request);
        true
    }

    /// Drop back to the default ceiling, returning borrowed memory.
    pub fn reset_to_default(&mut self) {
        if self.borrowed > 0 {
            self.budget.release(self.borrowed);
            self.borrowed = 0;
        }
        self.ceiling = self.default_ceiling;
    }
}

impl Drop for ResourceToken {
    fn drop(&mut self) {
        if self.borrowed > 0 {
            self.budget.release(self.borrowed);
        }
    }
}
