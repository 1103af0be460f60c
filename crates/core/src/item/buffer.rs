//! Allocation accounting for extracted payloads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

/// Bytes currently held by live payload buffers of one engine.
#[derive(Debug, Default)]
pub struct AllocationTracker {
    allocated: AtomicU64,
}

impl AllocationTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    fn charge(&self, bytes: u64) {
        self.allocated.fetch_add(bytes, Ordering::AcqRel);
    }

    fn release(&self, bytes: u64) {
        let _ = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }
}

/// A document body whose size is charged to a tracker until the buffer is dropped.
#[derive(Debug)]
pub struct PayloadBuffer {
    data: Value,
    size: u64,
    tracker: Option<Arc<AllocationTracker>>,
}

impl PayloadBuffer {
    pub fn new(data: Value) -> Self {
        let size = serde_json::to_vec(&data).map(|v| v.len() as u64).unwrap_or(0);
        Self {
            data,
            size,
            tracker: None,
        }
    }

    /// Charge this buffer to `tracker`. A buffer is charged at most once.
    pub fn attach(&mut self, tracker: &Arc<AllocationTracker>) {
        if self.tracker.is_some() {
            return;
        }
        tracker.charge(self.size);
        self.tracker = Some(Arc::clone(tracker));
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for PayloadBuffer {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.release(self.size);
        }
    }
}
