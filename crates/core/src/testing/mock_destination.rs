//! Mock destination writers for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::destination::{Destination, DestinationFactory, LoadError};
use crate::sync::lock;
use crate::task::{DestinationKind, ResolvedConfiguration};
use crate::transform::TransformedItem;

/// Mock implementation of [`Destination`].
///
/// Records every batch it accepts and fails on demand.
///
/// # Example
///
/// ```rust,ignore
/// use changefeed_core::testing::MockDestination;
///
/// let destination = MockDestination::relational();
/// destination.fail_next(1);
/// // first load fails, the next one is recorded
/// assert_eq!(destination.loaded_items().len(), 3);
/// ```
#[derive(Debug)]
pub struct MockDestination {
    kind: DestinationKind,
    cares_about_attachments: AtomicBool,
    batches: Mutex<Vec<Vec<TransformedItem>>>,
    attempts: AtomicUsize,
    fail_next: AtomicUsize,
    failing: AtomicBool,
    panicking: AtomicBool,
}

impl MockDestination {
    pub fn new(kind: DestinationKind) -> Self {
        Self {
            kind,
            cares_about_attachments: AtomicBool::new(false),
            batches: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            panicking: AtomicBool::new(false),
        }
    }

    pub fn peer() -> Self {
        Self::new(DestinationKind::Peer)
    }

    pub fn relational() -> Self {
        Self::new(DestinationKind::Relational)
    }

    pub fn set_cares_about_attachments(&self, cares: bool) {
        self.cares_about_attachments.store(cares, Ordering::SeqCst);
    }

    /// Fail the next `count` loads.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail every load until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Panic inside the next loads, taking the engine thread down with it.
    pub fn set_panicking(&self, panicking: bool) {
        self.panicking.store(panicking, Ordering::SeqCst);
    }

    /// Accepted batches, in order.
    pub fn batches(&self) -> Vec<Vec<TransformedItem>> {
        lock(&self.batches).clone()
    }

    pub fn loaded_items(&self) -> Vec<TransformedItem> {
        lock(&self.batches).iter().flatten().cloned().collect()
    }

    /// Load calls, failed ones included.
    pub fn load_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Destination for MockDestination {
    fn kind(&self) -> DestinationKind {
        self.kind
    }

    fn cares_about_attachments(&self) -> bool {
        self.cares_about_attachments.load(Ordering::SeqCst)
    }

    async fn load(&self, items: &[TransformedItem]) -> Result<usize, LoadError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.panicking.load(Ordering::SeqCst) {
            panic!("simulated destination driver crash");
        }
        if self.should_fail() {
            return Err(LoadError::Unreachable("simulated connection refused".to_string()));
        }
        lock(&self.batches).push(items.to_vec());
        Ok(items.len())
    }
}

/// Mock implementation of [`DestinationFactory`].
///
/// Hands out one shared [`MockDestination`] per configuration name, so a
/// restarted engine keeps writing to the same recorder.
#[derive(Debug, Default)]
pub struct MockDestinationFactory {
    destinations: Mutex<HashMap<String, Arc<MockDestination>>>,
    created: AtomicUsize,
}

impl MockDestinationFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorder of `configuration`, created on first use.
    pub fn destination(&self, configuration: &str, kind: DestinationKind) -> Arc<MockDestination> {
        Arc::clone(
            lock(&self.destinations)
                .entry(configuration.to_lowercase())
                .or_insert_with(|| Arc::new(MockDestination::new(kind))),
        )
    }

    /// How many writers were handed to engines.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl DestinationFactory for MockDestinationFactory {
    fn create(&self, configuration: &ResolvedConfiguration) -> Arc<dyn Destination> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.destination(configuration.name(), configuration.kind())
    }
}
