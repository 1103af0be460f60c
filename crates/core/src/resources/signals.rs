use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::info;

use crate::sync::lock;

/// Cluster-wide CPU credit exhaustion flag.
#[derive(Debug, Clone, Default)]
pub struct CpuCreditsSignal {
    exhausted: Arc<AtomicBool>,
}

impl CpuCreditsSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.exhausted.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.exhausted.store(false, Ordering::Release);
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }
}

/// Receives process memory pressure transitions.
pub trait LowMemoryObserver: Send + Sync {
    fn on_low_memory(&self);

    fn on_low_memory_over(&self);
}

/// Fans memory pressure transitions out to registered observers.
///
/// Observers are held weakly; dropped ones are pruned on the next notification.
#[derive(Default)]
pub struct LowMemoryMonitor {
    low_memory: AtomicBool,
    observers: Mutex<Vec<Weak<dyn LowMemoryObserver>>>,
}

impl LowMemoryMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, observer: Weak<dyn LowMemoryObserver>) {
        lock(&self.observers).push(observer);
    }

    pub fn is_low_memory(&self) -> bool {
        self.low_memory.load(Ordering::Acquire)
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.observers)
            .iter()
            .filter(|o| o.strong_count() > 0)
            .count()
    }

    pub fn notify_low_memory(&self) {
        info!("Low memory reported");
        self.low_memory.store(true, Ordering::Release);
        for observer in self.live_observers() {
            observer.on_low_memory();
        }
    }

    pub fn notify_pressure_over(&self) {
        info!("Low memory pressure over");
        self.low_memory.store(false, Ordering::Release);
        for observer in self.live_observers() {
            observer.on_low_memory_over();
        }
    }

    fn live_observers(&self) -> Vec<Arc<dyn LowMemoryObserver>> {
        let mut observers = lock(&self.observers);
        observers.retain(|o| o.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        low: AtomicUsize,
        over: AtomicUsize,
    }

    impl LowMemoryObserver for Counting {
        fn on_low_memory(&self) {
            self.low.fetch_add(1, Ordering::SeqCst);
        }

        fn on_low_memory_over(&self) {
            self.over.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_cpu_credits_signal_is_shared_between_clones() {
        let signal = CpuCreditsSignal::new();
        let clone = signal.clone();
        clone.raise();
        assert!(signal.is_exhausted());
        signal.clear();
        assert!(!clone.is_exhausted());
    }

    #[test]
    fn test_monitor_notifies_live_observers() {
        let monitor = LowMemoryMonitor::new();
        let observer = Arc::new(Counting::default());
        let weak: Weak<dyn LowMemoryObserver> = Arc::downgrade(&observer) as _;
        monitor.register(weak);

        monitor.notify_low_memory();
        assert!(monitor.is_low_memory());
        monitor.notify_pressure_over();
        assert!(!monitor.is_low_memory());

        assert_eq!(observer.low.load(Ordering::SeqCst), 1);
        assert_eq!(observer.over.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_observers_are_pruned() {
        let monitor = LowMemoryMonitor::new();
        let observer = Arc::new(Counting::default());
        let weak: Weak<dyn LowMemoryObserver> = Arc::downgrade(&observer) as _;
        monitor.register(weak);
        assert_eq!(monitor.observer_count(), 1);

        drop(observer);
        monitor.notify_low_memory();
        assert_eq!(monitor.observer_count(), 0);
    }
}
