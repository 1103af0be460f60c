use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::alerts::AlertHandle;
use crate::cluster::Consensus;
use crate::config::EtlSettings;
use crate::resources::{CpuCreditsSignal, LowMemoryMonitor, MemoryBudget, SharedMemoryBudget};
use crate::storage::DocumentStorage;
use crate::transform::{ScriptCache, ScriptCompiler};

/// Collaborators shared by every engine of one database.
#[derive(Clone)]
pub struct EngineContext {
    pub database: String,
    pub node_tag: String,
    pub settings: EtlSettings,
    pub storage: Arc<dyn DocumentStorage>,
    pub consensus: Arc<dyn Consensus>,
    pub compiler: Arc<dyn ScriptCompiler>,
    pub script_cache: Arc<ScriptCache>,
    pub alerts: Option<AlertHandle>,
    pub cpu_credits: CpuCreditsSignal,
    pub low_memory: Arc<LowMemoryMonitor>,
    pub memory_budget: Arc<dyn MemoryBudget>,
    /// Database shutdown; every engine's cancellation is a child of it.
    pub shutdown: CancellationToken,
}

impl EngineContext {
    pub fn new(
        database: impl Into<String>,
        node_tag: impl Into<String>,
        storage: Arc<dyn DocumentStorage>,
        consensus: Arc<dyn Consensus>,
        compiler: Arc<dyn ScriptCompiler>,
    ) -> Self {
        let settings = EtlSettings::default();
        Self {
            database: database.into(),
            node_tag: node_tag.into(),
            script_cache: Arc::new(ScriptCache::new(settings.script_cache_capacity)),
            settings,
            storage,
            consensus,
            compiler,
            alerts: None,
            cpu_credits: CpuCreditsSignal::new(),
            low_memory: LowMemoryMonitor::new(),
            memory_budget: Arc::new(SharedMemoryBudget::unlimited()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the settings. The script cache is resized to match.
    pub fn with_settings(mut self, settings: EtlSettings) -> Self {
        self.script_cache = Arc::new(ScriptCache::new(settings.script_cache_capacity));
        self.settings = settings;
        self
    }

    pub fn with_script_cache(mut self, cache: Arc<ScriptCache>) -> Self {
        self.script_cache = cache;
        self
    }

    pub fn with_alerts(mut self, alerts: AlertHandle) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn with_cpu_credits(mut self, signal: CpuCreditsSignal) -> Self {
        self.cpu_credits = signal;
        self
    }

    pub fn with_low_memory(mut self, monitor: Arc<LowMemoryMonitor>) -> Self {
        self.low_memory = monitor;
        self
    }

    pub fn with_memory_budget(mut self, budget: Arc<dyn MemoryBudget>) -> Self {
        self.memory_budget = budget;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}
