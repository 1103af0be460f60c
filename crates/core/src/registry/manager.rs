//! Configuration registry implementation.
//!
//! Keeps the running engines in line with the database record:
//! - Reconciliation: serialized by one mutation lock
//! - Fan-out: reads an immutable snapshot, never the mutation lock
//! - Subscriptions: taken lazily, dropped when no engine needs them

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertType, Severity};
use crate::engine::{EngineError, PipelineEngine, TestScriptInput, TestScriptResult};
use crate::storage::{ChangeCallback, StorageChange, SubscriptionId, SubscriptionKind};
use crate::sync::{lock, read, write};
use crate::task::{
    CollectionFilter, DatabaseRecord, ResolvedConfiguration, Transformation, ALL_COLLECTIONS,
};

use super::types::{RegistryContext, RegistryError};
use super::validate::ConfigurationValidator;

type Snapshot = Arc<[Arc<PipelineEngine>]>;

/// The live engine array. Replaced wholesale, read by cloning the `Arc`.
struct LiveEngines {
    engines: RwLock<Snapshot>,
}

impl LiveEngines {
    fn new() -> Self {
        Self {
            engines: RwLock::new(Arc::from(Vec::new())),
        }
    }

    fn snapshot(&self) -> Snapshot {
        Arc::clone(&read(&self.engines))
    }

    fn replace(&self, engines: Vec<Arc<PipelineEngine>>) {
        *write(&self.engines) = Arc::from(engines);
    }

    fn notify(&self, change: &StorageChange) -> usize {
        self.snapshot()
            .iter()
            .filter(|engine| engine.notify_change(change))
            .count()
    }
}

#[derive(Default)]
struct RegistryState {
    record: Option<DatabaseRecord>,
    document_subscription: Option<SubscriptionId>,
    counter_subscription: Option<SubscriptionId>,
    /// Configurations with an outstanding configuration alert.
    invalid: HashSet<String>,
    disposed: bool,
}

/// One (configuration, transformation) pair this node should run.
struct DesiredTask {
    resolved: ResolvedConfiguration,
    transformation: Transformation,
}

impl DesiredTask {
    fn matches(&self, engine: &PipelineEngine) -> bool {
        self.resolved.kind() == engine.destination_kind()
            && self
                .resolved
                .name()
                .eq_ignore_ascii_case(engine.configuration_name())
            && self
                .transformation
                .name
                .eq_ignore_ascii_case(engine.transformation_name())
    }
}

/// Owns the pipeline engines of one database.
pub struct PipelineRegistry {
    ctx: RegistryContext,
    live: Arc<LiveEngines>,
    state: Mutex<RegistryState>,
}

impl PipelineRegistry {
    pub fn new(ctx: RegistryContext) -> Self {
        Self {
            ctx,
            live: Arc::new(LiveEngines::new()),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Stop everything and rebuild the running set from `record`.
    pub fn reload(&self, record: &DatabaseRecord) -> Result<(), RegistryError> {
        let mut state = lock(&self.state);
        if state.disposed {
            return Ok(());
        }
        info!(database = %record.database_name, "Loading ETL processes");

        let previous = self.live.snapshot();
        self.live.replace(Vec::new());
        for (name, e) in stop_all(&previous, "reloading ETL configuration") {
            warn!(engine = %name, error = %e, "ETL process did not stop cleanly");
        }

        let desired = self.desired_tasks(record, &mut state);
        let (engines, failures) = self.spawn(desired);
        self.live.replace(engines);
        state.record = Some(record.clone());
        self.update_subscriptions(&mut state);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Start(failures))
        }
    }

    /// Diff `record` against the running set. Unaffected engines keep running.
    pub fn apply_configuration_change(&self, record: &DatabaseRecord) -> Result<(), RegistryError> {
        let mut state = lock(&self.state);
        if state.disposed {
            return Ok(());
        }

        let desired = self.desired_tasks(record, &mut state);
        let current = self.live.snapshot();

        let mut kept = Vec::new();
        let mut removed = Vec::new();
        for engine in current.iter() {
            let reason = match desired.iter().find(|task| task.matches(engine)) {
                Some(task)
                    if engine
                        .configuration()
                        .is_equivalent_for(&task.resolved, engine.transformation_name()) =>
                {
                    kept.push(Arc::clone(engine));
                    continue;
                }
                Some(_) => "ETL configuration changed",
                None => "ETL configuration was removed, disabled or moved to another node",
            };
            info!(engine = %engine.name(), reason, "Stopping ETL process");
            removed.push((Arc::clone(engine), reason));
        }

        // Stopped before their replacements start, so two engines never run one task.
        for (engine, reason) in &removed {
            if let Err(e) = engine.stop(reason) {
                warn!(engine = %engine.name(), error = %e, "ETL process did not stop cleanly");
            }
        }

        let added: Vec<DesiredTask> = desired
            .into_iter()
            .filter(|task| !kept.iter().any(|engine| task.matches(engine)))
            .collect();
        let (started, failures) = self.spawn(added);

        if !removed.is_empty() || !started.is_empty() {
            info!(
                stopped = removed.len(),
                started = started.len(),
                kept = kept.len(),
                "Applied ETL configuration change"
            );
        }

        kept.extend(started);
        self.live.replace(kept);
        state.record = Some(record.clone());
        self.update_subscriptions(&mut state);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Start(failures))
        }
    }

    /// Wake every engine interested in `change`. Returns how many woke.
    pub fn notify_change(&self, change: &StorageChange) -> usize {
        self.live.notify(change)
    }

    /// Lowest checkpoint per collection (lowercase, or `*` for all-collection
    /// tasks) across every enabled transformation of the last applied record.
    /// Tombstones at or below the floor have been consumed by everyone.
    pub fn min_unconsumed_tombstone_etags(&self) -> BTreeMap<String, u64> {
        let Some(record) = lock(&self.state).record.clone() else {
            return BTreeMap::new();
        };

        let engine_ctx = &self.ctx.engine;
        let mut floors: BTreeMap<String, u64> = BTreeMap::new();
        for configuration in record.etl_configurations.iter().filter(|c| !c.disabled) {
            for transformation in configuration.transformations.iter().filter(|t| !t.disabled) {
                let etag = engine_ctx
                    .consensus
                    .process_state(&record.database_name, &configuration.name, &transformation.name)
                    .last_processed_etag_for(&engine_ctx.node_tag);

                let keys: Vec<String> = match &transformation.collections {
                    CollectionFilter::All => vec![ALL_COLLECTIONS.to_string()],
                    CollectionFilter::Only(collections) => {
                        collections.iter().map(|c| c.to_lowercase()).collect()
                    }
                };
                for key in keys {
                    floors
                        .entry(key)
                        .and_modify(|floor| *floor = (*floor).min(etag))
                        .or_insert(etag);
                }
            }
        }
        floors
    }

    /// Dry-run one transformation of `record` against a single document.
    pub fn test_script(
        &self,
        record: &DatabaseRecord,
        configuration: &str,
        transformation: &str,
        input: TestScriptInput,
    ) -> Result<TestScriptResult, RegistryError> {
        let candidate = record
            .etl_configurations
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(configuration))
            .ok_or_else(|| RegistryError::NotFound(configuration.to_string()))?;
        let target = candidate.transformation(transformation).ok_or_else(|| {
            RegistryError::NotFound(format!("{}/{}", configuration, transformation))
        })?;

        let accepted = ConfigurationValidator::new()
            .validate(record, candidate)
            .map_err(|errors| RegistryError::InvalidConfiguration {
                name: candidate.name.clone(),
                errors,
            })?;

        let destination = self.ctx.destinations.create(&accepted.resolved);
        let engine = PipelineEngine::new(
            self.ctx.engine.clone(),
            &accepted.resolved,
            target,
            destination,
        );
        Ok(engine.test_script(input))
    }

    /// Stop every engine in parallel and drop the storage subscriptions.
    pub fn dispose(&self) -> Result<(), RegistryError> {
        let mut state = lock(&self.state);
        if state.disposed {
            return Ok(());
        }
        state.disposed = true;

        let engines = self.live.snapshot();
        self.live.replace(Vec::new());
        self.update_subscriptions(&mut state);

        let failures = stop_all(&engines, "database shutdown");
        info!(engines = engines.len(), failed = failures.len(), "Disposed ETL processes");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Dispose(failures))
        }
    }

    /// Current engines.
    pub fn engines(&self) -> Vec<Arc<PipelineEngine>> {
        self.live.snapshot().to_vec()
    }

    pub fn find(&self, configuration: &str, transformation: &str) -> Option<Arc<PipelineEngine>> {
        self.live
            .snapshot()
            .iter()
            .find(|engine| {
                engine.configuration_name().eq_ignore_ascii_case(configuration)
                    && engine.transformation_name().eq_ignore_ascii_case(transformation)
            })
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.live.snapshot().is_empty()
    }

    pub fn has_document_subscription(&self) -> bool {
        lock(&self.state).document_subscription.is_some()
    }

    pub fn has_counter_subscription(&self) -> bool {
        lock(&self.state).counter_subscription.is_some()
    }

    /// Validate every configuration and keep the enabled transformations
    /// this node owns.
    fn desired_tasks(&self, record: &DatabaseRecord, state: &mut RegistryState) -> Vec<DesiredTask> {
        let engine_ctx = &self.ctx.engine;
        let mut validator = ConfigurationValidator::new();
        let mut invalid = HashSet::new();
        let mut desired = Vec::new();

        for configuration in &record.etl_configurations {
            let accepted = match validator.validate(record, configuration) {
                Ok(accepted) => accepted,
                Err(errors) => {
                    warn!(
                        config = %configuration.name,
                        "Invalid ETL configuration: {}",
                        errors.join("; ")
                    );
                    self.raise_alert(
                        AlertType::EtlConfigurationError,
                        Severity::Error,
                        &configuration.name,
                        "Invalid ETL configuration",
                        errors.join("; "),
                    );
                    invalid.insert(configuration.name.clone());
                    continue;
                }
            };

            for warning in &accepted.warnings {
                warn!(config = %configuration.name, "{}", warning);
                self.raise_alert(
                    AlertType::EtlWarning,
                    Severity::Warning,
                    &configuration.name,
                    "ETL configuration warning",
                    warning.clone(),
                );
            }

            if configuration.disabled {
                debug!(config = %configuration.name, "ETL configuration is disabled");
                continue;
            }

            let Some(first) = configuration.transformations.first() else {
                continue;
            };
            let process_state = engine_ctx.consensus.process_state(
                &record.database_name,
                &configuration.name,
                &first.name,
            );
            let owner = self
                .ctx
                .ownership
                .whose_task_is_it(&record.topology, configuration, &process_state);
            if owner.as_deref() != Some(engine_ctx.node_tag.as_str()) {
                debug!(
                    config = %configuration.name,
                    owner = owner.as_deref().unwrap_or("none"),
                    "ETL configuration is owned by another node"
                );
                continue;
            }

            for transformation in configuration.transformations.iter().filter(|t| !t.disabled) {
                desired.push(DesiredTask {
                    resolved: accepted.resolved.clone(),
                    transformation: transformation.clone(),
                });
            }
        }

        for name in state.invalid.difference(&invalid) {
            info!(config = %name, "ETL configuration is valid again");
            self.dismiss_alert(AlertType::EtlConfigurationError, name);
        }
        state.invalid = invalid;
        desired
    }

    /// Create and start engines. Those that fail to start are left out.
    fn spawn(
        &self,
        tasks: Vec<DesiredTask>,
    ) -> (Vec<Arc<PipelineEngine>>, Vec<(String, EngineError)>) {
        let mut engines = Vec::with_capacity(tasks.len());
        let mut failures = Vec::new();

        for task in tasks {
            let destination = self.ctx.destinations.create(&task.resolved);
            let engine = PipelineEngine::new(
                self.ctx.engine.clone(),
                &task.resolved,
                &task.transformation,
                destination,
            );
            match engine.start() {
                Ok(()) => engines.push(engine),
                Err(e) => {
                    error!(engine = %engine.name(), error = %e, "Failed to start ETL process");
                    engine.cancel();
                    failures.push((engine.name().to_string(), e));
                }
            }
        }

        (engines, failures)
    }

    /// Subscribe or unsubscribe so that the document stream is held while any
    /// engine exists and the counter stream while any engine handles counters.
    fn update_subscriptions(&self, state: &mut RegistryState) {
        let Some(notifications) = &self.ctx.notifications else {
            return;
        };
        let engines = self.live.snapshot();
        let wants_documents = !state.disposed && !engines.is_empty();
        let wants_counters = wants_documents && engines.iter().any(|e| e.handles_counters());

        for (wanted, slot, kind) in [
            (wants_documents, &mut state.document_subscription, SubscriptionKind::Documents),
            (wants_counters, &mut state.counter_subscription, SubscriptionKind::Counters),
        ] {
            match (wanted, *slot) {
                (true, None) => {
                    debug!(?kind, "Subscribing to storage changes");
                    *slot = Some(notifications.subscribe(kind, self.fan_out()));
                }
                (false, Some(id)) => {
                    debug!(?kind, "Unsubscribing from storage changes");
                    notifications.unsubscribe(id);
                    *slot = None;
                }
                _ => {}
            }
        }
    }

    fn fan_out(&self) -> ChangeCallback {
        let live = Arc::clone(&self.live);
        Arc::new(move |change: &StorageChange| {
            live.notify(change);
        })
    }

    fn raise_alert(
        &self,
        alert_type: AlertType,
        severity: Severity,
        key: &str,
        title: &str,
        message: String,
    ) {
        if let Some(alerts) = &self.ctx.engine.alerts {
            alerts.raise(Alert::new(alert_type, severity, key, title, message));
        }
    }

    fn dismiss_alert(&self, alert_type: AlertType, key: &str) {
        if let Some(alerts) = &self.ctx.engine.alerts {
            alerts.dismiss(Alert::id_for(alert_type, key));
        }
    }
}

impl Drop for PipelineRegistry {
    fn drop(&mut self) {
        let state = lock(&self.state);
        if state.disposed {
            return;
        }
        for engine in self.live.snapshot().iter() {
            engine.cancel();
        }
        if let Some(notifications) = &self.ctx.notifications {
            for id in [state.document_subscription, state.counter_subscription]
                .into_iter()
                .flatten()
            {
                notifications.unsubscribe(id);
            }
        }
    }
}

/// Stop engines in parallel. One failure never prevents stopping the rest.
fn stop_all(engines: &[Arc<PipelineEngine>], reason: &str) -> Vec<(String, EngineError)> {
    if engines.is_empty() {
        return Vec::new();
    }

    std::thread::scope(|scope| {
        let handles: Vec<_> = engines
            .iter()
            .map(|engine| (engine, scope.spawn(move || engine.stop(reason))))
            .collect();

        handles
            .into_iter()
            .filter_map(|(engine, handle)| {
                let result = handle
                    .join()
                    .unwrap_or_else(|_| Err(EngineError::ThreadPanicked(engine.name().to_string())));
                result.err().map(|e| (engine.name().to_string(), e))
            })
            .collect()
    })
}
