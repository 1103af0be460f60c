//! The per-task pipeline engine.
//!
//! One engine moves the changes of one (configuration, transformation) pair
//! from local storage to its destination:
//! - Extract: etag-ordered documents and tombstones, then counter groups
//! - Transform: item by item, under admission control
//! - Load: the whole batch in one call, with fallback on failure
//! - Commit: the checkpoint goes through consensus before the next iteration

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertType, Severity};
use crate::cluster::UpdateProcessStateCommand;
use crate::destination::{Destination, LoadError};
use crate::item::{AllocationTracker, ExtractedItem, ItemKind, ItemType, RawTombstone};
use crate::metrics::{
    BATCHES_TOTAL, BATCH_DURATION, CHECKPOINT_COMMITS, ENGINES_RUNNING, ITEMS_EXTRACTED,
    ITEMS_LOADED, LOAD_FAILURES,
};
use crate::resources::{LowMemoryObserver, ResourceToken};
use crate::state::{ChangeVector, ConflictStatus, ProcessState};
use crate::stats::{EtlProcessStatistics, EtlRunStats, StatsHistory};
use crate::storage::{ReadTransaction, StorageChange};
use crate::sync::lock;
use crate::task::{
    CollectionFilter, DestinationKind, ResolvedConfiguration, Transformation, ALL_COLLECTIONS,
};
use crate::transform::{CompiledScript, ScriptSource, TransformError, TransformedItem, Transformer};

use super::admission::{Admission, BatchCounters, BatchLimits, Verdict, NO_MORE_ITEMS};
use super::context::EngineContext;
use super::extract::{counter_stream, document_stream};
use super::fallback::FallbackPolicy;
use super::thread;
use super::types::{
    CollectionProgress, EngineError, EngineProgress, EngineState, IterationOutcome,
    TestScriptInput, TestScriptResult,
};

/// Weight of the newest sample in the smoothed throughput.
const RATE_SMOOTHING: f64 = 0.3;

/// Items of the running batch not yet covered by a checkpoint.
#[derive(Debug, Clone, Copy, Default)]
struct InFlight {
    documents: u64,
    tombstones: u64,
    counter_groups: u64,
}

struct Observed {
    history: StatsHistory,
    statistics: EtlProcessStatistics,
    processed_per_second: f64,
    in_flight: HashMap<String, InFlight>,
    batches: u64,
}

/// Working set of one batch.
struct Batch {
    transformer: Box<dyn Transformer>,
    limits: BatchLimits,
    token: ResourceToken,
    counters: BatchCounters,
    /// Checkpoint vector when another node committed the checkpoint last.
    foreign_vector: Option<ChangeVector>,
    /// Checkpoint vector merged with every processed item.
    change_vector: ChangeVector,
    stats: EtlRunStats,
}

struct BatchResult {
    stats: EtlRunStats,
    items: Vec<TransformedItem>,
    change_vector: ChangeVector,
    fault: Option<TransformError>,
}

/// Clears the flag when dropped.
struct AlertSuppression<'a>(&'a AtomicBool);

impl<'a> AlertSuppression<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for AlertSuppression<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs one (configuration, transformation) pair on a dedicated thread.
pub struct PipelineEngine {
    name: String,
    ctx: EngineContext,
    configuration: ResolvedConfiguration,
    transformation: Transformation,
    destination: Arc<dyn Destination>,
    script: Result<Arc<dyn CompiledScript>, TransformError>,
    tracker: Arc<AllocationTracker>,
    cancel: CancellationToken,
    wake: Notify,
    thread: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<EngineState>,
    fallback: Mutex<FallbackPolicy>,
    observed: Mutex<Observed>,
    low_memory: AtomicBool,
    reset_budget: AtomicBool,
    alerts_suppressed: AtomicBool,
}

impl PipelineEngine {
    /// Create an engine. The script is compiled through the shared cache right
    /// away; a compile failure surfaces on the first iteration.
    pub fn new(
        ctx: EngineContext,
        configuration: &ResolvedConfiguration,
        transformation: &Transformation,
        destination: Arc<dyn Destination>,
    ) -> Arc<Self> {
        let source = ScriptSource {
            transformation: transformation.name.clone(),
            script: transformation.script.clone(),
            collections: transformation.collections.clone(),
            destination: configuration.kind(),
        };
        let script = ctx
            .script_cache
            .get_or_compile(&source, ctx.compiler.as_ref());

        let name = format!("{}/{}", configuration.name(), transformation.name);
        if let Err(e) = &script {
            warn!(engine = %name, error = %e, "Transformation script failed to compile");
        }

        let engine = Arc::new(Self {
            cancel: ctx.shutdown.child_token(),
            fallback: Mutex::new(
                FallbackPolicy::new(ctx.settings.max_fallback_time())
                    .with_floor(ctx.settings.min_fallback_time()),
            ),
            observed: Mutex::new(Observed {
                history: StatsHistory::new(ctx.settings.stats_history_size),
                statistics: EtlProcessStatistics::default(),
                processed_per_second: 0.0,
                in_flight: HashMap::new(),
                batches: 0,
            }),
            low_memory: AtomicBool::new(ctx.low_memory.is_low_memory()),
            name,
            configuration: configuration.clone(),
            transformation: transformation.clone(),
            destination,
            script,
            tracker: AllocationTracker::new(),
            wake: Notify::new(),
            thread: Mutex::new(None),
            state: Mutex::new(EngineState::Idle),
            reset_budget: AtomicBool::new(false),
            alerts_suppressed: AtomicBool::new(false),
            ctx,
        });

        let observer: Weak<Self> = Arc::downgrade(&engine);
        engine.ctx.low_memory.register(observer);
        engine
    }

    /// `configuration/transformation`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn configuration_name(&self) -> &str {
        self.configuration.name()
    }

    pub fn transformation_name(&self) -> &str {
        &self.transformation.name
    }

    pub fn configuration(&self) -> &ResolvedConfiguration {
        &self.configuration
    }

    pub fn transformation(&self) -> &Transformation {
        &self.transformation
    }

    pub fn destination_kind(&self) -> DestinationKind {
        self.destination.kind()
    }

    /// Whether counter groups are extracted: the script reacts to them and
    /// the destination can take them.
    pub fn handles_counters(&self) -> bool {
        matches!(&self.script, Ok(script) if script.handles_counters())
            && self.destination.supports_counters()
    }

    pub fn state(&self) -> EngineState {
        *lock(&self.state)
    }

    pub fn statistics(&self) -> EtlProcessStatistics {
        self.observed().statistics.clone()
    }

    /// Recent batch statistics, oldest first.
    pub fn performance_history(&self) -> Vec<EtlRunStats> {
        self.observed().history.snapshot()
    }

    /// Current fallback interval, if the last load failed.
    pub fn fallback_time(&self) -> Option<Duration> {
        lock(&self.fallback).current()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.thread)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Spawn the engine thread. Calling it on a started or stopped engine does nothing.
    pub fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let mut slot = lock(&self.thread);
        if slot.is_some() || self.cancel.is_cancelled() {
            return Ok(());
        }

        let engine = Arc::clone(self);
        let handle = thread::spawn_background(format!("etl-{}", self.name), move || {
            engine.thread_main()
        })
        .map_err(|e| EngineError::Spawn(e.to_string()))?;

        *slot = Some(handle);
        ENGINES_RUNNING.inc();
        info!(engine = %self.name, "Started ETL process");
        Ok(())
    }

    /// Cancel the loop and join its thread.
    ///
    /// Safe to call from the engine's own thread, in which case the thread is
    /// left to finish on its own.
    pub fn stop(&self, reason: &str) -> Result<(), EngineError> {
        info!(engine = %self.name, reason, "Stopping ETL process");
        self.cancel.cancel();

        let handle = lock(&self.thread).take();
        let result = match handle {
            Some(handle) => {
                ENGINES_RUNNING.dec();
                if thread::is_current(&handle) {
                    debug!(engine = %self.name, "Stop requested from the engine thread");
                    Ok(())
                } else {
                    handle
                        .join()
                        .map_err(|_| EngineError::ThreadPanicked(self.name.clone()))
                }
            }
            None => Ok(()),
        };

        self.set_state_unless_faulted(EngineState::Stopped);
        result
    }

    /// Request cancellation without waiting for the thread.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wake the loop if the change concerns this engine. Returns true if it did.
    pub fn notify_change(&self, change: &StorageChange) -> bool {
        if change.is_counter_change() && !self.handles_counters() {
            return false;
        }
        if !self
            .transformation
            .collections
            .applies_to(Some(&change.collection))
        {
            return false;
        }
        self.wake.notify_one();
        true
    }

    fn thread_main(&self) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(engine = %self.name, error = %e, "Failed to build engine runtime");
                self.set_state_unless_faulted(EngineState::Stopped);
                return;
            }
        };
        runtime.block_on(self.run());
    }

    async fn run(&self) {
        loop {
            if self.cancel.is_cancelled() || !self.wait_for_cpu_credits().await {
                break;
            }

            match self.run_iteration().await {
                Ok(IterationOutcome::Progress { .. }) => continue,
                Ok(IterationOutcome::Idle) | Ok(IterationOutcome::LoadFailed) => {
                    if !self.wait_for_work().await {
                        break;
                    }
                }
                Ok(IterationOutcome::ScriptFaulted) => {
                    info!(engine = %self.name, "ETL process halted until its script is fixed");
                    return;
                }
                Err(EngineError::Cancelled) => break,
                Err(e) => {
                    error!(engine = %self.name, error = %e, "Unexpected error in ETL process");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.ctx.settings.storage_retry_delay()) => {}
                    }
                }
            }
        }

        self.set_state_unless_faulted(EngineState::Stopped);
        debug!(engine = %self.name, "ETL loop exited");
    }

    /// Run one extract, transform, load and commit pass.
    pub async fn run_iteration(&self) -> Result<IterationOutcome, EngineError> {
        let script = match &self.script {
            Ok(script) => Arc::clone(script),
            Err(e) => {
                let e = e.clone();
                self.enter_script_fault(&e);
                return Ok(IterationOutcome::ScriptFaulted);
            }
        };
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let started = Instant::now();
        let state = self.ctx.consensus.process_state(
            &self.ctx.database,
            self.configuration.name(),
            &self.transformation.name,
        );
        let last_processed = state.last_processed_etag_for(&self.ctx.node_tag);
        let batch_id = {
            let mut observed = self.observed();
            observed.batches += 1;
            observed.batches
        };

        let BatchResult {
            mut stats,
            items,
            change_vector,
            fault,
        } = self.extract_and_transform(script.as_ref(), &state, batch_id)?;

        if let Some(e) = fault {
            self.finish_batch(stats, started, "script_faulted");
            self.enter_script_fault(&e);
            return Ok(IterationOutcome::ScriptFaulted);
        }

        if !items.is_empty() {
            self.set_state(EngineState::Loading);
            match self.load(&items).await {
                Ok(loaded) => {
                    stats.loaded = loaded as u64;
                    ITEMS_LOADED.inc_by(loaded as u64);
                    self.on_load_success(loaded as u64);
                }
                Err(LoadError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => {
                    stats.load_error = Some(e.to_string());
                    self.on_load_failure(&e, items.len() as u64);
                    self.finish_batch(stats, started, "load_failed");
                    return Ok(IterationOutcome::LoadFailed);
                }
            }
        }

        if items.is_empty() && stats.batch_complete_reason.is_some() {
            self.clear_fallback();
        }

        let checkpoint = stats.checkpoint_candidate();
        if checkpoint <= last_processed {
            let result = if stats.processed() > 0 { "filtered" } else { "empty" };
            self.finish_batch(stats, started, result);
            return Ok(IterationOutcome::Idle);
        }

        self.set_state(EngineState::Committing);
        let change_vector = change_vector.to_string();
        if let Err(e) = self.commit(checkpoint, change_vector.clone()).await {
            self.finish_batch(stats, started, "commit_failed");
            return Err(e);
        }

        self.observed()
            .statistics
            .record_checkpoint(checkpoint, Some(change_vector.clone()));
        stats.committed_etag = Some(checkpoint);
        stats.change_vector = Some(change_vector);
        let result = if stats.loaded > 0 { "loaded" } else { "filtered" };
        self.finish_batch(stats, started, result);

        debug!(engine = %self.name, checkpoint, "Checkpoint committed");
        Ok(IterationOutcome::Progress { checkpoint })
    }

    fn extract_and_transform(
        &self,
        script: &dyn CompiledScript,
        state: &ProcessState,
        batch_id: u64,
    ) -> Result<BatchResult, EngineError> {
        let last_processed = state.last_processed_etag_for(&self.ctx.node_tag);
        let from_etag = last_processed + 1;
        let settings = &self.ctx.settings;
        let filter = &self.transformation.collections;

        let tx = self.ctx.storage.begin_read()?;
        let state_vector = state.parsed_change_vector();
        let foreign_vector = state
            .node_tag
            .as_deref()
            .filter(|tag| !tag.eq_ignore_ascii_case(&self.ctx.node_tag))
            .map(|_| state_vector.clone());
        let mut batch = Batch {
            transformer: script.instantiate(),
            limits: BatchLimits::from_settings(settings),
            token: ResourceToken::acquire(
                Arc::clone(&self.ctx.memory_budget),
                Arc::clone(&self.tracker),
                settings.initial_memory_budget_bytes,
                settings.memory_budget_increment_bytes,
            ),
            counters: BatchCounters::new(Instant::now()),
            change_vector: state_vector,
            foreign_vector,
            stats: EtlRunStats::new(batch_id),
        };
        self.observed().in_flight.clear();
        self.set_state(EngineState::Extracting);

        // Phase 1: documents and tombstones.
        let include_attachments = filter.is_all() && self.destination.cares_about_attachments();
        let mut stop_reason = None;
        let mut documents_processed = 0u64;
        let mut drained_etag = 0u64;

        for next in document_stream(&*tx, filter, from_etag, include_attachments) {
            let mut item = next?;
            if let Some(reason) = self.admit(&mut batch, ItemType::Document, false, &*tx) {
                stop_reason = Some(reason);
                break;
            }
            drained_etag = item.etag;
            documents_processed += 1;
            if let Err(fault) = self.process_item(&mut batch, &mut item, None) {
                return Ok(batch.into_fault(fault));
            }
        }

        // Phase 2: counter groups, never ahead of the documents drained above.
        let documents_stopped = stop_reason.is_some();
        if self.handles_counters() && !(documents_stopped && documents_processed == 0) {
            let window = documents_stopped.then_some(drained_etag);
            let document_window = last_processed.max(drained_etag);

            for next in counter_stream(&*tx, filter, from_etag) {
                let mut item = next?;
                if window.is_some_and(|w| item.etag > w) {
                    break;
                }
                let unconditional = documents_processed > 0 && item.etag <= drained_etag;
                if let Some(reason) =
                    self.admit(&mut batch, ItemType::CounterGroup, unconditional, &*tx)
                {
                    stop_reason = Some(reason);
                    break;
                }
                if let Err(fault) = self.process_item(&mut batch, &mut item, Some(document_window)) {
                    return Ok(batch.into_fault(fault));
                }
            }
        }

        match stop_reason {
            Some(reason) => {
                debug!(engine = %self.name, reason = %reason, "Batch stopped early");
                batch.stats.batch_stop_reason = Some(reason);
            }
            None => {
                batch.stats.batch_complete_reason = Some(NO_MORE_ITEMS.to_string());
                // Everything up to the snapshot's last etag was seen or is of no interest.
                batch.stats.last_filtered_etag = batch.stats.last_filtered_etag.max(tx.last_etag());
            }
        }

        let items = batch.transformer.take_results();
        Ok(BatchResult {
            stats: batch.stats,
            items,
            change_vector: batch.change_vector,
            fault: None,
        })
    }

    /// Run admission control for the next item. `Some` carries the stop reason.
    fn admit(
        &self,
        batch: &mut Batch,
        item_type: ItemType,
        unconditional: bool,
        tx: &dyn ReadTransaction,
    ) -> Option<String> {
        if self.reset_budget.swap(false, Ordering::AcqRel) {
            batch.token.reset_to_default();
        }

        let admission = Admission {
            limits: &batch.limits,
            cpu_credits: &self.ctx.cpu_credits,
            low_memory: self.low_memory.load(Ordering::Acquire),
        };
        let overhead = batch.transformer.buffered_bytes();
        match admission.check(
            item_type,
            unconditional,
            &batch.counters,
            &mut batch.token,
            overhead,
            Instant::now(),
        ) {
            Verdict::Proceed => None,
            Verdict::Stop {
                reason,
                non_reusable,
            } => {
                if non_reusable {
                    tx.mark_non_reusable();
                }
                Some(reason)
            }
        }
    }

    /// Filter or transform one admitted item. Only a compile-class failure is returned.
    fn process_item(
        &self,
        batch: &mut Batch,
        item: &mut ExtractedItem,
        document_window: Option<u64>,
    ) -> Result<(), TransformError> {
        let item_type = item.item_type();
        item.track(&self.tracker);
        batch.counters.admit(item_type);
        batch.stats.extracted.increment(item_type);
        batch.stats.last_extracted_etag = item.etag;
        batch.stats.allocated_bytes = batch.stats.allocated_bytes.max(
            self.tracker
                .allocated_bytes()
                .saturating_add(batch.transformer.buffered_bytes()),
        );
        ITEMS_EXTRACTED
            .with_label_values(&[item_type.as_str()])
            .inc();

        let item_vector = ChangeVector::parse_lenient(&item.change_vector);
        let filter_reason = self.filter_reason(
            item,
            &item_vector,
            batch.foreign_vector.as_ref(),
            document_window,
        );
        batch.change_vector.merge(&item_vector);

        if let Some(reason) = filter_reason {
            debug!(engine = %self.name, id = %item.id, etag = item.etag, reason, "Filtered item");
            item.filtered = true;
            batch.stats.filtered.increment(item_type);
            batch.stats.last_filtered_etag = batch.stats.last_filtered_etag.max(item.etag);
        } else {
            self.set_state(EngineState::Transforming);
            match batch.transformer.transform(item) {
                Ok(()) => {
                    batch.stats.transformed.increment(item_type);
                    self.observed().statistics.record_transformation_successes(1);
                }
                Err(e) if e.is_compile() => {
                    item.dispose();
                    return Err(e);
                }
                Err(e) => {
                    batch.stats.transformation_errors += 1;
                    warn!(engine = %self.name, id = %item.id, error = %e, "Transformation failed");
                    let alert = self
                        .observed()
                        .statistics
                        .record_transformation_error(&item.id, &e.to_string());
                    if alert {
                        self.raise_alert(
                            AlertType::EtlTransformationError,
                            Severity::Warning,
                            "Transformation errors",
                            format!(
                                "Transformation errors reached the number of successful transformations. Last error: {}",
                                e
                            ),
                        );
                    }
                }
            }
            batch.stats.last_transformed_etag = batch.stats.last_transformed_etag.max(item.etag);
        }

        self.track_in_flight(item);
        item.dispose();
        Ok(())
    }

    fn filter_reason(
        &self,
        item: &ExtractedItem,
        item_vector: &ChangeVector,
        foreign_vector: Option<&ChangeVector>,
        document_window: Option<u64>,
    ) -> Option<&'static str> {
        let filter = &self.transformation.collections;
        if !filter.applies_to(item.collection.as_deref()) {
            return Some("collection not handled by the transformation");
        }
        if filter.is_all() && item.is_id_generator() {
            return Some("id generator document");
        }
        let loaded_elsewhere = foreign_vector.is_some_and(|foreign| {
            !item_vector.is_empty()
                && !foreign.is_empty()
                && ChangeVector::conflict_status(item_vector, foreign) == ConflictStatus::AlreadyMerged
        });
        if loaded_elsewhere {
            return Some("already processed by another node");
        }
        if let (Some(window), Some(document_etag)) = (document_window, item.document_etag()) {
            if document_etag > window {
                return Some("document has a newer version that was not processed yet");
            }
        }
        None
    }

    fn track_in_flight(&self, item: &ExtractedItem) {
        let key = if self.transformation.collections.is_all() {
            ALL_COLLECTIONS.to_string()
        } else {
            item.collection.as_deref().unwrap_or_default().to_lowercase()
        };
        let mut observed = self.observed();
        let entry = observed.in_flight.entry(key).or_default();
        match item.kind() {
            ItemKind::Document => entry.documents += 1,
            ItemKind::Tombstone { .. } => entry.tombstones += 1,
            ItemKind::CounterGroup { .. } => entry.counter_groups += 1,
        }
    }

    async fn load(&self, items: &[TransformedItem]) -> Result<usize, LoadError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(LoadError::Cancelled),
            result = self.destination.load(items) => result,
        }
    }

    fn on_load_success(&self, loaded: u64) {
        lock(&self.fallback).on_load_success();
        let recovered = self.observed().statistics.record_load_success(loaded);
        if recovered {
            info!(engine = %self.name, "Destination accepted a batch again");
            self.dismiss_alert(AlertType::EtlLoadError);
        }
    }

    /// Leave fallback once a completed batch had nothing to load.
    fn clear_fallback(&self) {
        let mut fallback = lock(&self.fallback);
        if fallback.is_active() {
            debug!(engine = %self.name, "No pending items, leaving fallback");
            fallback.on_load_success();
        }
    }

    fn on_load_failure(&self, error: &LoadError, items: u64) {
        let wait = lock(&self.fallback).on_load_failure(Instant::now());
        LOAD_FAILURES.inc();
        warn!(
            engine = %self.name,
            error = %error,
            fallback_secs = wait.as_secs(),
            "Failed to load batch, entering fallback"
        );

        let alert = self
            .observed()
            .statistics
            .record_load_error(&error.to_string(), items);
        if alert {
            self.raise_alert(
                AlertType::EtlLoadError,
                Severity::Error,
                "Load errors",
                format!(
                    "Load errors reached the number of successfully loaded items. Last error: {}",
                    error
                ),
            );
        }
    }

    /// Send the checkpoint to the leader, retrying transient failures, then
    /// wait until it is applied locally.
    async fn commit(&self, etag: u64, change_vector: String) -> Result<(), EngineError> {
        let command = UpdateProcessStateCommand {
            database: self.ctx.database.clone(),
            configuration_name: self.configuration.name().to_string(),
            transformation_name: self.transformation.name.clone(),
            node_tag: self.ctx.node_tag.clone(),
            last_processed_etag: etag,
            change_vector,
        };
        let settings = &self.ctx.settings;
        let attempts = settings.transient_retry_attempts.max(1);

        let mut attempt = 1;
        let index = loop {
            let sent = tokio::select! {
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                sent = self.ctx.consensus.send_to_leader(command.clone()) => sent,
            };
            match sent {
                Ok((index, _)) => break index,
                Err(e) if e.is_transient() && attempt < attempts => {
                    debug!(engine = %self.name, attempt, error = %e, "Retrying checkpoint commit");
                    attempt += 1;
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(settings.transient_retry_delay()) => {}
                    }
                }
                Err(e) => {
                    CHECKPOINT_COMMITS.with_label_values(&["failed"]).inc();
                    return Err(e.into());
                }
            }
        };

        let applied = tokio::select! {
            _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
            applied = self
                .ctx
                .consensus
                .wait_for_index_applied(index, settings.commit_wait_timeout()) => applied,
        };
        if let Err(e) = applied {
            CHECKPOINT_COMMITS.with_label_values(&["failed"]).inc();
            return Err(e.into());
        }

        CHECKPOINT_COMMITS.with_label_values(&["success"]).inc();
        Ok(())
    }

    /// Wait for a change notification, or out the fallback interval.
    /// Returns false when cancelled.
    async fn wait_for_work(&self) -> bool {
        match self.fallback_time() {
            Some(interval) => {
                self.set_state(EngineState::FallbackWait);
                let deadline = tokio::time::Instant::now() + interval;
                loop {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        _ = tokio::time::sleep_until(deadline) => return true,
                        _ = self.wake.notified() => {
                            debug!(engine = %self.name, "Woke during fallback, waiting out the interval");
                        }
                    }
                }
            }
            None => {
                self.set_state(EngineState::Idle);
                tokio::select! {
                    _ = self.cancel.cancelled() => false,
                    _ = self.wake.notified() => true,
                }
            }
        }
    }

    /// Pause while CPU credits are exhausted. Returns false when cancelled.
    async fn wait_for_cpu_credits(&self) -> bool {
        let settings = &self.ctx.settings;
        let mut waits = 0u32;
        let mut alerted = false;

        while self.ctx.cpu_credits.is_exhausted() {
            self.set_state(EngineState::CpuCreditsWait);
            waits += 1;
            if waits == settings.cpu_credits_alert_after_waits.max(1) {
                warn!(engine = %self.name, waits, "ETL process paused, CPU credits exhausted");
                self.raise_alert(
                    AlertType::CpuCreditsExhausted,
                    Severity::Warning,
                    "CPU credits exhausted",
                    "ETL process is paused until CPU credits are available again",
                );
                alerted = true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(settings.cpu_credits_wait()) => {}
            }
        }

        if alerted {
            info!(engine = %self.name, "CPU credits available, resuming");
            self.dismiss_alert(AlertType::CpuCreditsExhausted);
        }
        true
    }

    fn enter_script_fault(&self, error: &TransformError) {
        let previous = self.set_state(EngineState::ScriptFaulted);
        if previous == EngineState::ScriptFaulted {
            return;
        }
        error!(engine = %self.name, error = %error, "Transformation script is invalid, halting ETL process");
        self.raise_alert(
            AlertType::EtlScriptError,
            Severity::Error,
            "Script error",
            format!(
                "Transformation '{}' of '{}' cannot run: {}",
                self.transformation.name,
                self.configuration.name(),
                error
            ),
        );
    }

    fn finish_batch(&self, mut stats: EtlRunStats, started: Instant, result: &str) {
        let elapsed = started.elapsed();
        stats.duration_ms = elapsed.as_millis() as u64;
        BATCH_DURATION.observe(elapsed.as_secs_f64());
        if result != "empty" {
            BATCHES_TOTAL.with_label_values(&[result]).inc();
        }

        let mut observed = self.observed();
        let processed = stats.processed();
        if processed > 0 && elapsed.as_secs_f64() > 0.0 {
            let rate = processed as f64 / elapsed.as_secs_f64();
            observed.processed_per_second = if observed.processed_per_second == 0.0 {
                rate
            } else {
                RATE_SMOOTHING * rate + (1.0 - RATE_SMOOTHING) * observed.processed_per_second
            };
        }
        observed.in_flight.clear();
        if processed > 0 || stats.load_error.is_some() || stats.committed_etag.is_some() {
            observed.history.push(stats);
        }
    }

    /// Remaining work per collection, net of the running batch.
    pub fn progress(&self) -> Result<EngineProgress, EngineError> {
        let state = self.ctx.consensus.process_state(
            &self.ctx.database,
            self.configuration.name(),
            &self.transformation.name,
        );
        let last_processed = state.last_processed_etag_for(&self.ctx.node_tag);
        let handles_counters = self.handles_counters();
        let tx = self.ctx.storage.begin_read()?;

        let keys: Vec<Option<&str>> = match &self.transformation.collections {
            CollectionFilter::All => vec![None],
            CollectionFilter::Only(collections) => {
                collections.iter().map(|c| Some(c.as_str())).collect()
            }
        };

        let (in_flight, processed_per_second) = {
            let observed = self.observed();
            (observed.in_flight.clone(), observed.processed_per_second)
        };

        let mut collections = Vec::with_capacity(keys.len());
        for key in keys {
            let name = key.unwrap_or(ALL_COLLECTIONS);
            let pending = in_flight
                .get(&name.to_lowercase())
                .copied()
                .unwrap_or_default();
            let counter_groups = if handles_counters {
                tx.count_counter_groups_after(key, last_processed)?
            } else {
                0
            };
            collections.push(CollectionProgress {
                collection: name.to_string(),
                remaining_documents: tx
                    .count_documents_after(key, last_processed)?
                    .saturating_sub(pending.documents),
                remaining_tombstones: tx
                    .count_tombstones_after(key, last_processed)?
                    .saturating_sub(pending.tombstones),
                remaining_counter_groups: counter_groups.saturating_sub(pending.counter_groups),
            });
        }

        Ok(EngineProgress {
            configuration: self.configuration.name().to_string(),
            transformation: self.transformation.name.clone(),
            state: self.state(),
            collections,
            processed_per_second,
        })
    }

    /// Dry run against one document or its tombstone.
    ///
    /// Nothing is delivered, no checkpoint moves and no alerts are raised.
    /// Peer destinations get a capture of what they would have received.
    pub fn test_script(&self, input: TestScriptInput) -> TestScriptResult {
        let _suppression = AlertSuppression::new(&self.alerts_suppressed);
        let mut result = TestScriptResult::default();

        let script = match &self.script {
            Ok(script) => Arc::clone(script),
            Err(e) => {
                result.transformation_errors.push(e.to_string());
                return result;
            }
        };

        let mut item = if input.is_delete {
            ExtractedItem::from_tombstone(RawTombstone::for_document(&input.document), None)
        } else {
            ExtractedItem::from_document(input.document, None)
        };

        let filter = &self.transformation.collections;
        if !filter.applies_to(item.collection.as_deref())
            || (filter.is_all() && item.is_id_generator())
        {
            result.filtered = true;
            return result;
        }

        let mut transformer = script.instantiate();
        if let Err(e) = transformer.transform(&item) {
            result.transformation_errors.push(e.to_string());
        }
        item.dispose();

        result.transformed = transformer.take_results();
        result.debug_output = transformer.debug_output();
        if self.destination.kind() == DestinationKind::Peer {
            result.captured = Some(result.transformed.clone());
        }
        result
    }

    fn raise_alert(
        &self,
        alert_type: AlertType,
        severity: Severity,
        title: &str,
        message: impl Into<String>,
    ) {
        if self.alerts_suppressed.load(Ordering::Acquire) {
            return;
        }
        if let Some(alerts) = &self.ctx.alerts {
            alerts.raise(Alert::new(alert_type, severity, &self.name, title, message));
        }
    }

    fn dismiss_alert(&self, alert_type: AlertType) {
        if self.alerts_suppressed.load(Ordering::Acquire) {
            return;
        }
        if let Some(alerts) = &self.ctx.alerts {
            alerts.dismiss(Alert::id_for(alert_type, &self.name));
        }
    }

    /// Returns the previous state.
    fn set_state(&self, state: EngineState) -> EngineState {
        std::mem::replace(&mut *lock(&self.state), state)
    }

    fn set_state_unless_faulted(&self, state: EngineState) {
        let mut current = lock(&self.state);
        if *current != EngineState::ScriptFaulted {
            *current = state;
        }
    }

    fn observed(&self) -> MutexGuard<'_, Observed> {
        lock(&self.observed)
    }
}

impl Batch {
    fn into_fault(mut self, fault: TransformError) -> BatchResult {
        self.transformer.take_results();
        BatchResult {
            stats: self.stats,
            items: Vec::new(),
            change_vector: self.change_vector,
            fault: Some(fault),
        }
    }
}

impl LowMemoryObserver for PipelineEngine {
    fn on_low_memory(&self) {
        self.low_memory.store(true, Ordering::Release);
        self.reset_budget.store(true, Ordering::Release);
    }

    fn on_low_memory_over(&self) {
        self.low_memory.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
