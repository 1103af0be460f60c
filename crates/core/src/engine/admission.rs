//! Batch admission control, evaluated before every item.

use std::time::{Duration, Instant};

use crate::config::EtlSettings;
use crate::item::ItemType;
use crate::resources::{CpuCreditsSignal, ResourceToken};
use crate::stats::TypeCounts;

/// Completion reason when the stream ran dry.
pub const NO_MORE_ITEMS: &str = "No more items to process";

/// Limits taken from the settings when a batch starts.
#[derive(Debug, Clone)]
pub struct BatchLimits {
    pub max_documents: Option<u64>,
    pub max_counter_groups: Option<u64>,
    pub max_items: Option<u64>,
    pub max_batch_size: Option<u64>,
    pub timeout: Duration,
    pub low_memory_min_batch_size: u64,
}

impl BatchLimits {
    pub fn from_settings(settings: &EtlSettings) -> Self {
        Self {
            max_documents: settings.max_number_of_extracted_documents,
            max_counter_groups: settings.max_number_of_extracted_counter_groups,
            max_items: settings.max_number_of_extracted_items,
            max_batch_size: settings.max_batch_size,
            timeout: settings.extract_and_transform_timeout(),
            low_memory_min_batch_size: settings.low_memory_min_batch_size,
        }
    }

    fn max_for(&self, item_type: ItemType) -> Option<u64> {
        match item_type {
            ItemType::Document => self.max_documents,
            ItemType::CounterGroup => self.max_counter_groups,
        }
    }
}

/// Running totals of the current batch.
#[derive(Debug, Clone)]
pub struct BatchCounters {
    pub extracted: TypeCounts,
    /// Items admitted so far, filtered ones included.
    pub batch_size: u64,
    pub started_at: Instant,
}

impl BatchCounters {
    pub fn new(started_at: Instant) -> Self {
        Self {
            extracted: TypeCounts::default(),
            batch_size: 0,
            started_at,
        }
    }

    pub fn admit(&mut self, item_type: ItemType) {
        self.extracted.increment(item_type);
        self.batch_size += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Stop {
        reason: String,
        /// The read transaction must not be reused after this batch.
        non_reusable: bool,
    },
}

impl Verdict {
    fn stop(reason: String) -> Self {
        Verdict::Stop {
            reason,
            non_reusable: false,
        }
    }
}

/// Shared signals consulted on every check.
pub struct Admission<'a> {
    pub limits: &'a BatchLimits,
    pub cpu_credits: &'a CpuCreditsSignal,
    pub low_memory: bool,
}

impl Admission<'_> {
    /// Decide whether the next item of `item_type` may join the batch.
    ///
    /// `unconditional` marks counter groups inside the window of documents
    /// already processed in this batch; those are never cut off.
    pub fn check(
        &self,
        item_type: ItemType,
        unconditional: bool,
        counters: &BatchCounters,
        token: &mut ResourceToken,
        overhead: u64,
        now: Instant,
    ) -> Verdict {
        if unconditional {
            return Verdict::Proceed;
        }

        if self.cpu_credits.is_exhausted() {
            return Verdict::stop(
                "Stopping the batch because the CPU credits were exhausted".to_string(),
            );
        }

        if let Some(max) = self.limits.max_for(item_type) {
            let extracted = counters.extracted.get(item_type);
            if extracted >= max {
                return Verdict::stop(format!(
                    "Stopping the batch after extracting {} {} because it reached the maximum number of extracted {} ({})",
                    extracted,
                    item_type.as_str(),
                    item_type.as_str(),
                    max
                ));
            }
        }

        if let Some(max) = self.limits.max_items {
            let total = counters.extracted.total();
            if total >= max {
                return Verdict::stop(format!(
                    "Stopping the batch after extracting {} items because it reached the maximum number of extracted items ({})",
                    total, max
                ));
            }
        }

        let elapsed = now.saturating_duration_since(counters.started_at);
        if elapsed > self.limits.timeout {
            return Verdict::stop(format!(
                "Stopping the batch after {:?} because it exceeded the extract and transform timeout ({:?})",
                elapsed, self.limits.timeout
            ));
        }

        if self.low_memory && counters.batch_size >= self.limits.low_memory_min_batch_size {
            return Verdict::stop(format!(
                "Stopping the batch because of low memory (batch size: {})",
                counters.batch_size
            ));
        }

        if !token.within_budget(overhead) {
            return Verdict::Stop {
                reason: format!(
                    "Stopping the batch because allocated memory ({} bytes) exceeded the budget ({} bytes) and it could not be increased",
                    token.allocated_bytes().saturating_add(overhead),
                    token.ceiling()
                ),
                non_reusable: true,
            };
        }

        if let Some(max) = self.limits.max_batch_size {
            if counters.batch_size >= max {
                return Verdict::stop(format!(
                    "Stopping the batch because it reached the maximum batch size ({})",
                    max
                ));
            }
        }

        Verdict::Proceed
    }
}
