use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of recent errors kept per engine.
pub const MAX_RECENT_ERRORS: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub message: String,
}

/// Cumulative statistics of one engine since it started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EtlProcessStatistics {
    pub last_processed_etag: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_change_vector: Option<String>,
    pub transformation_successes: u64,
    pub transformation_errors: u64,
    pub load_successes: u64,
    pub load_errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transformation_error_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_load_error_time: Option<DateTime<Utc>>,
    pub was_latest_load_successful: bool,
    pub recent_errors: VecDeque<ErrorRecord>,
}

impl EtlProcessStatistics {
    pub fn record_transformation_successes(&mut self, count: u64) {
        self.transformation_successes += count;
    }

    /// Returns true when errors caught up with successes and an alert is due.
    pub fn record_transformation_error(&mut self, document_id: &str, message: &str) -> bool {
        self.transformation_errors += 1;
        self.last_transformation_error_time = Some(Utc::now());
        self.push_error(Some(document_id.to_string()), message.to_string());
        self.transformation_errors >= self.transformation_successes
    }

    /// Returns true when the previous load had failed, so its alert can be dismissed.
    pub fn record_load_success(&mut self, items: u64) -> bool {
        let recovered = !self.was_latest_load_successful && self.load_errors > 0;
        self.load_successes += items;
        self.was_latest_load_successful = true;
        recovered
    }

    /// Returns true when load errors caught up with successes and an alert is due.
    pub fn record_load_error(&mut self, message: &str, items: u64) -> bool {
        self.load_errors += items.max(1);
        self.last_load_error_time = Some(Utc::now());
        self.was_latest_load_successful = false;
        self.push_error(None, message.to_string());
        self.load_errors >= self.load_successes
    }

    pub fn record_checkpoint(&mut self, etag: u64, change_vector: Option<String>) {
        self.last_processed_etag = self.last_processed_etag.max(etag);
        if change_vector.is_some() {
            self.last_change_vector = change_vector;
        }
    }

    fn push_error(&mut self, document_id: Option<String>, message: String) {
        if self.recent_errors.len() == MAX_RECENT_ERRORS {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(ErrorRecord {
            at: Utc::now(),
            document_id,
            message,
        });
    }
}
