//! Types shared by the pipeline engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::ConsensusError;
use crate::item::RawDocument;
use crate::storage::StorageError;
use crate::transform::TransformedItem;

/// Logical state of an engine's loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Extracting,
    Transforming,
    Loading,
    Committing,
    FallbackWait,
    CpuCreditsWait,
    /// Cancelled or disposed.
    Stopped,
    /// The script does not compile. Only a configuration change recovers.
    ScriptFaulted,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Extracting => "extracting",
            EngineState::Transforming => "transforming",
            EngineState::Loading => "loading",
            EngineState::Committing => "committing",
            EngineState::FallbackWait => "fallback_wait",
            EngineState::CpuCreditsWait => "cpu_credits_wait",
            EngineState::Stopped => "stopped",
            EngineState::ScriptFaulted => "script_faulted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Stopped | EngineState::ScriptFaulted)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Checkpoint commit failed: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Engine cancelled")]
    Cancelled,

    #[error("Failed to spawn engine thread: {0}")]
    Spawn(String),

    #[error("Engine thread '{0}' panicked")]
    ThreadPanicked(String),
}

/// How one loop iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// A checkpoint was committed; loop again right away.
    Progress { checkpoint: u64 },
    /// Nothing to commit.
    Idle,
    /// The destination refused the batch; fallback is in effect.
    LoadFailed,
    /// The script cannot compile; the engine is done.
    ScriptFaulted,
}

/// Input of a dry run.
#[derive(Debug, Clone)]
pub struct TestScriptInput {
    pub document: RawDocument,
    /// Run against the document's tombstone instead of the document.
    pub is_delete: bool,
}

/// What a dry run produced. Nothing is delivered and no checkpoint moves.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestScriptResult {
    pub transformed: Vec<TransformedItem>,
    /// Items a peer destination would have received.
    pub captured: Option<Vec<TransformedItem>>,
    pub transformation_errors: Vec<String>,
    pub debug_output: Vec<String>,
    /// The document was outside the transformation's collections.
    pub filtered: bool,
}

/// Remaining work for one collection, or for every collection under `*`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionProgress {
    pub collection: String,
    pub remaining_documents: u64,
    pub remaining_tombstones: u64,
    pub remaining_counter_groups: u64,
}

impl CollectionProgress {
    pub fn remaining(&self) -> u64 {
        self.remaining_documents + self.remaining_tombstones + self.remaining_counter_groups
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineProgress {
    pub configuration: String,
    pub transformation: String,
    pub state: EngineState,
    pub collections: Vec<CollectionProgress>,
    /// Exponentially smoothed throughput.
    pub processed_per_second: f64,
}

impl EngineProgress {
    pub fn is_completed(&self) -> bool {
        self.collections.iter().all(|c| c.remaining() == 0)
    }
}
