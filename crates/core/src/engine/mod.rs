//! Pipeline engine: one extract, transform and load loop per (configuration, transformation).

mod admission;
mod context;
mod extract;
mod fallback;
mod pipeline;
mod thread;
mod types;

pub use admission::{Admission, BatchCounters, BatchLimits, Verdict, NO_MORE_ITEMS};
pub use context::EngineContext;
pub use fallback::{FallbackPolicy, MIN_FALLBACK};
pub use pipeline::PipelineEngine;
pub use types::{
    CollectionProgress, EngineError, EngineProgress, EngineState, IterationOutcome,
    TestScriptInput, TestScriptResult,
};
