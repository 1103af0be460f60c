//! Transformation capability: the pipeline depends only on these traits and the
//! two-tier error split, never on a concrete scripting runtime.

mod cache;
mod error;
mod traits;
mod types;

pub use cache::ScriptCache;
pub use error::TransformError;
pub use traits::{CompiledScript, ScriptCompiler, Transformer};
pub use types::{ScriptSource, TransformedItem};
