use std::sync::Arc;

use crate::item::ExtractedItem;

use super::{ScriptSource, TransformError, TransformedItem};

/// One script instance, owned by a single engine for the duration of a batch.
pub trait Transformer: Send {
    /// Run the script on `item`, accumulating its output.
    fn transform(&mut self, item: &ExtractedItem) -> Result<(), TransformError>;

    /// Drain everything accumulated since the last call.
    fn take_results(&mut self) -> Vec<TransformedItem>;

    /// Lines the script printed while running.
    fn debug_output(&self) -> Vec<String> {
        Vec::new()
    }

    /// Bytes held in output buffers not yet handed to the destination.
    fn buffered_bytes(&self) -> u64 {
        0
    }
}

/// A compiled script that can be instantiated any number of times.
pub trait CompiledScript: Send + Sync {
    /// Whether the script reacts to counter changes.
    fn handles_counters(&self) -> bool;

    fn instantiate(&self) -> Box<dyn Transformer>;
}

pub trait ScriptCompiler: Send + Sync {
    fn compile(&self, source: &ScriptSource) -> Result<Arc<dyn CompiledScript>, TransformError>;
}
