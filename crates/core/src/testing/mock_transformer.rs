//! Mock script compiler and transformer for testing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::item::ExtractedItem;
use crate::transform::{
    CompiledScript, ScriptCompiler, ScriptSource, TransformError, TransformedItem, Transformer,
};

/// Behaviour parsed from a script text.
///
/// Scripts are `;`-separated directives; anything unknown is ignored:
/// - `fail-compile`: compilation fails
/// - `counters`: the script handles counter groups
/// - `fail-runtime:<id>`: transforming `<id>` fails
/// - `compile-error-at-runtime`: the first transform reports a compile-class failure
/// - `debug`: every transform writes a debug line
#[derive(Debug, Clone, Default)]
struct Directives {
    handles_counters: bool,
    failing_ids: HashSet<String>,
    compile_error_at_runtime: bool,
    debug: bool,
}

/// Mock implementation of [`ScriptCompiler`].
#[derive(Debug, Default)]
pub struct MockScriptCompiler {
    compilations: AtomicUsize,
}

impl MockScriptCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times a script was actually compiled (cache misses).
    pub fn compile_count(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }
}

impl ScriptCompiler for MockScriptCompiler {
    fn compile(&self, source: &ScriptSource) -> Result<Arc<dyn CompiledScript>, TransformError> {
        self.compilations.fetch_add(1, Ordering::SeqCst);

        let mut directives = Directives::default();
        for directive in source.script.split(';').map(str::trim) {
            match directive {
                "fail-compile" => {
                    return Err(TransformError::compile(format!(
                        "unexpected token in script of '{}'",
                        source.transformation
                    )))
                }
                "counters" => directives.handles_counters = true,
                "compile-error-at-runtime" => directives.compile_error_at_runtime = true,
                "debug" => directives.debug = true,
                other => {
                    if let Some(id) = other.strip_prefix("fail-runtime:") {
                        directives.failing_ids.insert(id.to_lowercase());
                    }
                }
            }
        }

        Ok(Arc::new(MockCompiledScript { directives }))
    }
}

struct MockCompiledScript {
    directives: Directives,
}

impl CompiledScript for MockCompiledScript {
    fn handles_counters(&self) -> bool {
        self.directives.handles_counters
    }

    fn instantiate(&self) -> Box<dyn Transformer> {
        Box::new(MockTransformer::new(self.directives.clone()))
    }
}

/// Copies every item to the output unchanged.
pub struct MockTransformer {
    directives: Directives,
    results: Vec<TransformedItem>,
    buffered: u64,
    debug_output: Vec<String>,
}

impl MockTransformer {
    fn new(directives: Directives) -> Self {
        Self {
            directives,
            results: Vec::new(),
            buffered: 0,
            debug_output: Vec::new(),
        }
    }
}

impl Transformer for MockTransformer {
    fn transform(&mut self, item: &ExtractedItem) -> Result<(), TransformError> {
        if self.directives.debug {
            self.debug_output
                .push(format!("{} @ {}", item.id, item.etag));
        }
        if self.directives.compile_error_at_runtime {
            return Err(TransformError::compile("script references an undefined function"));
        }
        if self.directives.failing_ids.contains(&item.id.to_lowercase()) {
            return Err(TransformError::runtime(&item.id, "simulated script failure"));
        }

        self.buffered += item.payload_size();
        self.results.push(TransformedItem {
            id: item.id.clone(),
            etag: item.etag,
            collection: item.collection.clone(),
            is_delete: item.is_delete,
            item_type: item.item_type(),
            payload: item.payload().cloned(),
        });
        Ok(())
    }

    fn take_results(&mut self) -> Vec<TransformedItem> {
        self.buffered = 0;
        std::mem::take(&mut self.results)
    }

    fn debug_output(&self) -> Vec<String> {
        self.debug_output.clone()
    }

    fn buffered_bytes(&self) -> u64 {
        self.buffered
    }
}
