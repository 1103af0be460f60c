//! Bounded cache of compiled scripts keyed by a content hash of their sources.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::debug;

use crate::sync::lock;

use super::{CompiledScript, ScriptCompiler, ScriptSource, TransformError};

/// Compiled scripts shared by every engine of a database.
///
/// When full, the least recently used entry is evicted. Compile failures are
/// never cached, so a corrected script is picked up on the next attempt.
pub struct ScriptCache {
    entries: Mutex<LruCache<String, Arc<dyn CompiledScript>>>,
}

impl ScriptCache {
    /// A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get_or_compile(
        &self,
        source: &ScriptSource,
        compiler: &dyn ScriptCompiler,
    ) -> Result<Arc<dyn CompiledScript>, TransformError> {
        let key = source.content_hash();

        if let Some(script) = lock(&self.entries).get(&key) {
            return Ok(Arc::clone(script));
        }

        let script = compiler.compile(source)?;

        let mut entries = lock(&self.entries);
        // Another engine may have compiled the same source meanwhile.
        if let Some(existing) = entries.get(&key) {
            return Ok(Arc::clone(existing));
        }
        if let Some((evicted, _)) = entries.push(key, Arc::clone(&script)) {
            debug!(key = %evicted, "Evicting compiled script");
        }
        Ok(script)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn contains(&self, source: &ScriptSource) -> bool {
        lock(&self.entries).contains(&source.content_hash())
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}
