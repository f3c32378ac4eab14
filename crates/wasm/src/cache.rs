//! Compiled-module LRU cache, keyed by module id rather than a
//! filesystem path: module bytes are immutable once stored, so the
//! compiled artifact is safe to keep around indefinitely until the
//! caller explicitly invalidates it after an update.

use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;
use wasmtime::{Engine, Module};

use crate::error::{WasmError, WasmResult};

/// LRU cache of compiled [`Module`]s, sized by entry count.
pub struct ModuleCache {
    engine: Arc<Engine>,
    entries: Mutex<lru::LruCache<Uuid, Arc<Module>>>,
}

impl std::fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache")
            .field("len", &self.entries.lock().len())
            .finish()
    }
}

impl ModuleCache {
    #[must_use]
    pub fn new(engine: Arc<Engine>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            engine,
            entries: Mutex::new(lru::LruCache::new(capacity)),
        }
    }

    /// Return the compiled module for `id`, compiling and caching
    /// `bytes` on a miss.
    pub fn get_or_compile(&self, id: Uuid, bytes: &[u8]) -> WasmResult<Arc<Module>> {
        if let Some(module) = self.entries.lock().get(&id) {
            return Ok(Arc::clone(module));
        }

        let module = Module::new(&self.engine, bytes)
            .map_err(|e| WasmError::InvalidModule(e.to_string()))?;
        let module = Arc::new(module);
        self.entries.lock().put(id, Arc::clone(&module));
        Ok(module)
    }

    /// Drop the cached entry for `id`, e.g. after the module's bytes
    /// are updated in the store.
    pub fn invalidate(&self, id: Uuid) {
        self.entries.lock().pop(&id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, 0x01, 0x04, 0x01, 0x60, 0x00, 0x00, 0x03,
        0x02, 0x01, 0x00, 0x07, 0x0a, 0x01, 0x06, 0x5f, 0x73, 0x74, 0x61, 0x72, 0x74, 0x00, 0x00,
        0x0a, 0x04, 0x01, 0x02, 0x00, 0x0b,
    ];

    #[test]
    fn caches_and_invalidates_by_id() {
        let engine = Arc::new(Engine::default());
        let cache = ModuleCache::new(engine, 2);
        let id = Uuid::new_v4();

        assert!(cache.is_empty());
        cache.get_or_compile(id, MINIMAL_WASM).unwrap();
        assert_eq!(cache.len(), 1);

        cache.get_or_compile(id, MINIMAL_WASM).unwrap();
        assert_eq!(cache.len(), 1);

        cache.invalidate(id);
        assert!(cache.is_empty());
    }

    #[test]
    fn evicts_least_recently_used_entry() {
        let engine = Arc::new(Engine::default());
        let cache = ModuleCache::new(engine, 1);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        cache.get_or_compile(first, MINIMAL_WASM).unwrap();
        cache.get_or_compile(second, MINIMAL_WASM).unwrap();

        assert_eq!(cache.len(), 1);
        assert!(cache.entries.lock().peek(&first).is_none());
    }
}
