use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::{RelationalStore, SqliteStore};
use crate::error::{Result, TabloadError};

/// Thread-safe LRU cache of resolved connections
///
/// Maps a connection identifier from the config's `[connections]` table to a
/// store handle, keeping at most `capacity` handles alive.
pub struct StoreCache {
    connections: HashMap<String, PathBuf>,
    cache: Mutex<LruCache<String, Arc<dyn RelationalStore>>>,
}

impl StoreCache {
    /// Create a new cache over the configured connections
    ///
    /// A capacity of 0 is treated as 1.
    pub fn new(connections: HashMap<String, PathBuf>, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            connections,
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Resolve a connection identifier to a store handle
    pub fn resolve(&self, connection: &str) -> Result<Arc<dyn RelationalStore>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| TabloadError::Config("store cache lock poisoned".to_string()))?;

        if let Some(store) = cache.get(connection) {
            return Ok(Arc::clone(store));
        }

        let path = self
            .connections
            .get(connection)
            .ok_or_else(|| TabloadError::NotFound(format!("connection {}", connection)))?;

        log::debug!("Opening connection '{}' at {}", connection, path.display());
        let store: Arc<dyn RelationalStore> = Arc::new(SqliteStore::open(path));
        cache.put(connection.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Get the current number of cached handles
    pub fn len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
