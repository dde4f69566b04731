use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CacheError, RosterCache};

/// In-process cache. Clones share the same entries, so several coordinators
/// built from clones behave like workers sharing one cache server.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().remove(key)
    }
}

#[async_trait]
impl RosterCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
