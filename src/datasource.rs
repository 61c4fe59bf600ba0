//! Data sources: namespaced, versioned side lookups for signatures
//!
//! Data sources are registered with the engine at construction and looked
//! up by `(namespace, id)` from a signature's init context.

use crate::error::{Result, WatchError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Side-lookup capability signatures may query during evaluation
pub trait DataSource: Send + Sync {
    /// Get a value for `key`
    ///
    /// Fails with `DataNotFound` when nothing matches the key and with
    /// `KeyNotSupported` when the key is not one of the kinds in `keys()`.
    fn get(&self, key: &serde_json::Value) -> Result<HashMap<String, serde_json::Value>>;

    /// Version of the result schema; bumped on breaking changes
    fn version(&self) -> u32;

    /// Key kinds this data source accepts (e.g. "string")
    fn keys(&self) -> Vec<String>;

    /// JSON schema of `get` results
    fn schema(&self) -> String;

    /// Namespace, to avoid id collisions
    fn namespace(&self) -> &str;

    fn id(&self) -> &str;
}

/// namespace → id → data source
///
/// Entries are never removed once registered.
#[derive(Default)]
pub struct DataSourceRegistry {
    sources: RwLock<HashMap<String, HashMap<String, Arc<dyn DataSource>>>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source: Arc<dyn DataSource>) -> Result<()> {
        let namespace = source.namespace().to_string();
        let id = source.id().to_string();

        let mut sources = self.sources.write().map_err(|e| {
            WatchError::Config(format!("Data source registry lock poisoned: {}", e))
        })?;
        let by_id = sources.entry(namespace.clone()).or_default();
        if by_id.contains_key(&id) {
            return Err(WatchError::DuplicateDataSource { namespace, id });
        }
        by_id.insert(id, source);
        Ok(())
    }

    pub fn get(&self, namespace: &str, id: &str) -> Option<Arc<dyn DataSource>> {
        let sources = self.sources.read().ok()?;
        sources.get(namespace)?.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sources
            .read()
            .map(|s| s.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
