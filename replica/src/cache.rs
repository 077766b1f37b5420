//! In-flight entry cache
//!
//! Holds entries between "appended" and "applied" so the applier does not read back
//! what was just written. A miss is never an error: the log holds an equivalent entry
//! and the applier falls back to it.

use serde_derive::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::entry::LogEntry;
use crate::metrics;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Upper bound on cached entries, the lowest index is evicted first
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            max_entries: 1024,
        }
    }
}

#[derive(Debug)]
pub struct InFlightCache {
    config: CacheConfig,
    entries: Mutex<BTreeMap<u64, Arc<LogEntry>>>,
}

impl InFlightCache {
    pub fn new(config: CacheConfig) -> Self {
        InFlightCache {
            config,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Arc<LogEntry>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, index: u64, entry: LogEntry) {
        if !self.config.enabled || self.config.max_entries == 0 {
            return;
        }
        let mut entries = self.lock();
        entries.insert(index, Arc::new(entry));
        while entries.len() > self.config.max_entries {
            if let Some((evicted, _)) = entries.pop_first() {
                log::debug!("in-flight cache full, evicted index {}", evicted);
            }
        }
    }

    pub fn retrieve(&self, index: u64) -> Option<Arc<LogEntry>> {
        let found = self.lock().get(&index).cloned();
        let result = if found.is_some() { "hit" } else { "miss" };
        metrics::CACHE_COUNTER_VEC.with_label_values(&[result]).inc();
        found
    }

    pub fn unregister(&self, index: u64) {
        self.lock().remove(&index);
    }

    /// Drops every entry at or below an applied index
    pub fn prune(&self, up_to: u64) {
        let mut entries = self.lock();
        let kept = entries.split_off(&(up_to + 1));
        *entries = kept;
    }

    /// Drops every entry from a truncated log position on
    pub fn truncate(&self, from: u64) {
        let _ = self.lock().split_off(&from);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for InFlightCache {
    fn default() -> Self {
        InFlightCache::new(CacheConfig::default())
    }
}
