//! `AuthEffectiveCache`: per-cluster "authentication URI" override map (spec
//! §4.G). Written exactly once per cluster, first writer wins; read by the
//! discovery engine when preparing the authentication configuration for a
//! probe of a cluster-derived node.

use std::collections::HashMap;
use std::sync::RwLock;

use url::Url;

#[derive(Debug, Default)]
pub struct AuthEffectiveCache {
    entries: RwLock<HashMap<String, Url>>,
}

impl AuthEffectiveCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `uri` for `cluster` if no value has been recorded yet.
    /// No-op (first writer wins) if a value already exists.
    pub fn set_if_absent(&self, cluster: &str, uri: Url) {
        let mut entries = self.entries.write().unwrap();
        entries.entry(cluster.to_string()).or_insert(uri);
    }

    pub fn get(&self, cluster: &str) -> Option<Url> {
        self.entries.read().unwrap().get(cluster).cloned()
    }

    pub fn clear(&self, cluster: &str) {
        self.entries.write().unwrap().remove(cluster);
    }
}
