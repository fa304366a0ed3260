//! `NodeRegistry`: in-memory map of known nodes, their per-cluster address
//! tables, cluster membership, and the process-wide `FailedDestinations` set
//! (spec §3/§4.A).
//!
//! All maps here are many-reader/few-writer; a `std::sync::RwLock` around a
//! plain `HashMap` suffices (spec §9), matching the synchronization primitives
//! the rest of this codebase already reaches for rather than pulling in a
//! separate lock-free map crate.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};

use ipnet::IpNet;
use url::Url;

use crate::auth::AuthEffectiveCache;
use crate::filter::ModuleIdentifier;
use crate::queue::DiscoveryResultSink;
use crate::record::{attr, ServiceRecord};

/// An ordered `(CidrRange, SocketAddr)` table, most-specific range first.
/// The netmask-0 entry, if present, is the default fallback (spec §3).
#[derive(Debug, Clone, Default)]
pub struct CidrAddressTable {
    entries: Vec<(IpNet, SocketAddr)>,
}

impl CidrAddressTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a mapping, keeping entries ordered from most-specific
    /// (largest prefix length) to least-specific.
    pub fn insert(&mut self, range: IpNet, addr: SocketAddr) {
        let pos = self
            .entries
            .iter()
            .position(|(existing, _)| existing.prefix_len() < range.prefix_len())
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, (range, addr));
    }

    /// Iterate mappings most-specific to least-specific.
    pub fn iter(&self) -> impl Iterator<Item = &(IpNet, SocketAddr)> {
        self.entries.iter()
    }

    /// The mapping matching `source`, if any, preferring the most specific
    /// range; falls back to the netmask-0 default entry.
    pub fn resolve(&self, source: Option<IpAddr>) -> Option<SocketAddr> {
        if let Some(source) = source {
            for (range, addr) in &self.entries {
                if range.prefix_len() != 0 && range.contains(&source) {
                    return Some(*addr);
                }
            }
        }
        self.entries
            .iter()
            .find(|(range, _)| range.prefix_len() == 0)
            .map(|(_, addr)| *addr)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-cluster address tables for a node, keyed by transport scheme.
#[derive(Debug, Clone, Default)]
pub struct ClusterNodeInformation {
    pub address_tables_by_protocol: HashMap<String, CidrAddressTable>,
}

/// Everything known about one node: its cluster address tables and the
/// modules it has an established channel registered for (spec §3).
#[derive(Debug, Clone)]
pub struct NodeInformation {
    pub node_name: String,
    pub clusters: HashMap<String, ClusterNodeInformation>,
    module_list: HashSet<ModuleIdentifier>,
    /// URI of a channel already established to this node via prior module
    /// registration (independent of fresh discovery probes).
    established_uri: Option<Url>,
}

impl NodeInformation {
    fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            clusters: HashMap::new(),
            module_list: HashSet::new(),
            established_uri: None,
        }
    }

    /// Record that a channel to `uri` is registered for `module`.
    pub fn register_module(&mut self, module: ModuleIdentifier, uri: Url) {
        self.module_list.insert(module);
        self.established_uri = Some(uri);
    }

    /// Whether an established channel satisfies `filter`'s module constraint
    /// (spec §4.D's match pass). Pushes a matching [`ServiceRecord`] into
    /// `sink` and returns `true` on a match.
    pub fn discover(&self, filter: &crate::filter::FilterSpec, sink: &DiscoveryResultSink) -> bool {
        let uri = match &self.established_uri {
            Some(uri) => uri.clone(),
            None => return false,
        };
        let module = crate::filter::extract_module(filter);
        let matches = match module {
            Some(ref wanted) => self.module_list.contains(wanted),
            None => !self.module_list.is_empty(),
        };
        if !matches {
            return false;
        }

        let mut record = ServiceRecord::new(uri).with_attribute(attr::NODE, self.node_name.clone());
        for cluster in self.clusters.keys() {
            record = record.with_attribute(attr::CLUSTER, cluster.clone());
        }
        sink.push(record);
        true
    }
}

/// Process-wide hint set of URIs currently presumed unreachable (spec §3).
/// Eventually consistent by design: phase-2 retry tolerates stale entries.
#[derive(Debug, Default)]
pub struct FailedDestinations {
    failed: RwLock<HashSet<Url>>,
}

impl FailedDestinations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.failed.read().unwrap().contains(uri)
    }

    pub fn mark_failed(&self, uri: Url) {
        self.failed.write().unwrap().insert(uri);
    }

    /// Clear on a successful probe connection (spec §4.D).
    pub fn clear_uri(&self, uri: &Url) {
        self.failed.write().unwrap().remove(uri);
    }

    pub fn len(&self) -> usize {
        self.failed.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory registry of known nodes and cluster membership (spec §4.A).
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Arc<RwLock<NodeInformation>>>>,
    cluster_membership: RwLock<HashMap<String, HashSet<String>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: allocates on first observation, never overwrites.
    pub fn get_or_create(&self, node_name: &str) -> Arc<RwLock<NodeInformation>> {
        if let Some(existing) = self.nodes.read().unwrap().get(node_name) {
            return existing.clone();
        }
        let mut nodes = self.nodes.write().unwrap();
        nodes
            .entry(node_name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(NodeInformation::new(node_name))))
            .clone()
    }

    pub fn get(&self, node_name: &str) -> Option<Arc<RwLock<NodeInformation>>> {
        self.nodes.read().unwrap().get(node_name).cloned()
    }

    /// Snapshot of all known nodes; does not need point-in-time consistency.
    pub fn all(&self) -> Vec<Arc<RwLock<NodeInformation>>> {
        self.nodes.read().unwrap().values().cloned().collect()
    }

    /// Snapshot of cluster membership.
    pub fn cluster_membership(&self) -> HashMap<String, HashSet<String>> {
        self.cluster_membership.read().unwrap().clone()
    }

    pub fn cluster_nodes(&self, cluster: &str) -> HashSet<String> {
        self.cluster_membership
            .read()
            .unwrap()
            .get(cluster)
            .cloned()
            .unwrap_or_default()
    }

    /// Register `node` as a member of `cluster`. Records `registering_uri` in
    /// `auth_cache` under first-writer-wins semantics (spec §3).
    pub fn add_node(
        &self,
        cluster: &str,
        node: &str,
        registering_uri: Url,
        auth_cache: &AuthEffectiveCache,
    ) {
        let info = self.get_or_create(node);
        {
            let mut info = info.write().unwrap();
            info.clusters.entry(cluster.to_string()).or_default();
        }
        self.cluster_membership
            .write()
            .unwrap()
            .entry(cluster.to_string())
            .or_default()
            .insert(node.to_string());
        auth_cache.set_if_absent(cluster, registering_uri);
    }

    pub fn remove_node(&self, cluster: &str, node: &str) {
        if let Some(members) = self.cluster_membership.write().unwrap().get_mut(cluster) {
            members.remove(node);
        }
        if let Some(info) = self.nodes.read().unwrap().get(node) {
            info.write().unwrap().clusters.remove(cluster);
        }
    }

    pub fn remove_cluster(&self, cluster: &str, auth_cache: &AuthEffectiveCache) {
        self.cluster_membership.write().unwrap().remove(cluster);
        for info in self.nodes.read().unwrap().values() {
            info.write().unwrap().clusters.remove(cluster);
        }
        auth_cache.clear(cluster);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn cidr_table_prefers_most_specific_match() {
        let mut table = CidrAddressTable::new();
        table.insert("0.0.0.0/0".parse().unwrap(), addr("10.0.0.1:8080"));
        table.insert("10.0.0.0/24".parse().unwrap(), addr("10.0.0.2:8080"));

        let specific = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(table.resolve(Some(specific)), Some(addr("10.0.0.2:8080")));

        let elsewhere = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(table.resolve(Some(elsewhere)), Some(addr("10.0.0.1:8080")));
    }

    #[test]
    fn cidr_table_falls_back_to_default_when_source_unknown() {
        let mut table = CidrAddressTable::new();
        table.insert("0.0.0.0/0".parse().unwrap(), addr("10.0.0.1:8080"));
        assert_eq!(table.resolve(None), Some(addr("10.0.0.1:8080")));
    }

    #[test]
    fn cidr_table_supports_ipv6() {
        let mut table = CidrAddressTable::new();
        table.insert("::/0".parse().unwrap(), addr("[::1]:8080"));
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(table.resolve(Some(v6)), Some(addr("[::1]:8080")));
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let registry = NodeRegistry::new();
        let a = registry.get_or_create("n1");
        let b = registry.get_or_create("n1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn add_node_updates_membership_and_first_writer_wins_auth() {
        let registry = NodeRegistry::new();
        let auth = AuthEffectiveCache::new();

        registry.add_node("c1", "n1", Url::parse("remote://h1:8080").unwrap(), &auth);
        registry.add_node("c1", "n2", Url::parse("remote://h2:8080").unwrap(), &auth);

        let members = registry.cluster_nodes("c1");
        assert!(members.contains("n1"));
        assert!(members.contains("n2"));
        assert_eq!(
            auth.get("c1"),
            Some(Url::parse("remote://h1:8080").unwrap())
        );
    }

    #[test]
    fn remove_node_and_remove_cluster() {
        let registry = NodeRegistry::new();
        let auth = AuthEffectiveCache::new();
        registry.add_node("c1", "n1", Url::parse("remote://h1:8080").unwrap(), &auth);

        registry.remove_node("c1", "n1");
        assert!(registry.cluster_nodes("c1").is_empty());

        registry.add_node("c1", "n1", Url::parse("remote://h1:8080").unwrap(), &auth);
        registry.remove_cluster("c1", &auth);
        assert!(registry.cluster_membership().get("c1").is_none());
        assert!(auth.get("c1").is_none());
    }

    #[test]
    fn failed_destinations_mark_contains_clear() {
        let failed = FailedDestinations::new();
        let uri = Url::parse("remote://h1:8080").unwrap();
        assert!(!failed.contains(&uri));
        failed.mark_failed(uri.clone());
        assert!(failed.contains(&uri));
        failed.clear_uri(&uri);
        assert!(!failed.contains(&uri));
    }
}
