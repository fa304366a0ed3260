//! Integration coverage for the literal resolution scenarios and the
//! property tests they imply.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use ejb_destination_resolver::auth::AuthEffectiveCache;
use ejb_destination_resolver::config::DiscoveryConfig;
use ejb_destination_resolver::discovery::{DiscoveryCollaborators, DiscoveryEngine};
use ejb_destination_resolver::filter::{extract_module, FilterSpec};
use ejb_destination_resolver::locator::{Affinity, Locator};
use ejb_destination_resolver::record::attr;
use ejb_destination_resolver::registry::{FailedDestinations, NodeRegistry};
use ejb_destination_resolver::resolver::Resolver;
use ejb_destination_resolver::selectors::ClusterNodeSelector;
use ejb_destination_resolver::transport::{
    AuthConfig, AuthenticationClient, Channel, Connection, Endpoint, InvocationContext, SslContext,
    TransportProvider,
};

struct StubTransport {
    supported_scheme: &'static str,
}

#[async_trait]
impl TransportProvider for StubTransport {
    fn supports_protocol(&self, scheme: &str) -> bool {
        scheme == self.supported_scheme
    }

    fn source_address(&self, _dest: SocketAddr) -> Option<SocketAddr> {
        None
    }

    fn is_connected(&self, _uri: &Url) -> bool {
        false
    }

    async fn open_channel(&self, connection: Connection) -> Result<Channel, String> {
        Ok(Channel { uri: connection.uri })
    }
}

struct StubEndpoint;

#[async_trait]
impl Endpoint for StubEndpoint {
    fn is_valid_uri_scheme(&self, _scheme: &str) -> bool {
        true
    }

    async fn get_connected_identity(
        &self,
        _uri: &Url,
        _ssl_context: &SslContext,
        _auth_config: &AuthConfig,
    ) -> Result<(), String> {
        Ok(())
    }
}

struct StubAuth;

#[async_trait]
impl AuthenticationClient for StubAuth {
    async fn get_ssl_context(&self, _uri: &Url) -> SslContext {
        SslContext::default()
    }

    async fn get_authentication_configuration(&self, _uri: &Url) -> AuthConfig {
        AuthConfig::default()
    }
}

struct NullClusterSelector;

#[async_trait]
impl ClusterNodeSelector for NullClusterSelector {
    async fn select_node(&self, _cluster: &str, _connected: &[String], _available: &[String]) -> Option<String> {
        None
    }
}

fn config_with_endpoints(endpoints: Vec<Url>) -> DiscoveryConfig {
    DiscoveryConfig {
        configured_endpoints: endpoints,
        max_connected_cluster_nodes: 10,
        queue_capacity: 256,
        service_type: "ejb.jboss".to_string(),
    }
}

fn resolver_for(registry: Arc<NodeRegistry>, failed: Arc<FailedDestinations>, config: &DiscoveryConfig) -> Resolver {
    let collaborators = DiscoveryCollaborators {
        transport: Arc::new(StubTransport { supported_scheme: "remote" }),
        endpoint: Arc::new(StubEndpoint),
        auth_client: Arc::new(StubAuth),
        registry,
        failed,
        auth_cache: Arc::new(AuthEffectiveCache::new()),
    };
    let engine = DiscoveryEngine::new(collaborators, config);
    Resolver::new(engine, config.service_type.clone())
}

fn locator_with(affinity: Affinity) -> Locator {
    Locator::new("app", "module").with_affinity(affinity)
}

fn register_demo_module(registry: &NodeRegistry, node: &str, uri: Url) {
    let module = extract_module(&FilterSpec::equals(attr::EJB_MODULE, "app/module")).unwrap();
    registry.get_or_create(node).write().unwrap().register_module(module, uri);
}

#[tokio::test]
async fn direct_uri_resolves_without_discovery() {
    let config = config_with_endpoints(vec![]);
    let resolver = resolver_for(Arc::new(NodeRegistry::new()), Arc::new(FailedDestinations::new()), &config);

    let uri = Url::parse("remote://h1:8080").unwrap();
    let mut ctx = InvocationContext::new(locator_with(Affinity::Uri(uri.clone())));

    resolver.resolve(&mut ctx).await.unwrap();

    assert_eq!(ctx.destination(), Some(&uri));
    assert_eq!(ctx.target_affinity(), &Affinity::Uri(uri));
}

#[tokio::test]
async fn direct_uri_blacklisted_yields_no_destination() {
    let config = config_with_endpoints(vec![]);
    let resolver = resolver_for(Arc::new(NodeRegistry::new()), Arc::new(FailedDestinations::new()), &config);

    let uri = Url::parse("remote://h1:8080").unwrap();
    let mut ctx = InvocationContext::new(locator_with(Affinity::Uri(uri.clone())));
    ctx.blacklist_add(uri);

    resolver.resolve(&mut ctx).await.unwrap();

    assert!(ctx.destination().is_none());
}

#[tokio::test]
async fn single_node_cluster_resolves_to_its_node() {
    let registry = Arc::new(NodeRegistry::new());
    let auth = AuthEffectiveCache::new();
    let uri = Url::parse("remote://10.0.0.1:8080").unwrap();
    registry.add_node("c1", "n1", uri.clone(), &auth);
    register_demo_module(&registry, "n1", uri.clone());

    let config = config_with_endpoints(vec![]);
    let resolver = resolver_for(registry, Arc::new(FailedDestinations::new()), &config);

    let mut ctx = InvocationContext::new(locator_with(Affinity::Cluster("c1".to_string())));
    resolver.resolve(&mut ctx).await.unwrap();

    assert_eq!(ctx.destination(), Some(&uri));
    assert_eq!(ctx.target_affinity(), &Affinity::Node("n1".to_string()));
    assert_eq!(ctx.initial_cluster(), Some("c1"));
}

#[tokio::test]
async fn all_configured_endpoints_failed_triggers_phase_two_retry() {
    let uri1 = Url::parse("remote://h1:8080").unwrap();
    let uri2 = Url::parse("remote://h2:8080").unwrap();
    let failed = Arc::new(FailedDestinations::new());
    failed.mark_failed(uri1.clone());
    failed.mark_failed(uri2.clone());

    let config = config_with_endpoints(vec![uri1, uri2]);
    let resolver = resolver_for(Arc::new(NodeRegistry::new()), failed, &config);

    let before = ejb_destination_resolver::metrics::DISCOVERY_PHASE2_RETRIES_TOTAL.get();
    let mut ctx = InvocationContext::new(locator_with(Affinity::None));
    resolver.resolve(&mut ctx).await.unwrap();

    assert!(ctx.destination().is_none());
    assert_eq!(
        ejb_destination_resolver::metrics::DISCOVERY_PHASE2_RETRIES_TOTAL.get(),
        before + 1
    );
}

#[tokio::test]
async fn first_match_falls_back_to_cluster_discovery() {
    let registry = Arc::new(NodeRegistry::new());
    let auth = AuthEffectiveCache::new();
    let mut candidates = HashSet::new();
    for (node, ip) in [("n1", "10.0.0.5:8080"), ("n2", "10.0.0.6:8080")] {
        let uri = Url::parse(&format!("remote://{ip}")).unwrap();
        registry.add_node("c1", node, uri.clone(), &auth);
        register_demo_module(&registry, node, uri.clone());
        candidates.insert(uri);
    }

    let config = config_with_endpoints(vec![]);
    let resolver = resolver_for(registry, Arc::new(FailedDestinations::new()), &config);

    let mut ctx = InvocationContext::new(locator_with(Affinity::Cluster("c1".to_string())))
        .with_weak_affinity(Affinity::Node("nX".to_string()));

    resolver.resolve(&mut ctx).await.unwrap();

    // Primary first-match filter (cluster=c1 ∧ node=nX) finds nothing since
    // "nX" was never registered; resolution falls back to cluster discovery
    // and the default `ClusterNodeSelector` picks one of the two members.
    let destination = ctx.destination().expect("fallback cluster discovery should resolve a node");
    assert!(candidates.contains(destination));
    assert!(matches!(ctx.target_affinity(), Affinity::Node(n) if n == "n1" || n == "n2"));
}

#[tokio::test]
async fn selector_returning_none_is_fatal_with_suppressed_problems() {
    let registry = Arc::new(NodeRegistry::new());
    let auth = AuthEffectiveCache::new();
    for (node, ip) in [("n1", "10.0.0.1:8080"), ("n2", "10.0.0.2:8080")] {
        let uri = Url::parse(&format!("remote://{ip}")).unwrap();
        registry.add_node("c1", node, uri.clone(), &auth);
        register_demo_module(&registry, node, uri);
    }

    let config = config_with_endpoints(vec![]);
    let collaborators = DiscoveryCollaborators {
        transport: Arc::new(StubTransport { supported_scheme: "remote" }),
        endpoint: Arc::new(StubEndpoint),
        auth_client: Arc::new(StubAuth),
        registry,
        failed: Arc::new(FailedDestinations::new()),
        auth_cache: Arc::new(AuthEffectiveCache::new()),
    };
    let engine = DiscoveryEngine::new(collaborators, &config);
    let resolver =
        Resolver::new(engine, config.service_type.clone()).with_cluster_selector(Arc::new(NullClusterSelector));

    let mut ctx = InvocationContext::new(locator_with(Affinity::Cluster("c1".to_string())));
    let result = resolver.resolve(&mut ctx).await;

    let err = result.expect_err("a null selector result must be fatal");
    assert!(matches!(
        err.source,
        ejb_destination_resolver::errors::ResolutionError::InvalidSelectorResult { .. }
    ));
}

#[test]
fn cluster_membership_converges_under_concurrent_mutation() {
    let registry = Arc::new(NodeRegistry::new());
    let auth = Arc::new(AuthEffectiveCache::new());

    std::thread::scope(|scope| {
        for i in 0..8 {
            let registry = registry.clone();
            let auth = auth.clone();
            scope.spawn(move || {
                let node = format!("n{i}");
                let uri = Url::parse(&format!("remote://10.0.{i}.1:8080")).unwrap();
                registry.add_node("c1", &node, uri, &auth);
            });
        }
    });

    let members = registry.cluster_nodes("c1");
    assert_eq!(members.len(), 8);
    for i in 0..8 {
        assert!(members.contains(&format!("n{i}")));
    }

    std::thread::scope(|scope| {
        for i in 0..4 {
            let registry = registry.clone();
            scope.spawn(move || {
                registry.remove_node("c1", &format!("n{i}"));
            });
        }
    });

    let members = registry.cluster_nodes("c1");
    assert_eq!(members.len(), 4);
    for i in 4..8 {
        assert!(members.contains(&format!("n{i}")));
    }
}

#[test]
fn source_ip_satisfaction_matches_reference_for_random_cidrs() {
    use ejb_destination_resolver::record::ServiceRecord;
    use std::net::Ipv4Addr;

    fn reference_satisfies(cidrs: &[&str], addr: Ipv4Addr) -> bool {
        cidrs.iter().any(|c| {
            c.parse::<ipnet::IpNet>()
                .map(|net| net.contains(&std::net::IpAddr::V4(addr)))
                .unwrap_or(false)
        })
    }

    let cases: Vec<(Vec<&str>, Ipv4Addr)> = vec![
        (vec!["10.0.0.0/24"], Ipv4Addr::new(10, 0, 0, 5)),
        (vec!["10.0.0.0/24"], Ipv4Addr::new(192, 168, 1, 1)),
        (vec!["10.0.0.0/24", "192.168.0.0/16"], Ipv4Addr::new(192, 168, 1, 1)),
        (vec![], Ipv4Addr::new(8, 8, 8, 8)),
    ];

    for (cidrs, addr) in cases {
        let expected = if cidrs.is_empty() {
            true
        } else {
            reference_satisfies(&cidrs, addr)
        };

        let mut record = ServiceRecord::new(Url::parse("remote://h1:8080").unwrap());
        for cidr in &cidrs {
            record = record.with_attribute(attr::SOURCE_IP, *cidr);
        }

        let values = record.source_ips();
        let observed = if values.is_empty() {
            true
        } else {
            values
                .iter()
                .any(|v| v.parse::<ipnet::IpNet>().map(|n| n.contains(&std::net::IpAddr::V4(addr))).unwrap_or(false))
        };

        assert_eq!(observed, expected, "mismatch for {cidrs:?} against {addr}");
    }
}

#[tokio::test]
async fn selected_node_is_always_a_member_of_available() {
    use ejb_destination_resolver::selectors::PreferConnectedClusterNodeSelector;

    let selector = PreferConnectedClusterNodeSelector;
    let available = vec!["n1".to_string(), "n2".to_string(), "n3".to_string()];

    for connected in [vec![], vec!["n2".to_string()], available.clone()] {
        let chosen = selector.select_node("c1", &connected, &available).await;
        assert!(chosen.map(|n| available.contains(&n)).unwrap_or(true));
    }
}
