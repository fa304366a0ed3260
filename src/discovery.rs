//! `DiscoveryEngine`: two-phase fan-out probe coordinator (spec §4.D).
//!
//! A `discover()` call owns one [`DiscoveryAttempt`]: an `outstanding` counter
//! seeded at 1 (the "initial +1", released once every probe has been issued),
//! a `phase2` flag, and a cooperative cancellation [`tokio::sync::Notify`].
//! Every spawned probe bumps `outstanding` before it starts and calls
//! `count_down()` exactly once regardless of outcome — matched, failed, or
//! cancelled. The transition to zero is single-fire: `fetch_sub` returning 1
//! is observed by exactly one probe, which then either completes the result
//! sink (match found, or this was already the phase-2 pass) or escalates to
//! phase 2 and reissues every endpoint ignoring `FailedDestinations`.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::auth::AuthEffectiveCache;
use crate::config::DiscoveryConfig;
use crate::filter::{extract_node, FilterSpec};
use crate::metrics::{DISCOVERY_PHASE2_RETRIES_TOTAL, DISCOVERY_PROBES_TOTAL};
use crate::queue::{services_queue, DiscoveryResultSink, ServicesQueue};
use crate::registry::{FailedDestinations, NodeRegistry};
use crate::transport::{AuthenticationClient, Connection, Endpoint, TransportProvider};

/// Collaborators a [`DiscoveryEngine`] probes through (spec §6). Cheap to
/// clone: every field is an `Arc`.
#[derive(Clone)]
pub struct DiscoveryCollaborators {
    pub transport: Arc<dyn TransportProvider>,
    pub endpoint: Arc<dyn Endpoint>,
    pub auth_client: Arc<dyn AuthenticationClient>,
    pub registry: Arc<NodeRegistry>,
    pub failed: Arc<FailedDestinations>,
    pub auth_cache: Arc<AuthEffectiveCache>,
}

/// Handle to an in-flight or already-resolved `discover()` call. `cancel()`
/// is a no-op for the service-type-mismatch no-op handle (spec §4.D step 1).
pub struct DiscoveryHandle {
    attempt: Option<Arc<DiscoveryAttempt>>,
}

impl DiscoveryHandle {
    /// Propagates cooperative cancellation to every outstanding probe (spec
    /// §5/§9). Cancelled probes still call `count_down()`, so `complete()`
    /// still fires.
    pub fn cancel(&self) {
        if let Some(attempt) = &self.attempt {
            attempt.cancelled.store(true, Ordering::SeqCst);
            attempt.cancel.notify_waiters();
        }
    }
}

enum ProbeOutcome {
    Matched,
    Failed(String),
    Cancelled,
}

struct DiscoveryAttempt {
    collaborators: DiscoveryCollaborators,
    configured_endpoints: Vec<Url>,
    max_connected_cluster_nodes: usize,
    filter: FilterSpec,
    /// The sole surviving clone of the sink. Held here until `finish()` takes
    /// and drops it; every probe only ever gets a short-lived clone of this
    /// one (see `spawn_probe`), so the channel closes as soon as `finish()`
    /// runs and the last in-flight probe task returns.
    completion: Mutex<Option<DiscoveryResultSink>>,
    outstanding: AtomicUsize,
    phase2: AtomicBool,
    cancelled: AtomicBool,
    cancel: tokio::sync::Notify,
}

impl DiscoveryAttempt {
    fn spawn_probe(self: &Arc<Self>, uri: Url, cluster_effective: Option<String>) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let sink = self
            .completion
            .lock()
            .unwrap()
            .as_ref()
            .expect("sink present while probes are still being issued")
            .clone();
        let attempt = Arc::clone(self);
        tokio::spawn(async move { attempt.probe(uri, cluster_effective, sink).await });
    }

    fn count_down(self: &Arc<Self>) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.on_zero();
        }
    }

    fn run_match_pass(&self) -> bool {
        let guard = self.completion.lock().unwrap();
        let sink = guard.as_ref().expect("sink present during the match pass");
        match extract_node(&self.filter) {
            Some(node_name) => match self.collaborators.registry.get(&node_name) {
                Some(info) => info.read().unwrap().discover(&self.filter, sink),
                None => false,
            },
            None => self
                .collaborators
                .registry
                .all()
                .into_iter()
                .fold(false, |any, info| {
                    let matched = info.read().unwrap().discover(&self.filter, sink);
                    any || matched
                }),
        }
    }

    fn finish(&self) {
        if let Some(sink) = self.completion.lock().unwrap().take() {
            sink.complete();
        }
    }

    fn on_zero(self: &Arc<Self>) {
        let matched = self.run_match_pass();

        if self.phase2.load(Ordering::SeqCst) {
            debug!(matched, "phase 2 match pass complete");
            self.finish();
            return;
        }

        if matched {
            debug!("phase 1 match pass found a record; completing");
            self.finish();
            return;
        }

        info!("phase 1 produced no match; escalating to phase 2 retry");
        self.phase2.store(true, Ordering::SeqCst);
        DISCOVERY_PHASE2_RETRIES_TOTAL.inc();
        self.outstanding.store(1, Ordering::SeqCst);

        for uri in self.configured_endpoints.clone() {
            self.spawn_probe(uri, None);
        }
        for (uri, cluster) in self.enumerate_cluster_probes(true) {
            self.spawn_probe(uri, Some(cluster));
        }
        self.count_down();
    }

    /// Cluster-derived probe candidates (spec §4.D step 3). When
    /// `ignore_failed` is set (the phase-2 retry pass), `FailedDestinations`
    /// is not consulted.
    fn enumerate_cluster_probes(&self, ignore_failed: bool) -> Vec<(Url, String)> {
        let mut result = Vec::new();

        for (cluster, nodes) in self.collaborators.registry.cluster_membership() {
            let mut budget = self.max_connected_cluster_nodes;
            for node in nodes {
                if budget == 0 {
                    break;
                }
                budget -= 1;

                let Some(info) = self.collaborators.registry.get(&node) else {
                    continue;
                };
                let info = info.read().unwrap();
                let Some(cluster_info) = info.clusters.get(&cluster) else {
                    continue;
                };

                'schemes: for (scheme, table) in &cluster_info.address_tables_by_protocol {
                    for (range, addr) in table.iter() {
                        let source = self.collaborators.transport.source_address(*addr);
                        let eligible = range.prefix_len() == 0
                            || source.map(|s| range.contains(&s.ip())).unwrap_or(false);
                        if !eligible {
                            continue;
                        }
                        let Some(uri) = build_cluster_uri(scheme, *addr) else {
                            continue;
                        };
                        if ignore_failed || !self.collaborators.failed.contains(&uri) {
                            result.push((uri, cluster.clone()));
                            break 'schemes;
                        }
                    }
                }
            }
        }

        result
    }

    async fn attempt_connection(&self, uri: &Url, cluster_effective: Option<&str>) -> ProbeOutcome {
        let auth_uri = cluster_effective
            .and_then(|c| self.collaborators.auth_cache.get(c))
            .unwrap_or_else(|| uri.clone());

        let ssl_context = self.collaborators.auth_client.get_ssl_context(&auth_uri).await;
        let mut auth_config = self
            .collaborators
            .auth_client
            .get_authentication_configuration(&auth_uri)
            .await;
        if cluster_effective.is_some() {
            auth_config = auth_config.stripped_of_overrides();
        }

        if let Err(e) = self
            .collaborators
            .endpoint
            .get_connected_identity(uri, &ssl_context, &auth_config)
            .await
        {
            return ProbeOutcome::Failed(e);
        }

        match self
            .collaborators
            .transport
            .open_channel(Connection { uri: uri.clone() })
            .await
        {
            Ok(_channel) => ProbeOutcome::Matched,
            Err(e) => ProbeOutcome::Failed(e),
        }
    }

    async fn probe(self: Arc<Self>, uri: Url, cluster_effective: Option<String>, sink: DiscoveryResultSink) {
        let scheme = uri.scheme().to_string();
        if !self.collaborators.transport.supports_protocol(&scheme)
            || !self.collaborators.endpoint.is_valid_uri_scheme(&scheme)
        {
            self.count_down();
            return;
        }

        let notified = self.cancel.notified();
        tokio::pin!(notified);

        let outcome = if self.cancelled.load(Ordering::SeqCst) {
            ProbeOutcome::Cancelled
        } else {
            tokio::select! {
                _ = &mut notified => ProbeOutcome::Cancelled,
                outcome = self.attempt_connection(&uri, cluster_effective.as_deref()) => outcome,
            }
        };

        match outcome {
            ProbeOutcome::Matched => {
                self.collaborators.failed.clear_uri(&uri);
                DISCOVERY_PROBES_TOTAL.with_label_values(&["success"]).inc();
            }
            ProbeOutcome::Failed(message) => {
                warn!(uri = %uri, error = %message, "probe failed");
                sink.report_problem(Some(uri.clone()), message);
                self.collaborators.failed.mark_failed(uri);
                DISCOVERY_PROBES_TOTAL.with_label_values(&["failure"]).inc();
            }
            ProbeOutcome::Cancelled => {
                DISCOVERY_PROBES_TOTAL.with_label_values(&["cancelled"]).inc();
            }
        }

        self.count_down();
    }
}

fn build_cluster_uri(scheme: &str, addr: SocketAddr) -> Option<Url> {
    let host = match addr.ip() {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    };
    Url::parse(&format!("{scheme}://{host}:{}", addr.port())).ok()
}

/// Two-phase fan-out probe coordinator (spec §2 component D, §4.D).
pub struct DiscoveryEngine {
    collaborators: DiscoveryCollaborators,
    configured_endpoints: Vec<Url>,
    service_type: String,
    max_connected_cluster_nodes: usize,
    queue_capacity: usize,
}

impl DiscoveryEngine {
    pub fn new(collaborators: DiscoveryCollaborators, config: &DiscoveryConfig) -> Self {
        Self {
            collaborators,
            configured_endpoints: config.configured_endpoints.clone(),
            service_type: config.service_type.clone(),
            max_connected_cluster_nodes: config.max_connected_cluster_nodes,
            queue_capacity: config.queue_capacity,
        }
    }

    /// The transport collaborator, exposed for the resolver's scheme/
    /// connectivity/source-address checks during cluster- and any-discovery
    /// (spec §4.E).
    pub fn transport(&self) -> &Arc<dyn TransportProvider> {
        &self.collaborators.transport
    }

    /// Begins a discovery fan-out for `filter` (spec §4.D). Returns the queue
    /// records will stream into and a handle usable to cancel the attempt.
    #[instrument(skip(self, filter), fields(filter = ?filter))]
    pub fn discover(&self, requested_service_type: &str, filter: FilterSpec) -> (ServicesQueue, DiscoveryHandle) {
        let (sink, queue) = services_queue(self.queue_capacity);

        if requested_service_type != self.service_type {
            debug!(requested_service_type, "service type mismatch; no-op discovery");
            sink.complete();
            return (queue, DiscoveryHandle { attempt: None });
        }

        let attempt = Arc::new(DiscoveryAttempt {
            collaborators: self.collaborators.clone(),
            configured_endpoints: self.configured_endpoints.clone(),
            max_connected_cluster_nodes: self.max_connected_cluster_nodes,
            filter,
            completion: Mutex::new(Some(sink)),
            outstanding: AtomicUsize::new(1),
            phase2: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            cancel: tokio::sync::Notify::new(),
        });

        let mut any_survived_initial = false;
        for uri in attempt.configured_endpoints.clone() {
            if !attempt.collaborators.failed.contains(&uri) {
                any_survived_initial = true;
                attempt.spawn_probe(uri, None);
            }
        }

        for (uri, cluster) in attempt.enumerate_cluster_probes(false) {
            attempt.spawn_probe(uri, Some(cluster));
        }

        if !attempt.configured_endpoints.is_empty() && !any_survived_initial {
            for uri in attempt.configured_endpoints.clone() {
                attempt.spawn_probe(uri, None);
            }
        }

        attempt.count_down();

        (queue, DiscoveryHandle { attempt: Some(attempt) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::filter::FilterSpec;
    use crate::record::attr;
    use crate::transport::{AuthConfig, Channel, SslContext};

    struct FakeTransport {
        supported: HashSet<&'static str>,
    }

    #[async_trait]
    impl TransportProvider for FakeTransport {
        fn supports_protocol(&self, scheme: &str) -> bool {
            self.supported.contains(scheme)
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

    struct FakeEndpoint {
        fail: bool,
        hang: bool,
    }

    #[async_trait]
    impl Endpoint for FakeEndpoint {
        fn is_valid_uri_scheme(&self, _scheme: &str) -> bool {
            true
        }
        async fn get_connected_identity(
            &self,
            _uri: &Url,
            _ssl_context: &SslContext,
            _auth_config: &AuthConfig,
        ) -> Result<(), String> {
            if self.hang {
                futures::future::pending::<()>().await;
            }
            if self.fail {
                Err("connection refused".to_string())
            } else {
                Ok(())
            }
        }
    }

    struct FakeAuth;

    #[async_trait]
    impl AuthenticationClient for FakeAuth {
        async fn get_ssl_context(&self, _uri: &Url) -> SslContext {
            SslContext::default()
        }
        async fn get_authentication_configuration(&self, _uri: &Url) -> AuthConfig {
            AuthConfig::default()
        }
    }

    fn collaborators(fail: bool, hang: bool) -> DiscoveryCollaborators {
        DiscoveryCollaborators {
            transport: Arc::new(FakeTransport {
                supported: ["remote"].into_iter().collect(),
            }),
            endpoint: Arc::new(FakeEndpoint { fail, hang }),
            auth_client: Arc::new(FakeAuth),
            registry: Arc::new(NodeRegistry::new()),
            failed: Arc::new(FailedDestinations::new()),
            auth_cache: Arc::new(AuthEffectiveCache::new()),
        }
    }

    #[tokio::test]
    async fn service_type_mismatch_is_a_noop() {
        let engine = DiscoveryEngine::new(collaborators(false, false), &DiscoveryConfig::for_testing());
        let (mut queue, _handle) = engine.discover("other.type", FilterSpec::has_attribute(attr::NODE));
        assert!(queue.drain_all().await.is_empty());
    }

    #[tokio::test]
    async fn phase1_match_completes_without_phase2() {
        let collaborators = collaborators(false, false);
        let uri = Url::parse("remote://h1:8080").unwrap();
        let module = crate::filter::extract_module(&FilterSpec::equals(attr::EJB_MODULE, "app/mod")).unwrap();
        collaborators
            .registry
            .get_or_create("n1")
            .write()
            .unwrap()
            .register_module(module, uri.clone());

        let mut config = DiscoveryConfig::for_testing();
        config.configured_endpoints = vec![uri.clone()];
        let before = DISCOVERY_PHASE2_RETRIES_TOTAL.get();

        let engine = DiscoveryEngine::new(collaborators, &config);
        let (mut queue, _handle) =
            engine.discover(&config.service_type, FilterSpec::equals(attr::NODE, "n1"));

        let records = queue.drain_all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].location_uri, uri);
        assert_eq!(DISCOVERY_PHASE2_RETRIES_TOTAL.get(), before);
    }

    #[tokio::test]
    async fn phase1_no_match_triggers_phase2_retry() {
        let collaborators = collaborators(false, false);
        let uri = Url::parse("remote://h2:8080").unwrap();
        let mut config = DiscoveryConfig::for_testing();
        config.configured_endpoints = vec![uri];
        let before = DISCOVERY_PHASE2_RETRIES_TOTAL.get();

        let engine = DiscoveryEngine::new(collaborators, &config);
        let (mut queue, _handle) =
            engine.discover(&config.service_type, FilterSpec::equals(attr::NODE, "unknown"));

        assert!(queue.drain_all().await.is_empty());
        assert_eq!(DISCOVERY_PHASE2_RETRIES_TOTAL.get(), before + 1);
    }

    #[tokio::test]
    async fn failed_probe_marks_failed_destinations() {
        let collaborators = collaborators(true, false);
        let failed = collaborators.failed.clone();
        let uri = Url::parse("remote://h3:8080").unwrap();
        let mut config = DiscoveryConfig::for_testing();
        config.configured_endpoints = vec![uri.clone()];

        let engine = DiscoveryEngine::new(collaborators, &config);
        let (mut queue, _handle) =
            engine.discover(&config.service_type, FilterSpec::has_attribute(attr::NODE));
        queue.drain_all().await;

        assert!(failed.contains(&uri));
        assert!(!queue.problems().is_empty());
    }

    #[tokio::test]
    async fn cancellation_releases_a_hanging_probe() {
        let collaborators = collaborators(false, true);
        let uri = Url::parse("remote://h4:8080").unwrap();
        let mut config = DiscoveryConfig::for_testing();
        config.configured_endpoints = vec![uri];

        let engine = DiscoveryEngine::new(collaborators, &config);
        let (mut queue, handle) =
            engine.discover(&config.service_type, FilterSpec::has_attribute(attr::NODE));

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let result = tokio::time::timeout(Duration::from_millis(500), queue.drain_all()).await;
        assert!(result.is_ok(), "cancellation should release the hanging probe");
    }
}
