//! `Resolver`: the affinity-driven state machine that turns a locator's
//! strong/weak affinity into a `(destination, targetAffinity, cluster?)`
//! triple (spec §2 component E, §4.E).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use ipnet::IpNet;
use tracing::{debug, info, instrument};
use url::Url;

use crate::discovery::{DiscoveryEngine, DiscoveryHandle};
use crate::errors::{ResolutionError, SuppressingError};
use crate::filter::FilterSpec;
use crate::locator::{Affinity, Locator};
use crate::metrics::{RESOLVER_BLACKLIST_SIZE, RESOLVER_RESOLUTIONS_TOTAL};
use crate::queue::ServicesQueue;
use crate::record::{attr, ServiceRecord};
use crate::selectors::{pick_uniform, ClusterNodeSelector, DeploymentNodeSelector, DiscoveredUriSelector};
use crate::selectors::{PreferConnectedClusterNodeSelector, RandomDeploymentNodeSelector, RandomDiscoveredUriSelector};
use crate::transport::{Cancellation, InvocationContext, TransportProvider};

/// Outcome of draining a queue to completion while racing an external
/// [`Cancellation`] signal (spec §5 "Interruption").
enum DrainOutcome {
    Drained(Vec<ServiceRecord>),
    Interrupted,
}

/// Drains every remaining record, or stops early and cancels `handle` if
/// `cancellation` fires first.
async fn drain_or_interrupt(
    queue: &mut ServicesQueue,
    handle: &DiscoveryHandle,
    cancellation: &Cancellation,
) -> DrainOutcome {
    let mut records = Vec::new();
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                handle.cancel();
                return DrainOutcome::Interrupted;
            }
            maybe_record = queue.take_service() => match maybe_record {
                Some(record) => records.push(record),
                None => return DrainOutcome::Drained(records),
            },
        }
    }
}

/// The outcome of an invocation carried out against a resolved destination,
/// as reported back to `handle_invocation_result` (spec §4.E post-invocation
/// handling). Authentication failures are deliberately excluded from the
/// target-missing path (spec §7.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationOutcome {
    Success,
    TargetMissing,
    AuthenticationFailure,
}

/// Affinity state machine (spec §4.E). Holds the discovery engine and the
/// three pluggable selectors, defaulting to the policies chosen in
/// DESIGN.md's Open Question decisions.
pub struct Resolver {
    engine: DiscoveryEngine,
    service_type: String,
    cluster_selector: Arc<dyn ClusterNodeSelector>,
    deployment_selector: Arc<dyn DeploymentNodeSelector>,
    uri_selector: Arc<dyn DiscoveredUriSelector>,
}

impl Resolver {
    pub fn new(engine: DiscoveryEngine, service_type: impl Into<String>) -> Self {
        Self {
            engine,
            service_type: service_type.into(),
            cluster_selector: Arc::new(PreferConnectedClusterNodeSelector),
            deployment_selector: Arc::new(RandomDeploymentNodeSelector),
            uri_selector: Arc::new(RandomDiscoveredUriSelector),
        }
    }

    pub fn with_cluster_selector(mut self, selector: Arc<dyn ClusterNodeSelector>) -> Self {
        self.cluster_selector = selector;
        self
    }

    pub fn with_deployment_selector(mut self, selector: Arc<dyn DeploymentNodeSelector>) -> Self {
        self.deployment_selector = selector;
        self
    }

    pub fn with_uri_selector(mut self, selector: Arc<dyn DiscoveredUriSelector>) -> Self {
        self.uri_selector = selector;
        self
    }

    /// Resolves a destination for `ctx`, or leaves it unset if nothing
    /// resolvable was found (spec §4.E/§7.6 — downstream interceptors decide
    /// whether that is fatal).
    #[instrument(skip(self, ctx))]
    pub async fn resolve(&self, ctx: &mut InvocationContext) -> Result<(), SuppressingError> {
        if ctx.destination().is_some() {
            debug!("destination already set; passing through");
            return Ok(());
        }

        let strategy = self.strategy_label(ctx);
        let result = self.dispatch(ctx).await;

        let outcome = if result.is_ok() { "resolved" } else { "failed" };
        RESOLVER_RESOLUTIONS_TOTAL.with_label_values(&[strategy, outcome]).inc();
        RESOLVER_BLACKLIST_SIZE
            .with_label_values(&[strategy])
            .set(ctx.blacklist().len() as f64);

        match &result {
            Ok(()) => info!(strategy, destination = ?ctx.destination(), "resolution complete"),
            Err(e) => info!(strategy, error = %e, "resolution failed"),
        }

        result
    }

    fn strategy_label(&self, ctx: &InvocationContext) -> &'static str {
        match (&ctx.locator().affinity, ctx.weak_affinity()) {
            (Affinity::Uri(_), _) | (Affinity::Local, _) => "direct-uri",
            (Affinity::None, Affinity::Uri(_)) | (Affinity::None, Affinity::Local) => "direct-uri",
            (Affinity::Node(_), _) | (Affinity::None, Affinity::Node(_)) => "first-match",
            (Affinity::Cluster(_), _) => "cluster",
            (Affinity::None, Affinity::None) | (Affinity::None, Affinity::Cluster(_)) => "any",
        }
    }

    async fn dispatch(&self, ctx: &mut InvocationContext) -> Result<(), SuppressingError> {
        let strong = ctx.locator().affinity.clone();
        let weak = ctx.weak_affinity().clone();

        match strong {
            Affinity::Local => {
                debug!("local strong affinity; no destination resolution needed");
                Ok(())
            }
            Affinity::Uri(u) => {
                debug!("strong uri affinity");
                self.set_direct(ctx, u, Affinity::Uri)
            }
            Affinity::Node(n) => {
                debug!(node = %n, "strong node affinity; first-match");
                let filter = FilterSpec::equals(attr::NODE, n);
                self.first_match(ctx, filter, None).await
            }
            Affinity::Cluster(c) => self.dispatch_cluster_strong(ctx, c, weak).await,
            Affinity::None => self.dispatch_no_strong_affinity(ctx, weak).await,
        }
    }

    async fn dispatch_cluster_strong(
        &self,
        ctx: &mut InvocationContext,
        cluster: String,
        weak: Affinity,
    ) -> Result<(), SuppressingError> {
        match weak {
            Affinity::Node(n) => {
                debug!(cluster = %cluster, node = %n, "cluster strong, node weak; first-match with cluster fallback");
                let filter = FilterSpec::all(vec![
                    FilterSpec::equals(attr::CLUSTER, cluster.clone()),
                    FilterSpec::equals(attr::NODE, n),
                ]);
                let fallback = FilterSpec::all(vec![
                    FilterSpec::equals(attr::CLUSTER, cluster.clone()),
                    FilterSpec::has_attribute(attr::NODE),
                ]);
                self.first_match(ctx, filter, Some((fallback, cluster))).await
            }
            Affinity::Uri(u) => self.set_direct(ctx, u, Affinity::Uri),
            Affinity::Local => Ok(()),
            Affinity::None | Affinity::Cluster(_) => {
                debug!(cluster = %cluster, "cluster discovery");
                let filter = FilterSpec::equals(attr::CLUSTER, cluster.clone());
                self.cluster_discovery(ctx, &cluster, filter).await
            }
        }
    }

    async fn dispatch_no_strong_affinity(
        &self,
        ctx: &mut InvocationContext,
        weak: Affinity,
    ) -> Result<(), SuppressingError> {
        match weak {
            Affinity::Uri(u) => self.set_direct(ctx, u, Affinity::Uri),
            Affinity::Local => Ok(()),
            Affinity::Node(n) => {
                debug!(node = %n, "weak node affinity; first-match");
                let filter = FilterSpec::equals(attr::NODE, n);
                self.first_match(ctx, filter, None).await
            }
            Affinity::None | Affinity::Cluster(_) => {
                debug!("no usable affinity; any-discovery by module");
                let filter = self.module_filter(ctx.locator());
                self.any_discovery(ctx, filter).await
            }
        }
    }

    fn set_direct(
        &self,
        ctx: &mut InvocationContext,
        uri: Url,
        to_affinity: impl FnOnce(Url) -> Affinity,
    ) -> Result<(), SuppressingError> {
        if !ctx.blacklist().contains(&uri) {
            let affinity = to_affinity(uri.clone());
            ctx.set_destination(Some(uri));
            ctx.set_target_affinity(affinity);
        }
        Ok(())
    }

    fn module_filter(&self, locator: &Locator) -> FilterSpec {
        if locator.distinct_name.is_empty() {
            FilterSpec::equals(
                attr::EJB_MODULE,
                format!("{}/{}", locator.app_name, locator.module_name),
            )
        } else {
            FilterSpec::equals(
                attr::EJB_MODULE_DISTINCT,
                format!("{}/{}/{}", locator.app_name, locator.module_name, locator.distinct_name),
            )
        }
    }

    /// Drains the queue; the first non-blacklisted record wins. Falls back
    /// to cluster-discovery with `fallback` if nothing matched (spec §4.E).
    async fn first_match(
        &self,
        ctx: &mut InvocationContext,
        filter: FilterSpec,
        fallback: Option<(FilterSpec, String)>,
    ) -> Result<(), SuppressingError> {
        let (mut queue, handle) = self.engine.discover(&self.service_type, filter);
        let cancellation = ctx.cancellation().clone();

        let found = loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    handle.cancel();
                    ctx.add_suppressed(queue.problems());
                    return Err(ResolutionError::Interrupted.with_suppressed(ctx.suppressed()));
                }
                maybe_record = queue.take_service() => match maybe_record {
                    Some(record) if !ctx.blacklist().contains(&record.location_uri) => break Some(record),
                    Some(_) => continue,
                    None => break None,
                },
            }
        };

        ctx.add_suppressed(queue.problems());

        if let Some(record) = found {
            let target_affinity = match record.node() {
                Some(node) => Affinity::Node(node.to_string()),
                None => Affinity::Uri(record.location_uri.clone()),
            };
            ctx.set_destination(Some(record.location_uri));
            ctx.set_target_affinity(target_affinity);
            return Ok(());
        }

        if let Some((fallback_filter, cluster)) = fallback {
            return self.cluster_discovery(ctx, &cluster, fallback_filter).await;
        }

        Ok(())
    }

    /// Builds the connected/available node maps for `cluster` and invokes
    /// `ClusterNodeSelector` (spec §4.E).
    async fn cluster_discovery(
        &self,
        ctx: &mut InvocationContext,
        cluster: &str,
        filter: FilterSpec,
    ) -> Result<(), SuppressingError> {
        let (mut queue, handle) = self.engine.discover(&self.service_type, filter);
        let cancellation = ctx.cancellation().clone();
        let records = match drain_or_interrupt(&mut queue, &handle, &cancellation).await {
            DrainOutcome::Drained(records) => records,
            DrainOutcome::Interrupted => {
                ctx.add_suppressed(queue.problems());
                return Err(ResolutionError::Interrupted.with_suppressed(ctx.suppressed()));
            }
        };
        ctx.add_suppressed(queue.problems());
        let transport = self.engine.transport();

        let mut nodes: HashMap<String, Url> = HashMap::new();
        for record in &records {
            if ctx.blacklist().contains(&record.location_uri) {
                continue;
            }
            if !transport.supports_protocol(record.location_uri.scheme()) {
                continue;
            }
            if !satisfies_source_ip(transport.as_ref(), &record.location_uri, record) {
                continue;
            }
            if let Some(node) = record.node() {
                nodes.insert(node.to_string(), record.location_uri.clone());
            }
        }

        let preferred = ctx.preferred_destinations();
        if !preferred.is_empty() {
            let filtered: HashMap<String, Url> = nodes
                .iter()
                .filter(|(_, uri)| preferred.contains(*uri))
                .map(|(node, uri)| (node.clone(), uri.clone()))
                .collect();
            if !filtered.is_empty() {
                nodes = filtered;
            }
        }

        if nodes.is_empty() {
            if let Some(provider) = ctx.naming_provider().cloned() {
                if let Some(location) = provider.get_locations().await.into_iter().next() {
                    ctx.set_destination(Some(location.uri.clone()));
                    ctx.set_target_affinity(Affinity::Uri(location.uri));
                }
            }
            return Ok(());
        }

        let chosen_node = if nodes.len() == 1 {
            nodes.keys().next().cloned().expect("checked non-empty above")
        } else {
            let available: Vec<String> = nodes.keys().cloned().collect();
            let connected: Vec<String> = available
                .iter()
                .filter(|n| transport.is_connected(&nodes[*n]))
                .cloned()
                .collect();

            match self.cluster_selector.select_node(cluster, &connected, &available).await {
                Some(node) if available.contains(&node) => node,
                _ => {
                    return Err(ResolutionError::InvalidSelectorResult {
                        app: ctx.locator().app_name.clone(),
                        module: ctx.locator().module_name.clone(),
                    }
                    .with_suppressed(ctx.suppressed()));
                }
            }
        };

        let uri = nodes
            .get(&chosen_node)
            .cloned()
            .expect("chosen_node was drawn from nodes' keys");
        ctx.set_initial_cluster(cluster.to_string());
        ctx.set_destination(Some(uri));
        ctx.set_target_affinity(Affinity::Node(chosen_node));
        Ok(())
    }

    /// No identity to anchor on: builds node/uri/cluster-association maps
    /// from every surviving record and invokes whichever selector fits the
    /// shape of what was discovered (spec §4.E).
    async fn any_discovery(&self, ctx: &mut InvocationContext, filter: FilterSpec) -> Result<(), SuppressingError> {
        let (mut queue, handle) = self.engine.discover(&self.service_type, filter);
        let cancellation = ctx.cancellation().clone();
        let records = match drain_or_interrupt(&mut queue, &handle, &cancellation).await {
            DrainOutcome::Drained(records) => records,
            DrainOutcome::Interrupted => {
                ctx.add_suppressed(queue.problems());
                return Err(ResolutionError::Interrupted.with_suppressed(ctx.suppressed()));
            }
        };
        ctx.add_suppressed(queue.problems());

        let mut uris: HashMap<String, Url> = HashMap::new();
        let mut cluster_associations: HashMap<Url, Vec<String>> = HashMap::new();
        let mut all_uris: Vec<Url> = Vec::new();
        let mut nodeless = 0usize;

        for record in &records {
            if ctx.blacklist().contains(&record.location_uri) {
                continue;
            }
            all_uris.push(record.location_uri.clone());
            cluster_associations
                .entry(record.location_uri.clone())
                .or_default()
                .extend(record.clusters().into_iter().map(str::to_string));
            match record.node() {
                Some(node) => {
                    uris.insert(node.to_string(), record.location_uri.clone());
                }
                None => nodeless += 1,
            }
        }

        if all_uris.is_empty() {
            return Ok(());
        }

        let chosen_uri = if all_uris.len() == 1 {
            all_uris[0].clone()
        } else if nodeless == 0 {
            let node_names: Vec<String> = uris.keys().cloned().collect();
            let locator = ctx.locator().clone();
            let selected = self
                .deployment_selector
                .select_node(&node_names, &locator.app_name, &locator.module_name, &locator.distinct_name)
                .await;
            match selected.and_then(|node| uris.get(&node).cloned()) {
                Some(uri) => uri,
                None => {
                    return Err(ResolutionError::InvalidSelectorResult {
                        app: ctx.locator().app_name.clone(),
                        module: ctx.locator().module_name.clone(),
                    }
                    .with_suppressed(ctx.suppressed()));
                }
            }
        } else {
            let locator = ctx.locator().clone();
            match self.uri_selector.select_node(&uris, &locator).await {
                Some(uri) if all_uris.contains(&uri) => uri,
                _ => {
                    return Err(ResolutionError::InvalidSelectorResult {
                        app: ctx.locator().app_name.clone(),
                        module: ctx.locator().module_name.clone(),
                    }
                    .with_suppressed(ctx.suppressed()));
                }
            }
        };

        if let Some(clusters) = cluster_associations.get(&chosen_uri) {
            if let Some(cluster) = pick_uniform(clusters) {
                ctx.set_initial_cluster(cluster.clone());
            }
        }

        let node_name = uris.iter().find(|(_, uri)| **uri == chosen_uri).map(|(node, _)| node.clone());
        ctx.set_destination(Some(chosen_uri.clone()));
        ctx.set_target_affinity(match node_name {
            Some(node) => Affinity::Node(node),
            None => Affinity::Uri(chosen_uri),
        });
        Ok(())
    }

    /// Called when a stateful invocation establishes a session (spec §4.E
    /// post-invocation handling).
    pub fn handle_session_creation(&self, ctx: &mut InvocationContext, observed_target_affinity: Affinity) {
        if ctx.locator().is_stateful_with_cluster_affinity() && ctx.weak_affinity().is_none() {
            ctx.set_weak_affinity(observed_target_affinity);
        }
    }

    /// Called after an invocation completes, successfully or not (spec §4.E/§7.4).
    pub fn handle_invocation_result(
        &self,
        ctx: &mut InvocationContext,
        outcome: InvocationOutcome,
    ) -> Result<(), SuppressingError> {
        match outcome {
            InvocationOutcome::Success => {
                if ctx.locator().is_stateful_with_cluster_affinity() && ctx.weak_affinity().is_none() {
                    if let Some(destination) = ctx.destination().cloned() {
                        ctx.set_weak_affinity(Affinity::Uri(destination));
                    }
                }
                Ok(())
            }
            InvocationOutcome::AuthenticationFailure => Ok(()),
            InvocationOutcome::TargetMissing => {
                let destination = ctx.destination().cloned();
                if let Some(ref dest) = destination {
                    ctx.blacklist_add(dest.clone());
                }
                let suppressed = ctx.suppressed().to_vec();
                ctx.reset_for_retry();
                ctx.request_retry();
                Err(ResolutionError::TargetMissing {
                    destination: destination.map(|u| u.to_string()).unwrap_or_default(),
                }
                .with_suppressed(&suppressed))
            }
        }
    }
}

fn uri_socket_addr(uri: &Url) -> Option<SocketAddr> {
    let host = uri.host_str()?.trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = host.parse().ok()?;
    Some(SocketAddr::new(ip, uri.port()?))
}

/// Whether `record`'s `source-ip` attribute list is satisfied for `uri`
/// (spec §4.E "source-ip satisfaction").
fn satisfies_source_ip(transport: &dyn TransportProvider, uri: &Url, record: &ServiceRecord) -> bool {
    let values = record.source_ips();
    if values.is_empty() {
        return true;
    }

    let source = uri_socket_addr(uri).and_then(|sock| transport.source_address(sock));
    match source {
        None => values
            .iter()
            .any(|v| v.parse::<IpNet>().map(|n| n.prefix_len() == 0).unwrap_or(false)),
        Some(addr) => values
            .iter()
            .any(|v| v.parse::<IpNet>().map(|n| n.contains(&addr.ip())).unwrap_or(false)),
    }
}
