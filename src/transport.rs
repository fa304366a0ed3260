//! External collaborators (spec §6). This crate only depends on these traits;
//! the wire transport, TLS/auth configuration, and the broader invocation
//! pipeline that implements them are out of scope (spec §1).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;
use url::Url;

use crate::locator::{Affinity, Locator};
use crate::queue::Problem;

/// External cooperative-cancellation signal for an in-flight
/// [`Resolver::resolve`](crate::resolver::Resolver::resolve) call (spec §5
/// "Interruption"). Clones share one underlying signal: a caller keeps a
/// clone and calls `cancel()` from elsewhere while another task awaits
/// `resolve`; the resolver notices at its next queue wait and raises
/// `ResolutionError::Interrupted` instead of leaking the in-flight
/// `DiscoveryAttempt`.
#[derive(Clone)]
pub struct Cancellation(Arc<CancellationState>);

struct CancellationState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self(Arc::new(CancellationState {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called, now or in the future.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.0.notify.notified().await;
    }
}

/// An established (or about-to-be-established) connection to a peer. Opaque
/// to this crate beyond its address.
#[derive(Debug, Clone)]
pub struct Connection {
    pub uri: Url,
}

/// A usable EJB client channel, returned once a connection's identity has
/// been verified and the channel opened.
#[derive(Debug, Clone)]
pub struct Channel {
    pub uri: Url,
}

/// Opaque SSL context handle, as returned by [`AuthenticationClient::get_ssl_context`].
#[derive(Debug, Clone, Default)]
pub struct SslContext;

/// Authentication configuration for a probe. `protocol_override`/`host_override`/
/// `port_override` mirror endpoint overrides a user may have configured for a
/// *specific* URI; they must be stripped before probing a cluster-discovered
/// node, since that node's address was not the one the override was written
/// for (spec §4.D probe step).
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub protocol_override: Option<String>,
    pub host_override: Option<String>,
    pub port_override: Option<u16>,
}

impl AuthConfig {
    pub fn stripped_of_overrides(mut self) -> Self {
        self.protocol_override = None;
        self.host_override = None;
        self.port_override = None;
        self
    }
}

/// A discovered naming-provider location, used only as the cluster-empty
/// fallback in any-discovery.
#[derive(Debug, Clone)]
pub struct Location {
    pub uri: Url,
}

/// The transport's view of connectivity: protocol support, source-address
/// selection, connection-state queries, and channel opening (spec §6).
#[async_trait]
pub trait TransportProvider: Send + Sync {
    fn supports_protocol(&self, scheme: &str) -> bool;
    fn source_address(&self, dest: SocketAddr) -> Option<SocketAddr>;
    fn is_connected(&self, uri: &Url) -> bool;
    async fn open_channel(&self, connection: Connection) -> Result<Channel, String>;
}

/// The EJB-client-specific collaborator that validates URI schemes and
/// negotiates a peer identity over a connection (spec §6). Cancellation is
/// cooperative: callers race `get_connected_identity` against a cancel
/// signal rather than this trait exposing cancellation itself.
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn is_valid_uri_scheme(&self, scheme: &str) -> bool;
    async fn get_connected_identity(
        &self,
        uri: &Url,
        ssl_context: &SslContext,
        auth_config: &AuthConfig,
    ) -> Result<(), String>;
}

/// Resolves SSL context and authentication configuration for a URI (spec §6).
#[async_trait]
pub trait AuthenticationClient: Send + Sync {
    async fn get_ssl_context(&self, uri: &Url) -> SslContext;
    async fn get_authentication_configuration(&self, uri: &Url) -> AuthConfig;
}

/// Fallback source of candidate locations when cluster discovery comes back
/// empty (spec §6, §4.E any-discovery).
#[async_trait]
pub trait NamingProvider: Send + Sync {
    async fn get_locations(&self) -> Vec<Location>;
}

/// Per-invocation state the resolver reads and mutates. The Java source
/// models this as a generic attachment map keyed by string constants
/// (`BLACKLIST`, `PREFERRED_DESTINATIONS`, `NAMING_PROVIDER`); here those
/// become plain typed fields, which is the idiomatic Rust shape for a fixed,
/// known set of attachments (spec §4.E/§6).
pub struct InvocationContext {
    locator: Locator,
    weak_affinity: Affinity,
    destination: Option<Url>,
    target_affinity: Affinity,
    initial_cluster: Option<String>,
    retry_requested: bool,
    suppressed: Vec<Problem>,
    blacklist: HashSet<Url>,
    preferred_destinations: HashSet<Url>,
    naming_provider: Option<Arc<dyn NamingProvider>>,
    cancellation: Cancellation,
}

impl InvocationContext {
    pub fn new(locator: Locator) -> Self {
        Self {
            locator,
            weak_affinity: Affinity::None,
            destination: None,
            target_affinity: Affinity::None,
            initial_cluster: None,
            retry_requested: false,
            suppressed: Vec::new(),
            blacklist: HashSet::new(),
            preferred_destinations: HashSet::new(),
            naming_provider: None,
            cancellation: Cancellation::new(),
        }
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub fn with_weak_affinity(mut self, affinity: Affinity) -> Self {
        self.weak_affinity = affinity;
        self
    }

    pub fn with_preferred_destinations(mut self, preferred: HashSet<Url>) -> Self {
        self.preferred_destinations = preferred;
        self
    }

    pub fn with_naming_provider(mut self, provider: Arc<dyn NamingProvider>) -> Self {
        self.naming_provider = Some(provider);
        self
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn set_locator(&mut self, locator: Locator) {
        self.locator = locator;
    }

    pub fn weak_affinity(&self) -> &Affinity {
        &self.weak_affinity
    }

    pub fn set_weak_affinity(&mut self, affinity: Affinity) {
        self.weak_affinity = affinity;
    }

    pub fn destination(&self) -> Option<&Url> {
        self.destination.as_ref()
    }

    pub fn set_destination(&mut self, destination: Option<Url>) {
        self.destination = destination;
    }

    pub fn target_affinity(&self) -> &Affinity {
        &self.target_affinity
    }

    pub fn set_target_affinity(&mut self, affinity: Affinity) {
        self.target_affinity = affinity;
    }

    pub fn set_initial_cluster(&mut self, cluster: String) {
        self.initial_cluster = Some(cluster);
    }

    pub fn initial_cluster(&self) -> Option<&str> {
        self.initial_cluster.as_deref()
    }

    pub fn request_retry(&mut self) {
        self.retry_requested = true;
    }

    pub fn retry_requested(&self) -> bool {
        self.retry_requested
    }

    pub fn add_suppressed(&mut self, problems: Vec<Problem>) {
        self.suppressed.extend(problems);
    }

    pub fn suppressed(&self) -> &[Problem] {
        &self.suppressed
    }

    pub fn blacklist(&self) -> &HashSet<Url> {
        &self.blacklist
    }

    /// Idempotent: adding the same URI twice yields the same observable set
    /// (spec §8).
    pub fn blacklist_add(&mut self, uri: Url) {
        self.blacklist.insert(uri);
    }

    pub fn preferred_destinations(&self) -> &HashSet<Url> {
        &self.preferred_destinations
    }

    pub fn naming_provider(&self) -> Option<&Arc<dyn NamingProvider>> {
        self.naming_provider.as_ref()
    }

    /// Clears destination/target/weak affinity ahead of a retry (spec §4.E
    /// post-invocation handling).
    pub fn reset_for_retry(&mut self) {
        self.destination = None;
        self.target_affinity = Affinity::None;
        self.weak_affinity = Affinity::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_add_is_idempotent() {
        let mut ctx = InvocationContext::new(Locator::new("app", "module"));
        let uri = Url::parse("remote://h1:8080").unwrap();
        ctx.blacklist_add(uri.clone());
        ctx.blacklist_add(uri.clone());
        assert_eq!(ctx.blacklist().len(), 1);
    }

    #[test]
    fn auth_config_strips_overrides() {
        let config = AuthConfig {
            protocol_override: Some("https".into()),
            host_override: Some("h1".into()),
            port_override: Some(8080),
        }
        .stripped_of_overrides();

        assert!(config.protocol_override.is_none());
        assert!(config.host_override.is_none());
        assert!(config.port_override.is_none());
    }
}
