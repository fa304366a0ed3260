//! Demonstration entrypoint: wires an in-memory `NodeRegistry` and fake
//! collaborators through one `Resolver::resolve` call and prints the
//! gathered metrics, the way the reference load-test harness's `main`
//! registers its metrics and reports a summary at the end of a run.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use ejb_destination_resolver::auth::AuthEffectiveCache;
use ejb_destination_resolver::config::DiscoveryConfig;
use ejb_destination_resolver::discovery::{DiscoveryCollaborators, DiscoveryEngine};
use ejb_destination_resolver::locator::{Affinity, Locator};
use ejb_destination_resolver::metrics::{gather_metrics_string, register_metrics};
use ejb_destination_resolver::registry::{FailedDestinations, NodeRegistry};
use ejb_destination_resolver::resolver::Resolver;
use ejb_destination_resolver::transport::{
    AuthConfig, AuthenticationClient, Channel, Connection, Endpoint, InvocationContext, SslContext,
    TransportProvider,
};

struct DemoTransport;

#[async_trait]
impl TransportProvider for DemoTransport {
    fn supports_protocol(&self, scheme: &str) -> bool {
        scheme == "remote"
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

struct DemoEndpoint;

#[async_trait]
impl Endpoint for DemoEndpoint {
    fn is_valid_uri_scheme(&self, scheme: &str) -> bool {
        scheme == "remote"
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

struct DemoAuthenticationClient;

#[async_trait]
impl AuthenticationClient for DemoAuthenticationClient {
    async fn get_ssl_context(&self, _uri: &Url) -> SslContext {
        SslContext::default()
    }

    async fn get_authentication_configuration(&self, _uri: &Url) -> AuthConfig {
        AuthConfig::default()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    register_metrics()?;

    let config = DiscoveryConfig {
        configured_endpoints: vec![Url::parse("remote://bootstrap.example:8080")?],
        max_connected_cluster_nodes: 10,
        queue_capacity: 256,
        service_type: "ejb.jboss".to_string(),
    };

    let registry = Arc::new(NodeRegistry::new());
    let auth_cache = Arc::new(AuthEffectiveCache::new());
    registry.add_node(
        "demo-cluster",
        "node-1",
        Url::parse("remote://10.0.0.1:8080")?,
        &auth_cache,
    );

    let collaborators = DiscoveryCollaborators {
        transport: Arc::new(DemoTransport),
        endpoint: Arc::new(DemoEndpoint),
        auth_client: Arc::new(DemoAuthenticationClient),
        registry,
        failed: Arc::new(FailedDestinations::new()),
        auth_cache,
    };

    let engine = DiscoveryEngine::new(collaborators, &config);
    let resolver = Resolver::new(engine, config.service_type.clone());

    let locator = Locator::new("demo-app", "demo-module").with_affinity(Affinity::Cluster("demo-cluster".to_string()));
    let mut ctx = InvocationContext::new(locator);

    resolver.resolve(&mut ctx).await?;

    info!(destination = ?ctx.destination(), target_affinity = ?ctx.target_affinity(), "resolved destination");
    info!("metrics snapshot:\n{}", gather_metrics_string());

    Ok(())
}
