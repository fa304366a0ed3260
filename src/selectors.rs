//! Pluggable node/URI selection policies (spec §4.F). A `None` return from any
//! selector is treated by the resolver as a fatal configuration error — these
//! traits never return an empty string or synthesize a value to paper over
//! misconfiguration.

use std::collections::HashMap;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use url::Url;

use crate::locator::Locator;

/// Chooses among the nodes discovered for a named cluster.
#[async_trait]
pub trait ClusterNodeSelector: Send + Sync {
    async fn select_node(
        &self,
        cluster: &str,
        connected: &[String],
        available: &[String],
    ) -> Option<String>;
}

/// Chooses among the nodes discovered for a deployed module.
#[async_trait]
pub trait DeploymentNodeSelector: Send + Sync {
    async fn select_node(
        &self,
        nodes: &[String],
        app: &str,
        module: &str,
        distinct: &str,
    ) -> Option<String>;
}

/// Chooses among discovered URIs when no node identity is available for any
/// of them.
#[async_trait]
pub trait DiscoveredUriSelector: Send + Sync {
    async fn select_node(&self, uris: &HashMap<String, Url>, locator: &Locator) -> Option<Url>;
}

pub(crate) fn pick_uniform<'a, T>(items: &'a [T]) -> Option<&'a T> {
    items.choose(&mut rand::thread_rng())
}

/// Default `ClusterNodeSelector`: prefer a node the transport already has an
/// open connection to; otherwise draw uniformly from the available set
/// (spec §4.F leaves the default unspecified for this selector — see
/// DESIGN.md's Open Question decision).
#[derive(Debug, Default, Clone, Copy)]
pub struct PreferConnectedClusterNodeSelector;

#[async_trait]
impl ClusterNodeSelector for PreferConnectedClusterNodeSelector {
    async fn select_node(
        &self,
        _cluster: &str,
        connected: &[String],
        available: &[String],
    ) -> Option<String> {
        if let Some(node) = pick_uniform(connected) {
            return Some(node.clone());
        }
        pick_uniform(available).cloned()
    }
}

/// Default `DeploymentNodeSelector`: draws uniformly from the candidate
/// nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomDeploymentNodeSelector;

#[async_trait]
impl DeploymentNodeSelector for RandomDeploymentNodeSelector {
    async fn select_node(
        &self,
        nodes: &[String],
        _app: &str,
        _module: &str,
        _distinct: &str,
    ) -> Option<String> {
        pick_uniform(nodes).cloned()
    }
}

/// Default `DiscoveredURISelector`: `RANDOM`, draws uniformly (spec §4.F).
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomDiscoveredUriSelector;

#[async_trait]
impl DiscoveredUriSelector for RandomDiscoveredUriSelector {
    async fn select_node(&self, uris: &HashMap<String, Url>, _locator: &Locator) -> Option<Url> {
        let values: Vec<&Url> = uris.values().collect();
        pick_uniform(&values).map(|uri| (*uri).clone())
    }
}
