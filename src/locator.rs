//! Invocation identity: the `Locator` an invocation carries and the `Affinity`
//! hints that steer destination resolution.

use url::Url;

/// Node/URI/cluster hint attached to a [`Locator`] (strong, part of identity) or
/// carried separately as a "weak" hint learned from a prior invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Affinity {
    None,
    Uri(Url),
    Node(String),
    Cluster(String),
    Local,
}

impl Affinity {
    pub fn is_none(&self) -> bool {
        matches!(self, Affinity::None)
    }
}

impl Default for Affinity {
    fn default() -> Self {
        Affinity::None
    }
}

/// Immutable identity of the business-object invocation being resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub app_name: String,
    pub module_name: String,
    pub distinct_name: String,
    pub bean_name: String,
    pub session_id: Option<String>,
    pub affinity: Affinity,
}

impl Locator {
    pub fn new(app_name: impl Into<String>, module_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            module_name: module_name.into(),
            distinct_name: String::new(),
            bean_name: String::new(),
            session_id: None,
            affinity: Affinity::None,
        }
    }

    pub fn with_affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn with_bean_name(mut self, bean_name: impl Into<String>) -> Self {
        self.bean_name = bean_name.into();
        self
    }

    pub fn with_distinct_name(mut self, distinct_name: impl Into<String>) -> Self {
        self.distinct_name = distinct_name.into();
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Whether this locator is a stateful invocation that should carry cluster
    /// affinity between calls (spec §4.E `handleInvocationResult`).
    pub fn is_stateful_with_cluster_affinity(&self) -> bool {
        self.session_id.is_some()
    }
}
