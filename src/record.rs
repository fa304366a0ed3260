//! `ServiceRecord`: a discovered endpoint plus the attributes a probe observed
//! on it, and the wire attribute name constants from spec §6.

use std::collections::HashMap;

use url::Url;

/// Wire constant: the EJB service type name probed for (spec §6).
pub const SERVICE_TYPE_EJB_JBOSS: &str = "ejb.jboss";

/// Wire attribute name constants (spec §6).
pub mod attr {
    pub const NODE: &str = "node";
    pub const CLUSTER: &str = "cluster";
    pub const EJB_MODULE: &str = "ejb-module";
    pub const EJB_MODULE_DISTINCT: &str = "ejb-module-distinct";
    pub const SOURCE_IP: &str = "source-ip";
}

/// A single attribute value. Most attributes are plain strings; `source-ip`
/// values are CIDR strings parsed lazily by the resolver (spec §4.E).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Str(String),
}

impl AttributeValue {
    pub fn as_str(&self) -> &str {
        match self {
            AttributeValue::Str(s) => s,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::Str(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::Str(s)
    }
}

/// A discovered endpoint plus its attributes (multimap: an attribute key may
/// carry more than one value, e.g. `cluster` or `source-ip`).
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRecord {
    pub location_uri: Url,
    attributes: HashMap<String, Vec<AttributeValue>>,
}

impl ServiceRecord {
    pub fn new(location_uri: Url) -> Self {
        Self {
            location_uri,
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.entry(key.into()).or_default().push(value.into());
        self
    }

    pub fn values(&self, key: &str) -> &[AttributeValue] {
        self.attributes.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn first_value(&self, key: &str) -> Option<&str> {
        self.values(key).first().map(|v| v.as_str())
    }

    /// The `node` attribute, if the record carries one.
    pub fn node(&self) -> Option<&str> {
        self.first_value(attr::NODE)
    }

    /// All `cluster` attribute values on this record.
    pub fn clusters(&self) -> Vec<&str> {
        self.values(attr::CLUSTER).iter().map(|v| v.as_str()).collect()
    }

    /// All `source-ip` CIDR strings on this record.
    pub fn source_ips(&self) -> Vec<&str> {
        self.values(attr::SOURCE_IP).iter().map(|v| v.as_str()).collect()
    }
}
