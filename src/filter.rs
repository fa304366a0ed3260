//! `FilterSpec`: boolean filter expressions over named attributes (spec §3/§4.B),
//! modeled as a sum type with plain recursive-function extractors rather than a
//! visitor dispatch object.

use crate::record::attr;

/// Boolean filter expression over a [`ServiceRecord`](crate::record::ServiceRecord)'s
/// attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSpec {
    Equals(String, String),
    All(Vec<FilterSpec>),
    HasAttribute(String),
}

impl FilterSpec {
    pub fn equals(attr: impl Into<String>, value: impl Into<String>) -> Self {
        FilterSpec::Equals(attr.into(), value.into())
    }

    pub fn has_attribute(attr: impl Into<String>) -> Self {
        FilterSpec::HasAttribute(attr.into())
    }

    pub fn all(children: Vec<FilterSpec>) -> Self {
        FilterSpec::All(children)
    }
}

/// A parsed `ejb-module`/`ejb-module-distinct` attribute value (spec §4.B).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleIdentifier {
    pub app: String,
    pub module: String,
    pub distinct: String,
}

impl ModuleIdentifier {
    fn new(app: &str, module: &str, distinct: &str) -> Self {
        Self {
            app: app.to_string(),
            module: module.to_string(),
            distinct: distinct.to_string(),
        }
    }

    fn parse_ejb_module(value: &str) -> Option<Self> {
        let segments: Vec<&str> = value.split('/').collect();
        match segments.as_slice() {
            [app, module] => Some(Self::new(app, module, "")),
            [module] => Some(Self::new("", module, "")),
            _ => None,
        }
    }

    fn parse_ejb_module_distinct(value: &str) -> Option<Self> {
        let segments: Vec<&str> = value.split('/').collect();
        match segments.as_slice() {
            [app, module, distinct] => Some(Self::new(app, module, distinct)),
            [module, distinct] => Some(Self::new("", module, distinct)),
            _ => None,
        }
    }
}

/// Returns the first [`ModuleIdentifier`] implied by an `Equals` on `ejb-module`
/// or `ejb-module-distinct`, recursing into `All` children (spec §4.B).
pub fn extract_module(filter: &FilterSpec) -> Option<ModuleIdentifier> {
    match filter {
        FilterSpec::Equals(key, value) if key == attr::EJB_MODULE => {
            ModuleIdentifier::parse_ejb_module(value)
        }
        FilterSpec::Equals(key, value) if key == attr::EJB_MODULE_DISTINCT => {
            ModuleIdentifier::parse_ejb_module_distinct(value)
        }
        FilterSpec::All(children) => children.iter().find_map(extract_module),
        _ => None,
    }
}

/// Returns the string value of an `Equals` on `node`, recursing into `All`
/// children (spec §4.B).
pub fn extract_node(filter: &FilterSpec) -> Option<String> {
    match filter {
        FilterSpec::Equals(key, value) if key == attr::NODE => Some(value.clone()),
        FilterSpec::All(children) => children.iter().find_map(extract_node),
        _ => None,
    }
}
