//! kuberes core types: application identity, records, requests and the error taxonomy.

#![forbid(unsafe_code)]

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

mod error;

pub use error::{DeployError, DeployResult, ResourceOp};

/// Identity of an application inside the registry: (cluster, namespace, name).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppKey {
    pub cluster: String,
    pub namespace: String,
    pub name: String,
}

impl AppKey {
    pub fn new(cluster: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { cluster: cluster.into(), namespace: namespace.into(), name: name.into() }
    }
}

impl std::fmt::Display for AppKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.namespace, self.name)
    }
}

/// Persisted description of a deployed application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppRecord {
    /// Registry row id; 0 until persisted.
    pub id: i64,
    pub cluster: String,
    pub namespace: String,
    pub name: String,
    pub api_version: String,
    pub kind: String,
    pub project_id: i64,
    /// Template the record was rendered from.
    pub template: String,
    /// Rendered manifest as last applied to the cluster.
    pub spec: Json,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AppRecord {
    /// Build an unpersisted record from a freshly rendered resource.
    pub fn from_rendered(cluster: &str, project_id: i64, template: &str, obj: &ResourceObject, now: i64) -> Self {
        Self {
            id: 0,
            cluster: cluster.to_string(),
            namespace: obj.namespace.clone(),
            name: obj.name.clone(),
            api_version: obj.api_version.clone(),
            kind: obj.kind.clone(),
            project_id,
            template: template.to_string(),
            spec: obj.manifest.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> AppKey {
        AppKey::new(&self.cluster, &self.namespace, &self.name)
    }

    /// `v1/Kind` or `group/v1/Kind`, the same shape used for cluster bindings.
    pub fn gvk_key(&self) -> String {
        gvk_key(&self.api_version, &self.kind)
    }

    /// The cluster object this record describes.
    pub fn resource_object(&self) -> ResourceObject {
        ResourceObject {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            manifest: self.spec.clone(),
        }
    }
}

/// Per-invocation application parameters. `values` is overlaid on the template.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppParam {
    pub name: String,
    #[serde(default)]
    pub values: serde_json::Map<String, Json>,
}

impl AppParam {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), values: serde_json::Map::new() }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Json) -> Self {
        self.values.insert(key.into(), value);
        self
    }
}

/// A rendered, namespaced cluster object ready to be created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceObject {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub manifest: Json,
}

impl ResourceObject {
    pub fn gvk_key(&self) -> String {
        gvk_key(&self.api_version, &self.kind)
    }
}

/// Compose a GVK key from `apiVersion` and `kind`.
pub fn gvk_key(api_version: &str, kind: &str) -> String {
    format!("{}/{}", api_version, kind)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FilterKey {
    Name,
    Kind,
}

/// Listing filter for registry queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterQuery {
    pub key: Option<FilterKey>,
    pub value: String,
    /// Exact match when true, substring match otherwise.
    pub exact: bool,
}

impl FilterQuery {
    pub fn all() -> Self { Self::default() }

    pub fn name_eq(name: &str) -> Self {
        Self { key: Some(FilterKey::Name), value: name.to_string(), exact: true }
    }

    pub fn matches(&self, rec: &AppRecord) -> bool {
        let field = match self.key {
            None => return true,
            Some(FilterKey::Name) => rec.name.as_str(),
            Some(FilterKey::Kind) => rec.kind.as_str(),
        };
        if self.exact { field == self.value } else { field.contains(self.value.as_str()) }
    }
}

static DNS_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex")
});

/// Application names become object names, so they must be RFC 1123 labels.
pub fn validate_app_name(name: &str) -> DeployResult<()> {
    if name.is_empty() || name.len() > 63 || !DNS_LABEL.is_match(name) {
        return Err(DeployError::Validation(format!(
            "invalid application name {:?} (expect lowercase RFC 1123 label, max 63 chars)",
            name
        )));
    }
    Ok(())
}

pub mod prelude {
    pub use super::{AppKey, AppParam, AppRecord, DeployError, DeployResult, FilterKey, FilterQuery, ResourceObject, ResourceOp};
}
