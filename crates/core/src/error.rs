//! Error taxonomy surfaced by the deploy worker.

use serde::{Deserialize, Serialize};

/// Errors carry enough identity (application, cluster, namespace) for the caller to act on.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeployError {
    /// Name already live in other namespaces of the same cluster.
    #[error("conflict: {}", conflict_message(.app, .cluster, .namespaces, .cause))]
    Conflict {
        app: String,
        cluster: String,
        namespaces: Vec<String>,
        /// Set when a forced override could not remove an old application.
        cause: Option<String>,
    },
    #[error("not_found: application({name}) in namespace {namespace} of cluster {cluster}")]
    NotFound { cluster: String, namespace: String, name: String },
    #[error("validation: {0}")]
    Validation(String),
    #[error("render: template {template} for application({app}) in {cluster}/{namespace}: {reason}")]
    Render { app: String, cluster: String, namespace: String, template: String, reason: String },
    #[error("resource: {op} {kind} {name} in namespace {namespace} of cluster {cluster}: {reason}")]
    Resource { op: ResourceOp, cluster: String, namespace: String, kind: String, name: String, reason: String },
    #[error("persistence: application({app}) in namespace {namespace} of cluster {cluster}: {reason}")]
    Persistence { app: String, cluster: String, namespace: String, reason: String },
    /// Best-effort cleanup failure. Logged by the worker, never returned from `start`.
    #[error("cleanup: application({app}) in cluster {cluster}: {reason}")]
    Cleanup { app: String, cluster: String, reason: String },
    #[error("internal: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResourceOp {
    Create,
    Delete,
    Check,
    Connect,
}

impl std::fmt::Display for ResourceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceOp::Create => "create",
            ResourceOp::Delete => "delete",
            ResourceOp::Check => "check",
            ResourceOp::Connect => "connect",
        };
        f.write_str(s)
    }
}

pub type DeployResult<T> = Result<T, DeployError>;

impl DeployError {
    pub fn is_conflict(&self) -> bool { matches!(self, DeployError::Conflict { .. }) }

    pub fn is_not_found(&self) -> bool { matches!(self, DeployError::NotFound { .. }) }
}

fn conflict_message(app: &str, cluster: &str, namespaces: &[String], cause: &Option<String>) -> String {
    match cause.as_deref() {
        None => format!(
            "the application({}) is existed in namespace {:?} of cluster {}, and you have no right to cover the old application",
            app, namespaces, cluster
        ),
        Some(cause) => format!(
            "the application({}) is existed in namespace {:?} of cluster {}, and delete old application failed: {}",
            app, namespaces, cluster, cause
        ),
    }
}
