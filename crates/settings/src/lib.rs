//! Integration settings lookup used to wire image pull secrets into deployments.
//! Independent of the deploy state machine: failures here are plain errors.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Deployment environment of a project (cluster/namespace plus linked integrations).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectEnv {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub cluster: String,
    pub namespace: String,
    /// Integration setting id of the image registry used by this environment.
    pub registry_setting_id: i64,
}

/// Stored integration row; `config` is JSON whose shape depends on `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrateSetting {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub config: String,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HarborConfig {
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, rename = "isHttps")]
    pub is_https: bool,
}

impl std::fmt::Debug for HarborConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarborConfig")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &"***")
            .field("is_https", &self.is_https)
            .finish()
    }
}

/// Plain docker registry (no project API).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryConfig {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationConfig {
    Harbor(HarborConfig),
    Registry(RegistryConfig),
}

impl IntegrationConfig {
    /// Decode a stored config by integration type.
    pub fn parse(config: &str, kind: &str) -> Result<Self> {
        match kind.to_ascii_lowercase().as_str() {
            "harbor" => {
                let c: HarborConfig = serde_json::from_str(config).context("parsing harbor config")?;
                Ok(IntegrationConfig::Harbor(c))
            }
            "registry" => {
                let c: RegistryConfig = serde_json::from_str(config).context("parsing registry config")?;
                Ok(IntegrationConfig::Registry(c))
            }
            other => Err(anyhow!("unsupported integration type: {}", other)),
        }
    }
}

/// Read access to environments and integrations.
pub trait SettingsStore: Send + Sync {
    fn project_env(&self, env_id: i64) -> Result<ProjectEnv>;
    fn integrate_setting(&self, id: i64) -> Result<IntegrateSetting>;
}

/// Image pull secret name plus registry address for an environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullSecret {
    pub name: String,
    pub registry_url: String,
}

/// Resolve the pull secret and registry address configured for `env_id`.
///
/// Only harbor integrations carry an address; other types yield an empty `registry_url`.
pub fn default_pull_secret_and_registry_addr(store: &dyn SettingsStore, env_id: i64) -> Result<PullSecret> {
    let env = store.project_env(env_id).map_err(|e| {
        error!(env_id, error = %e, "pull secret: project env lookup failed");
        e
    })?;
    let setting = store.integrate_setting(env.registry_setting_id).map_err(|e| {
        error!(setting_id = env.registry_setting_id, error = %e, "pull secret: integrate setting lookup failed");
        e
    })?;
    let config = IntegrationConfig::parse(&setting.config, &setting.kind).map_err(|e| {
        error!(setting = %setting.name, error = %e, "pull secret: config parse failed");
        e
    })?;
    let registry_url = match config {
        IntegrationConfig::Harbor(h) => h.url,
        IntegrationConfig::Registry(_) => String::new(),
    };
    Ok(PullSecret { name: format!("harbor-{}", setting.name), registry_url })
}
