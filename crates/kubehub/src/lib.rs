//! kuberes kubehub: cluster resource handles bound to (cluster, namespace, kind).
//!
//! A cluster is a kubeconfig context name; the empty string means the current context.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use kube::{
    api::{Api, DeleteParams, PostParams},
    config::KubeConfigOptions,
    core::{DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client, Config,
};
use kuberes_core::ResourceObject;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

/// Target of every cluster operation a handle performs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ClusterBinding {
    pub cluster: String,
    pub namespace: String,
    /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment".
    pub kind: String,
}

impl ClusterBinding {
    pub fn new(cluster: impl Into<String>, namespace: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { cluster: cluster.into(), namespace: namespace.into(), kind: kind.into() }
    }

    /// Same namespace and kind on another cluster.
    pub fn with_cluster(&self, cluster: &str) -> Self {
        Self { cluster: cluster.to_string(), ..self.clone() }
    }
}

/// Create/delete/existence checks against one binding.
#[async_trait::async_trait]
pub trait ClusterResourceHandle: Send + Sync {
    fn binding(&self) -> &ClusterBinding;

    async fn create_resource(&self, obj: &ResourceObject) -> Result<()>;

    /// Delete the object; an object that is already gone counts as deleted.
    async fn delete_resource(&self, obj: &ResourceObject) -> Result<()>;

    /// Whether an object of the bound kind with this name is live.
    async fn check_exists(&self, name: &str) -> Result<bool>;

    /// A handle for the same namespace and kind on `cluster`.
    async fn rebind(&self, cluster: &str) -> Result<Arc<dyn ClusterResourceHandle>>;
}

/// Builds handles for arbitrary bindings.
#[async_trait::async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, binding: ClusterBinding) -> Result<Arc<dyn ClusterResourceHandle>>;
}

/// kube-rs connector; caches one client per kubeconfig context.
#[derive(Clone, Default)]
pub struct KubeConnector {
    clients: Arc<tokio::sync::Mutex<HashMap<String, Client>>>,
}

impl KubeConnector {
    pub fn new() -> Self { Self::default() }

    pub async fn client_for(&self, cluster: &str) -> Result<Client> {
        let mut guard = self.clients.lock().await;
        if let Some(c) = guard.get(cluster) {
            return Ok(c.clone());
        }
        let client = if cluster.is_empty() {
            Client::try_default().await.context("building default kube client")?
        } else {
            let opts = KubeConfigOptions { context: Some(cluster.to_string()), ..Default::default() };
            let cfg = Config::from_kubeconfig(&opts)
                .await
                .with_context(|| format!("loading kubeconfig context {}", cluster))?;
            Client::try_from(cfg).with_context(|| format!("building kube client for {}", cluster))?
        };
        info!(cluster = %cluster, "kube client ready");
        guard.insert(cluster.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait::async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, binding: ClusterBinding) -> Result<Arc<dyn ClusterResourceHandle>> {
        Ok(Arc::new(KubeAppRes::connect(self.clone(), binding).await?))
    }
}

/// kube-rs backed cluster resource handle.
pub struct KubeAppRes {
    binding: ClusterBinding,
    connector: KubeConnector,
    client: Client,
    api: Api<DynamicObject>,
}

impl KubeAppRes {
    pub async fn connect(connector: KubeConnector, binding: ClusterBinding) -> Result<Self> {
        let client = connector.client_for(&binding.cluster).await?;
        let api = namespaced_api(client.clone(), &binding.kind, &binding.namespace).await?;
        debug!(cluster = %binding.cluster, ns = %binding.namespace, kind = %binding.kind, "kube handle bound");
        Ok(Self { binding, connector, client, api })
    }

    async fn api_for(&self, obj: &ResourceObject) -> Result<Api<DynamicObject>> {
        if obj.gvk_key() == self.binding.kind {
            return Ok(self.api.clone());
        }
        namespaced_api(self.client.clone(), &obj.gvk_key(), &self.binding.namespace).await
    }
}

#[async_trait::async_trait]
impl ClusterResourceHandle for KubeAppRes {
    fn binding(&self) -> &ClusterBinding { &self.binding }

    async fn create_resource(&self, obj: &ResourceObject) -> Result<()> {
        let api = self.api_for(obj).await?;
        let dynobj = to_dynamic(obj, &self.binding.namespace)?;
        let created = api
            .create(&PostParams::default(), &dynobj)
            .await
            .with_context(|| format!("creating {} {}", obj.gvk_key(), obj.name))?;
        counter!("kube_create_total", 1u64);
        info!(cluster = %self.binding.cluster, ns = %self.binding.namespace, kind = %obj.gvk_key(), name = %obj.name, uid = ?created.metadata.uid, "resource created");
        Ok(())
    }

    async fn delete_resource(&self, obj: &ResourceObject) -> Result<()> {
        let api = self.api_for(obj).await?;
        match api.delete(&obj.name, &DeleteParams::foreground()).await {
            Ok(_) => {
                counter!("kube_delete_total", 1u64);
                info!(cluster = %self.binding.cluster, ns = %self.binding.namespace, kind = %obj.gvk_key(), name = %obj.name, "resource deleted");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(name = %obj.name, "resource already absent");
                Ok(())
            }
            Err(e) => Err(anyhow!("deleting {} {}: {}", obj.gvk_key(), obj.name, e)),
        }
    }

    async fn check_exists(&self, name: &str) -> Result<bool> {
        let found = self.api.get_opt(name).await.with_context(|| format!("getting {} {}", self.binding.kind, name))?;
        Ok(found.is_some())
    }

    async fn rebind(&self, cluster: &str) -> Result<Arc<dyn ClusterResourceHandle>> {
        self.connector.connect(self.binding.with_cluster(cluster)).await
    }
}

/// Split a GVK key ("v1/Kind" or "group/v1/Kind").
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn namespaced_api(client: Client, gvk_key: &str, namespace: &str) -> Result<Api<DynamicObject>> {
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, caps) = discovery::pinned_kind(&client, &gvk)
        .await
        .with_context(|| format!("discovering {}", gvk_key))?;
    if !matches!(caps.scope, Scope::Namespaced) {
        return Err(anyhow!("kind {} is cluster-scoped; applications must be namespaced", gvk_key));
    }
    Ok(Api::namespaced_with(client, namespace, &ar))
}

/// Convert a rendered object into a `DynamicObject` pinned to `namespace`.
pub fn to_dynamic(obj: &ResourceObject, namespace: &str) -> Result<DynamicObject> {
    let mut v = obj.manifest.clone();
    let root = v.as_object_mut().ok_or_else(|| anyhow!("manifest for {} is not an object", obj.name))?;
    root.insert("apiVersion".into(), Json::String(obj.api_version.clone()));
    root.insert("kind".into(), Json::String(obj.kind.clone()));
    let meta = root.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
    let meta = meta.as_object_mut().ok_or_else(|| anyhow!("metadata for {} is not an object", obj.name))?;
    meta.insert("name".into(), Json::String(obj.name.clone()));
    meta.insert("namespace".into(), Json::String(namespace.to_string()));
    // server-populated fields must not be sent on create
    meta.remove("resourceVersion");
    meta.remove("uid");
    meta.remove("managedFields");
    meta.remove("creationTimestamp");
    root.remove("status");
    serde_json::from_value(v).context("decoding manifest as DynamicObject")
}
