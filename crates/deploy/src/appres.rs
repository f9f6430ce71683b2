use std::sync::Arc;
use std::time::{Duration, Instant};

use kuberes_core::{AppParam, AppRecord, DeployError, DeployResult, ResourceObject, ResourceOp};
use kuberes_kubehub::{ClusterBinding, ClusterConnector, ClusterResourceHandle};
use kuberes_persist::AppRegistry;
use kuberes_template::{RenderRequest, TemplateRenderer};
use tracing::{debug, info};

/// Application-level operations that touch both the cluster and the registry.
#[async_trait::async_trait]
pub trait AppResHandle: Send + Sync {
    /// Cluster this handle operates on.
    fn cluster(&self) -> &str;

    fn project_id(&self) -> i64;

    /// Delete the live resource of a registered application, then its record.
    /// `NotFound` when the registry has no such application.
    async fn delete_app(&self, namespace: &str, name: &str) -> DeployResult<()>;

    /// Whether the cluster object described by `app` exists, looked up with the record's
    /// own cluster, namespace and kind.
    async fn check_app_live(&self, app: &AppRecord) -> DeployResult<bool>;

    /// Re-render `template` against the record's own identity, recreate the cluster
    /// resource and update the record in place.
    async fn reconfigure(&self, app: &AppRecord, template: &str, param: &AppParam) -> DeployResult<AppRecord>;

    /// The same handle targeting another cluster.
    async fn rebind(&self, cluster: &str) -> DeployResult<Arc<dyn AppResHandle>>;
}

/// Registry + cluster backed [`AppResHandle`].
#[derive(Clone)]
pub struct AppRes {
    cluster: String,
    project_id: i64,
    registry: Arc<dyn AppRegistry>,
    connector: Arc<dyn ClusterConnector>,
    renderer: Arc<dyn TemplateRenderer>,
}

impl AppRes {
    pub fn new(
        cluster: impl Into<String>,
        project_id: i64,
        registry: Arc<dyn AppRegistry>,
        connector: Arc<dyn ClusterConnector>,
        renderer: Arc<dyn TemplateRenderer>,
    ) -> Self {
        Self { cluster: cluster.into(), project_id, registry, connector, renderer }
    }

    async fn connect(&self, cluster: &str, namespace: &str, gvk_key: &str, name: &str) -> DeployResult<Arc<dyn ClusterResourceHandle>> {
        self.connector
            .connect(ClusterBinding::new(cluster, namespace, gvk_key))
            .await
            .map_err(|e| resource_err(ResourceOp::Connect, cluster, namespace, gvk_key, name, &e))
    }
}

pub(crate) fn resource_err(op: ResourceOp, cluster: &str, namespace: &str, kind: &str, name: &str, e: &anyhow::Error) -> DeployError {
    DeployError::Resource {
        op,
        cluster: cluster.to_string(),
        namespace: namespace.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        reason: format!("{:#}", e),
    }
}

pub(crate) fn persistence_err(app: &str, cluster: &str, namespace: &str, e: &anyhow::Error) -> DeployError {
    DeployError::Persistence {
        app: app.to_string(),
        cluster: cluster.to_string(),
        namespace: namespace.to_string(),
        reason: format!("{:#}", e),
    }
}

fn delete_wait() -> Duration {
    let secs = std::env::var("KUBERES_DELETE_WAIT_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(30);
    Duration::from_secs(secs)
}

/// Foreground deletes return before the object is gone; a create with the same name
/// would be rejected until then.
async fn wait_gone(handle: &dyn ClusterResourceHandle, obj: &ResourceObject) -> DeployResult<()> {
    let b = handle.binding();
    let deadline = Instant::now() + delete_wait();
    loop {
        let live = handle
            .check_exists(&obj.name)
            .await
            .map_err(|e| resource_err(ResourceOp::Check, &b.cluster, &b.namespace, &b.kind, &obj.name, &e))?;
        if !live {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(resource_err(
                ResourceOp::Delete,
                &b.cluster,
                &b.namespace,
                &b.kind,
                &obj.name,
                &anyhow::anyhow!("still terminating after {:?}", delete_wait()),
            ));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[async_trait::async_trait]
impl AppResHandle for AppRes {
    fn cluster(&self) -> &str { &self.cluster }

    fn project_id(&self) -> i64 { self.project_id }

    async fn delete_app(&self, namespace: &str, name: &str) -> DeployResult<()> {
        let rec = self
            .registry
            .get_by_name(&self.cluster, namespace, name)
            .map_err(|e| persistence_err(name, &self.cluster, namespace, &e))?
            .ok_or_else(|| DeployError::NotFound { cluster: self.cluster.clone(), namespace: namespace.to_string(), name: name.to_string() })?;
        let handle = self.connect(&self.cluster, namespace, &rec.gvk_key(), name).await?;
        handle
            .delete_resource(&rec.resource_object())
            .await
            .map_err(|e| resource_err(ResourceOp::Delete, &self.cluster, namespace, &rec.gvk_key(), name, &e))?;
        self.registry
            .delete(&rec.key())
            .map_err(|e| persistence_err(name, &self.cluster, namespace, &e))?;
        info!(cluster = %self.cluster, ns = %namespace, app = %name, "application deleted");
        Ok(())
    }

    async fn check_app_live(&self, app: &AppRecord) -> DeployResult<bool> {
        let kind = app.gvk_key();
        let handle = self.connect(&app.cluster, &app.namespace, &kind, &app.name).await?;
        handle
            .check_exists(&app.name)
            .await
            .map_err(|e| resource_err(ResourceOp::Check, &app.cluster, &app.namespace, &kind, &app.name, &e))
    }

    async fn reconfigure(&self, app: &AppRecord, template: &str, param: &AppParam) -> DeployResult<AppRecord> {
        let mut param = param.clone();
        param.name = app.name.clone();
        let req = RenderRequest {
            cluster: &app.cluster,
            namespace: &app.namespace,
            template,
            project_id: app.project_id,
            param: &param,
        };
        let obj = self.renderer.generate(&req).map_err(|e| DeployError::Render {
            app: app.name.clone(),
            cluster: app.cluster.clone(),
            namespace: app.namespace.clone(),
            template: template.to_string(),
            reason: format!("{:#}", e),
        })?;
        let handle = self.connect(&app.cluster, &app.namespace, &obj.gvk_key(), &app.name).await?;

        let previous = app.resource_object();
        debug!(cluster = %app.cluster, ns = %app.namespace, app = %app.name, kind = %previous.gvk_key(), "reconfigure: deleting previous resource");
        handle
            .delete_resource(&previous)
            .await
            .map_err(|e| resource_err(ResourceOp::Delete, &app.cluster, &app.namespace, &previous.gvk_key(), &app.name, &e))?;
        if previous.gvk_key() == obj.gvk_key() {
            wait_gone(handle.as_ref(), &obj).await?;
        }
        handle
            .create_resource(&obj)
            .await
            .map_err(|e| resource_err(ResourceOp::Create, &app.cluster, &app.namespace, &obj.gvk_key(), &app.name, &e))?;

        let mut updated = app.clone();
        updated.api_version = obj.api_version.clone();
        updated.kind = obj.kind.clone();
        updated.template = template.to_string();
        updated.spec = obj.manifest.clone();
        updated.updated_at = kuberes_persist::now_ts();
        self.registry
            .update(&updated)
            .map_err(|e| persistence_err(&app.name, &app.cluster, &app.namespace, &e))?;
        info!(cluster = %app.cluster, ns = %app.namespace, app = %app.name, template = %template, "application reconfigured");
        Ok(updated)
    }

    async fn rebind(&self, cluster: &str) -> DeployResult<Arc<dyn AppResHandle>> {
        let mut me = self.clone();
        me.cluster = cluster.to_string();
        Ok(Arc::new(me))
    }
}
