use std::sync::Arc;
use std::time::Instant;

use kuberes_core::{validate_app_name, AppKey, AppParam, AppRecord, DeployError, DeployResult, FilterQuery, ResourceObject, ResourceOp};
use kuberes_kubehub::{ClusterBinding, ClusterResourceHandle};
use kuberes_persist::AppRegistry;
use kuberes_template::{RenderRequest, TemplateRenderer};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::appres::{persistence_err, resource_err, AppResHandle};
use crate::locks::DeployLocks;
use crate::policy::ExtensionPolicy;

/// How a successful `start` ended. Never both for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "app", rename_all = "snake_case")]
pub enum DeployOutcome {
    Created(AppRecord),
    Updated(AppRecord),
}

impl DeployOutcome {
    pub fn app(&self) -> &AppRecord {
        match self {
            DeployOutcome::Created(a) | DeployOutcome::Updated(a) => a,
        }
    }
}

/// Everything the worker talks to. The worker never builds these itself.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn AppRegistry>,
    /// Bound to the worker's (cluster, namespace, kind).
    pub kube_res: Arc<dyn ClusterResourceHandle>,
    pub app_res: Arc<dyn AppResHandle>,
    pub renderer: Arc<dyn TemplateRenderer>,
}

/// Reconciles one application name into the bound cluster/namespace.
pub struct DeployWorker {
    name: String,
    binding: ClusterBinding,
    deps: Collaborators,
    policy: ExtensionPolicy,
    locks: Option<Arc<DeployLocks>>,
}

impl DeployWorker {
    /// Fails with `Validation` when `kube_res` and `app_res` target different clusters.
    pub fn new(name: impl Into<String>, deps: Collaborators, policy: ExtensionPolicy) -> DeployResult<Self> {
        let binding = deps.kube_res.binding().clone();
        if deps.app_res.cluster() != binding.cluster {
            return Err(DeployError::Validation(format!(
                "application handle targets cluster {:?} but resource handle is bound to {:?}",
                deps.app_res.cluster(),
                binding.cluster
            )));
        }
        Ok(Self { name: name.into(), binding, deps, policy, locks: None })
    }

    /// Serialize `start` per identity with other workers sharing `locks`.
    pub fn with_locks(mut self, locks: Arc<DeployLocks>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn binding(&self) -> &ClusterBinding { &self.binding }

    pub fn policy(&self) -> &ExtensionPolicy { &self.policy }

    fn cluster(&self) -> &str { &self.binding.cluster }

    fn namespace(&self) -> &str { &self.binding.namespace }

    /// Ensure exactly one live `param.name` exists in the bound cluster/namespace.
    pub async fn start(&self, template: &str, param: &AppParam) -> DeployResult<DeployOutcome> {
        let t0 = Instant::now();
        info!(worker = %self.name, app = %param.name, cluster = %self.cluster(), ns = %self.namespace(), template = %template, force = self.policy.force(), "deploy: start");
        validate_app_name(&param.name)?;

        let key = AppKey::new(self.cluster(), self.namespace(), &param.name);
        let _guard = match &self.locks {
            Some(locks) => Some(locks.acquire(&key).await),
            None => None,
        };

        let res = self.run(template, param).await;
        match &res {
            Ok(DeployOutcome::Created(app)) => {
                counter!("deploy_created_total", 1u64);
                info!(app = %app.name, id = app.id, took_ms = %t0.elapsed().as_millis(), "deploy: created");
            }
            Ok(DeployOutcome::Updated(app)) => {
                counter!("deploy_updated_total", 1u64);
                info!(app = %app.name, id = app.id, took_ms = %t0.elapsed().as_millis(), "deploy: updated");
            }
            Err(e) => {
                counter!("deploy_failed_total", 1u64);
                warn!(app = %param.name, error = %e, took_ms = %t0.elapsed().as_millis(), "deploy: failed");
            }
        }
        histogram!("deploy_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        res
    }

    async fn run(&self, template: &str, param: &AppParam) -> DeployResult<DeployOutcome> {
        self.check_app_res(&param.name).await?;
        let existing = self
            .deps
            .registry
            .get_by_name(self.cluster(), self.namespace(), &param.name)
            .map_err(|e| persistence_err(&param.name, self.cluster(), self.namespace(), &e))?;
        match existing {
            Some(app) => self.update_app_res(app, template, param).await.map(DeployOutcome::Updated),
            None => self.create_app_res(template, param).await.map(DeployOutcome::Created),
        }
    }

    /// Uniqueness of the name within the cluster. With `force`, every application holding
    /// the name in another namespace is deleted; any failed deletion is a conflict.
    async fn check_app_res(&self, app: &str) -> DeployResult<()> {
        let exotic = self
            .deps
            .registry
            .get_exotic_by_name(self.cluster(), self.namespace(), app)
            .map_err(|e| persistence_err(app, self.cluster(), self.namespace(), &e))?;
        if exotic.is_empty() {
            return Ok(());
        }
        let namespaces: Vec<String> = exotic.iter().map(|a| a.namespace.clone()).collect();
        if !self.policy.force() {
            return Err(DeployError::Conflict { app: app.to_string(), cluster: self.cluster().to_string(), namespaces, cause: None });
        }

        let mut failed_ns = Vec::new();
        let mut causes = Vec::new();
        for old in &exotic {
            warn!(app = %app, cluster = %self.cluster(), ns = %old.namespace, "deleting application held in another namespace (force)");
            match self.deps.app_res.delete_app(&old.namespace, &old.name).await {
                Ok(()) => warn!(app = %app, cluster = %self.cluster(), ns = %old.namespace, "old application deleted (force)"),
                Err(e) if e.is_not_found() => debug!(app = %app, ns = %old.namespace, "old application already gone"),
                Err(e) => {
                    error!(app = %app, cluster = %self.cluster(), ns = %old.namespace, error = %e, "delete old application failed");
                    causes.push(format!("{}: {}", old.namespace, e));
                    failed_ns.push(old.namespace.clone());
                }
            }
        }
        if !failed_ns.is_empty() {
            return Err(DeployError::Conflict {
                app: app.to_string(),
                cluster: self.cluster().to_string(),
                namespaces: failed_ns,
                cause: Some(causes.join("; ")),
            });
        }
        Ok(())
    }

    async fn update_app_res(&self, app: AppRecord, template: &str, param: &AppParam) -> DeployResult<AppRecord> {
        info!(cluster = %self.cluster(), ns = %self.namespace(), app = %app.name, kind = %app.gvk_key(), "deploy: update path, removing stray copies");
        self.delete_application(&app.name).await;
        self.deps.app_res.reconfigure(&app, template, param).await
    }

    async fn create_app_res(&self, template: &str, param: &AppParam) -> DeployResult<AppRecord> {
        let (obj, record) = self.create_kube_app_res(template, param).await?;
        let created = match self.deps.registry.create(&record) {
            Ok(c) => c,
            Err(e) => {
                let err = persistence_err(&param.name, self.cluster(), self.namespace(), &e);
                self.compensate(&obj, &record).await;
                return Err(err);
            }
        };
        // Patch hook failures are logged only; the application is already created.
        if let Some(patch) = self.policy.patcher() {
            if let Err(e) = patch(&created) {
                counter!("deploy_patch_failed_total", 1u64);
                warn!(app = %created.name, error = %format!("{:#}", e), "deploy: patch hook failed");
            }
        }
        Ok(created)
    }

    async fn create_kube_app_res(&self, template: &str, param: &AppParam) -> DeployResult<(ResourceObject, AppRecord)> {
        let project_id = self.deps.app_res.project_id();
        let req = RenderRequest { cluster: self.cluster(), namespace: self.namespace(), template, project_id, param };
        let obj = self.deps.renderer.generate(&req).map_err(|e| DeployError::Render {
            app: param.name.clone(),
            cluster: self.cluster().to_string(),
            namespace: self.namespace().to_string(),
            template: template.to_string(),
            reason: format!("{:#}", e),
        })?;
        info!(cluster = %self.cluster(), ns = %self.namespace(), app = %param.name, kind = %obj.gvk_key(), "deploy: create path, removing stray copies");
        self.delete_application(&param.name).await;
        info!(cluster = %self.cluster(), ns = %self.namespace(), app = %param.name, kind = %obj.gvk_key(), "deploy: creating resource");
        self.deps
            .kube_res
            .create_resource(&obj)
            .await
            .map_err(|e| resource_err(ResourceOp::Create, self.cluster(), self.namespace(), &obj.gvk_key(), &obj.name, &e))?;
        let record = AppRecord::from_rendered(self.cluster(), project_id, template, &obj, kuberes_persist::now_ts());
        Ok((obj, record))
    }

    /// Undo a create whose record could not be persisted. Failures here are logged so the
    /// persistence error stays the one reported.
    async fn compensate(&self, obj: &ResourceObject, record: &AppRecord) {
        warn!(app = %obj.name, cluster = %self.cluster(), ns = %self.namespace(), "compensating: deleting created resource");
        if let Err(e) = self.deps.kube_res.delete_resource(obj).await {
            error!(app = %obj.name, error = %format!("{:#}", e), "compensation: resource delete failed");
        }
        // only a row matching this attempt is removed; a record written by someone else stays
        match self.deps.registry.get_by_name(&record.cluster, &record.namespace, &record.name) {
            Ok(Some(stored)) if stored.created_at == record.created_at && stored.spec == record.spec => {
                if let Err(e) = self.deps.registry.delete(&record.key()) {
                    error!(app = %record.name, error = %format!("{:#}", e), "compensation: record delete failed");
                }
            }
            Ok(_) => debug!(app = %record.name, "compensation: no record from this attempt"),
            Err(e) => error!(app = %record.name, error = %format!("{:#}", e), "compensation: record lookup failed"),
        }
    }

    /// Best-effort removal of copies of `app` registered under other clusters.
    async fn delete_application(&self, app: &str) {
        let project_id = self.deps.app_res.project_id();
        let candidates = match self.deps.registry.list(&FilterQuery::name_eq(app), Some(project_id), None, Some(self.namespace())) {
            Ok(v) => v,
            Err(e) => {
                error!(app = %app, error = %format!("{:#}", e), "cleanup: listing applications failed");
                return;
            }
        };
        for rec in candidates {
            if rec.cluster == self.cluster() {
                continue;
            }
            let app_res = match self.deps.app_res.rebind(&rec.cluster).await {
                Ok(ar) => ar,
                Err(e) => {
                    self.cleanup_failed(&rec, e.to_string());
                    continue;
                }
            };
            match app_res.check_app_live(&rec).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(cluster = %rec.cluster, app = %rec.name, kind = %rec.gvk_key(), "cleanup: not live, skipping");
                    continue;
                }
                Err(e) => {
                    self.cleanup_failed(&rec, e.to_string());
                    continue;
                }
            }
            match app_res.delete_app(&rec.namespace, &rec.name).await {
                Ok(()) => info!(cluster = %rec.cluster, app = %rec.name, "delete unsuitable application successfully"),
                Err(e) => self.cleanup_failed(&rec, e.to_string()),
            }
        }
    }

    fn cleanup_failed(&self, rec: &AppRecord, reason: String) {
        let e = DeployError::Cleanup { app: rec.name.clone(), cluster: rec.cluster.clone(), reason };
        counter!("deploy_cleanup_failed_total", 1u64);
        warn!(ns = %rec.namespace, error = %e, "delete unsuitable application failed");
    }
}
