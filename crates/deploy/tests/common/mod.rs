#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use kuberes_core::{AppKey, AppParam, AppRecord, FilterQuery, ResourceObject};
use kuberes_deploy::{AppRes, Collaborators, DeployWorker, ExtensionPolicy};
use kuberes_kubehub::{ClusterBinding, ClusterConnector, ClusterResourceHandle};
use kuberes_persist::AppRegistry;
use kuberes_template::{render_yaml, RenderRequest, TemplateRenderer};

pub const PROJECT: i64 = 7;
pub const DEPLOYMENT: &str = "apps/v1/Deployment";
pub const CONFIGMAP: &str = "v1/ConfigMap";

pub const WEB: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: placeholder\nspec:\n  replicas: 1\n";
pub const CFG: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: placeholder\ndata:\n  mode: prod\n";
pub const BROKEN: &str = "apiVersion: v1\nmetadata: {}\n";

// ---------------- registry ----------------

#[derive(Default)]
pub struct MemRegistry {
    rows: Mutex<Vec<AppRecord>>,
    next_id: AtomicI64,
    pub fail_create: AtomicBool,
    pub fail_get: AtomicBool,
}

impl MemRegistry {
    pub fn records(&self) -> Vec<AppRecord> { self.rows.lock().unwrap().clone() }

    pub fn find(&self, cluster: &str, ns: &str, name: &str) -> Option<AppRecord> {
        self.rows.lock().unwrap().iter().find(|r| r.cluster == cluster && r.namespace == ns && r.name == name).cloned()
    }
}

impl AppRegistry for MemRegistry {
    fn get_by_name(&self, cluster: &str, namespace: &str, name: &str) -> Result<Option<AppRecord>> {
        if self.fail_get.load(Ordering::SeqCst) {
            bail!("registry unavailable");
        }
        Ok(self.find(cluster, namespace, name))
    }

    fn get_exotic_by_name(&self, cluster: &str, namespace: &str, name: &str) -> Result<Vec<AppRecord>> {
        if self.fail_get.load(Ordering::SeqCst) {
            bail!("registry unavailable");
        }
        let rows = self.rows.lock().unwrap();
        Ok(rows.iter().filter(|r| r.cluster == cluster && r.namespace != namespace && r.name == name).cloned().collect())
    }

    fn list(&self, filter: &FilterQuery, project_id: Option<i64>, cluster: Option<&str>, namespace: Option<&str>) -> Result<Vec<AppRecord>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|r| filter.matches(r))
            .filter(|r| project_id.map_or(true, |p| r.project_id == p))
            .filter(|r| cluster.map_or(true, |c| r.cluster == c))
            .filter(|r| namespace.map_or(true, |n| r.namespace == n))
            .cloned()
            .collect())
    }

    fn create(&self, rec: &AppRecord) -> Result<AppRecord> {
        if self.fail_create.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|r| r.key() == rec.key()) {
            bail!("UNIQUE constraint failed: {}", rec.key());
        }
        let mut out = rec.clone();
        out.id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        rows.push(out.clone());
        Ok(out)
    }

    fn update(&self, rec: &AppRecord) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let slot = rows.iter_mut().find(|r| r.key() == rec.key()).ok_or_else(|| anyhow!("{} not found", rec.key()))?;
        *slot = rec.clone();
        Ok(())
    }

    fn delete(&self, key: &AppKey) -> Result<()> {
        self.rows.lock().unwrap().retain(|r| &r.key() != key);
        Ok(())
    }
}

// ---------------- cluster ----------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create { cluster: String, ns: String, name: String },
    Delete { cluster: String, ns: String, name: String },
    Check { cluster: String, ns: String, name: String },
}

impl Call {
    pub fn is_mutation(&self) -> bool { !matches!(self, Call::Check { .. }) }
}

type LiveKey = (String, String, String, String);

/// Every cluster the tests talk to, keyed by cluster name inside.
#[derive(Default)]
pub struct FakeCluster {
    live: Mutex<HashSet<LiveKey>>,
    calls: Mutex<Vec<Call>>,
    pub fail_create: AtomicBool,
    fail_delete: Mutex<HashSet<(String, String)>>,
}

impl FakeCluster {
    pub fn put_live(&self, cluster: &str, ns: &str, kind: &str, name: &str) {
        self.live.lock().unwrap().insert((cluster.into(), ns.into(), kind.into(), name.into()));
    }

    pub fn is_live(&self, cluster: &str, ns: &str, kind: &str, name: &str) -> bool {
        self.live.lock().unwrap().contains(&(cluster.into(), ns.into(), kind.into(), name.into()))
    }

    pub fn fail_delete_in(&self, cluster: &str, ns: &str) {
        self.fail_delete.lock().unwrap().insert((cluster.into(), ns.into()));
    }

    pub fn calls(&self) -> Vec<Call> { self.calls.lock().unwrap().clone() }

    pub fn mutations(&self) -> Vec<Call> { self.calls().into_iter().filter(Call::is_mutation).collect() }

    fn record(&self, c: Call) { self.calls.lock().unwrap().push(c); }
}

pub struct FakeHandle {
    binding: ClusterBinding,
    state: Arc<FakeCluster>,
}

impl FakeHandle {
    pub fn new(binding: ClusterBinding, state: Arc<FakeCluster>) -> Self { Self { binding, state } }
}

#[async_trait::async_trait]
impl ClusterResourceHandle for FakeHandle {
    fn binding(&self) -> &ClusterBinding { &self.binding }

    async fn create_resource(&self, obj: &ResourceObject) -> Result<()> {
        let cluster = self.binding.cluster.clone();
        self.state.record(Call::Create { cluster: cluster.clone(), ns: obj.namespace.clone(), name: obj.name.clone() });
        if self.state.fail_create.load(Ordering::SeqCst) {
            bail!("admission webhook denied the request");
        }
        let key = (cluster, obj.namespace.clone(), obj.gvk_key(), obj.name.clone());
        let mut live = self.state.live.lock().unwrap();
        if !live.insert(key) {
            bail!("{} already exists", obj.name);
        }
        Ok(())
    }

    async fn delete_resource(&self, obj: &ResourceObject) -> Result<()> {
        let cluster = self.binding.cluster.clone();
        self.state.record(Call::Delete { cluster: cluster.clone(), ns: obj.namespace.clone(), name: obj.name.clone() });
        if self.state.fail_delete.lock().unwrap().contains(&(cluster.clone(), obj.namespace.clone())) {
            bail!("forbidden: cannot delete in {}", obj.namespace);
        }
        self.state.live.lock().unwrap().remove(&(cluster, obj.namespace.clone(), obj.gvk_key(), obj.name.clone()));
        Ok(())
    }

    async fn check_exists(&self, name: &str) -> Result<bool> {
        let b = &self.binding;
        self.state.record(Call::Check { cluster: b.cluster.clone(), ns: b.namespace.clone(), name: name.to_string() });
        Ok(self.state.is_live(&b.cluster, &b.namespace, &b.kind, name))
    }

    async fn rebind(&self, cluster: &str) -> Result<Arc<dyn ClusterResourceHandle>> {
        Ok(Arc::new(FakeHandle::new(self.binding.with_cluster(cluster), self.state.clone())))
    }
}

pub struct FakeConnector {
    pub state: Arc<FakeCluster>,
}

#[async_trait::async_trait]
impl ClusterConnector for FakeConnector {
    async fn connect(&self, binding: ClusterBinding) -> Result<Arc<dyn ClusterResourceHandle>> {
        Ok(Arc::new(FakeHandle::new(binding, self.state.clone())))
    }
}

// ---------------- templates ----------------

pub struct InlineTemplates {
    pub sources: HashMap<String, String>,
}

impl Default for InlineTemplates {
    fn default() -> Self {
        let sources = [("web", WEB), ("cfg", CFG), ("broken", BROKEN)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self { sources }
    }
}

impl TemplateRenderer for InlineTemplates {
    fn generate(&self, req: &RenderRequest<'_>) -> Result<ResourceObject> {
        let src = self.sources.get(req.template).ok_or_else(|| anyhow!("template {} not found", req.template))?;
        render_yaml(src, req)
    }
}

// ---------------- harness ----------------

#[derive(Default)]
pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub registry: Arc<MemRegistry>,
    pub renderer: Arc<InlineTemplates>,
}

impl Harness {
    pub fn new() -> Self { Self::default() }

    pub fn app_res(&self, cluster: &str) -> AppRes {
        AppRes::new(
            cluster,
            PROJECT,
            self.registry.clone(),
            Arc::new(FakeConnector { state: self.cluster.clone() }),
            self.renderer.clone(),
        )
    }

    pub fn collaborators(&self, cluster: &str, ns: &str) -> Collaborators {
        Collaborators {
            registry: self.registry.clone(),
            kube_res: Arc::new(FakeHandle::new(ClusterBinding::new(cluster, ns, DEPLOYMENT), self.cluster.clone())),
            app_res: Arc::new(self.app_res(cluster)),
            renderer: self.renderer.clone(),
        }
    }

    pub fn worker(&self, cluster: &str, ns: &str, policy: ExtensionPolicy) -> DeployWorker {
        DeployWorker::new(format!("worker-{}-{}", cluster, ns), self.collaborators(cluster, ns), policy).unwrap()
    }

    /// Register an application rendered from `web` without going through the fake
    /// cluster's call log. `live` also places the object in the cluster.
    pub fn seed(&self, cluster: &str, ns: &str, name: &str, project_id: i64, live: bool) -> AppRecord {
        self.seed_from("web", cluster, ns, name, project_id, live)
    }

    /// Like [`Harness::seed`] with an explicit template, so the record may have another kind.
    pub fn seed_from(&self, template: &str, cluster: &str, ns: &str, name: &str, project_id: i64, live: bool) -> AppRecord {
        let param = AppParam::named(name);
        let req = RenderRequest { cluster, namespace: ns, template, project_id, param: &param };
        let obj = self.renderer.generate(&req).unwrap();
        let rec = self.registry.create(&AppRecord::from_rendered(cluster, project_id, template, &obj, 1_700_000_000)).unwrap();
        if live {
            self.cluster.put_live(cluster, ns, &obj.gvk_key(), name);
        }
        rec
    }
}
