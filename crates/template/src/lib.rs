//! kuberes template rendering: a template name plus parameters becomes a desired resource.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use kuberes_core::{AppParam, ResourceObject};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::debug;

pub const LABEL_APP: &str = "app.kubernetes.io/name";
pub const LABEL_CLUSTER: &str = "kuberes.io/cluster";
pub const LABEL_PROJECT: &str = "kuberes.io/project";

/// Inputs to one render.
#[derive(Debug, Clone, Copy)]
pub struct RenderRequest<'a> {
    pub cluster: &'a str,
    pub namespace: &'a str,
    pub template: &'a str,
    pub project_id: i64,
    pub param: &'a AppParam,
}

pub trait TemplateRenderer: Send + Sync {
    fn generate(&self, req: &RenderRequest<'_>) -> Result<ResourceObject>;
}

fn max_yaml_bytes() -> usize {
    std::env::var("KUBERES_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("KUBERES_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// RFC 7386 merge patch: objects merge recursively, `null` removes, anything else replaces.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    match patch {
        Json::Object(p) => {
            if !target.is_object() {
                *target = Json::Object(serde_json::Map::new());
            }
            if let Some(t) = target.as_object_mut() {
                for (k, pv) in p.iter() {
                    if pv.is_null() {
                        t.remove(k);
                    } else {
                        merge_patch(t.entry(k.clone()).or_insert(Json::Null), pv);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// Parse a YAML template and render it for `req`.
pub fn render_yaml(yaml: &str, req: &RenderRequest<'_>) -> Result<ResourceObject> {
    if yaml.len() > max_yaml_bytes() {
        return Err(anyhow!("template {} too large (>{} bytes)", req.template, max_yaml_bytes()));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(yaml).with_context(|| format!("parsing template {}", req.template))?;
    let mut json = serde_json::to_value(val).context("converting YAML to JSON")?;
    if json_node_budget_exceeded(&json, max_yaml_nodes()) {
        return Err(anyhow!("template {} too complex (>{} nodes)", req.template, max_yaml_nodes()));
    }
    if !json.is_object() {
        return Err(anyhow!("template {} is not a mapping", req.template));
    }
    merge_patch(&mut json, &Json::Object(req.param.values.clone()));

    let api_version = json.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("template {} missing apiVersion", req.template))?.to_string();
    let kind = json.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("template {} missing kind", req.template))?.to_string();

    let root = json.as_object_mut().ok_or_else(|| anyhow!("template {} is not a mapping", req.template))?;
    let meta = root.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
    if !meta.is_object() {
        *meta = Json::Object(serde_json::Map::new());
    }
    if let Some(m) = meta.as_object_mut() {
        m.insert("name".into(), Json::String(req.param.name.clone()));
        m.insert("namespace".into(), Json::String(req.namespace.to_string()));
        let labels = m.entry("labels").or_insert_with(|| Json::Object(serde_json::Map::new()));
        if !labels.is_object() {
            *labels = Json::Object(serde_json::Map::new());
        }
        if let Some(l) = labels.as_object_mut() {
            l.insert(LABEL_APP.into(), Json::String(req.param.name.clone()));
            l.insert(LABEL_CLUSTER.into(), Json::String(req.cluster.to_string()));
            l.insert(LABEL_PROJECT.into(), Json::String(req.project_id.to_string()));
        }
    }

    Ok(ResourceObject {
        api_version,
        kind,
        name: req.param.name.clone(),
        namespace: req.namespace.to_string(),
        manifest: json,
    })
}

/// Renders `<dir>/<template>.yaml` (or `.yml`).
pub struct FileTemplates {
    dir: PathBuf,
}

impl FileTemplates {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

    /// Directory from `KUBERES_TEMPLATE_DIR`, default `./templates`.
    pub fn from_env() -> Self {
        let dir = std::env::var("KUBERES_TEMPLATE_DIR").unwrap_or_else(|_| "templates".to_string());
        Self::new(dir)
    }

    pub fn dir(&self) -> &Path { &self.dir }

    fn locate(&self, template: &str) -> Result<PathBuf> {
        if template.is_empty() || template.contains('/') || template.contains('\\') || template.starts_with('.') {
            return Err(anyhow!("invalid template name {:?}", template));
        }
        for ext in ["yaml", "yml"] {
            let p = self.dir.join(format!("{}.{}", template, ext));
            if p.is_file() {
                return Ok(p);
            }
        }
        Err(anyhow!("template {} not found in {}", template, self.dir.display()))
    }
}

impl TemplateRenderer for FileTemplates {
    fn generate(&self, req: &RenderRequest<'_>) -> Result<ResourceObject> {
        let started = std::time::Instant::now();
        let path = self.locate(req.template)?;
        let yaml = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let obj = render_yaml(&yaml, req);
        match &obj {
            Ok(o) => {
                counter!("template_render_ok", 1u64);
                debug!(template = %req.template, kind = %o.gvk_key(), name = %o.name, "template rendered");
            }
            Err(_) => {
                counter!("template_render_err", 1u64);
            }
        }
        histogram!("template_render_ms", started.elapsed().as_secs_f64() * 1000.0);
        obj
    }
}
