use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kuberes_core::{AppParam, AppRecord, FilterKey, FilterQuery};
use kuberes_deploy::{AppRes, AppResHandle, Collaborators, DeployOutcome, DeployWorker, ExtensionPolicy};
use kuberes_kubehub::{ClusterBinding, ClusterConnector, KubeConnector};
use kuberes_persist::{AppRegistry, SqliteRegistry};
use kuberes_settings::default_pull_secret_and_registry_addr;
use kuberes_template::FileTemplates;
use serde_json::Value as Json;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kuberesctl", version, about = "kuberes CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Registry database (default ~/.kuberes/kuberes.db)
    #[arg(long = "db", global = true, env = "KUBERES_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or reconfigure an application from a template
    Deploy {
        /// Kubeconfig context; empty means the current one
        #[arg(long = "cluster", default_value = "")]
        cluster: String,
        #[arg(long = "ns")]
        namespace: String,
        /// GVK key the template renders, e.g. "apps/v1/Deployment"
        #[arg(long = "kind")]
        kind: String,
        #[arg(long = "project")]
        project: i64,
        #[arg(long = "template")]
        template: String,
        /// Application name
        name: String,
        /// Override template values, e.g. `spec.replicas=3`
        #[arg(long = "set", value_name = "PATH=VALUE")]
        set: Vec<String>,
        /// Replace an application of the same name living in another namespace
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
    },
    /// List registered applications
    Ls {
        #[arg(long = "cluster")]
        cluster: Option<String>,
        #[arg(long = "ns")]
        namespace: Option<String>,
        #[arg(long = "project")]
        project: Option<i64>,
        /// Substring match on the application name
        #[arg(long = "name")]
        name: Option<String>,
    },
    /// Delete an application and its registry record
    Rm {
        #[arg(long = "cluster", default_value = "")]
        cluster: String,
        #[arg(long = "ns")]
        namespace: String,
        #[arg(long = "project")]
        project: i64,
        name: String,
    },
    /// Resolve the image pull secret and registry address of an environment
    PullSecret {
        env_id: i64,
    },
}

fn init_tracing() {
    let env = std::env::var("KUBERES_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUBERES_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KUBERES_METRICS_ADDR; expected host:port");
        }
    }
}

fn open_registry(db: Option<&str>) -> Result<Arc<SqliteRegistry>> {
    let reg = match db {
        Some(p) => SqliteRegistry::open(p)?,
        None => SqliteRegistry::open_default()?,
    };
    Ok(Arc::new(reg))
}

/// Parse `a.b.c=value` into a nested object. Values that parse as JSON keep their type.
fn parse_set(expr: &str) -> Result<(String, Json)> {
    let (path, raw) = expr.split_once('=').ok_or_else(|| anyhow!("--set expects PATH=VALUE, got {:?}", expr))?;
    let mut keys = path.split('.').rev();
    let leaf = keys.next().filter(|k| !k.is_empty()).ok_or_else(|| anyhow!("empty path in --set {:?}", expr))?;
    let value = serde_json::from_str::<Json>(raw).unwrap_or_else(|_| Json::String(raw.to_string()));
    let mut node = value;
    let mut top = leaf;
    for k in keys {
        if k.is_empty() {
            return Err(anyhow!("empty path segment in --set {:?}", expr));
        }
        node = serde_json::json!({ top: node });
        top = k;
    }
    Ok((top.to_string(), node))
}

fn build_param(name: &str, sets: &[String]) -> Result<AppParam> {
    let mut values = Json::Object(serde_json::Map::new());
    for s in sets {
        let (k, v) = parse_set(s)?;
        kuberes_template::merge_patch(&mut values, &serde_json::json!({ k: v }));
    }
    let mut param = AppParam::named(name);
    if let Json::Object(m) = values {
        param.values = m;
    }
    Ok(param)
}

fn render_age(ts: i64) -> String {
    if ts <= 0 { return "-".to_string(); }
    let mut secs = (kuberes_persist::now_ts() - ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

fn print_records(rows: &[AppRecord]) {
    println!("{:<16} {:<16} {:<24} {:<28} {:>8} {:>8}", "CLUSTER", "NAMESPACE", "NAME", "KIND", "PROJECT", "AGE");
    for r in rows {
        let cluster = if r.cluster.is_empty() { "-" } else { r.cluster.as_str() };
        println!("{:<16} {:<16} {:<24} {:<28} {:>8} {:>8}", cluster, r.namespace, r.name, r.gvk_key(), r.project_id, render_age(r.created_at));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let registry = open_registry(cli.db.as_deref())?;

    match cli.command {
        Commands::Deploy { cluster, namespace, kind, project, template, name, set, force } => {
            let t0 = Instant::now();
            let param = build_param(&name, &set)?;
            let connector = KubeConnector::new();
            let kube_res = connector
                .connect(ClusterBinding::new(&cluster, &namespace, &kind))
                .await
                .with_context(|| format!("connecting to cluster {:?}", cluster))?;
            let renderer = Arc::new(FileTemplates::from_env());
            info!(dir = %renderer.dir().display(), "templates");
            let app_res = AppRes::new(&cluster, project, registry.clone(), Arc::new(connector), renderer.clone());
            let deps = Collaborators { registry, kube_res, app_res: Arc::new(app_res), renderer };
            let worker = DeployWorker::new("kuberesctl", deps, ExtensionPolicy::new(force))?;
            let out = match worker.start(&template, &param).await {
                Ok(o) => o,
                Err(e) => {
                    error!(error = %e, "deploy failed");
                    return Err(e.into());
                }
            };
            match cli.output {
                Output::Human => {
                    let (verb, app) = match &out {
                        DeployOutcome::Created(a) => ("created", a),
                        DeployOutcome::Updated(a) => ("updated", a),
                    };
                    println!("{} {} {}/{} ({} ms)", verb, app.gvk_key(), app.namespace, app.name, t0.elapsed().as_millis());
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&out)?),
            }
        }
        Commands::Ls { cluster, namespace, project, name } => {
            let filter = match name {
                Some(n) => FilterQuery { key: Some(FilterKey::Name), value: n, exact: false },
                None => FilterQuery::all(),
            };
            let rows = registry.list(&filter, project, cluster.as_deref(), namespace.as_deref())?;
            info!(count = rows.len(), "ls");
            match cli.output {
                Output::Human => print_records(&rows),
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Rm { cluster, namespace, project, name } => {
            let app_res = AppRes::new(&cluster, project, registry.clone(), Arc::new(KubeConnector::new()), Arc::new(FileTemplates::from_env()));
            app_res.delete_app(&namespace, &name).await?;
            match cli.output {
                Output::Human => println!("deleted {}/{}", namespace, name),
                Output::Json => println!("{}", serde_json::json!({ "deleted": { "cluster": cluster, "namespace": namespace, "name": name } })),
            }
        }
        Commands::PullSecret { env_id } => {
            let secret = default_pull_secret_and_registry_addr(registry.as_ref(), env_id)?;
            match cli.output {
                Output::Human => {
                    let addr = if secret.registry_url.is_empty() { "-" } else { secret.registry_url.as_str() };
                    println!("{}\t{}", secret.name, addr);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&secret)?),
            }
        }
    }

    Ok(())
}
