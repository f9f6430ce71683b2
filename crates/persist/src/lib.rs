//! kuberes persistence: the application registry and settings tables in SQLite.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use kuberes_core::{AppKey, AppRecord, FilterQuery};
use kuberes_settings::{IntegrateSetting, ProjectEnv, SettingsStore};
use metrics::{counter, histogram};
use rusqlite::OptionalExtension;
use tracing::debug;

/// Persisted store of applications keyed by (cluster, namespace, name).
pub trait AppRegistry: Send + Sync {
    /// Point lookup; `None` when no record exists.
    fn get_by_name(&self, cluster: &str, namespace: &str, name: &str) -> Result<Option<AppRecord>>;
    /// Records with this name in the same cluster but a namespace other than `namespace`.
    fn get_exotic_by_name(&self, cluster: &str, namespace: &str, name: &str) -> Result<Vec<AppRecord>>;
    /// Filtered listing; `None` scopes match everything.
    fn list(&self, filter: &FilterQuery, project_id: Option<i64>, cluster: Option<&str>, namespace: Option<&str>) -> Result<Vec<AppRecord>>;
    /// Insert a new record. Fails if the identity is already taken.
    fn create(&self, rec: &AppRecord) -> Result<AppRecord>;
    /// Update kind/spec/template of an existing identity in place.
    fn update(&self, rec: &AppRecord) -> Result<()>;
    /// Remove a record. Missing identities are not an error.
    fn delete(&self, key: &AppKey) -> Result<()>;
}

/// SQLite-backed registry. Simple, synchronous.
pub struct SqliteRegistry {
    db: std::sync::Mutex<rusqlite::Connection>,
}

const COLUMNS: &str = "id, cluster, namespace, name, api_version, kind, project_id, template, spec, created_at, updated_at";

impl SqliteRegistry {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KUBERES_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        Self::init(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(db)
    }

    fn init(db: rusqlite::Connection) -> Result<Self> {
        let started = std::time::Instant::now();
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS applications (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster     TEXT NOT NULL,
                namespace   TEXT NOT NULL,
                name        TEXT NOT NULL,
                api_version TEXT NOT NULL,
                kind        TEXT NOT NULL,
                project_id  INTEGER NOT NULL,
                template    TEXT NOT NULL,
                spec        TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_applications_identity ON applications(cluster, namespace, name);
            CREATE INDEX IF NOT EXISTS idx_applications_name ON applications(name);
            CREATE TABLE IF NOT EXISTS project_envs (
                id                  INTEGER PRIMARY KEY,
                project_id          INTEGER NOT NULL,
                name                TEXT NOT NULL,
                cluster             TEXT NOT NULL,
                namespace           TEXT NOT NULL,
                registry_setting_id INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS integrate_settings (
                id     INTEGER PRIMARY KEY,
                name   TEXT NOT NULL,
                kind   TEXT NOT NULL,
                config TEXT NOT NULL
            );",
        )
        .context("creating registry tables")?;
        let me = Self { db: std::sync::Mutex::new(db) };
        histogram!("registry_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("registry connection poisoned"))
    }

    fn query_records(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<AppRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(record_from_row(row)?);
        }
        Ok(out)
    }

    pub fn put_project_env(&self, env: &ProjectEnv) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO project_envs(id, project_id, name, cluster, namespace, registry_setting_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (env.id, env.project_id, &env.name, &env.cluster, &env.namespace, env.registry_setting_id),
        )?;
        Ok(())
    }

    pub fn put_integrate_setting(&self, s: &IntegrateSetting) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO integrate_settings(id, name, kind, config) VALUES (?1, ?2, ?3, ?4)",
            (s.id, &s.name, &s.kind, &s.config),
        )?;
        Ok(())
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> Result<AppRecord> {
    let spec: String = row.get(8)?;
    Ok(AppRecord {
        id: row.get(0)?,
        cluster: row.get(1)?,
        namespace: row.get(2)?,
        name: row.get(3)?,
        api_version: row.get(4)?,
        kind: row.get(5)?,
        project_id: row.get(6)?,
        template: row.get(7)?,
        spec: serde_json::from_str(&spec).context("decoding stored spec")?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl AppRegistry for SqliteRegistry {
    fn get_by_name(&self, cluster: &str, namespace: &str, name: &str) -> Result<Option<AppRecord>> {
        let started = std::time::Instant::now();
        let sql = format!("SELECT {} FROM applications WHERE cluster = ?1 AND namespace = ?2 AND name = ?3", COLUMNS);
        let out = self.query_records(&sql, &[&cluster, &namespace, &name])?.into_iter().next();
        histogram!("registry_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn get_exotic_by_name(&self, cluster: &str, namespace: &str, name: &str) -> Result<Vec<AppRecord>> {
        let sql = format!(
            "SELECT {} FROM applications WHERE cluster = ?1 AND namespace <> ?2 AND name = ?3 ORDER BY namespace",
            COLUMNS
        );
        self.query_records(&sql, &[&cluster, &namespace, &name])
    }

    fn list(&self, filter: &FilterQuery, project_id: Option<i64>, cluster: Option<&str>, namespace: Option<&str>) -> Result<Vec<AppRecord>> {
        let started = std::time::Instant::now();
        let sql = format!(
            "SELECT {} FROM applications
             WHERE (?1 IS NULL OR project_id = ?1)
               AND (?2 IS NULL OR cluster = ?2)
               AND (?3 IS NULL OR namespace = ?3)
             ORDER BY cluster, namespace, name",
            COLUMNS
        );
        let rows = self.query_records(&sql, &[&project_id, &cluster, &namespace])?;
        let out: Vec<AppRecord> = rows.into_iter().filter(|r| filter.matches(r)).collect();
        histogram!("registry_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(count = out.len(), "registry: list");
        Ok(out)
    }

    fn create(&self, rec: &AppRecord) -> Result<AppRecord> {
        let started = std::time::Instant::now();
        let spec = serde_json::to_string(&rec.spec)?;
        let db = self.conn()?;
        db.execute(
            "INSERT INTO applications(cluster, namespace, name, api_version, kind, project_id, template, spec, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            (
                &rec.cluster,
                &rec.namespace,
                &rec.name,
                &rec.api_version,
                &rec.kind,
                rec.project_id,
                &rec.template,
                &spec,
                rec.created_at,
                rec.updated_at,
            ),
        )
        .with_context(|| format!("inserting application {}", rec.key()))?;
        let mut out = rec.clone();
        out.id = db.last_insert_rowid();
        histogram!("registry_create_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("registry_create_total", 1u64);
        Ok(out)
    }

    fn update(&self, rec: &AppRecord) -> Result<()> {
        let spec = serde_json::to_string(&rec.spec)?;
        let n = self.conn()?.execute(
            "UPDATE applications SET api_version = ?4, kind = ?5, template = ?6, spec = ?7, updated_at = ?8
             WHERE cluster = ?1 AND namespace = ?2 AND name = ?3",
            (&rec.cluster, &rec.namespace, &rec.name, &rec.api_version, &rec.kind, &rec.template, &spec, rec.updated_at),
        )?;
        if n == 0 {
            return Err(anyhow!("application {} not found for update", rec.key()));
        }
        counter!("registry_update_total", 1u64);
        Ok(())
    }

    fn delete(&self, key: &AppKey) -> Result<()> {
        self.conn()?.execute(
            "DELETE FROM applications WHERE cluster = ?1 AND namespace = ?2 AND name = ?3",
            (&key.cluster, &key.namespace, &key.name),
        )?;
        counter!("registry_delete_total", 1u64);
        Ok(())
    }
}

impl SettingsStore for SqliteRegistry {
    fn project_env(&self, env_id: i64) -> Result<ProjectEnv> {
        let db = self.conn()?;
        db.query_row(
            "SELECT id, project_id, name, cluster, namespace, registry_setting_id FROM project_envs WHERE id = ?1",
            [env_id],
            |row| {
                Ok(ProjectEnv {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    name: row.get(2)?,
                    cluster: row.get(3)?,
                    namespace: row.get(4)?,
                    registry_setting_id: row.get(5)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| anyhow!("project env {} not found", env_id))
    }

    fn integrate_setting(&self, id: i64) -> Result<IntegrateSetting> {
        let db = self.conn()?;
        db.query_row(
            "SELECT id, name, kind, config FROM integrate_settings WHERE id = ?1",
            [id],
            |row| Ok(IntegrateSetting { id: row.get(0)?, name: row.get(1)?, kind: row.get(2)?, config: row.get(3)? }),
        )
        .optional()?
        .ok_or_else(|| anyhow!("integrate setting {} not found", id))
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".kuberes");
        let _ = std::fs::create_dir_all(&p);
        p.push("kuberes.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "kuberes.db".to_string()
}

/// Seconds since epoch.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("kuberes-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    fn rec(cluster: &str, ns: &str, name: &str, project_id: i64) -> AppRecord {
        AppRecord {
            id: 0,
            cluster: cluster.into(),
            namespace: ns.into(),
            name: name.into(),
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            project_id,
            template: "tpl1".into(),
            spec: serde_json::json!({"spec": {"replicas": 1}}),
            created_at: 10,
            updated_at: 10,
        }
    }

    #[test]
    fn create_get_update_delete() {
        let path = temp_db();
        let r = SqliteRegistry::open(&path).unwrap();
        let created = r.create(&rec("c1", "ns-a", "svc", 1)).unwrap();
        assert!(created.id > 0);

        let got = r.get_by_name("c1", "ns-a", "svc").unwrap().expect("present");
        assert_eq!(got, created);
        assert!(r.get_by_name("c1", "ns-b", "svc").unwrap().is_none());

        let mut changed = got.clone();
        changed.spec = serde_json::json!({"spec": {"replicas": 3}});
        changed.updated_at = 20;
        r.update(&changed).unwrap();
        let after = r.get_by_name("c1", "ns-a", "svc").unwrap().unwrap();
        assert_eq!(after.id, created.id);
        assert_eq!(after.spec["spec"]["replicas"], 3);
        assert_eq!(after.created_at, 10);
        assert_eq!(after.updated_at, 20);

        r.delete(&created.key()).unwrap();
        assert!(r.get_by_name("c1", "ns-a", "svc").unwrap().is_none());
        // deleting again is a no-op
        r.delete(&created.key()).unwrap();
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let r = SqliteRegistry::open_in_memory().unwrap();
        r.create(&rec("c1", "ns-a", "svc", 1)).unwrap();
        let e = r.create(&rec("c1", "ns-a", "svc", 1)).unwrap_err();
        assert!(format!("{:#}", e).contains("inserting application c1/ns-a/svc"), "{:#}", e);
        // same name in another cluster is a different identity
        r.create(&rec("c2", "ns-a", "svc", 1)).unwrap();
    }

    #[test]
    fn update_missing_identity_fails() {
        let r = SqliteRegistry::open_in_memory().unwrap();
        assert!(r.update(&rec("c1", "ns-a", "svc", 1)).is_err());
    }

    #[test]
    fn exotic_lookup_excludes_own_namespace_and_other_clusters() {
        let r = SqliteRegistry::open_in_memory().unwrap();
        r.create(&rec("c1", "ns-a", "svc", 1)).unwrap();
        r.create(&rec("c1", "ns-b", "svc", 1)).unwrap();
        r.create(&rec("c1", "ns-c", "svc", 1)).unwrap();
        r.create(&rec("c2", "ns-d", "svc", 1)).unwrap();
        r.create(&rec("c1", "ns-e", "other", 1)).unwrap();
        let exotic = r.get_exotic_by_name("c1", "ns-b", "svc").unwrap();
        let ns: Vec<_> = exotic.iter().map(|a| a.namespace.as_str()).collect();
        assert_eq!(ns, vec!["ns-a", "ns-c"]);
    }

    #[test]
    fn list_applies_scopes_and_filter() {
        let r = SqliteRegistry::open_in_memory().unwrap();
        r.create(&rec("c1", "ns-a", "svc", 1)).unwrap();
        r.create(&rec("c2", "ns-a", "svc", 1)).unwrap();
        r.create(&rec("c2", "ns-a", "svc-worker", 1)).unwrap();
        // identity is taken regardless of project
        r.create(&rec("c2", "ns-a", "svc", 2)).unwrap_err();
        r.create(&rec("c3", "ns-a", "svc", 2)).unwrap();

        let all = r.list(&FilterQuery::all(), None, None, None).unwrap();
        assert_eq!(all.len(), 4);

        let by_name = r.list(&FilterQuery::name_eq("svc"), Some(1), None, Some("ns-a")).unwrap();
        let clusters: Vec<_> = by_name.iter().map(|a| a.cluster.as_str()).collect();
        assert_eq!(clusters, vec!["c1", "c2"]);

        let scoped = r.list(&FilterQuery::all(), None, Some("c2"), None).unwrap();
        assert_eq!(scoped.len(), 2);
    }

    #[test]
    fn settings_tables_back_pull_secret_lookup() {
        let r = SqliteRegistry::open_in_memory().unwrap();
        r.put_integrate_setting(&IntegrateSetting { id: 3, name: "prod".into(), kind: "harbor".into(), config: r#"{"url":"harbor.local"}"#.into() }).unwrap();
        r.put_project_env(&ProjectEnv { id: 1, project_id: 1, name: "dev".into(), cluster: "c1".into(), namespace: "ns".into(), registry_setting_id: 3 }).unwrap();
        let ps = kuberes_settings::default_pull_secret_and_registry_addr(&r, 1).unwrap();
        assert_eq!(ps.name, "harbor-prod");
        assert_eq!(ps.registry_url, "harbor.local");
        assert!(r.project_env(42).is_err());
    }
}
