//! SQLite-backed persistence for projects and settings.
//!
//! A single connection (WAL mode, 5 s busy timeout) serialises writes;
//! [`StoreHandle`] wraps it behind `Arc<Mutex>` and runs all access on
//! tokio's blocking thread pool so synchronous SQLite I/O never ties up
//! async worker threads.

pub mod migrations;

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;

// ── Model ─────────────────────────────────────────────────────────────

/// Lifecycle state of a project. The transient variants mean a background
/// task currently owns the project and its stored status must not be
/// overwritten by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectStatus {
    Stopped,
    Running,
    Error,
    Creating,
    Starting,
    Stopping,
    Deleting,
    Updating,
    UpdatingRepo,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Error => "error",
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::Deleting => "deleting",
            Self::Updating => "updating",
            Self::UpdatingRepo => "updating-repo",
        }
    }

    /// True while a background task owns the project.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Creating
                | Self::Starting
                | Self::Stopping
                | Self::Deleting
                | Self::Updating
                | Self::UpdatingRepo
        )
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "running" => Ok(Self::Running),
            "error" => Ok(Self::Error),
            "creating" => Ok(Self::Creating),
            "starting" => Ok(Self::Starting),
            "stopping" => Ok(Self::Stopping),
            "deleting" => Ok(Self::Deleting),
            "updating" => Ok(Self::Updating),
            "updating-repo" => Ok(Self::UpdatingRepo),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

/// An Odoo project: one Odoo container plus one Postgres container and the
/// configuration that shapes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: String,
    pub odoo_version: String,
    pub postgres_version: String,
    pub port: u16,
    pub status: ProjectStatus,
    pub git_repo_url: String,
    pub git_repo_branch: String,
    pub enterprise_enabled: bool,
    pub design_themes_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Major component of the Odoo version ("18.0" → 18). Zero when the
    /// version string is malformed.
    pub fn odoo_major(&self) -> u32 {
        self.odoo_version
            .split('.')
            .next()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

// ── Store ─────────────────────────────────────────────────────────────

pub struct ProjectStore {
    conn: Connection,
}

impl ProjectStore {
    /// Open (or create) the store at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow!("Failed to create store directory: {}", e))?;
        }
        let mut conn = Connection::open(path)?;
        Self::init(&mut conn)?;
        Ok(Self { conn })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        Self::init(&mut conn)?;
        Ok(Self { conn })
    }

    fn init(conn: &mut Connection) -> Result<(), StoreError> {
        // WAL keeps readers concurrent with the single writer. The pragma
        // returns the resulting mode as a row, so query it rather than
        // execute it.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(conn).map_err(StoreError::Other)?;
        Ok(())
    }

    pub fn create(&self, project: &Project) -> Result<Project, StoreError> {
        let mut p = project.clone();
        let now = Utc::now();
        p.created_at = now;
        p.updated_at = now;

        self.conn
            .execute(
                "INSERT INTO projects (id, name, description, odoo_version, postgres_version, port,
                                       status, git_repo_url, git_repo_branch, enterprise_enabled,
                                       design_themes_enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    p.id,
                    p.name,
                    p.description,
                    p.odoo_version,
                    p.postgres_version,
                    p.port,
                    p.status.as_str(),
                    p.git_repo_url,
                    p.git_repo_branch,
                    p.enterprise_enabled as i64,
                    p.design_themes_enabled as i64,
                    p.created_at.to_rfc3339(),
                    p.updated_at.to_rfc3339(),
                ],
            )
            .map_err(map_constraint)?;

        Ok(p)
    }

    pub fn get(&self, id: &str) -> Result<Option<Project>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, description, odoo_version, postgres_version, port, status,
                    git_repo_url, git_repo_branch, enterprise_enabled, design_themes_enabled,
                    created_at, updated_at
             FROM projects WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], row_to_project)?;
        match rows.next() {
            Some(row) => Ok(Some(row?.into_project()?)),
            None => Ok(None),
        }
    }

    /// All projects, newest first.
    pub fn list(&self) -> Result<Vec<Project>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, description, odoo_version, postgres_version, port, status,
                    git_repo_url, git_repo_branch, enterprise_enabled, design_themes_enabled,
                    created_at, updated_at
             FROM projects ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_project)?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row?.into_project()?);
        }
        Ok(projects)
    }

    /// Update all mutable fields. Refreshes `updated_at`.
    pub fn update(&self, project: &Project) -> Result<Project, StoreError> {
        let mut p = project.clone();
        p.updated_at = Utc::now();

        let changed = self
            .conn
            .execute(
                "UPDATE projects
                 SET name = ?1, description = ?2, odoo_version = ?3, postgres_version = ?4,
                     port = ?5, status = ?6, git_repo_url = ?7, git_repo_branch = ?8,
                     enterprise_enabled = ?9, design_themes_enabled = ?10, updated_at = ?11
                 WHERE id = ?12",
                params![
                    p.name,
                    p.description,
                    p.odoo_version,
                    p.postgres_version,
                    p.port,
                    p.status.as_str(),
                    p.git_repo_url,
                    p.git_repo_branch,
                    p.enterprise_enabled as i64,
                    p.design_themes_enabled as i64,
                    p.updated_at.to_rfc3339(),
                    p.id,
                ],
            )
            .map_err(map_constraint)?;

        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(p)
    }

    /// Idempotent delete.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Whether any project other than `exclude_id` already uses the name.
    pub fn name_exists(&self, name: &str, exclude_id: &str) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM projects WHERE name = ?1 AND id != ?2",
            params![name, exclude_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Whether any project other than `exclude_id` already uses the port.
    pub fn port_exists(&self, port: u16, exclude_id: &str) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM projects WHERE port = ?1 AND id != ?2",
            params![port, exclude_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Read a setting; missing keys read as the empty string.
    pub fn get_setting(&self, key: &str) -> Result<String, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM settings WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(row) => Ok(row?),
            None => Ok(String::new()),
        }
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Rewrite any transient status to `error` and return how many rows were
    /// touched. A transient status persisted across a restart means the
    /// owning background task died with the process.
    pub fn reconcile_stale_statuses(&self) -> Result<usize, StoreError> {
        let changed = self.conn.execute(
            "UPDATE projects SET status = 'error'
             WHERE status IN ('creating', 'starting', 'stopping', 'deleting', 'updating', 'updating-repo')",
            [],
        )?;
        Ok(changed)
    }
}

/// Map UNIQUE violations onto the typed duplicate errors so handlers can
/// produce clean 409 responses.
fn map_constraint(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(e, Some(ref msg)) = err
        && e.code == rusqlite::ErrorCode::ConstraintViolation
    {
        if msg.contains("projects.name") {
            return StoreError::DuplicateName;
        }
        if msg.contains("projects.port") {
            return StoreError::DuplicatePort;
        }
    }
    StoreError::Sqlite(err)
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct so status and timestamp strings are parsed into
/// typed values outside the rusqlite closure.
struct ProjectRow {
    id: String,
    name: String,
    description: String,
    odoo_version: String,
    postgres_version: String,
    port: u16,
    status: String,
    git_repo_url: String,
    git_repo_branch: String,
    enterprise_enabled: i64,
    design_themes_enabled: i64,
    created_at: String,
    updated_at: String,
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectRow> {
    Ok(ProjectRow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        odoo_version: row.get(3)?,
        postgres_version: row.get(4)?,
        port: row.get(5)?,
        status: row.get(6)?,
        git_repo_url: row.get(7)?,
        git_repo_branch: row.get(8)?,
        enterprise_enabled: row.get(9)?,
        design_themes_enabled: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

impl ProjectRow {
    fn into_project(self) -> Result<Project, StoreError> {
        let status = ProjectStatus::from_str(&self.status)
            .map_err(|e| anyhow!("corrupt status in database: {}", e))?;
        Ok(Project {
            id: self.id,
            name: self.name,
            description: self.description,
            odoo_version: self.odoo_version,
            postgres_version: self.postgres_version,
            port: self.port,
            status,
            git_repo_url: self.git_repo_url,
            git_repo_branch: self.git_repo_branch,
            enterprise_enabled: self.enterprise_enabled != 0,
            design_themes_enabled: self.design_themes_enabled != 0,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Other(anyhow!("corrupt timestamp '{}': {}", s, e)))
}

// ── Async handle ──────────────────────────────────────────────────────

/// Cloneable async-safe handle to the store.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<Mutex<ProjectStore>>,
}

impl StoreHandle {
    pub fn new(store: ProjectStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Run a closure against the store on a blocking thread. All data passed
    /// into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&ProjectStore) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| StoreError::Other(anyhow!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Other(anyhow!("DB task panicked: {}", e)))?
    }

    /// Acquire the store mutex synchronously. For startup initialization and
    /// tests only; never call this from a hot async path.
    pub fn lock_sync(&self) -> Result<MutexGuard<'_, ProjectStore>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Other(anyhow!("DB lock poisoned: {}", e)))
    }

    pub async fn create(&self, project: Project) -> Result<Project, StoreError> {
        self.call(move |db| db.create(&project)).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Project>, StoreError> {
        let id = id.to_string();
        self.call(move |db| db.get(&id)).await
    }

    pub async fn list(&self) -> Result<Vec<Project>, StoreError> {
        self.call(|db| db.list()).await
    }

    pub async fn update(&self, project: Project) -> Result<Project, StoreError> {
        self.call(move |db| db.update(&project)).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.call(move |db| db.delete(&id)).await
    }

    pub async fn name_exists(&self, name: &str, exclude_id: &str) -> Result<bool, StoreError> {
        let (name, exclude_id) = (name.to_string(), exclude_id.to_string());
        self.call(move |db| db.name_exists(&name, &exclude_id)).await
    }

    pub async fn port_exists(&self, port: u16, exclude_id: &str) -> Result<bool, StoreError> {
        let exclude_id = exclude_id.to_string();
        self.call(move |db| db.port_exists(port, &exclude_id)).await
    }

    pub async fn get_setting(&self, key: &str) -> Result<String, StoreError> {
        let key = key.to_string();
        self.call(move |db| db.get_setting(&key)).await
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.call(move |db| db.set_setting(&key, &value)).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
