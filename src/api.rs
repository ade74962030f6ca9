//! REST handlers, shared application state, and the audit middleware.
//!
//! Mutating endpoints that launch background work answer 202 Accepted with
//! the current project snapshot; completion always arrives over the SSE
//! stream, never in the HTTP response.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router, body::Body, middleware};
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::warn;

use crate::audit::{AuditLog, client_ip};
use crate::config::Config;
use crate::docker::exec::is_safe_database_name;
use crate::docker::{DockerManager, odoo_conf};
use crate::errors::{GitError, StoreError};
use crate::events::{Event, EventHub};
use crate::gitops::{self, GitOps};
use crate::lifecycle;
use crate::sse;
use crate::store::{Project, ProjectStatus, StoreHandle};

// ── Shared application state ──────────────────────────────────────────

struct DockerState {
    manager: Option<DockerManager>,
    up: bool,
}

pub struct AppState {
    pub config: Config,
    pub store: StoreHandle,
    pub events: EventHub,
    pub audit: AuditLog,
    pub git: GitOps,
    pub version: String,
    docker: RwLock<DockerState>,
    /// Project ids with a backup in flight. Single-flight per project.
    backups_running: Mutex<HashSet<String>>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        store: StoreHandle,
        events: EventHub,
        audit: AuditLog,
        git: GitOps,
        version: String,
        docker_manager: Option<DockerManager>,
        docker_up: bool,
    ) -> Self {
        Self {
            config,
            store,
            events,
            audit,
            git,
            version,
            docker: RwLock::new(DockerState {
                manager: docker_manager,
                up: docker_up,
            }),
            backups_running: Mutex::new(HashSet::new()),
        }
    }

    /// The Docker manager, if a client has been constructed.
    pub fn docker(&self) -> Option<DockerManager> {
        self.docker
            .read()
            .ok()
            .and_then(|state| state.manager.clone())
    }

    /// Last known daemon reachability (maintained by the health loop).
    pub fn docker_up(&self) -> bool {
        self.docker.read().map(|state| state.up).unwrap_or(false)
    }

    /// Install a freshly constructed manager (health loop only).
    pub(crate) fn install_docker_manager(&self, manager: DockerManager) {
        if let Ok(mut state) = self.docker.write() {
            state.manager = Some(manager);
        }
    }

    /// Record reachability; returns true when the value changed.
    pub(crate) fn set_docker_up(&self, up: bool) -> bool {
        match self.docker.write() {
            Ok(mut state) => {
                let changed = state.up != up;
                state.up = up;
                changed
            }
            Err(_) => false,
        }
    }

    /// Claim the single backup slot for a project. Returns false when one is
    /// already in flight.
    pub(crate) fn try_begin_backup(&self, project_id: &str) -> bool {
        match self.backups_running.lock() {
            Ok(mut running) => running.insert(project_id.to_string()),
            Err(_) => false,
        }
    }

    pub(crate) fn end_backup(&self, project_id: &str) {
        if let Ok(mut running) = self.backups_running.lock() {
            running.remove(project_id);
        }
    }

    /// PAT from settings, empty when unset.
    pub async fn github_pat(&self) -> String {
        self.store
            .get_setting("github_pat")
            .await
            .unwrap_or_default()
    }
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unprocessable(String),
    NotFound(String),
    Conflict(String),
    DockerUnavailable,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::DockerUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Docker daemon not available".to_string(),
            ),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateName | StoreError::DuplicatePort => {
                ApiError::Conflict(err.to_string())
            }
            StoreError::NotFound => ApiError::NotFound("Project not found".to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub odoo_version: String,
    pub postgres_version: String,
    pub port: u16,
    #[serde(default)]
    pub git_repo_url: String,
    #[serde(default)]
    pub git_repo_branch: String,
    #[serde(default)]
    pub enterprise_enabled: bool,
    #[serde(default)]
    pub design_themes_enabled: bool,
}

#[derive(Deserialize)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub odoo_version: Option<String>,
    pub postgres_version: Option<String>,
    pub port: Option<u16>,
}

#[derive(Deserialize)]
pub struct UpdateRepoRequest {
    #[serde(default)]
    pub git_repo_url: String,
    #[serde(default)]
    pub git_repo_branch: String,
    // Options so an omitted flag is distinguishable from an explicit false.
    pub enterprise_enabled: Option<bool>,
    pub design_themes_enabled: Option<bool>,
}

#[derive(Deserialize)]
pub struct ConfigContentRequest {
    pub content: String,
}

#[derive(Deserialize)]
pub struct SettingsRequest {
    #[serde(default)]
    pub github_pat: String,
}

#[derive(Deserialize)]
pub struct ValidateTokenRequest {
    #[serde(default)]
    pub token: String,
}

#[derive(Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
    pub before: Option<usize>,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/:id",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route("/api/projects/:id/start", post(start_project))
        .route("/api/projects/:id/stop", post(stop_project))
        .route("/api/projects/:id/logs", get(sse::project_logs))
        .route("/api/projects/:id/databases", get(list_databases))
        .route("/api/projects/:id/backup", get(sse::backup_stream))
        .route(
            "/api/projects/:id/config",
            get(get_project_config).put(put_project_config),
        )
        .route("/api/projects/:id/repo", put(update_repo))
        .route("/api/projects/:id/update-odoo", put(update_odoo))
        .route("/api/projects/:id/update-repo", post(update_repos))
        .route("/api/projects/:id/restart-odoo", post(restart_odoo))
        .route("/api/backup/download/:filename", get(download_backup))
        .route("/api/repo/branches", get(repo_branches))
        .route("/api/enterprise/check-access", get(enterprise_check_access))
        .route(
            "/api/design-themes/check-access",
            get(design_themes_check_access),
        )
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/settings/validate-token", post(validate_token))
        .route(
            "/api/maintenance/preview-containers",
            get(preview_containers),
        )
        .route("/api/maintenance/preview-volumes", get(preview_volumes))
        .route("/api/maintenance/preview-images", get(preview_images))
        .route("/api/maintenance/clean-containers", post(clean_containers))
        .route("/api/maintenance/clean-volumes", post(clean_volumes))
        .route("/api/maintenance/clean-images", post(clean_images))
        .route("/api/audit/logs", get(audit_logs))
        .route("/api/audit/stream", get(sse::audit_stream))
        .route("/api/events", get(sse::events_stream))
        .route("/health", get(health_check))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            audit_middleware,
        ))
        .with_state(state)
}

// ── Audit middleware ──────────────────────────────────────────────────

/// Streams, previews, and pure probes stay out of the audit log; project
/// and settings activity goes in.
fn should_audit(path: &str) -> bool {
    if !path.starts_with("/api/") {
        return false;
    }
    if path.starts_with("/api/events")
        || path.starts_with("/api/audit")
        || path.starts_with("/api/maintenance/preview-")
        || path == "/api/repo/branches"
        || path.ends_with("/check-access")
    {
        return false;
    }
    true
}

async fn audit_middleware(State(state): State<SharedState>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    if should_audit(&path) {
        let method = req.method().to_string();
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        let ip = client_ip(req.headers(), peer);

        let mut message = format!("{} {}", method, path);
        // Include the project name for readability when the path names one.
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        if parts.len() >= 3
            && parts[0] == "api"
            && parts[1] == "projects"
            && let Ok(Some(project)) = state.store.get(parts[2]).await
        {
            message.push_str(&format!(" ({})", project.name));
        }

        state.audit.log(&ip, &method, &path, &message);
    }
    next.run(req).await
}

// ── Helpers ───────────────────────────────────────────────────────────

pub(crate) async fn fetch_project(state: &SharedState, id: &str) -> Result<Project, ApiError> {
    state
        .store
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Project {} not found", id)))
}

fn require_docker(state: &SharedState) -> Result<DockerManager, ApiError> {
    state.docker().ok_or(ApiError::DockerUnavailable)
}

/// Replace a stale stored status with the daemon-observed one and persist
/// the correction. Transient statuses pass through untouched.
pub(crate) async fn reconcile_project(state: &SharedState, mut project: Project) -> Project {
    let Some(docker) = state.docker() else {
        return project;
    };
    let actual = docker.reconcile_status(&project).await;
    if actual != project.status {
        project.status = actual;
        match state.store.update(project.clone()).await {
            Ok(saved) => return saved,
            Err(e) => warn!(
                project_id = %project.id,
                "failed to persist reconciled status: {}", e
            ),
        }
    }
    project
}

/// Persist a transient status and announce the pending action. The guard
/// against concurrent tasks is the transient-status check done by callers.
async fn begin_transition(
    state: &SharedState,
    mut project: Project,
    status: ProjectStatus,
    verb: &str,
) -> Result<Project, ApiError> {
    project.status = status;
    let saved = state.store.update(project).await?;
    state.events.publish(Event::action_pending(&saved.id, verb));
    Ok(saved)
}

// ── Project handlers ──────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_projects(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let projects = state.store.list().await?;
    let mut reconciled = Vec::with_capacity(projects.len());
    for project in projects {
        reconciled.push(reconcile_project(&state, project).await);
    }
    Ok(Json(reconciled))
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Project name is required".to_string()));
    }
    if req.port == 0 {
        return Err(ApiError::BadRequest(
            "Port must be between 1 and 65535".to_string(),
        ));
    }

    // Pre-validate uniqueness for clean 409s before touching Docker or git.
    if state.store.name_exists(&req.name, "").await? {
        return Err(ApiError::Conflict(
            "A project with this name already exists".to_string(),
        ));
    }
    if state.store.port_exists(req.port, "").await? {
        return Err(ApiError::Conflict(
            "A project with this port already exists".to_string(),
        ));
    }

    if !req.git_repo_url.is_empty() {
        gitops::validate_repo_url(&req.git_repo_url)
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        let token = state.github_pat().await;
        state
            .git
            .check_repo_accessible(&req.git_repo_url, &token)
            .await
            .map_err(|e| ApiError::BadRequest(format!("Repository not accessible: {}", e)))?;
    }

    let project = Project {
        id: uuid::Uuid::new_v4().to_string(),
        name: req.name,
        description: req.description,
        odoo_version: req.odoo_version,
        postgres_version: req.postgres_version,
        port: req.port,
        status: ProjectStatus::Creating,
        git_repo_branch: if req.git_repo_url.is_empty() {
            String::new()
        } else {
            req.git_repo_branch
        },
        git_repo_url: req.git_repo_url,
        enterprise_enabled: req.enterprise_enabled,
        design_themes_enabled: req.design_themes_enabled,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };

    let project = state.store.create(project).await?;
    state.events.publish(Event::project_created(&project));

    // The card shows up immediately; containers come up in the background.
    lifecycle::spawn_create(state.clone(), project.id.clone());

    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = fetch_project(&state, &id).await?;
    Ok(Json(reconcile_project(&state, project).await))
}

async fn update_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut project = fetch_project(&state, &id).await?;

    if let Some(name) = req.name {
        if name.trim().is_empty() {
            return Err(ApiError::BadRequest("Project name is required".to_string()));
        }
        if state.store.name_exists(&name, &id).await? {
            return Err(ApiError::Conflict(
                "A project with this name already exists".to_string(),
            ));
        }
        project.name = name;
    }
    if let Some(port) = req.port {
        if port == 0 {
            return Err(ApiError::BadRequest(
                "Port must be between 1 and 65535".to_string(),
            ));
        }
        if state.store.port_exists(port, &id).await? {
            return Err(ApiError::Conflict(
                "A project with this port already exists".to_string(),
            ));
        }
        project.port = port;
    }
    if let Some(description) = req.description {
        project.description = description;
    }
    if let Some(odoo_version) = req.odoo_version {
        project.odoo_version = odoo_version;
    }
    if let Some(postgres_version) = req.postgres_version {
        project.postgres_version = postgres_version;
    }

    let saved = state.store.update(project).await?;
    Ok(Json(saved))
}

async fn delete_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = fetch_project(&state, &id).await?;
    if project.status.is_transient() {
        return Err(ApiError::Conflict(
            "Another operation is in progress".to_string(),
        ));
    }

    let saved = begin_transition(&state, project, ProjectStatus::Deleting, "deleting").await?;

    // Docker stop + remove may take longer than any sane request timeout.
    lifecycle::spawn_delete(state.clone(), saved.clone());

    Ok((StatusCode::ACCEPTED, Json(saved)))
}

async fn start_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let project = fetch_project(&state, &id).await?;
    require_docker(&state)?;

    let project = reconcile_project(&state, project).await;
    if project.status.is_transient() {
        return Err(ApiError::Conflict(
            "Another operation is in progress".to_string(),
        ));
    }
    if project.status == ProjectStatus::Running {
        // Already in the target state; broadcast to heal stale clients.
        state.events.publish(Event::status_changed(&project));
        return Ok(Json(project).into_response());
    }

    let saved = begin_transition(&state, project, ProjectStatus::Starting, "starting").await?;
    lifecycle::spawn_start(state.clone(), saved.id.clone());

    Ok((StatusCode::ACCEPTED, Json(saved)).into_response())
}

async fn stop_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let project = fetch_project(&state, &id).await?;
    require_docker(&state)?;

    let project = reconcile_project(&state, project).await;
    if project.status.is_transient() {
        return Err(ApiError::Conflict(
            "Another operation is in progress".to_string(),
        ));
    }
    if project.status == ProjectStatus::Stopped {
        state.events.publish(Event::status_changed(&project));
        return Ok(Json(project).into_response());
    }

    let saved = begin_transition(&state, project, ProjectStatus::Stopping, "stopping").await?;
    lifecycle::spawn_stop(state.clone(), saved.id.clone());

    Ok((StatusCode::ACCEPTED, Json(saved)).into_response())
}

async fn list_databases(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = fetch_project(&state, &id).await?;
    let docker = require_docker(&state)?;

    let project = reconcile_project(&state, project).await;
    if project.status != ProjectStatus::Running {
        return Err(ApiError::Conflict(
            "Project must be running to list databases".to_string(),
        ));
    }

    let databases = docker.list_databases(&id).await?;
    Ok(Json(databases))
}

async fn download_backup(
    State(state): State<SharedState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    // The filename came out of our own SSE complete event; reject anything
    // that could walk out of the backups directory.
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return Err(ApiError::BadRequest("Invalid filename".to_string()));
    }

    let path = state.config.backups_dir().join(&filename);
    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|_| ApiError::NotFound("Backup file not found".to_string()))?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to open backup file: {}", e)))?;

    // Backups are transient: stream the bytes out, then delete. The guard
    // removes the file even when the client disconnects mid-download.
    let guard = RemoveOnDrop(path);
    let stream = tokio_util::io::ReaderStream::new(file).map(move |chunk| {
        let _hold = &guard;
        chunk
    });

    let response = Response::builder()
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .header(header::CONTENT_LENGTH, metadata.len())
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(response)
}

struct RemoveOnDrop(std::path::PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

// ── Config & repo handlers ────────────────────────────────────────────

async fn get_project_config(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    fetch_project(&state, &id).await?;
    let content = odoo_conf::read_config(&state.config, &id)
        .map_err(|e| ApiError::Internal(format!("Failed to read odoo.conf: {:#}", e)))?;
    Ok(Json(serde_json::json!({"content": content})))
}

async fn put_project_config(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ConfigContentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    fetch_project(&state, &id).await?;
    odoo_conf::write_config(&state.config, &id, &req.content)
        .map_err(|e| ApiError::Internal(format!("Failed to write odoo.conf: {:#}", e)))?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn update_repo(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateRepoRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut project = fetch_project(&state, &id).await?;

    let previous_url = project.git_repo_url.clone();
    let previous_branch = project.git_repo_branch.clone();
    let previous_enterprise = project.enterprise_enabled;
    let previous_design_themes = project.design_themes_enabled;

    if let Some(enabled) = req.enterprise_enabled {
        project.enterprise_enabled = enabled;
    }
    if let Some(enabled) = req.design_themes_enabled {
        project.design_themes_enabled = enabled;
    }

    if req.git_repo_url.is_empty() {
        project.git_repo_url = String::new();
        project.git_repo_branch = String::new();
    } else {
        gitops::validate_repo_url(&req.git_repo_url)
            .map_err(|e| ApiError::Unprocessable(e.to_string()))?;
        let token = state.github_pat().await;
        state
            .git
            .check_repo_accessible(&req.git_repo_url, &token)
            .await
            .map_err(|e| {
                ApiError::Unprocessable(format!("Repository not accessible: {}", e))
            })?;
        project.git_repo_url = req.git_repo_url.clone();
        project.git_repo_branch = req.git_repo_branch.clone();
    }

    let project = state.store.update(project).await?;

    let url_changed = previous_url != project.git_repo_url;
    let branch_changed = previous_branch != project.git_repo_branch;
    let enterprise_changed = previous_enterprise != project.enterprise_enabled;
    let design_themes_changed = previous_design_themes != project.design_themes_enabled;

    if url_changed || branch_changed || enterprise_changed || design_themes_changed {
        // Clone removal first so the rebuilt mount set starts clean.
        if url_changed && !previous_url.is_empty() {
            let _ = state.git.remove_repo(&id);
        }
        if enterprise_changed && !project.enterprise_enabled {
            let _ = state.git.remove_enterprise_repo(&id);
        }
        if design_themes_changed && !project.design_themes_enabled {
            let _ = state.git.remove_design_themes_repo(&id);
        }

        if let Some(docker) = state.docker() {
            let mounts = lifecycle::resolve_mounts(&state, &project).await;
            if let Err(e) = docker
                .recreate_odoo_container(
                    &project,
                    &state.config.project_config_dir(&id),
                    &mounts,
                )
                .await
            {
                warn!(project_id = %id, "failed to recreate container after repo change: {:#}", e);
            }

            // Keep addons_path honest for every toggled mount.
            let had_repo = !previous_url.is_empty();
            let has_repo = !project.git_repo_url.is_empty();
            if had_repo != has_repo
                && let Err(e) = odoo_conf::update_addons_path(
                    &state.config,
                    &id,
                    crate::docker::compose::ADDONS_MOUNT,
                    has_repo,
                )
            {
                warn!(project_id = %id, "failed to update addons_path: {:#}", e);
            }
            if enterprise_changed
                && let Err(e) = odoo_conf::update_addons_path(
                    &state.config,
                    &id,
                    crate::docker::compose::ENTERPRISE_MOUNT,
                    project.enterprise_enabled,
                )
            {
                warn!(project_id = %id, "failed to update addons_path: {:#}", e);
            }
            if design_themes_changed
                && let Err(e) = odoo_conf::update_addons_path(
                    &state.config,
                    &id,
                    crate::docker::compose::DESIGN_THEMES_MOUNT,
                    project.design_themes_enabled,
                )
            {
                warn!(project_id = %id, "failed to update addons_path: {:#}", e);
            }
        }
    }

    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn update_odoo(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = fetch_project(&state, &id).await?;
    require_docker(&state)?;
    if project.status.is_transient() {
        return Err(ApiError::Conflict(
            "Another operation is in progress".to_string(),
        ));
    }

    let saved = begin_transition(&state, project, ProjectStatus::Updating, "updating").await?;
    lifecycle::spawn_update_odoo(state.clone(), saved.id.clone());

    Ok((StatusCode::ACCEPTED, Json(saved)))
}

async fn update_repos(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = fetch_project(&state, &id).await?;
    if project.git_repo_url.is_empty() {
        return Err(ApiError::BadRequest("No repository configured".to_string()));
    }
    require_docker(&state)?;
    if project.status.is_transient() {
        return Err(ApiError::Conflict(
            "Another operation is in progress".to_string(),
        ));
    }

    let saved =
        begin_transition(&state, project, ProjectStatus::UpdatingRepo, "updating-repo").await?;
    lifecycle::spawn_update_repos(state.clone(), saved.id.clone());

    Ok((StatusCode::ACCEPTED, Json(saved)))
}

async fn restart_odoo(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = fetch_project(&state, &id).await?;
    require_docker(&state)?;

    lifecycle::spawn_restart(state.clone(), project.id.clone());

    Ok((StatusCode::ACCEPTED, Json(project)))
}

// ── Git & settings handlers ───────────────────────────────────────────

#[derive(Deserialize)]
pub struct BranchesQuery {
    pub url: Option<String>,
}

async fn repo_branches(
    State(state): State<SharedState>,
    Query(query): Query<BranchesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let url = query
        .url
        .ok_or_else(|| ApiError::BadRequest("Missing url parameter".to_string()))?;

    gitops::validate_repo_url(&url).map_err(|e| ApiError::Unprocessable(e.to_string()))?;

    let token = state.github_pat().await;
    let branches = state
        .git
        .list_branches(&url, &token)
        .await
        .map_err(|e| ApiError::Unprocessable(format!("Failed to list branches: {}", e)))?;

    Ok(Json(branches))
}

async fn check_access(state: &SharedState, repo: &str) -> Json<serde_json::Value> {
    let token = state.github_pat().await;
    if token.is_empty() {
        return Json(serde_json::json!({
            "accessible": false,
            "error": "No GitHub PAT token configured. Set one in Configuration.",
        }));
    }

    let result = match repo {
        "enterprise" => state.git.check_enterprise_access(&token).await,
        _ => state.git.check_design_themes_access(&token).await,
    };
    match result {
        Ok(()) => Json(serde_json::json!({"accessible": true})),
        Err(_) => Json(serde_json::json!({
            "accessible": false,
            "error": format!(
                "Your PAT token does not have access to the Odoo {} repository.",
                if repo == "enterprise" { "Enterprise" } else { "Design Themes" }
            ),
        })),
    }
}

async fn enterprise_check_access(State(state): State<SharedState>) -> impl IntoResponse {
    check_access(&state, "enterprise").await
}

async fn design_themes_check_access(State(state): State<SharedState>) -> impl IntoResponse {
    check_access(&state, "design-themes").await
}

/// Mask a PAT for display: enough to recognise, never enough to use.
fn mask_token(token: &str) -> String {
    if token.is_empty() {
        String::new()
    } else if token.len() > 8 {
        format!("{}...{}", &token[..4], &token[token.len() - 4..])
    } else {
        "****".to_string()
    }
}

async fn get_settings(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let pat = state.github_pat().await;
    let valid = state.store.get_setting("github_pat_valid").await?;
    Ok(Json(serde_json::json!({
        "github_pat": mask_token(&pat),
        "github_pat_valid": valid,
        "git_available": state.git.is_available(),
    })))
}

async fn put_settings(
    State(state): State<SharedState>,
    Json(req): Json<SettingsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.set_setting("github_pat", &req.github_pat).await?;

    // Re-validate the new token and record the result.
    let validity = if req.github_pat.is_empty() {
        ""
    } else if gitops::validate_token(&req.github_pat).await.is_ok() {
        "true"
    } else {
        "false"
    };
    state.store.set_setting("github_pat_valid", validity).await?;

    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn validate_token(
    State(state): State<SharedState>,
    Json(req): Json<ValidateTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let token = if req.token.is_empty() {
        state.github_pat().await
    } else {
        req.token
    };
    if token.is_empty() {
        return Err(ApiError::BadRequest("No token provided".to_string()));
    }

    match gitops::validate_token(&token).await {
        Ok(()) => Ok(Json(serde_json::json!({"status": "valid"}))),
        Err(e @ (GitError::TokenInvalid | GitError::TokenUnreachable(_))) => {
            Err(ApiError::Unprocessable(e.to_string()))
        }
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

// ── Maintenance handlers ──────────────────────────────────────────────

async fn known_project_ids(state: &SharedState) -> Result<HashSet<String>, ApiError> {
    Ok(state
        .store
        .list()
        .await?
        .into_iter()
        .map(|p| p.id)
        .collect())
}

async fn preview_orphans(state: SharedState, kind: &str) -> Result<Response, ApiError> {
    let docker = require_docker(&state)?;
    let known = known_project_ids(&state).await?;
    let items = match kind {
        "containers" => docker.list_orphaned_containers(&known).await?,
        "volumes" => docker.list_orphaned_volumes(&known).await?,
        _ => docker.list_orphaned_images(&known).await?,
    };
    Ok(Json(serde_json::json!({"items": items})).into_response())
}

async fn preview_containers(State(state): State<SharedState>) -> Result<Response, ApiError> {
    preview_orphans(state, "containers").await
}

async fn preview_volumes(State(state): State<SharedState>) -> Result<Response, ApiError> {
    preview_orphans(state, "volumes").await
}

async fn preview_images(State(state): State<SharedState>) -> Result<Response, ApiError> {
    preview_orphans(state, "images").await
}

async fn clean_orphans(state: SharedState, kind: &str) -> Result<Response, ApiError> {
    let docker = require_docker(&state)?;
    let known = known_project_ids(&state).await?;
    let result = match kind {
        "containers" => docker.clean_orphaned_containers(&known).await?,
        "volumes" => docker.clean_orphaned_volumes(&known).await?,
        _ => docker.clean_orphaned_images(&known).await?,
    };
    Ok(Json(result).into_response())
}

async fn clean_containers(State(state): State<SharedState>) -> Result<Response, ApiError> {
    clean_orphans(state, "containers").await
}

async fn clean_volumes(State(state): State<SharedState>) -> Result<Response, ApiError> {
    clean_orphans(state, "volumes").await
}

async fn clean_images(State(state): State<SharedState>) -> Result<Response, ApiError> {
    clean_orphans(state, "images").await
}

// ── Audit handlers ────────────────────────────────────────────────────

async fn audit_logs(
    State(state): State<SharedState>,
    Query(query): Query<AuditQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 500);

    let audit = state.audit.clone();
    let (lines, offset) = tokio::task::spawn_blocking(move || match query.before {
        None => audit.tail(limit).map(|lines| {
            let offset = lines.len();
            (lines, offset)
        }),
        Some(0) => Ok((Vec::new(), 0)),
        Some(before) => audit.tail_before(limit, before),
    })
    .await
    .map_err(|e| ApiError::Internal(format!("audit read panicked: {}", e)))?
    .map_err(|e| ApiError::Internal(format!("Failed to read audit log: {:#}", e)))?;

    Ok(Json(serde_json::json!({"lines": lines, "offset": offset})))
}

// ── Validation helpers shared with sse.rs ─────────────────────────────

/// Default and validate the `db` query parameter for backups.
pub(crate) fn backup_database_name(raw: Option<String>) -> Result<String, ApiError> {
    let name = raw.unwrap_or_else(|| "postgres".to_string());
    if !is_safe_database_name(&name) {
        return Err(ApiError::BadRequest("Invalid database name".to_string()));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token(""), "");
        assert_eq!(mask_token("short"), "****");
        assert_eq!(mask_token("ghp_abcdefgh1234"), "ghp_...1234");
    }

    #[test]
    fn test_should_audit() {
        assert!(should_audit("/api/projects"));
        assert!(should_audit("/api/projects/abc/start"));
        assert!(should_audit("/api/settings"));
        assert!(should_audit("/api/maintenance/clean-containers"));

        assert!(!should_audit("/api/events"));
        assert!(!should_audit("/api/audit/logs"));
        assert!(!should_audit("/api/audit/stream"));
        assert!(!should_audit("/api/maintenance/preview-volumes"));
        assert!(!should_audit("/api/repo/branches"));
        assert!(!should_audit("/api/enterprise/check-access"));
        assert!(!should_audit("/health"));
    }

    #[test]
    fn test_backup_database_name() {
        assert_eq!(backup_database_name(None).unwrap(), "postgres");
        assert_eq!(
            backup_database_name(Some("mydb".to_string())).unwrap(),
            "mydb"
        );
        assert!(backup_database_name(Some("bad name".to_string())).is_err());
        assert!(backup_database_name(Some("x;y".to_string())).is_err());
    }
}
