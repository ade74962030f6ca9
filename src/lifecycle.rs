//! Background lifecycle tasks and the Docker daemon health monitor.
//!
//! Every user action finishes its synchronous HTTP phase (validation, store
//! write, pending event, 202) and hands the rest to a task spawned here.
//! Tasks follow one contract: re-read the project, do the Docker/git work
//! under their own deadlines, then persist the terminal status and publish
//! `project_status_changed`. A failing or panicking task never leaves a
//! project stuck in a transient status; the supervisor converts both into
//! the error path.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::api::SharedState;
use crate::docker::{DockerManager, MountSet, odoo_conf};
use crate::events::Event;
use crate::store::{Project, ProjectStatus};

/// Deadline for git-bound phases; addon repos can be multi-gigabyte.
const GIT_PHASE_TIMEOUT: Duration = Duration::from_secs(600);

/// Health poll cadence while the daemon is reachable.
const HEALTH_INTERVAL_UP: Duration = Duration::from_secs(10);
/// Faster cadence while it is down, so recovery shows quickly.
const HEALTH_INTERVAL_DOWN: Duration = Duration::from_secs(5);

// ── Task supervision ──────────────────────────────────────────────────

/// Run a lifecycle task under supervision: any error or panic is logged and
/// converted into `status = error` plus a status-changed broadcast.
fn spawn_supervised<F>(state: SharedState, project_id: String, task: &'static str, fut: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let failed = match tokio::spawn(fut).await {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                error!(project_id = %project_id, "{} task failed: {:#}", task, e);
                true
            }
            Err(join_err) => {
                error!(project_id = %project_id, "{} task panicked: {}", task, join_err);
                true
            }
        };
        if failed {
            mark_error(&state, &project_id).await;
        }
    });
}

async fn mark_error(state: &SharedState, project_id: &str) {
    match state.store.get(project_id).await {
        Ok(Some(mut project)) => {
            project.status = ProjectStatus::Error;
            match state.store.update(project).await {
                Ok(saved) => state.events.publish(Event::status_changed(&saved)),
                Err(e) => error!(%project_id, "failed to persist error status: {}", e),
            }
        }
        Ok(None) => {}
        Err(e) => error!(%project_id, "failed to load project for error status: {}", e),
    }
}

/// Persist a terminal status and broadcast the fresh snapshot. The project
/// is re-read so edits made while the task ran are not clobbered.
async fn finish(state: &SharedState, project_id: &str, status: ProjectStatus) -> Result<()> {
    let Some(mut project) = state.store.get(project_id).await? else {
        return Ok(());
    };
    project.status = status;
    let saved = state.store.update(project).await?;
    state.events.publish(Event::status_changed(&saved));
    Ok(())
}

// ── Mount resolution ──────────────────────────────────────────────────

/// Clone or pull every repo the project is configured with and return the
/// host directories for the bind mounts. An individual failure logs a
/// warning and yields an empty mount; the containers still come up when,
/// say, Enterprise auth is temporarily broken.
pub(crate) async fn resolve_mounts(state: &SharedState, project: &Project) -> MountSet {
    let token = state.github_pat().await;
    let mut mounts = MountSet::default();

    if !project.git_repo_url.is_empty() {
        match tokio::time::timeout(
            GIT_PHASE_TIMEOUT,
            state.git.clone_or_pull(
                &project.id,
                &project.git_repo_url,
                &token,
                &project.git_repo_branch,
            ),
        )
        .await
        {
            Ok(Ok(dir)) => mounts.addons = Some(dir),
            Ok(Err(e)) => warn!(project_id = %project.id, "addons clone/pull failed: {}", e),
            Err(_) => warn!(project_id = %project.id, "addons clone/pull timed out"),
        }
    }

    if project.enterprise_enabled {
        match tokio::time::timeout(
            GIT_PHASE_TIMEOUT,
            state
                .git
                .clone_or_pull_enterprise(&project.id, &token, &project.odoo_version),
        )
        .await
        {
            Ok(Ok(dir)) => mounts.enterprise = Some(dir),
            Ok(Err(e)) => warn!(project_id = %project.id, "enterprise clone/pull failed: {}", e),
            Err(_) => warn!(project_id = %project.id, "enterprise clone/pull timed out"),
        }
    }

    if project.design_themes_enabled {
        match tokio::time::timeout(
            GIT_PHASE_TIMEOUT,
            state
                .git
                .clone_or_pull_design_themes(&project.id, &token, &project.odoo_version),
        )
        .await
        {
            Ok(Ok(dir)) => mounts.design_themes = Some(dir),
            Ok(Err(e)) => {
                warn!(project_id = %project.id, "design-themes clone/pull failed: {}", e)
            }
            Err(_) => warn!(project_id = %project.id, "design-themes clone/pull timed out"),
        }
    }

    mounts
}

// ── Lifecycle tasks ───────────────────────────────────────────────────

pub fn spawn_create(state: SharedState, project_id: String) {
    spawn_supervised(
        state.clone(),
        project_id.clone(),
        "create",
        run_create(state, project_id),
    );
}

async fn run_create(state: SharedState, project_id: String) -> Result<()> {
    let Some(project) = state.store.get(&project_id).await? else {
        warn!(%project_id, "project vanished before container creation");
        return Ok(());
    };

    state
        .events
        .publish(Event::action_pending(&project_id, "creating"));

    let docker = state.docker().context("Docker daemon not available")?;

    info!(%project_id, "resolving addons host directories");
    let mounts = resolve_mounts(&state, &project).await;

    odoo_conf::ensure_default_config(&state.config, &project_id, &mounts)?;

    info!(%project_id, "creating Docker containers");
    docker
        .create_project(
            &project,
            &state.config.project_config_dir(&project_id),
            &mounts,
        )
        .await?;

    finish(&state, &project_id, ProjectStatus::Stopped).await?;
    info!(%project_id, "containers created");
    Ok(())
}

pub fn spawn_start(state: SharedState, project_id: String) {
    spawn_supervised(
        state.clone(),
        project_id.clone(),
        "start",
        run_start(state, project_id),
    );
}

async fn run_start(state: SharedState, project_id: String) -> Result<()> {
    let Some(project) = state.store.get(&project_id).await? else {
        warn!(%project_id, "project vanished before start");
        return Ok(());
    };
    let docker = state.docker().context("Docker daemon not available")?;

    let mounts = resolve_mounts(&state, &project).await;
    docker
        .start_project(
            &project,
            &state.config.project_config_dir(&project_id),
            &mounts,
        )
        .await?;

    finish(&state, &project_id, ProjectStatus::Running).await
}

pub fn spawn_stop(state: SharedState, project_id: String) {
    spawn_supervised(
        state.clone(),
        project_id.clone(),
        "stop",
        run_stop(state, project_id),
    );
}

async fn run_stop(state: SharedState, project_id: String) -> Result<()> {
    let docker = state.docker().context("Docker daemon not available")?;
    docker.stop_project(&project_id).await?;
    finish(&state, &project_id, ProjectStatus::Stopped).await
}

pub fn spawn_delete(state: SharedState, project: Project) {
    spawn_supervised(
        state.clone(),
        project.id.clone(),
        "delete",
        run_delete(state, project),
    );
}

async fn run_delete(state: SharedState, project: Project) -> Result<()> {
    // Container and clone removal is best-effort: a half-broken Docker
    // state must never leave an undeletable project behind.
    if let Some(docker) = state.docker()
        && let Err(e) = docker
            .remove_project(&project.id, &state.config.project_config_dir(&project.id))
            .await
    {
        warn!(project_id = %project.id, "failed to remove containers: {:#}", e);
    }

    if !project.git_repo_url.is_empty()
        && let Err(e) = state.git.remove_repo(&project.id)
    {
        warn!(project_id = %project.id, "failed to remove git repo: {:#}", e);
    }
    if project.enterprise_enabled
        && let Err(e) = state.git.remove_enterprise_repo(&project.id)
    {
        warn!(project_id = %project.id, "failed to remove enterprise repo: {:#}", e);
    }
    if project.design_themes_enabled
        && let Err(e) = state.git.remove_design_themes_repo(&project.id)
    {
        warn!(project_id = %project.id, "failed to remove design-themes repo: {:#}", e);
    }

    state.store.delete(&project.id).await?;
    state.events.publish(Event::project_deleted(&project.id));
    info!(project_id = %project.id, "project deleted");
    Ok(())
}

pub fn spawn_update_odoo(state: SharedState, project_id: String) {
    spawn_supervised(
        state.clone(),
        project_id.clone(),
        "update-odoo",
        run_update_odoo(state, project_id),
    );
}

async fn run_update_odoo(state: SharedState, project_id: String) -> Result<()> {
    let Some(project) = state.store.get(&project_id).await? else {
        warn!(%project_id, "project vanished before update");
        return Ok(());
    };
    let docker = state.docker().context("Docker daemon not available")?;

    let mounts = resolve_mounts(&state, &project).await;

    info!(%project_id, "pulling latest Odoo image and recreating container");
    docker
        .update_odoo_container(
            &project,
            &state.config.project_config_dir(&project_id),
            &mounts,
        )
        .await?;

    let status = docker.get_project_status(&project_id).await;
    finish(&state, &project_id, status).await?;
    info!(%project_id, %status, "Odoo update complete");
    Ok(())
}

pub fn spawn_update_repos(state: SharedState, project_id: String) {
    spawn_supervised(
        state.clone(),
        project_id.clone(),
        "update-repo",
        run_update_repos(state, project_id),
    );
}

async fn run_update_repos(state: SharedState, project_id: String) -> Result<()> {
    let Some(project) = state.store.get(&project_id).await? else {
        warn!(%project_id, "project vanished before repo update");
        return Ok(());
    };
    let docker = state.docker().context("Docker daemon not available")?;

    let mounts = resolve_mounts(&state, &project).await;
    if mounts.addons.is_none() {
        // The primary repo pull failed; report the live status and bail out
        // without touching the container.
        warn!(%project_id, "repo pull failed, skipping restart");
        let status = docker.get_project_status(&project_id).await;
        return finish(&state, &project_id, status).await;
    }

    // With dev=all / dev=reload Odoo picks up code changes itself.
    let needs_restart = match odoo_conf::read_config(&state.config, &project_id) {
        Ok(content) => {
            let dev_reload = odoo_conf::dev_reload_enabled(&content);
            if dev_reload {
                info!(%project_id, "dev mode detected, skipping restart");
            }
            !dev_reload
        }
        Err(_) => true,
    };

    if needs_restart {
        info!(%project_id, "restarting Odoo container after code update");
        if let Err(e) = docker.restart_odoo_container(&project_id).await {
            warn!(%project_id, "restart failed: {:#}", e);
        }
    }

    let status = docker.get_project_status(&project_id).await;
    finish(&state, &project_id, status).await?;
    info!(%project_id, %status, restarted = needs_restart, "repo update complete");
    Ok(())
}

pub fn spawn_restart(state: SharedState, project_id: String) {
    spawn_supervised(
        state.clone(),
        project_id.clone(),
        "restart-odoo",
        run_restart(state, project_id),
    );
}

async fn run_restart(state: SharedState, project_id: String) -> Result<()> {
    let docker = state.docker().context("Docker daemon not available")?;

    if let Err(e) = docker.restart_odoo_container(&project_id).await {
        warn!(%project_id, "restart failed: {:#}", e);
    }

    let status = docker.get_project_status(&project_id).await;
    finish(&state, &project_id, status).await
}

// ── Docker daemon health monitor ──────────────────────────────────────

/// Poll the daemon forever, publishing `docker_status` on transitions. When
/// no client exists yet (daemon was down at start) a new one is constructed
/// on each tick until it answers.
pub async fn docker_health_loop(state: SharedState) {
    loop {
        let interval = if state.docker_up() {
            HEALTH_INTERVAL_UP
        } else {
            HEALTH_INTERVAL_DOWN
        };
        tokio::time::sleep(interval).await;

        let is_up = match state.docker() {
            Some(manager) => manager.ping().await,
            None => match DockerManager::connect() {
                Ok(manager) => {
                    if manager.ping().await {
                        state.install_docker_manager(manager);
                        true
                    } else {
                        false
                    }
                }
                Err(_) => false,
            },
        };

        if state.set_docker_up(is_up) {
            if is_up {
                info!("Docker daemon is reachable again");
            } else {
                warn!("Docker daemon is unreachable");
            }
            state.events.publish(Event::docker_status(is_up));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AppState;
    use crate::audit::AuditLog;
    use crate::config::Config;
    use crate::events::EventHub;
    use crate::gitops::GitOps;
    use crate::store::{ProjectStore, StoreHandle};
    use std::sync::Arc;

    fn test_state(dir: &tempfile::TempDir) -> SharedState {
        let config = Config {
            port: 8080,
            data_dir: dir.path().to_path_buf(),
        };
        let store = StoreHandle::new(ProjectStore::open_in_memory().unwrap());
        let audit = AuditLog::open(&config.audit_log_path()).unwrap();
        let git = GitOps::with_exe(config.clone(), None);
        Arc::new(AppState::new(
            config,
            store,
            EventHub::new(),
            audit,
            git,
            "test".to_string(),
            None,
            false,
        ))
    }

    fn sample_project(status: ProjectStatus) -> Project {
        Project {
            id: uuid::Uuid::new_v4().to_string(),
            name: "demo".to_string(),
            description: String::new(),
            odoo_version: "18.0".to_string(),
            postgres_version: "16".to_string(),
            port: 8070,
            status,
            git_repo_url: String::new(),
            git_repo_branch: String::new(),
            enterprise_enabled: false,
            design_themes_enabled: false,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_failed_task_marks_project_error_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let project = state
            .store
            .create(sample_project(ProjectStatus::Starting))
            .await
            .unwrap();
        let mut sub = state.events.subscribe();

        spawn_supervised(state.clone(), project.id.clone(), "test", async {
            anyhow::bail!("boom")
        });

        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("hub closed");
        assert_eq!(
            event.event_type,
            crate::events::EventType::ProjectStatusChanged
        );
        assert_eq!(event.project_id, project.id);

        let stored = state.store.get(&project.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ProjectStatus::Error);
    }

    #[tokio::test]
    async fn test_panicking_task_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let project = state
            .store
            .create(sample_project(ProjectStatus::Creating))
            .await
            .unwrap();
        let mut sub = state.events.subscribe();

        spawn_supervised(state.clone(), project.id.clone(), "test", async {
            panic!("deliberate panic")
        });

        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("hub closed");
        assert_eq!(event.project_id, project.id);

        let stored = state.store.get(&project.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ProjectStatus::Error);
    }

    #[tokio::test]
    async fn test_run_create_without_docker_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let project = state
            .store
            .create(sample_project(ProjectStatus::Creating))
            .await
            .unwrap();

        let result = run_create(state.clone(), project.id.clone()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_resolve_mounts_without_git_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let mut project = sample_project(ProjectStatus::Stopped);
        project.git_repo_url = "https://example.com/repo.git".to_string();
        project.enterprise_enabled = true;

        // git is unavailable in the test state: every mount resolves empty
        // rather than failing the caller.
        let mounts = resolve_mounts(&state, &project).await;
        assert!(mounts.addons.is_none());
        assert!(mounts.enterprise.is_none());
        assert!(mounts.design_themes.is_none());
    }

    #[tokio::test]
    async fn test_finish_skips_vanished_project() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        finish(&state, "no-such-id", ProjectStatus::Stopped)
            .await
            .unwrap();
    }
}
