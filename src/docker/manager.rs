//! Container lifecycle against the Docker daemon.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use bollard::Docker;
use bollard::container::{
    CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::MountPoint;
use futures_util::StreamExt;
use tracing::{info, warn};

use crate::docker::compose::{
    MountSet, odoo_container_config, odoo_container_name, odoo_image, postgres_container_config,
    postgres_container_name, postgres_image,
};
use crate::store::{Project, ProjectStatus};

/// Grace period for container stop/restart.
const STOP_TIMEOUT_SECS: i64 = 30;

/// Daemon ping timeout.
const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Cloneable handle to the Docker daemon.
#[derive(Clone)]
pub struct DockerManager {
    pub(crate) docker: Docker,
}

pub(crate) fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// The engine answers 304 when a start/stop is already satisfied.
fn is_not_modified(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

/// Anonymous volume mounted at /var/lib/odoo, if the container has one.
fn data_volume_name(mounts: &[MountPoint]) -> Option<String> {
    mounts
        .iter()
        .find(|m| m.destination.as_deref() == Some("/var/lib/odoo"))
        .and_then(|m| m.name.clone())
}

impl DockerManager {
    /// Connect using the client's standard socket discovery. The connection
    /// is lazy; use [`DockerManager::ping`] to learn whether the daemon is
    /// actually reachable.
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_socket_defaults().context("failed to create Docker client")?;
        Ok(Self { docker })
    }

    /// Whether the daemon answers within the ping timeout.
    pub async fn ping(&self) -> bool {
        matches!(
            tokio::time::timeout(PING_TIMEOUT, self.docker.ping()).await,
            Ok(Ok(_))
        )
    }

    pub(crate) async fn container_exists(&self, name: &str) -> bool {
        self.docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .is_ok()
    }

    /// Pull an image and drain the progress stream so the pull completes.
    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("pulling image {}", image);
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions::<String> {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(item) = stream.next().await {
            item.with_context(|| format!("failed to pull image {}", image))?;
        }
        Ok(())
    }

    async fn pull_image_if_missing(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        self.pull_image(image).await
    }

    /// Start a container; already-running is success.
    async fn start_container(&self, name: &str) -> Result<()> {
        match self
            .docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to start container {}", name)),
        }
    }

    /// Stop with the standard grace period; missing or already-stopped
    /// containers are success.
    async fn stop_container(&self, name: &str) -> Result<()> {
        match self
            .docker
            .stop_container(
                name,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECS,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) || is_not_modified(&e) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to stop container {}", name)),
        }
    }

    /// Force-remove; missing container is success.
    async fn remove_container(&self, name: &str) -> Result<()> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove container {}", name)),
        }
    }

    async fn ensure_postgres_created(&self, project: &Project) -> Result<()> {
        let name = postgres_container_name(&project.id);
        if self.container_exists(&name).await {
            return Ok(());
        }
        self.pull_image(&postgres_image(project))
            .await
            .context("failed to pull postgres image")?;
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                postgres_container_config(project),
            )
            .await
            .context("failed to create postgres container")?;
        Ok(())
    }

    async fn ensure_odoo_created(
        &self,
        project: &Project,
        config_dir: &Path,
        mounts: &MountSet,
    ) -> Result<()> {
        let name = odoo_container_name(&project.id);
        if self.container_exists(&name).await {
            return Ok(());
        }
        self.pull_image(&odoo_image(project))
            .await
            .context("failed to pull odoo image")?;
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                odoo_container_config(project, config_dir, mounts, &[]),
            )
            .await
            .context("failed to create odoo container")?;
        Ok(())
    }

    /// Pull images and create both containers without starting them.
    pub async fn create_project(
        &self,
        project: &Project,
        config_dir: &Path,
        mounts: &MountSet,
    ) -> Result<()> {
        self.ensure_postgres_created(project).await?;
        self.ensure_odoo_created(project, config_dir, mounts).await?;
        Ok(())
    }

    /// Create anything missing, then start postgres followed by odoo.
    pub async fn start_project(
        &self,
        project: &Project,
        config_dir: &Path,
        mounts: &MountSet,
    ) -> Result<()> {
        self.ensure_postgres_created(project).await?;
        self.start_container(&postgres_container_name(&project.id))
            .await?;

        self.ensure_odoo_created(project, config_dir, mounts).await?;
        self.start_container(&odoo_container_name(&project.id))
            .await?;
        Ok(())
    }

    /// Stop odoo then postgres. Both stops are attempted; the first error
    /// wins.
    pub async fn stop_project(&self, project_id: &str) -> Result<()> {
        let odoo = self.stop_container(&odoo_container_name(project_id)).await;
        let postgres = self
            .stop_container(&postgres_container_name(project_id))
            .await;
        odoo.and(postgres)
    }

    /// Best-effort stop, force-remove both containers, then drop the host
    /// config directory.
    pub async fn remove_project(&self, project_id: &str, config_dir: &Path) -> Result<()> {
        if let Err(e) = self.stop_project(project_id).await {
            warn!(project_id, "stop before removal failed: {:#}", e);
        }

        let odoo = self.remove_container(&odoo_container_name(project_id)).await;
        let postgres = self
            .remove_container(&postgres_container_name(project_id))
            .await;

        if config_dir.exists() {
            std::fs::remove_dir_all(config_dir)
                .with_context(|| format!("remove config dir {}", config_dir.display()))?;
        }

        odoo.and(postgres)
    }

    /// Replace the odoo container with one using the given mount set.
    /// Postgres and data volumes are untouched; running-ness is preserved.
    pub async fn recreate_odoo_container(
        &self,
        project: &Project,
        config_dir: &Path,
        mounts: &MountSet,
    ) -> Result<()> {
        let name = odoo_container_name(&project.id);

        let was_running = match self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => {
                let running = inspect
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                self.stop_container(&name).await?;
                self.remove_container(&name).await?;
                running
            }
            Err(e) if is_not_found(&e) => false,
            Err(e) => return Err(e).context("failed to inspect odoo container"),
        };

        self.pull_image_if_missing(&odoo_image(project)).await?;
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                odoo_container_config(project, config_dir, mounts, &[]),
            )
            .await
            .context("failed to recreate odoo container")?;

        if was_running {
            self.start_container(&postgres_container_name(&project.id))
                .await?;
            self.start_container(&name).await?;
        }
        Ok(())
    }

    /// Pull the latest image for the project's Odoo version and recreate the
    /// container, explicitly re-attaching the anonymous /var/lib/odoo data
    /// volume so filestore data survives the update.
    pub async fn update_odoo_container(
        &self,
        project: &Project,
        config_dir: &Path,
        mounts: &MountSet,
    ) -> Result<()> {
        let name = odoo_container_name(&project.id);

        self.pull_image(&odoo_image(project))
            .await
            .context("failed to pull odoo image")?;

        let (was_running, data_volume) = match self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => {
                let running = inspect
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                let volume = inspect.mounts.as_deref().and_then(data_volume_name);
                self.stop_container(&name).await?;
                self.remove_container(&name).await?;
                (running, volume)
            }
            Err(e) if is_not_found(&e) => (false, None),
            Err(e) => return Err(e).context("failed to inspect odoo container"),
        };

        let extra_binds: Vec<String> = data_volume
            .into_iter()
            .map(|v| format!("{}:/var/lib/odoo", v))
            .collect();

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                odoo_container_config(project, config_dir, mounts, &extra_binds),
            )
            .await
            .context("failed to create updated odoo container")?;

        if was_running {
            self.start_container(&postgres_container_name(&project.id))
                .await?;
            self.start_container(&name).await?;
        }
        Ok(())
    }

    /// Graceful restart of the odoo container only.
    pub async fn restart_odoo_container(&self, project_id: &str) -> Result<()> {
        let name = odoo_container_name(project_id);
        self.docker
            .restart_container(
                &name,
                Some(RestartContainerOptions {
                    t: STOP_TIMEOUT_SECS as isize,
                }),
            )
            .await
            .with_context(|| format!("failed to restart container {}", name))
    }

    /// Live status of the project's odoo container.
    pub async fn get_project_status(&self, project_id: &str) -> ProjectStatus {
        match self
            .docker
            .inspect_container(&odoo_container_name(project_id), None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => {
                if inspect
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false)
                {
                    ProjectStatus::Running
                } else {
                    ProjectStatus::Stopped
                }
            }
            Err(e) if is_not_found(&e) => ProjectStatus::Stopped,
            Err(_) => ProjectStatus::Error,
        }
    }

    /// The stored status may lag reality. Transient statuses are owned by a
    /// background task and pass through untouched; everything else is
    /// replaced with the daemon-observed status.
    pub async fn reconcile_status(&self, project: &Project) -> ProjectStatus {
        if project.status.is_transient() {
            return project.status;
        }
        self.get_project_status(&project.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(status_code: u16) -> bollard::errors::Error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: "test".to_string(),
        }
    }

    #[test]
    fn test_error_classification() {
        assert!(is_not_found(&server_error(404)));
        assert!(!is_not_found(&server_error(500)));
        assert!(is_not_modified(&server_error(304)));
        assert!(!is_not_modified(&server_error(404)));
    }

    #[test]
    fn test_data_volume_name() {
        let mounts = vec![
            MountPoint {
                name: Some("cfgvol".to_string()),
                destination: Some("/etc/odoo".to_string()),
                ..Default::default()
            },
            MountPoint {
                name: Some("a1b2c3".to_string()),
                destination: Some("/var/lib/odoo".to_string()),
                ..Default::default()
            },
        ];
        assert_eq!(data_volume_name(&mounts), Some("a1b2c3".to_string()));
        assert_eq!(data_volume_name(&mounts[..1]), None);
        assert_eq!(data_volume_name(&[]), None);
    }

    #[tokio::test]
    async fn test_connect_does_not_require_daemon() {
        // The client is lazy; constructing it must not panic even when no
        // daemon is present. Reachability is what ping() reports.
        if let Ok(manager) = DockerManager::connect() {
            let _ = manager.ping().await;
        }
    }

    #[tokio::test]
    async fn test_reconcile_preserves_transient_statuses() {
        let Ok(manager) = DockerManager::connect() else {
            return;
        };
        let mut project = crate::store::Project {
            id: "no-such-project".to_string(),
            name: "x".to_string(),
            description: String::new(),
            odoo_version: "18.0".to_string(),
            postgres_version: "16".to_string(),
            port: 18069,
            status: ProjectStatus::Creating,
            git_repo_url: String::new(),
            git_repo_branch: String::new(),
            enterprise_enabled: false,
            design_themes_enabled: false,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        for status in [
            ProjectStatus::Creating,
            ProjectStatus::Starting,
            ProjectStatus::Stopping,
            ProjectStatus::Deleting,
            ProjectStatus::Updating,
            ProjectStatus::UpdatingRepo,
        ] {
            project.status = status;
            assert_eq!(manager.reconcile_status(&project).await, status);
        }
    }
}
