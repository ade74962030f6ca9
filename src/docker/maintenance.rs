//! Orphaned-resource sweeps.
//!
//! A container is owned when it carries the managed label AND its project id
//! is still in the store. The sweeps never touch anything without
//! `odoo-manager.managed=true`, so they are safe on daemons shared with
//! unrelated workloads. Volumes and images count as orphaned when no owned
//! container references them.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use bollard::container::ListContainersOptions;
use bollard::image::{ListImagesOptions, RemoveImageOptions};
use bollard::models::{ContainerSummary, ImageSummary};
use bollard::volume::{ListVolumesOptions, RemoveVolumeOptions};
use bollard::container::{InspectContainerOptions, RemoveContainerOptions};
use serde::Serialize;

use crate::docker::compose::{LABEL_MANAGED, LABEL_PROJECT_ID};
use crate::docker::manager::DockerManager;

/// Outcome of a cleanup run. Slices are always present on the wire, never
/// null.
#[derive(Debug, Default, Serialize)]
pub struct CleanupResult {
    pub removed: Vec<String>,
    pub errors: Vec<String>,
}

/// Owned = managed label present AND project id known to the store.
fn is_owned(labels: Option<&HashMap<String, String>>, known_ids: &HashSet<String>) -> bool {
    let Some(labels) = labels else {
        return false;
    };
    if labels.get(LABEL_MANAGED).map(String::as_str) != Some("true") {
        return false;
    }
    labels
        .get(LABEL_PROJECT_ID)
        .map(|id| known_ids.contains(id))
        .unwrap_or(false)
}

fn container_display_name(c: &ContainerSummary) -> String {
    c.names
        .as_ref()
        .and_then(|names| names.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| {
            c.id.as_deref()
                .map(|id| id.chars().take(12).collect())
                .unwrap_or_default()
        })
}

fn image_display_name(img: &ImageSummary) -> String {
    img.repo_tags
        .first()
        .cloned()
        .unwrap_or_else(|| img.id.chars().take(19).collect())
}

impl DockerManager {
    /// Every container carrying the managed label, running or not.
    async fn managed_containers(&self) -> Result<Vec<ContainerSummary>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", LABEL_MANAGED)],
        )]);
        self.docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("failed to list containers")
    }

    /// Managed containers whose project no longer exists in the store.
    async fn orphaned_containers(
        &self,
        known_ids: &HashSet<String>,
    ) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .managed_containers()
            .await?
            .into_iter()
            .filter(|c| !is_owned(c.labels.as_ref(), known_ids))
            .collect())
    }

    pub async fn list_orphaned_containers(
        &self,
        known_ids: &HashSet<String>,
    ) -> Result<Vec<String>> {
        Ok(self
            .orphaned_containers(known_ids)
            .await?
            .iter()
            .map(container_display_name)
            .collect())
    }

    pub async fn clean_orphaned_containers(
        &self,
        known_ids: &HashSet<String>,
    ) -> Result<CleanupResult> {
        let mut result = CleanupResult::default();
        for c in self.orphaned_containers(known_ids).await? {
            let name = container_display_name(&c);
            let Some(id) = c.id.as_deref() else {
                continue;
            };
            match self
                .docker
                .remove_container(
                    id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => result.removed.push(name),
                Err(e) => result.errors.push(format!("{}: {}", name, e)),
            }
        }
        Ok(result)
    }

    /// Volume names mounted by containers whose project still exists.
    async fn owned_volume_names(&self, known_ids: &HashSet<String>) -> HashSet<String> {
        let mut owned = HashSet::new();
        let containers = match self.managed_containers().await {
            Ok(containers) => containers,
            Err(_) => return owned,
        };
        for c in containers {
            if !is_owned(c.labels.as_ref(), known_ids) {
                continue;
            }
            let Some(id) = c.id.as_deref() else {
                continue;
            };
            let Ok(inspect) = self
                .docker
                .inspect_container(id, None::<InspectContainerOptions>)
                .await
            else {
                continue;
            };
            for mount in inspect.mounts.unwrap_or_default() {
                if let Some(name) = mount.name
                    && !name.is_empty()
                {
                    owned.insert(name);
                }
            }
        }
        owned
    }

    pub async fn list_orphaned_volumes(&self, known_ids: &HashSet<String>) -> Result<Vec<String>> {
        let owned = self.owned_volume_names(known_ids).await;
        let volumes = self
            .docker
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await
            .context("failed to list volumes")?;
        Ok(volumes
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| v.name)
            .filter(|name| !owned.contains(name))
            .collect())
    }

    pub async fn clean_orphaned_volumes(
        &self,
        known_ids: &HashSet<String>,
    ) -> Result<CleanupResult> {
        let mut result = CleanupResult::default();
        for name in self.list_orphaned_volumes(known_ids).await? {
            match self
                .docker
                .remove_volume(&name, Some(RemoveVolumeOptions { force: true }))
                .await
            {
                Ok(()) => result.removed.push(name),
                Err(e) => result.errors.push(format!("{}: {}", name, e)),
            }
        }
        Ok(result)
    }

    /// Image ids used by containers whose project still exists.
    async fn owned_image_ids(&self, known_ids: &HashSet<String>) -> HashSet<String> {
        let mut ids = HashSet::new();
        let containers = match self.managed_containers().await {
            Ok(containers) => containers,
            Err(_) => return ids,
        };
        for c in containers {
            if is_owned(c.labels.as_ref(), known_ids)
                && let Some(image_id) = c.image_id
            {
                ids.insert(image_id);
            }
        }
        ids
    }

    pub async fn list_orphaned_images(&self, known_ids: &HashSet<String>) -> Result<Vec<String>> {
        let used = self.owned_image_ids(known_ids).await;
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .context("failed to list images")?;
        Ok(images
            .iter()
            .filter(|img| !used.contains(&img.id))
            .map(image_display_name)
            .collect())
    }

    pub async fn clean_orphaned_images(
        &self,
        known_ids: &HashSet<String>,
    ) -> Result<CleanupResult> {
        let used = self.owned_image_ids(known_ids).await;
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .context("failed to list images")?;

        let mut result = CleanupResult::default();
        for img in images {
            if used.contains(&img.id) {
                continue;
            }
            let tag = image_display_name(&img);
            match self
                .docker
                .remove_image(
                    &img.id,
                    Some(RemoveImageOptions {
                        force: true,
                        noprune: false,
                    }),
                    None,
                )
                .await
            {
                Ok(_) => result.removed.push(tag),
                Err(e) => result.errors.push(format!("{}: {}", tag, e)),
            }
        }
        Ok(result)
    }
}
