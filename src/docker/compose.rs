//! Container composition: image references, names, labels, environment,
//! port and bind-mount planning for a project's container pair.
//!
//! Everything here is pure planning over a [`Project`]; the daemon calls
//! live in `manager`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bollard::container::Config as ContainerConfig;
use bollard::models::{HostConfig, PortBinding};

use crate::store::Project;

pub const LABEL_PROJECT_ID: &str = "odoo-manager.project-id";
pub const LABEL_ROLE: &str = "odoo-manager.role";
pub const LABEL_MANAGED: &str = "odoo-manager.managed";

/// Container mount point for the project's custom addons clone.
pub const ADDONS_MOUNT: &str = "/mnt/extra-addons";
/// Container mount point for the Enterprise clone.
pub const ENTERPRISE_MOUNT: &str = "/mnt/enterprise-addons";
/// Container mount point for the Design Themes clone.
pub const DESIGN_THEMES_MOUNT: &str = "/mnt/design-themes";

/// Wrapper around the stock image entrypoint. Custom-addon repos frequently
/// ship a requirements.txt that must be satisfied before Odoo boots.
const ODOO_ENTRYPOINT_WRAPPER: &str = "if [ -f /mnt/extra-addons/requirements.txt ]; then \
     pip3 install --break-system-packages -r /mnt/extra-addons/requirements.txt; fi; \
     exec /entrypoint.sh odoo";

/// Which half of the pair a container is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRole {
    Odoo,
    Postgres,
}

impl ContainerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Odoo => "odoo",
            Self::Postgres => "postgres",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "odoo" => Some(Self::Odoo),
            "postgres" => Some(Self::Postgres),
            _ => None,
        }
    }

    pub fn container_name(&self, project_id: &str) -> String {
        format!("{}-{}", self.as_str(), project_id)
    }
}

pub fn odoo_container_name(project_id: &str) -> String {
    ContainerRole::Odoo.container_name(project_id)
}

pub fn postgres_container_name(project_id: &str) -> String {
    ContainerRole::Postgres.container_name(project_id)
}

/// The ownership labels every managed container carries. These are the
/// single source of truth for the maintenance sweeps.
pub fn project_labels(project_id: &str, role: ContainerRole) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_PROJECT_ID.to_string(), project_id.to_string()),
        (LABEL_ROLE.to_string(), role.as_str().to_string()),
        (LABEL_MANAGED.to_string(), "true".to_string()),
    ])
}

pub fn odoo_image(project: &Project) -> String {
    format!("odoo:{}", project.odoo_version)
}

/// Odoo 19+ requires the pgvector extension, so those projects run on the
/// pgvector image; everything older uses stock postgres.
pub fn postgres_image(project: &Project) -> String {
    if project.odoo_major() >= 19 {
        format!("pgvector/pgvector:pg{}-trixie", project.postgres_version)
    } else {
        format!("postgres:{}", project.postgres_version)
    }
}

/// Host directories resolved for a project's conditional bind mounts. `None`
/// means the mount is not part of this project (or its clone failed and the
/// container comes up without it).
#[derive(Debug, Clone, Default)]
pub struct MountSet {
    pub addons: Option<PathBuf>,
    pub enterprise: Option<PathBuf>,
    pub design_themes: Option<PathBuf>,
}

impl MountSet {
    /// Container-side addon directories in mount order, for addons_path.
    pub fn addon_paths(&self) -> Vec<&'static str> {
        let mut paths = Vec::new();
        if self.addons.is_some() {
            paths.push(ADDONS_MOUNT);
        }
        if self.enterprise.is_some() {
            paths.push(ENTERPRISE_MOUNT);
        }
        if self.design_themes.is_some() {
            paths.push(DESIGN_THEMES_MOUNT);
        }
        paths
    }
}

/// Bind strings for the Odoo container. The per-project config directory is
/// always mounted; addon mounts only when resolved.
pub fn odoo_binds(config_dir: &Path, mounts: &MountSet) -> Vec<String> {
    let mut binds = vec![format!("{}:/etc/odoo", config_dir.display())];
    if let Some(dir) = &mounts.addons {
        binds.push(format!("{}:{}", dir.display(), ADDONS_MOUNT));
    }
    if let Some(dir) = &mounts.enterprise {
        binds.push(format!("{}:{}", dir.display(), ENTERPRISE_MOUNT));
    }
    if let Some(dir) = &mounts.design_themes {
        binds.push(format!("{}:{}", dir.display(), DESIGN_THEMES_MOUNT));
    }
    binds
}

/// Full creation config for the Odoo container.
///
/// `extra_binds` carries the re-attached data volume during an image update;
/// it is empty everywhere else.
pub fn odoo_container_config(
    project: &Project,
    config_dir: &Path,
    mounts: &MountSet,
    extra_binds: &[String],
) -> ContainerConfig<String> {
    let mut binds = odoo_binds(config_dir, mounts);
    binds.extend(extra_binds.iter().cloned());

    let port_bindings = HashMap::from([(
        "8069/tcp".to_string(),
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(project.port.to_string()),
        }]),
    )]);

    ContainerConfig {
        image: Some(odoo_image(project)),
        env: Some(vec![
            "HOST=postgres".to_string(),
            "USER=odoo".to_string(),
            "PASSWORD=odoo".to_string(),
        ]),
        exposed_ports: Some(HashMap::from([(
            "8069/tcp".to_string(),
            HashMap::new(),
        )])),
        // TTY keeps ANSI colours on the log stream for the viewer.
        tty: Some(true),
        labels: Some(project_labels(&project.id, ContainerRole::Odoo)),
        entrypoint: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            ODOO_ENTRYPOINT_WRAPPER.to_string(),
        ]),
        host_config: Some(HostConfig {
            binds: Some(binds),
            links: Some(vec![format!(
                "{}:postgres",
                postgres_container_name(&project.id)
            )]),
            port_bindings: Some(port_bindings),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Full creation config for the Postgres container.
pub fn postgres_container_config(project: &Project) -> ContainerConfig<String> {
    ContainerConfig {
        image: Some(postgres_image(project)),
        env: Some(vec![
            "POSTGRES_DB=postgres".to_string(),
            "POSTGRES_USER=odoo".to_string(),
            "POSTGRES_PASSWORD=odoo".to_string(),
        ]),
        labels: Some(project_labels(&project.id, ContainerRole::Postgres)),
        host_config: Some(HostConfig::default()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::store::ProjectStatus;

    fn project(odoo_version: &str, postgres_version: &str) -> Project {
        Project {
            id: "abc-123".to_string(),
            name: "demo".to_string(),
            description: String::new(),
            odoo_version: odoo_version.to_string(),
            postgres_version: postgres_version.to_string(),
            port: 8070,
            status: ProjectStatus::Stopped,
            git_repo_url: String::new(),
            git_repo_branch: String::new(),
            enterprise_enabled: false,
            design_themes_enabled: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_container_names() {
        assert_eq!(odoo_container_name("abc"), "odoo-abc");
        assert_eq!(postgres_container_name("abc"), "postgres-abc");
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(ContainerRole::parse("odoo"), Some(ContainerRole::Odoo));
        assert_eq!(
            ContainerRole::parse("postgres"),
            Some(ContainerRole::Postgres)
        );
        assert_eq!(ContainerRole::parse("redis"), None);
    }

    #[test]
    fn test_project_labels_complete() {
        let labels = project_labels("abc", ContainerRole::Odoo);
        assert_eq!(labels.get(LABEL_PROJECT_ID).unwrap(), "abc");
        assert_eq!(labels.get(LABEL_ROLE).unwrap(), "odoo");
        assert_eq!(labels.get(LABEL_MANAGED).unwrap(), "true");
        assert_eq!(labels.len(), 3);
    }

    #[test]
    fn test_postgres_image_selection() {
        assert_eq!(postgres_image(&project("18.0", "16")), "postgres:16");
        assert_eq!(postgres_image(&project("17.0", "15")), "postgres:15");
        assert_eq!(
            postgres_image(&project("19.0", "16")),
            "pgvector/pgvector:pg16-trixie"
        );
        assert_eq!(
            postgres_image(&project("20.0", "17")),
            "pgvector/pgvector:pg17-trixie"
        );
    }

    #[test]
    fn test_odoo_image() {
        assert_eq!(odoo_image(&project("18.0", "16")), "odoo:18.0");
    }

    #[test]
    fn test_mount_set_addon_paths() {
        let mut mounts = MountSet::default();
        assert!(mounts.addon_paths().is_empty());

        mounts.enterprise = Some(PathBuf::from("/data/repos/x-enterprise"));
        assert_eq!(mounts.addon_paths(), vec![ENTERPRISE_MOUNT]);

        mounts.addons = Some(PathBuf::from("/data/repos/x"));
        mounts.design_themes = Some(PathBuf::from("/data/repos/x-design-themes"));
        assert_eq!(
            mounts.addon_paths(),
            vec![ADDONS_MOUNT, ENTERPRISE_MOUNT, DESIGN_THEMES_MOUNT]
        );
    }

    #[test]
    fn test_odoo_binds_config_always_first() {
        let mounts = MountSet {
            addons: Some(PathBuf::from("/data/repos/abc")),
            enterprise: None,
            design_themes: Some(PathBuf::from("/data/repos/abc-design-themes")),
        };
        let binds = odoo_binds(Path::new("/data/config/abc"), &mounts);
        assert_eq!(
            binds,
            vec![
                "/data/config/abc:/etc/odoo",
                "/data/repos/abc:/mnt/extra-addons",
                "/data/repos/abc-design-themes:/mnt/design-themes",
            ]
        );
    }

    #[test]
    fn test_odoo_container_config() {
        let p = project("18.0", "16");
        let cfg = odoo_container_config(&p, Path::new("/data/config/abc-123"), &MountSet::default(), &[]);

        assert_eq!(cfg.image.as_deref(), Some("odoo:18.0"));
        assert_eq!(cfg.tty, Some(true));
        let env = cfg.env.unwrap();
        assert!(env.contains(&"HOST=postgres".to_string()));
        assert!(env.contains(&"PASSWORD=odoo".to_string()));

        let entrypoint = cfg.entrypoint.unwrap();
        assert_eq!(entrypoint[0], "/bin/sh");
        assert!(entrypoint[2].contains("requirements.txt"));
        assert!(entrypoint[2].contains("exec /entrypoint.sh odoo"));

        let host = cfg.host_config.unwrap();
        assert_eq!(
            host.links.unwrap(),
            vec!["postgres-abc-123:postgres".to_string()]
        );
        let bindings = host.port_bindings.unwrap();
        let binding = &bindings["8069/tcp"].as_ref().unwrap()[0];
        assert_eq!(binding.host_ip.as_deref(), Some("0.0.0.0"));
        assert_eq!(binding.host_port.as_deref(), Some("8070"));

        let labels = cfg.labels.unwrap();
        assert_eq!(labels.get(LABEL_MANAGED).unwrap(), "true");
    }

    #[test]
    fn test_odoo_container_config_extra_binds_appended() {
        let p = project("18.0", "16");
        let extra = vec!["volname:/var/lib/odoo".to_string()];
        let cfg = odoo_container_config(&p, Path::new("/cfg"), &MountSet::default(), &extra);
        let binds = cfg.host_config.unwrap().binds.unwrap();
        assert_eq!(binds.last().unwrap(), "volname:/var/lib/odoo");
    }

    #[test]
    fn test_postgres_container_config() {
        let p = project("19.0", "16");
        let cfg = postgres_container_config(&p);
        assert_eq!(cfg.image.as_deref(), Some("pgvector/pgvector:pg16-trixie"));
        let env = cfg.env.unwrap();
        assert!(env.contains(&"POSTGRES_USER=odoo".to_string()));
        let labels = cfg.labels.unwrap();
        assert_eq!(labels.get(LABEL_ROLE).unwrap(), "postgres");
        // Postgres is reached through the link, never published on the host.
        assert!(cfg.host_config.unwrap().port_bindings.is_none());
    }
}
