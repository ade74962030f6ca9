use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Runtime configuration for the manager server.
///
/// Everything the process persists lives under `data_dir`:
///
/// ```text
/// <data>/odoo-manager.db      SQLite store
/// <data>/audit.log            append-only audit log
/// <data>/repos/<id>{,-enterprise,-design-themes}/
///                             git worktrees for addon sources
/// <data>/config/<id>/odoo.conf
///                             per-project Odoo config, bind-mounted
/// <data>/backups/             transient backup zips
/// <data>/bin/git/             portable git (Windows auto-download)
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Config {
    /// Build a config from an optional CLI port and data dir, falling back to
    /// the `PORT` environment variable and then the defaults.
    pub fn resolve(port: Option<u16>, data_dir: Option<PathBuf>) -> Self {
        let env_port = std::env::var("PORT").ok().and_then(|v| v.parse().ok());
        Self {
            port: port.or(env_port).unwrap_or(8080),
            data_dir: data_dir.unwrap_or_else(|| PathBuf::from("data")),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("odoo-manager.db")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join("audit.log")
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.data_dir.join("repos")
    }

    pub fn repo_dir(&self, project_id: &str) -> PathBuf {
        self.repos_dir().join(project_id)
    }

    pub fn enterprise_repo_dir(&self, project_id: &str) -> PathBuf {
        self.repos_dir().join(format!("{}-enterprise", project_id))
    }

    pub fn design_themes_repo_dir(&self, project_id: &str) -> PathBuf {
        self.repos_dir().join(format!("{}-design-themes", project_id))
    }

    /// Host directory bind-mounted at /etc/odoo inside the Odoo container.
    pub fn project_config_dir(&self, project_id: &str) -> PathBuf {
        self.data_dir.join("config").join(project_id)
    }

    pub fn odoo_conf_path(&self, project_id: &str) -> PathBuf {
        self.project_config_dir(project_id).join("odoo.conf")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn git_bin_dir(&self) -> PathBuf {
        self.data_dir.join("bin").join("git")
    }

    /// Create the directories the server writes into unconditionally.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.data_dir.clone(),
            self.repos_dir(),
            self.data_dir.join("config"),
            self.backups_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Resolve a path to its absolute form without requiring it to exist.
pub fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.data_dir, PathBuf::from("data"));
    }

    #[test]
    fn test_config_paths_derive_from_data_dir() {
        let config = Config {
            port: 9000,
            data_dir: PathBuf::from("/srv/odoo"),
        };
        assert_eq!(config.db_path(), PathBuf::from("/srv/odoo/odoo-manager.db"));
        assert_eq!(config.audit_log_path(), PathBuf::from("/srv/odoo/audit.log"));
        assert_eq!(config.repo_dir("abc"), PathBuf::from("/srv/odoo/repos/abc"));
        assert_eq!(
            config.enterprise_repo_dir("abc"),
            PathBuf::from("/srv/odoo/repos/abc-enterprise")
        );
        assert_eq!(
            config.design_themes_repo_dir("abc"),
            PathBuf::from("/srv/odoo/repos/abc-design-themes")
        );
        assert_eq!(
            config.odoo_conf_path("abc"),
            PathBuf::from("/srv/odoo/config/abc/odoo.conf")
        );
        assert_eq!(config.git_bin_dir(), PathBuf::from("/srv/odoo/bin/git"));
    }

    #[test]
    fn test_resolve_explicit_port_wins() {
        let config = Config::resolve(Some(9001), None);
        assert_eq!(config.port, 9001);
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            port: 8080,
            data_dir: dir.path().join("data"),
        };
        config.ensure_directories().unwrap();
        assert!(config.repos_dir().is_dir());
        assert!(config.backups_dir().is_dir());
        assert!(config.data_dir.join("config").is_dir());
    }

    #[test]
    fn test_absolutize_keeps_absolute_paths() {
        let p = PathBuf::from("/already/absolute");
        assert_eq!(absolutize(&p), p);
    }

    #[test]
    fn test_absolutize_relative_path() {
        let p = absolutize(Path::new("relative/dir"));
        assert!(p.is_absolute());
        assert!(p.ends_with("relative/dir"));
    }
}
