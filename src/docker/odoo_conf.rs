//! Host-side management of each project's `odoo.conf`.
//!
//! The file lives at `<data>/config/<id>/odoo.conf` and is bind-mounted into
//! the container at `/etc/odoo`. The `addons_path` option is edited
//! surgically rather than regenerated so user-authored options survive
//! mount-set changes.

use std::path::Path;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::docker::compose::MountSet;

/// Default config written before the first container creation. The
/// addons_path line is omitted when no addon mounts apply.
pub fn default_odoo_conf(mounts: &MountSet) -> String {
    let paths = mounts.addon_paths();
    if paths.is_empty() {
        "[options]\ndata_dir = /var/lib/odoo\n".to_string()
    } else {
        format!(
            "[options]\ndata_dir = /var/lib/odoo\naddons_path = {}\n",
            paths.join(",")
        )
    }
}

/// Write the default config for a project unless one already exists. User
/// edits are never clobbered.
pub fn ensure_default_config(config: &Config, project_id: &str, mounts: &MountSet) -> Result<()> {
    let path = config.odoo_conf_path(project_id);
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create config dir {}", parent.display()))?;
    }
    write_atomic(&path, &default_odoo_conf(mounts))
}

pub fn read_config(config: &Config, project_id: &str) -> Result<String> {
    let path = config.odoo_conf_path(project_id);
    std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
}

pub fn write_config(config: &Config, project_id: &str, content: &str) -> Result<()> {
    let path = config.odoo_conf_path(project_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create config dir {}", parent.display()))?;
    }
    write_atomic(&path, content)
}

/// Write via a temp file + rename so a crash never leaves a torn config.
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("conf.tmp");
    std::fs::write(&tmp, content).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

/// Add or remove one mount directory in the `addons_path` option, leaving
/// every other line byte-identical.
///
/// When no `addons_path` line exists and `enable` is true, one is appended.
/// When disabling leaves the list empty the whole line is dropped, matching
/// the default config's shape for mount-less projects.
pub fn update_addons_path(
    config: &Config,
    project_id: &str,
    mount_path: &str,
    enable: bool,
) -> Result<()> {
    let content = read_config(config, project_id)?;
    let updated = edit_addons_path(&content, mount_path, enable);
    if updated != content {
        write_config(config, project_id, &updated)?;
    }
    Ok(())
}

fn edit_addons_path(content: &str, mount_path: &str, enable: bool) -> String {
    let had_trailing_newline = content.ends_with('\n');
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    let found_at = lines.iter().position(|line| {
        let trimmed = line.trim_start();
        trimmed
            .strip_prefix("addons_path")
            .map(|rest| rest.trim_start().starts_with('='))
            .unwrap_or(false)
    });

    match found_at {
        Some(i) => {
            let value = lines[i].splitn(2, '=').nth(1).unwrap_or("").to_string();
            let mut entries: Vec<&str> = value
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty() && *e != mount_path)
                .collect();
            if enable {
                entries.push(mount_path);
            }
            if entries.is_empty() {
                // An emptied addons_path line is removed entirely.
                lines.remove(i);
            } else {
                lines[i] = format!("addons_path = {}", entries.join(","));
            }
        }
        None => {
            if enable {
                lines.push(format!("addons_path = {}", mount_path));
            }
        }
    }

    let mut out = lines.join("\n");
    if had_trailing_newline && !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Whether the config declares a dev mode that hot-reloads addon code
/// (`dev = all` or `dev = reload`). Repo updates skip the container restart
/// when it does.
pub fn dev_reload_enabled(content: &str) -> bool {
    for line in content.lines() {
        let lower = line.trim().to_lowercase();
        if !lower.starts_with("dev") || lower.starts_with("dev_") {
            continue;
        }
        if let Some((_, value)) = lower.split_once('=') {
            let value = value.trim();
            if value.contains("all") || value.contains("reload") {
                return true;
            }
        }
    }
    false
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::docker::compose::{ADDONS_MOUNT, DESIGN_THEMES_MOUNT, ENTERPRISE_MOUNT};
    use proptest::prelude::*;

    fn mount() -> impl Strategy<Value = &'static str> {
        prop_oneof![
            Just(ADDONS_MOUNT),
            Just(ENTERPRISE_MOUNT),
            Just(DESIGN_THEMES_MOUNT),
        ]
    }

    // Option keys are prefixed so they can never collide with addons_path,
    // and values are too short to contain a mount path.
    fn other_lines() -> impl Strategy<Value = Vec<String>> {
        proptest::collection::vec("opt_[a-z]{1,8} = [a-z0-9/._-]{0,16}", 0..6)
    }

    proptest! {
        #[test]
        fn enable_then_disable_is_exact(lines in other_lines(), mount in mount()) {
            let mut content = String::from("[options]\n");
            for line in &lines {
                content.push_str(line);
                content.push('\n');
            }

            let enabled = edit_addons_path(&content, mount, true);
            prop_assert_eq!(enabled.matches(mount).count(), 1);

            // Enabling again never duplicates the entry.
            let enabled_twice = edit_addons_path(&enabled, mount, true);
            prop_assert_eq!(enabled_twice.matches(mount).count(), 1);

            let disabled = edit_addons_path(&enabled, mount, false);
            prop_assert_eq!(disabled.matches(mount).count(), 0);

            // Every unrelated option line survives byte-for-byte.
            for line in &lines {
                prop_assert!(disabled.contains(line.as_str()));
            }
        }

        #[test]
        fn disable_without_line_is_identity(lines in other_lines(), mount in mount()) {
            let mut content = String::from("[options]\n");
            for line in &lines {
                content.push_str(line);
                content.push('\n');
            }
            let edited = edit_addons_path(&content, mount, false);
            prop_assert_eq!(edited, content);
        }
    }
}
