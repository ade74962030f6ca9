//! Exec-based operations inside project containers: database listing,
//! backup dumps, file copy-out, and log streaming.

use std::path::Path;
use std::pin::Pin;

use anyhow::{Context, Result, anyhow};
use bollard::container::{DownloadFromContainerOptions, InspectContainerOptions, LogsOptions};
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;

use crate::docker::compose::{ContainerRole, odoo_container_name, postgres_container_name};
use crate::docker::manager::DockerManager;

/// Where the dump command writes its zip inside the odoo container.
const BACKUP_PATH: &str = "/tmp/odoo_backup.zip";

/// Console/log frames from the daemon.
pub type DockerStream =
    Pin<Box<dyn Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>>;

/// Database names travel into a shell command line; restrict them to the
/// character set psql reports for ordinary databases.
pub fn is_safe_database_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Strip a Docker multiplex header (or any non-name prefix) from an exec
/// output line. Multiplexed streams prepend 8 opaque bytes per frame.
fn sanitize_db_line(line: &str) -> Option<String> {
    let mut name = line.trim();
    if let Some(idx) = name
        .char_indices()
        .find(|(_, c)| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .map(|(i, _)| i)
        && idx > 0
    {
        name = &name[idx..];
    }
    let name = name.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

impl DockerManager {
    /// Run psql inside the postgres container and return the project's
    /// databases, excluding templates and the maintenance db.
    pub async fn list_databases(&self, project_id: &str) -> Result<Vec<String>> {
        let container = postgres_container_name(project_id);

        let exec = self
            .docker
            .create_exec(
                &container,
                CreateExecOptions::<String> {
                    cmd: Some(
                        [
                            "psql",
                            "-U",
                            "odoo",
                            "-d",
                            "postgres",
                            "-t",
                            "-A",
                            "-c",
                            "SELECT datname FROM pg_database WHERE datistemplate = false AND datname NOT IN ('postgres') ORDER BY datname",
                        ]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                    ),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("failed to create exec for listing databases")?;

        let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .context("failed to attach to exec")?
        else {
            return Err(anyhow!("exec unexpectedly detached"));
        };

        let mut raw = Vec::new();
        while let Some(chunk) = output.next().await {
            let chunk = chunk.context("failed to read exec output")?;
            raw.extend_from_slice(&chunk.into_bytes());
        }

        let databases = String::from_utf8_lossy(&raw)
            .lines()
            .filter_map(sanitize_db_line)
            .collect();
        Ok(databases)
    }

    /// Start a database dump inside the odoo container.
    ///
    /// The dump zip is redirected to a file in the container while the
    /// command's console output streams back to the caller. The exec runs
    /// with a TTY so the output is a single unmultiplexed stream. Returns
    /// the output stream and the exec id for exit-code polling.
    pub async fn backup_database(
        &self,
        project_id: &str,
        database: &str,
    ) -> Result<(DockerStream, String)> {
        let container = odoo_container_name(project_id);
        let cmd = format!(
            "odoo db --db_host postgres --db_port 5432 --db_user odoo --db_password odoo dump {} > {}",
            database, BACKUP_PATH
        );

        let exec = self
            .docker
            .create_exec(
                &container,
                CreateExecOptions::<String> {
                    cmd: Some(vec!["sh".into(), "-c".into(), cmd]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("failed to create exec for backup")?;

        let StartExecResults::Attached { output, .. } = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .context("failed to attach to exec for backup")?
        else {
            return Err(anyhow!("backup exec unexpectedly detached"));
        };

        Ok((output, exec.id))
    }

    /// Poll the exec until it finishes and return its exit code. Callers
    /// bound this with their own timeout when needed.
    pub async fn wait_exec(&self, exec_id: &str) -> Result<i64> {
        loop {
            let inspect = self
                .docker
                .inspect_exec(exec_id)
                .await
                .context("failed to inspect exec")?;
            if !inspect.running.unwrap_or(false) {
                return Ok(inspect.exit_code.unwrap_or(-1));
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    /// Copy the dump zip out of the odoo container to `dest_path`, then
    /// best-effort remove it inside the container.
    pub async fn copy_backup_from_container(
        &self,
        project_id: &str,
        dest_path: &Path,
    ) -> Result<()> {
        let container = odoo_container_name(project_id);

        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create backup dir {}", parent.display()))?;
        }

        // The copy API hands back a tar archive; spool it to disk first so
        // multi-gigabyte dumps never sit in memory.
        let tar_path = dest_path.with_extension("tar.partial");
        let mut tar_file = tokio::fs::File::create(&tar_path)
            .await
            .context("create tar spool file")?;

        let mut stream = self.docker.download_from_container(
            &container,
            Some(DownloadFromContainerOptions {
                path: BACKUP_PATH.to_string(),
            }),
        );
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("failed to copy backup from container")?;
            tar_file
                .write_all(&chunk)
                .await
                .context("write tar spool file")?;
        }
        tar_file.flush().await.context("flush tar spool file")?;
        drop(tar_file);

        let dest = dest_path.to_path_buf();
        let tar_path_for_extract = tar_path.clone();
        let extract = tokio::task::spawn_blocking(move || -> Result<()> {
            let file = std::fs::File::open(&tar_path_for_extract).context("open tar spool")?;
            let mut archive = tar::Archive::new(file);
            let mut entries = archive.entries().context("read tar entries")?;
            let mut entry = entries
                .next()
                .ok_or_else(|| anyhow!("backup archive was empty"))?
                .context("read tar entry")?;
            let mut out = std::fs::File::create(&dest)
                .with_context(|| format!("create {}", dest.display()))?;
            std::io::copy(&mut entry, &mut out).context("extract backup file")?;
            Ok(())
        })
        .await
        .context("extraction task panicked")?;

        let _ = std::fs::remove_file(&tar_path);
        extract?;

        // The zip inside the container is no longer needed.
        if let Ok(exec) = self
            .docker
            .create_exec(
                &container,
                CreateExecOptions::<String> {
                    cmd: Some(vec!["rm".into(), "-f".into(), BACKUP_PATH.into()]),
                    ..Default::default()
                },
            )
            .await
        {
            let _ = self
                .docker
                .start_exec(&exec.id, Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }))
                .await;
        }

        Ok(())
    }

    /// Follow a container's log stream (last 100 lines of history). The
    /// returned flag says whether the container has a TTY: TTY streams are
    /// raw (ANSI colours preserved), non-TTY streams arrive as demuxed
    /// stdout/stderr frames.
    pub async fn get_logs(
        &self,
        project_id: &str,
        role: ContainerRole,
    ) -> Result<(DockerStream, bool)> {
        let container = role.container_name(project_id);

        let inspect = self
            .docker
            .inspect_container(&container, None::<InspectContainerOptions>)
            .await
            .context("failed to inspect container")?;
        let has_tty = inspect
            .config
            .as_ref()
            .and_then(|c| c.tty)
            .unwrap_or(false);

        let stream = self.docker.logs(
            &container,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                tail: "100".to_string(),
                ..Default::default()
            }),
        );

        Ok((Box::pin(stream), has_tty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_db_line_plain() {
        assert_eq!(sanitize_db_line("mydb"), Some("mydb".to_string()));
        assert_eq!(sanitize_db_line("  mydb \r"), Some("mydb".to_string()));
    }

    #[test]
    fn test_sanitize_db_line_strips_multiplex_header() {
        // 8-byte stdout frame header followed by the payload.
        let line = "\u{1}\u{0}\u{0}\u{0}\u{0}\u{0}\u{0}\u{6}testdb";
        assert_eq!(sanitize_db_line(line), Some("testdb".to_string()));
    }

    #[test]
    fn test_sanitize_db_line_empty() {
        assert_eq!(sanitize_db_line(""), None);
        assert_eq!(sanitize_db_line("   "), None);
    }

    #[test]
    fn test_sanitize_db_line_keeps_underscores_and_dashes() {
        assert_eq!(
            sanitize_db_line("prod_db-2024"),
            Some("prod_db-2024".to_string())
        );
    }

    #[test]
    fn test_is_safe_database_name() {
        assert!(is_safe_database_name("testdb"));
        assert!(is_safe_database_name("prod_db-2024"));
        assert!(!is_safe_database_name(""));
        assert!(!is_safe_database_name("db; rm -rf /"));
        assert!(!is_safe_database_name("db name"));
        assert!(!is_safe_database_name("db$(x)"));
    }
}
