//! Streaming endpoints: the global event stream, the audit stream,
//! container log streams, and the backup pipeline.
//!
//! All streams use standard SSE framing with a `: ping` comment keepalive
//! every 30 seconds so idle proxies do not cut the connection.

use std::convert::Infallible;
use std::pin::Pin;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use bollard::container::LogOutput;
use futures_util::{Stream, StreamExt, stream};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::api::{ApiError, SharedState, backup_database_name, fetch_project, reconcile_project};
use crate::docker::ContainerRole;
use crate::events::Event;
use crate::store::{Project, ProjectStatus};

type SseStream = Pin<Box<dyn Stream<Item = Result<SseEvent, Infallible>> + Send>>;

fn keepalive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(30))
        .text("ping")
}

// ── Global event stream ───────────────────────────────────────────────

/// `GET /api/events`
///
/// Opens with `event: version` (so a client can force a reload when the
/// server binary changed across a reconnect) and the cached daemon status,
/// then relays every hub event as `event: <type>` + JSON data.
pub async fn events_stream(State(state): State<SharedState>) -> Sse<SseStream> {
    let sub = state.events.subscribe();

    let initial: Vec<Result<SseEvent, Infallible>> = vec![
        Ok(SseEvent::default().event("version").data(state.version.clone())),
        Ok(SseEvent::default()
            .event("docker_status")
            .data(if state.docker_up() { "up" } else { "down" })),
    ];

    let live = stream::unfold(sub, |mut sub| async move {
        let event = sub.recv().await?;
        let data = serde_json::to_string(&event).unwrap_or_default();
        let sse = SseEvent::default()
            .event(event.event_type.as_str())
            .data(data);
        Some((Ok(sse), sub))
    });

    let stream: SseStream = Box::pin(stream::iter(initial).chain(live));
    Sse::new(stream).keep_alive(keepalive())
}

// ── Audit stream ──────────────────────────────────────────────────────

/// `GET /api/audit/stream`: new audit entries as JSON `data:` frames.
pub async fn audit_stream(State(state): State<SharedState>) -> Sse<SseStream> {
    let sub = state.audit.subscribe();

    let live = stream::unfold(sub, |mut sub| async move {
        let entry = sub.recv().await?;
        let data = serde_json::to_string(&entry).unwrap_or_default();
        Some((Ok(SseEvent::default().data(data)), sub))
    });

    let stream: SseStream = Box::pin(live);
    Sse::new(stream).keep_alive(keepalive())
}

// ── Container log stream ──────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LogsQuery {
    pub container: Option<String>,
}

fn log_chunk_events(item: Result<LogOutput, bollard::errors::Error>) -> Vec<Result<SseEvent, Infallible>> {
    match item {
        Ok(output) => {
            let bytes = output.into_bytes();
            String::from_utf8_lossy(&bytes)
                .lines()
                .map(|line| line.trim_end_matches('\r'))
                .filter(|line| !line.is_empty())
                .map(|line| Ok(SseEvent::default().data(line)))
                .collect()
        }
        Err(e) => vec![Ok(SseEvent::default().event("error").data(e.to_string()))],
    }
}

/// `GET /api/projects/:id/logs?container=odoo|postgres`
pub async fn project_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Sse<SseStream>, ApiError> {
    let role = match query.container.as_deref() {
        None => ContainerRole::Odoo,
        Some(raw) => ContainerRole::parse(raw)
            .ok_or_else(|| ApiError::BadRequest("Invalid container type".to_string()))?,
    };

    fetch_project(&state, &id).await?;
    let docker = state.docker().ok_or(ApiError::DockerUnavailable)?;

    // The daemon client demultiplexes non-TTY streams into frames itself;
    // TTY streams (the odoo container) arrive raw with ANSI colours intact.
    let (logs, _has_tty) = docker
        .get_logs(&id, role)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to get logs: {:#}", e)))?;

    let stream: SseStream = Box::pin(logs.flat_map(|item| stream::iter(log_chunk_events(item))));
    Ok(Sse::new(stream).keep_alive(keepalive()))
}

// ── Backup pipeline ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct BackupQuery {
    pub db: Option<String>,
}

/// Releases the single-flight slot and tells every browser the backup is
/// over, whatever path the pipeline took.
struct BackupGuard {
    state: SharedState,
    project_id: String,
}

impl Drop for BackupGuard {
    fn drop(&mut self) {
        self.state.end_backup(&self.project_id);
        self.state
            .events
            .publish(Event::backup_done(&self.project_id));
    }
}

async fn send_data(tx: &mpsc::Sender<SseEvent>, line: impl Into<String>) -> bool {
    tx.send(SseEvent::default().data(line.into())).await.is_ok()
}

async fn send_named(tx: &mpsc::Sender<SseEvent>, event: &str, data: impl Into<String>) -> bool {
    tx.send(SseEvent::default().event(event).data(data.into()))
        .await
        .is_ok()
}

/// `GET /api/projects/:id/backup?db=<name>`
///
/// Streams the dump command's console output as `data:` lines, then emits
/// `event: complete` with the download URL (or `event: error`).
pub async fn backup_stream(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<BackupQuery>,
) -> Result<Sse<SseStream>, ApiError> {
    let db = backup_database_name(query.db)?;
    let project = fetch_project(&state, &id).await?;
    state.docker().ok_or(ApiError::DockerUnavailable)?;

    let project = reconcile_project(&state, project).await;
    if project.status != ProjectStatus::Running {
        return Err(ApiError::Conflict(
            "Project must be running to create a backup".to_string(),
        ));
    }

    // Single-flight per project.
    if !state.try_begin_backup(&id) {
        return Err(ApiError::Conflict(
            "A backup is already in progress for this project".to_string(),
        ));
    }

    state.events.publish(Event::backup_pending(&id));

    let (tx, rx) = mpsc::channel::<SseEvent>(64);
    tokio::spawn(run_backup(state.clone(), project, db, tx));

    let stream: SseStream = Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    }));
    Ok(Sse::new(stream).keep_alive(keepalive()))
}

async fn run_backup(state: SharedState, project: Project, db: String, tx: mpsc::Sender<SseEvent>) {
    let _guard = BackupGuard {
        state: state.clone(),
        project_id: project.id.clone(),
    };

    if !send_data(
        &tx,
        format!(
            "Starting backup of database \"{}\" for project {}...",
            db, project.name
        ),
    )
    .await
    {
        return;
    }

    let Some(docker) = state.docker() else {
        let _ = send_named(&tx, "error", "Docker daemon not available").await;
        return;
    };

    let (mut output, exec_id) = match docker.backup_database(&project.id, &db).await {
        Ok(started) => started,
        Err(e) => {
            let _ = send_named(&tx, "error", format!("Failed to start backup: {:#}", e)).await;
            return;
        }
    };

    // Relay the dump command's console output line by line. A failed send
    // means the browser went away; the guard still cleans up.
    while let Some(item) = output.next().await {
        let Ok(chunk) = item else { break };
        let bytes = chunk.into_bytes();
        for line in String::from_utf8_lossy(&bytes).lines() {
            let line = line.trim_end_matches('\r');
            if !line.is_empty() && !send_data(&tx, line).await {
                return;
            }
        }
    }

    let exit_code = match docker.wait_exec(&exec_id).await {
        Ok(code) => code,
        Err(e) => {
            let _ = send_named(
                &tx,
                "error",
                format!("Failed waiting for backup process: {:#}", e),
            )
            .await;
            return;
        }
    };
    if exit_code != 0 {
        let _ = send_named(
            &tx,
            "error",
            format!("Backup command exited with code {}", exit_code),
        )
        .await;
        return;
    }

    if !send_data(&tx, "Backup command completed, extracting file...").await {
        return;
    }

    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let safe_name = project.name.replace(['/', '\\'], "-");
    let filename = format!("{}-{}-{}.zip", safe_name, db, timestamp);
    let dest = state.config.backups_dir().join(&filename);

    if let Err(e) = docker.copy_backup_from_container(&project.id, &dest).await {
        warn!(project_id = %project.id, "backup extraction failed: {:#}", e);
        let _ = send_named(&tx, "error", format!("Failed to extract backup: {:#}", e)).await;
        return;
    }

    let _ = send_data(&tx, "Backup ready for download.").await;
    // The download URL is only announced once the file exists on disk.
    let _ = send_named(&tx, "complete", format!("/api/backup/download/{}", filename)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_chunk_events_splits_lines() {
        let output = LogOutput::Console {
            message: "line one\r\nline two\n\nline three".into(),
        };
        let events = log_chunk_events(Ok(output));
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_log_chunk_events_error_frame() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "daemon went away".to_string(),
        };
        let events = log_chunk_events(Err(err));
        assert_eq!(events.len(), 1);
    }
}
