//! In-process pub/sub hub feeding the global SSE stream.
//!
//! Each subscriber gets a bounded queue. Publishing never blocks: when a
//! subscriber's queue is full the event is dropped for that subscriber only.
//! Clients self-heal by re-fetching `/api/projects` on reconnect and on a
//! periodic timer, so a dropped event costs at most one refresh interval of
//! staleness.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::store::Project;

/// Per-subscriber queue depth. Slow consumers drop rather than backing up
/// the publisher.
const QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ProjectCreated,
    ProjectDeleted,
    ProjectStatusChanged,
    ProjectActionPending,
    ProjectBackupPending,
    ProjectBackupDone,
    DockerStatus,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectCreated => "project_created",
            Self::ProjectDeleted => "project_deleted",
            Self::ProjectStatusChanged => "project_status_changed",
            Self::ProjectActionPending => "project_action_pending",
            Self::ProjectBackupPending => "project_backup_pending",
            Self::ProjectBackupDone => "project_backup_done",
            Self::DockerStatus => "docker_status",
        }
    }
}

/// A lifecycle event broadcast to every connected browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    pub fn project_created(project: &Project) -> Self {
        Self {
            event_type: EventType::ProjectCreated,
            project_id: project.id.clone(),
            data: serde_json::to_value(project).ok(),
        }
    }

    pub fn project_deleted(project_id: &str) -> Self {
        Self {
            event_type: EventType::ProjectDeleted,
            project_id: project_id.to_string(),
            data: None,
        }
    }

    pub fn status_changed(project: &Project) -> Self {
        Self {
            event_type: EventType::ProjectStatusChanged,
            project_id: project.id.clone(),
            data: serde_json::to_value(project).ok(),
        }
    }

    /// `verb` is the human-readable pending action, e.g. "creating".
    pub fn action_pending(project_id: &str, verb: &str) -> Self {
        Self {
            event_type: EventType::ProjectActionPending,
            project_id: project_id.to_string(),
            data: Some(serde_json::Value::String(verb.to_string())),
        }
    }

    pub fn backup_pending(project_id: &str) -> Self {
        Self {
            event_type: EventType::ProjectBackupPending,
            project_id: project_id.to_string(),
            data: None,
        }
    }

    pub fn backup_done(project_id: &str) -> Self {
        Self {
            event_type: EventType::ProjectBackupDone,
            project_id: project_id.to_string(),
            data: None,
        }
    }

    /// `up` maps to the wire values "up"/"down".
    pub fn docker_status(up: bool) -> Self {
        Self {
            event_type: EventType::DockerStatus,
            project_id: String::new(),
            data: Some(serde_json::Value::String(
                if up { "up" } else { "down" }.to_string(),
            )),
        }
    }
}

struct HubInner {
    clients: RwLock<HashMap<u64, mpsc::Sender<Event>>>,
    next_id: AtomicU64,
}

/// Cloneable handle to the shared hub.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                clients: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a subscriber. Dropping the returned subscription removes it
    /// from the hub.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut clients) = self.inner.clients.write() {
            clients.insert(id, tx);
        }
        debug!("SSE client connected (total: {})", self.client_count());
        Subscription {
            hub: self.clone(),
            id,
            rx,
        }
    }

    fn unsubscribe(&self, id: u64) {
        if let Ok(mut clients) = self.inner.clients.write() {
            clients.remove(&id);
        }
        debug!("SSE client disconnected (total: {})", self.client_count());
    }

    /// Fan an event out to every subscriber. Never blocks; full queues drop.
    pub fn publish(&self, event: Event) {
        let clients = match self.inner.clients.read() {
            Ok(clients) => clients,
            Err(_) => return,
        };
        for tx in clients.values() {
            if tx.try_send(event.clone()).is_err() {
                warn!("dropped {} event for slow SSE client", event.event_type.as_str());
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.inner
            .clients
            .read()
            .map(|clients| clients.len())
            .unwrap_or(0)
    }
}

/// A live subscription. Receive with [`Subscription::recv`]; unsubscribes on
/// drop.
pub struct Subscription {
    hub: EventHub,
    id: u64,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive, used by tests.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}
