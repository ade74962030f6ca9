//! Append-only audit log of API activity.
//!
//! Every entry is written to `<data>/audit.log`, echoed to the process log,
//! and broadcast to real-time subscribers (the Audit page SSE stream). Slow
//! subscribers drop entries, same policy as the event hub.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use axum::http::HeaderMap;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

/// Per-subscriber queue depth for the real-time stream.
const QUEUE_DEPTH: usize = 64;

/// A single audit log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub message: String,
}

impl AuditEntry {
    fn as_line(&self) -> String {
        format!(
            "[{}] {} {} {} - {}",
            self.timestamp, self.client_ip, self.method, self.path, self.message
        )
    }
}

struct AuditInner {
    file: Mutex<File>,
    file_path: PathBuf,
    clients: RwLock<HashMap<u64, mpsc::Sender<AuditEntry>>>,
    next_id: AtomicU64,
}

/// Cloneable handle to the audit logger.
#[derive(Clone)]
pub struct AuditLog {
    inner: Arc<AuditInner>,
}

impl AuditLog {
    /// Open the audit log in append mode, creating it (and its parent
    /// directory) if needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("audit: mkdir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("audit: open {}", path.display()))?;

        Ok(Self {
            inner: Arc::new(AuditInner {
                file: Mutex::new(file),
                file_path: path.to_path_buf(),
                clients: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Record an entry: file, process log, and real-time subscribers.
    pub fn log(&self, client_ip: &str, method: &str, path: &str, message: &str) {
        let entry = AuditEntry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            client_ip: client_ip.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            message: message.to_string(),
        };
        let line = entry.as_line();

        if let Ok(mut file) = self.inner.file.lock() {
            let _ = writeln!(file, "{}", line);
        }

        info!("AUDIT: {}", line);

        if let Ok(clients) = self.inner.clients.read() {
            for tx in clients.values() {
                let _ = tx.try_send(entry.clone());
            }
        }
    }

    /// Last `n` lines in chronological order.
    pub fn tail(&self, n: usize) -> Result<Vec<String>> {
        let _guard = self.inner.file.lock();
        let file = match File::open(&self.inner.file_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("audit: open for tail"),
        };

        let mut ring: Vec<String> = Vec::with_capacity(n);
        for line in BufReader::new(file).lines() {
            ring.push(line.context("audit: read line")?);
            if ring.len() > n {
                ring.remove(0);
            }
        }
        Ok(ring)
    }

    /// Up to `n` lines ending `before` entries before the file tail, plus the
    /// new offset for the next scroll-back page. `before` is 1-indexed from
    /// the end.
    pub fn tail_before(&self, n: usize, before: usize) -> Result<(Vec<String>, usize)> {
        let _guard = self.inner.file.lock();
        let file = match File::open(&self.inner.file_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e).context("audit: open for tail_before"),
        };

        let mut all = Vec::new();
        for line in BufReader::new(file).lines() {
            all.push(line.context("audit: read line")?);
        }

        let total = all.len();
        if total == 0 {
            return Ok((Vec::new(), 0));
        }
        if before >= total {
            return Ok((Vec::new(), total));
        }

        let end = total - before;
        let start = end.saturating_sub(n);
        Ok((all[start..end].to_vec(), total - start))
    }

    /// Register a real-time subscriber. Unsubscribes on drop.
    pub fn subscribe(&self) -> AuditSubscription {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut clients) = self.inner.clients.write() {
            clients.insert(id, tx);
        }
        AuditSubscription {
            log: self.clone(),
            id,
            rx,
        }
    }

    fn unsubscribe(&self, id: u64) {
        if let Ok(mut clients) = self.inner.clients.write() {
            clients.remove(&id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .clients
            .read()
            .map(|clients| clients.len())
            .unwrap_or(0)
    }
}

pub struct AuditSubscription {
    log: AuditLog,
    id: u64,
    rx: mpsc::Receiver<AuditEntry>,
}

impl AuditSubscription {
    pub async fn recv(&mut self) -> Option<AuditEntry> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AuditEntry> {
        self.rx.try_recv().ok()
    }
}

impl Drop for AuditSubscription {
    fn drop(&mut self) {
        self.log.unsubscribe(self.id);
    }
}

/// Resolve the real client IP: first hop of `X-Forwarded-For`, else
/// `X-Real-Ip`, else the peer address with the port stripped.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let first = xff.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = xri.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}
