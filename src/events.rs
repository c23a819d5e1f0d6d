//! Lease events and the sinks that receive them.
//!
//! The manager reports every lease transition to an [`EventSink`].
//! Delivery is best-effort: a sink failure is logged and surfaced next to
//! the operation result, but never undoes the lease change itself.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

use crate::client::{AddressFamily, ClientId, Parity};
use crate::error::{Error, Result};
use crate::lease::Lease;

/// Default capacity for [`BroadcastSink`] channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseEventKind {
    Assigned,
    Renewed,
    Released,
    Expired,
}

impl fmt::Display for LeaseEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LeaseEventKind::Assigned => "assigned",
            LeaseEventKind::Renewed => "renewed",
            LeaseEventKind::Released => "released",
            LeaseEventKind::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// A lease transition, carrying the lease as it stood afterwards (or, for
/// `Released` and `Expired`, as it stood when removed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseEvent {
    pub kind: LeaseEventKind,
    pub lease: Lease,
    pub at: DateTime<Utc>,
}

impl LeaseEvent {
    pub fn new(kind: LeaseEventKind, lease: Lease, at: DateTime<Utc>) -> Self {
        Self { kind, lease, at }
    }
}

/// Receiver of lease events, typically a persistence or audit store.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    ///
    /// Implementations that may block should expect to be cancelled: the
    /// manager bounds every call with its configured sink timeout.
    async fn notify(&self, event: &LeaseEvent) -> Result<()>;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn notify(&self, _event: &LeaseEvent) -> Result<()> {
        Ok(())
    }
}

/// Writes every event to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn notify(&self, event: &LeaseEvent) -> Result<()> {
        info!(
            kind = %event.kind,
            client = %event.lease.client,
            family = %event.lease.family,
            address = %event.lease.address,
            expires_at = %event.lease.expires_at,
            "Lease event"
        );
        Ok(())
    }
}

/// Publishes events on a tokio broadcast channel for in-process subscribers.
///
/// Events sent while nobody is subscribed are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<LeaseEvent>,
}

impl BroadcastSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn notify(&self, event: &LeaseEvent) -> Result<()> {
        match self.sender.send(event.clone()) {
            Ok(receivers) => debug!(kind = %event.kind, receivers, "Lease event published"),
            Err(_) => debug!(kind = %event.kind, "Lease event dropped (no subscribers)"),
        }
        Ok(())
    }
}

/// One line of the JSON-lines audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event: LeaseEventKind,
    pub mac_address: ClientId,
    pub family: AddressFamily,
    pub assigned_ip: IpAddr,
    pub lease_time_seconds: u32,
    pub mac_sum_parity: Parity,
    pub expires_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl From<&LeaseEvent> for AuditRecord {
    fn from(event: &LeaseEvent) -> Self {
        Self {
            event: event.kind,
            mac_address: event.lease.client,
            family: event.lease.family,
            assigned_ip: event.lease.address,
            lease_time_seconds: event.lease.lease_duration_seconds,
            mac_sum_parity: event.lease.client.octet_parity(),
            expires_at: event.lease.expires_at,
            timestamp: event.at,
        }
    }
}

/// Appends an [`AuditRecord`] per event to a file, one JSON object per line.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    /// Serializes appends so concurrent records never interleave.
    write_lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Reads back every record in the log. A missing file yields no records.
    pub async fn read_records(&self) -> Result<Vec<AuditRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Error::from))
            .collect()
    }
}

#[async_trait]
impl EventSink for JsonLinesSink {
    async fn notify(&self, event: &LeaseEvent) -> Result<()> {
        let mut line = serde_json::to_string(&AuditRecord::from(event))?;
        line.push('\n');

        let _lock = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|error| {
                Error::SinkUnavailable(format!("cannot open {}: {}", self.path.display(), error))
            })?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Forwards each event to several sinks.
///
/// Every sink is tried; the first failure is returned.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl EventSink for FanoutSink {
    async fn notify(&self, event: &LeaseEvent) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(error) = sink.notify(event).await
                && first_error.is_none()
            {
                first_error = Some(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
