//! Lease orchestration.
//!
//! The [`LeaseManager`] validates requests, consults the [`LeaseTable`],
//! draws addresses from the [`AddressPool`] and reports every transition to
//! the configured [`EventSink`].
//!
//! # Assignment
//!
//! 1. Parse the client identifier (no state is touched if it is malformed).
//! 2. Lock the `(client, family)` key in the table.
//! 3. An active lease is returned unchanged, or renewed when
//!    [`Config::renew_on_reassign`] is set.
//! 4. An expired lease is dropped and its address returned to the pool.
//! 5. A fresh address is allocated and the new lease stored.
//! 6. The key is unlocked and the event is delivered to the sink.
//!
//! # Thread Safety
//!
//! All operations on one key are linearized by the table's per-key lock, so
//! concurrent assignments for the same client never both allocate. The key
//! lock is always taken before the pool lock.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::client::{AddressFamily, ClientId, Parity};
use crate::clock::{SystemTimeSource, TimeSource};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventSink, LeaseEvent, LeaseEventKind};
use crate::lease::{Lease, LeaseKey, LeaseSnapshot, LeaseTable};
use crate::pool::AddressPool;

/// How an [`Assignment`] was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOutcome {
    /// A new lease was created.
    Created,
    /// An active lease already existed and was returned unchanged.
    Existing,
    /// An active lease already existed and its expiry was extended.
    Renewed,
}

/// Result of a successful assignment or renewal.
#[derive(Debug)]
pub struct Assignment {
    pub lease: Lease,
    pub outcome: AssignOutcome,
    /// First sink failure or timeout among the events this call emitted
    /// (the replaced lease's expiry, then the assignment); the lease still
    /// stands.
    pub sink_error: Option<Error>,
}

impl Assignment {
    pub fn parity(&self) -> Parity {
        self.lease.client.octet_parity()
    }
}

/// A lease removed by release or expiry.
#[derive(Debug)]
pub struct LeaseChange {
    pub lease: Lease,
    pub sink_error: Option<Error>,
}

/// Thread-safe lease manager over an address pool and lease table.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use leasewarden::{AddressFamily, Config, LeaseManager, LogSink};
///
/// # async fn example() -> leasewarden::Result<()> {
/// let manager = LeaseManager::new(Arc::new(Config::default()), Arc::new(LogSink));
/// let assignment = manager.assign("00:1A:2B:3C:4D:5E", AddressFamily::V4).await?;
/// println!("{}", assignment.lease.address);
/// # Ok(())
/// # }
/// ```
pub struct LeaseManager {
    config: Arc<Config>,
    pool: AddressPool,
    table: LeaseTable,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn TimeSource>,
}

impl LeaseManager {
    /// Creates an empty manager using the system clock.
    pub fn new(config: Arc<Config>, sink: Arc<dyn EventSink>) -> Self {
        Self::with_time_source(config, sink, Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(
        config: Arc<Config>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let pool = AddressPool::new(Arc::clone(&config));
        Self {
            config,
            pool,
            table: LeaseTable::new(),
            sink,
            clock,
        }
    }

    /// Creates a manager holding previously issued leases.
    ///
    /// Expired leases are kept, with their addresses still claimed, until the
    /// reaper or a new assignment reclaims them. When a key appears more than
    /// once the lease expiring last wins, and the same rule settles two
    /// clients claiming one IPv4 address. IPv4 leases whose address the pool
    /// cannot hand out (outside the range, reserved, or already claimed) are
    /// dropped with a warning.
    pub async fn restore(
        config: Arc<Config>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn TimeSource>,
        leases: impl IntoIterator<Item = Lease>,
    ) -> Self {
        let pool = AddressPool::new(Arc::clone(&config));

        let mut latest: HashMap<LeaseKey, Lease> = HashMap::new();
        for lease in leases {
            match latest.get(&lease.key()) {
                Some(kept) if kept.expires_at >= lease.expires_at => {}
                _ => {
                    latest.insert(lease.key(), lease);
                }
            }
        }

        // Latest expiry claims first, so a stale lease never displaces a live
        // one holding the same address.
        let mut candidates: Vec<Lease> = latest.into_values().collect();
        candidates.sort_by(|a, b| {
            b.expires_at
                .cmp(&a.expires_at)
                .then_with(|| a.key().cmp(&b.key()))
        });

        let mut restored = Vec::with_capacity(candidates.len());
        for lease in candidates {
            match (lease.family, lease.address) {
                (AddressFamily::V4, IpAddr::V4(ip)) => {
                    if !pool.claim(ip).await {
                        warn!(
                            client = %lease.client,
                            address = %ip,
                            "Dropping restored lease: address is not available in the pool"
                        );
                        continue;
                    }
                }
                (AddressFamily::V6, IpAddr::V6(_)) => {}
                (family, address) => {
                    warn!(
                        client = %lease.client,
                        %family,
                        %address,
                        "Dropping restored lease: address does not match its family"
                    );
                    continue;
                }
            }
            restored.push(lease);
        }

        info!(count = restored.len(), "Restored leases");

        Self {
            config,
            pool,
            table: LeaseTable::from_leases(restored),
            sink,
            clock,
        }
    }

    /// Creates a manager from the configured `leases_file`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(config: Arc<Config>, sink: Arc<dyn EventSink>) -> Result<Self> {
        Self::load_with_time_source(config, sink, Arc::new(SystemTimeSource)).await
    }

    pub async fn load_with_time_source(
        config: Arc<Config>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        match config.leases_file.clone() {
            Some(path) => {
                let snapshot = LeaseSnapshot::load(&path).await?;
                Ok(Self::restore(config, sink, clock, snapshot.leases).await)
            }
            None => Ok(Self::with_time_source(config, sink, clock)),
        }
    }

    /// Writes every lease to `path` as a [`LeaseSnapshot`].
    pub async fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let snapshot = LeaseSnapshot {
            leases: self.table.list_all().await,
        };
        snapshot.save(path).await
    }

    /// Saves to the configured `leases_file`; a no-op when none is set.
    pub async fn save(&self) -> Result<()> {
        match &self.config.leases_file {
            Some(path) => self.save_snapshot(path).await,
            None => Ok(()),
        }
    }

    /// Assigns an address of `family` to the client named by `client`.
    ///
    /// Repeat requests within the lease lifetime return the same lease.
    ///
    /// When the pool is exhausted after dropping the client's expired lease,
    /// the `Expired` event is still delivered but a sink failure on it is
    /// only logged, since the call itself fails.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidClientIdentifier`] if `client` is malformed.
    /// - [`Error::NoAddressAvailable`] if the IPv4 pool is exhausted.
    pub async fn assign(&self, client: &str, family: AddressFamily) -> Result<Assignment> {
        let client = ClientId::parse(client)?;
        self.assign_client(client, family).await
    }

    pub async fn assign_client(&self, client: ClientId, family: AddressFamily) -> Result<Assignment> {
        let mut entry = self.table.entry(LeaseKey::new(client, family)).await;
        let now = self.clock.now();

        if let Some(existing) = entry.get_mut()
            && existing.is_active_at(now)
        {
            if !self.config.renew_on_reassign {
                let lease = existing.clone();
                drop(entry);
                debug!(%client, %family, address = %lease.address, "Returning existing lease");
                return Ok(Assignment {
                    lease,
                    outcome: AssignOutcome::Existing,
                    sink_error: None,
                });
            }

            existing.renew(self.config.default_lease_seconds, now);
            let lease = existing.clone();
            drop(entry);
            info!(%client, %family, address = %lease.address, "Renewed lease on repeat request");
            let sink_error = self.publish(LeaseEventKind::Renewed, &lease, now).await;
            return Ok(Assignment {
                lease,
                outcome: AssignOutcome::Renewed,
                sink_error,
            });
        }

        let stale = entry.take();
        if let Some(stale) = &stale {
            self.pool.release(stale.address).await;
        }

        let address = match self.pool.allocate(family, &client).await {
            Ok(address) => address,
            Err(Error::PoolExhausted) => {
                drop(entry);
                warn!(%client, %family, "Address pool exhausted");
                if let Some(stale) = stale {
                    self.publish(LeaseEventKind::Expired, &stale, now).await;
                }
                return Err(Error::NoAddressAvailable);
            }
            Err(error) => return Err(error),
        };

        let lease = Lease::new(client, family, address, self.config.default_lease_seconds, now);
        entry.put(lease.clone());
        drop(entry);

        info!(
            %client,
            %family,
            %address,
            lease_seconds = lease.lease_duration_seconds,
            "Assigned lease"
        );

        let expired_error = match &stale {
            Some(stale) => self.publish(LeaseEventKind::Expired, stale, now).await,
            None => None,
        };
        let assigned_error = self.publish(LeaseEventKind::Assigned, &lease, now).await;

        Ok(Assignment {
            lease,
            outcome: AssignOutcome::Created,
            sink_error: expired_error.or(assigned_error),
        })
    }

    /// Extends an active lease by the configured duration from now.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidClientIdentifier`] if `client` is malformed.
    /// - [`Error::LeaseNotFound`] if the client holds no active lease.
    pub async fn renew(&self, client: &str, family: AddressFamily) -> Result<Assignment> {
        let client = ClientId::parse(client)?;
        let mut entry = self.table.entry(LeaseKey::new(client, family)).await;
        let now = self.clock.now();

        let lease = match entry.get_mut() {
            Some(lease) if lease.is_active_at(now) => {
                lease.renew(self.config.default_lease_seconds, now);
                lease.clone()
            }
            _ => {
                return Err(Error::LeaseNotFound {
                    client: client.to_string(),
                    family,
                });
            }
        };
        drop(entry);

        info!(%client, %family, address = %lease.address, "Renewed lease");
        let sink_error = self.publish(LeaseEventKind::Renewed, &lease, now).await;

        Ok(Assignment {
            lease,
            outcome: AssignOutcome::Renewed,
            sink_error,
        })
    }

    /// Ends the client's lease early and returns its address to the pool.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidClientIdentifier`] if `client` is malformed.
    /// - [`Error::LeaseNotFound`] if the client holds no lease.
    pub async fn release(&self, client: &str, family: AddressFamily) -> Result<LeaseChange> {
        let client = ClientId::parse(client)?;
        let mut entry = self.table.entry(LeaseKey::new(client, family)).await;
        let now = self.clock.now();

        let lease = entry.take().ok_or_else(|| Error::LeaseNotFound {
            client: client.to_string(),
            family,
        })?;
        self.pool.release(lease.address).await;
        drop(entry);

        info!(%client, %family, address = %lease.address, "Released lease");
        let sink_error = self.publish(LeaseEventKind::Released, &lease, now).await;

        Ok(LeaseChange { lease, sink_error })
    }

    /// Removes the lease under `key` if it has expired.
    ///
    /// Returns `None` when the key holds no lease or an active one.
    pub async fn expire_if_due(&self, key: LeaseKey) -> Option<LeaseChange> {
        let mut entry = self.table.entry(key).await;
        let now = self.clock.now();

        if !entry.get().is_some_and(|lease| lease.is_expired_at(now)) {
            return None;
        }

        let lease = entry.take()?;
        self.pool.release(lease.address).await;
        drop(entry);

        debug!(client = %lease.client, family = %lease.family, address = %lease.address, "Expired lease");
        let sink_error = self.publish(LeaseEventKind::Expired, &lease, now).await;

        Some(LeaseChange { lease, sink_error })
    }

    /// Returns the client's active lease, if any.
    pub async fn lookup(&self, client: &str, family: AddressFamily) -> Result<Option<Lease>> {
        let client = ClientId::parse(client)?;
        let now = self.clock.now();
        Ok(self
            .table
            .lookup(&client, family)
            .await
            .filter(|lease| lease.is_active_at(now)))
    }

    /// Active leases of `family`, oldest issue first.
    pub async fn list_active(&self, family: AddressFamily) -> Vec<Lease> {
        self.table.list_active(family, self.clock.now()).await
    }

    /// Every stored lease, including expired ones not yet reaped.
    pub async fn list_leases(&self) -> Vec<Lease> {
        self.table.list_all().await
    }

    pub async fn free_v4_count(&self) -> usize {
        self.pool.free_count().await
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn table(&self) -> &LeaseTable {
        &self.table
    }

    async fn publish(&self, kind: LeaseEventKind, lease: &Lease, at: DateTime<Utc>) -> Option<Error> {
        let event = LeaseEvent::new(kind, lease.clone(), at);
        let timeout = self.config.sink_timeout();

        let reason = match tokio::time::timeout(timeout, self.sink.notify(&event)).await {
            Ok(Ok(())) => return None,
            Ok(Err(Error::SinkUnavailable(reason))) => reason,
            Ok(Err(error)) => error.to_string(),
            Err(_) => format!("timed out after {}ms", timeout.as_millis()),
        };

        warn!(
            %kind,
            client = %lease.client,
            family = %lease.family,
            "Failed to deliver lease event: {}",
            reason
        );
        Some(Error::SinkUnavailable(reason))
    }
}
