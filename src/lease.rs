//! Lease records and the lease table.
//!
//! The table is the sole owner of [`Lease`] records and is keyed by
//! `(client, family)`, so a client may hold at most one lease per family.
//!
//! # Thread Safety
//!
//! Each key has its own slot behind a [`Mutex`]; the map of slots sits
//! behind a [`RwLock`] that is only held long enough to find or create a
//! slot. Mutations of one key are serialized through [`LeaseTable::entry`],
//! while lookups and mutations of unrelated keys proceed concurrently.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::client::{AddressFamily, ClientId};
use crate::error::Result;

/// A time-bounded binding of an address to a client.
///
/// `expires_at` is always `issued_at + lease_duration_seconds`; a lease is
/// active while the current time is strictly before `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub client: ClientId,
    pub family: AddressFamily,
    pub address: IpAddr,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub lease_duration_seconds: u32,
}

impl Lease {
    pub fn new(
        client: ClientId,
        family: AddressFamily,
        address: IpAddr,
        duration_seconds: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            client,
            family,
            address,
            issued_at: now,
            expires_at: now + TimeDelta::seconds(i64::from(duration_seconds)),
            lease_duration_seconds: duration_seconds,
        }
    }

    pub fn key(&self) -> LeaseKey {
        LeaseKey::new(self.client, self.family)
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_active_at(now)
    }

    /// Re-issues the lease at `now` for `duration_seconds`, keeping the address.
    pub fn renew(&mut self, duration_seconds: u32, now: DateTime<Utc>) {
        self.issued_at = now;
        self.expires_at = now + TimeDelta::seconds(i64::from(duration_seconds));
        self.lease_duration_seconds = duration_seconds;
    }

    /// Returns seconds remaining until expiration, or 0 if expired.
    pub fn remaining_seconds_at(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// Lease table key: one lease per client per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseKey {
    pub client: ClientId,
    pub family: AddressFamily,
}

impl LeaseKey {
    pub fn new(client: ClientId, family: AddressFamily) -> Self {
        Self { client, family }
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client, self.family)
    }
}

type Slot = Arc<Mutex<Option<Lease>>>;

/// Exclusive access to one key of the table.
///
/// Holding an entry blocks every other mutation and lookup of the same key
/// until it is dropped.
pub struct LeaseEntry {
    key: LeaseKey,
    guard: OwnedMutexGuard<Option<Lease>>,
}

impl LeaseEntry {
    pub fn key(&self) -> LeaseKey {
        self.key
    }

    pub fn get(&self) -> Option<&Lease> {
        self.guard.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut Lease> {
        self.guard.as_mut()
    }

    /// Stores `lease` under this key, returning the lease it replaced.
    pub fn put(&mut self, lease: Lease) -> Option<Lease> {
        debug_assert_eq!(lease.key(), self.key);
        self.guard.replace(lease)
    }

    pub fn take(&mut self) -> Option<Lease> {
        self.guard.take()
    }
}

/// In-memory lease storage keyed by `(client, family)`.
#[derive(Debug, Default)]
pub struct LeaseTable {
    slots: RwLock<HashMap<LeaseKey, Slot>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table holding `leases`; later duplicates of a key win.
    pub fn from_leases(leases: impl IntoIterator<Item = Lease>) -> Self {
        let slots = leases
            .into_iter()
            .map(|lease| (lease.key(), Arc::new(Mutex::new(Some(lease)))))
            .collect();
        Self {
            slots: RwLock::new(slots),
        }
    }

    async fn slot(&self, key: LeaseKey) -> Slot {
        if let Some(slot) = self.slots.read().await.get(&key) {
            return Arc::clone(slot);
        }

        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(key).or_default())
    }

    async fn existing_slots(&self) -> Vec<Slot> {
        self.slots.read().await.values().cloned().collect()
    }

    /// Locks `key` for a serialized read-modify-write.
    pub async fn entry(&self, key: LeaseKey) -> LeaseEntry {
        let guard = self.slot(key).await.lock_owned().await;
        LeaseEntry { key, guard }
    }

    pub async fn lookup(&self, client: &ClientId, family: AddressFamily) -> Option<Lease> {
        let key = LeaseKey::new(*client, family);
        let slot = self.slots.read().await.get(&key).cloned()?;
        let lease = slot.lock().await.clone();
        lease
    }

    /// Inserts or replaces the lease for its `(client, family)` key.
    pub async fn put(&self, lease: Lease) -> Option<Lease> {
        self.entry(lease.key()).await.put(lease)
    }

    pub async fn remove(&self, client: &ClientId, family: AddressFamily) -> Option<Lease> {
        self.entry(LeaseKey::new(*client, family)).await.take()
    }

    /// Leases of `family` still active at `now`, oldest issue first.
    pub async fn list_active(&self, family: AddressFamily, now: DateTime<Utc>) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self
            .list_all()
            .await
            .into_iter()
            .filter(|lease| lease.family == family && lease.is_active_at(now))
            .collect();
        leases.sort_by_key(|lease| lease.issued_at);
        leases
    }

    /// Every stored lease, expired ones included, oldest issue first.
    pub async fn list_all(&self) -> Vec<Lease> {
        let mut leases = Vec::new();
        for slot in self.existing_slots().await {
            if let Some(lease) = slot.lock().await.clone() {
                leases.push(lease);
            }
        }
        leases.sort_by_key(|lease| lease.issued_at);
        leases
    }

    /// Keys that currently have a slot; some may have been emptied since.
    pub async fn keys(&self) -> Vec<LeaseKey> {
        self.slots.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.list_all().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops empty slots nobody is waiting on. Returns how many were dropped.
    pub async fn compact(&self) -> usize {
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || slot.try_lock().map_or(true, |lease| lease.is_some())
        });
        before - slots.len()
    }
}

/// On-disk form of the lease table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseSnapshot {
    pub leases: Vec<Lease>,
}

impl LeaseSnapshot {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn client(last: u8) -> ClientId {
        ClientId::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn v4_lease(last: u8, issued_at: DateTime<Utc>) -> Lease {
        Lease::new(
            client(last),
            AddressFamily::V4,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, last)),
            3600,
            issued_at,
        )
    }

    #[test]
    fn test_lease_struct() {
        let now = Utc::now();
        let lease = v4_lease(10, now);
        assert_eq!(lease.expires_at, lease.issued_at + TimeDelta::seconds(3600));
        assert!(lease.is_active_at(now));
        assert!(lease.remaining_seconds_at(now) >= 3599);

        let at_expiry = lease.expires_at;
        assert!(lease.is_expired_at(at_expiry));
        assert_eq!(lease.remaining_seconds_at(at_expiry + TimeDelta::seconds(5)), 0);

        let mut renewable = lease.clone();
        let later = now + TimeDelta::seconds(1800);
        renewable.renew(7200, later);
        assert_eq!(renewable.address, lease.address);
        assert_eq!(renewable.issued_at, later);
        assert_eq!(renewable.expires_at, later + TimeDelta::seconds(7200));
        assert_eq!(renewable.lease_duration_seconds, 7200);
    }

    #[tokio::test]
    async fn test_put_lookup_remove() {
        let table = LeaseTable::new();
        let lease = v4_lease(10, Utc::now());

        assert!(table.lookup(&client(10), AddressFamily::V4).await.is_none());
        assert!(table.put(lease.clone()).await.is_none());
        assert_eq!(table.lookup(&client(10), AddressFamily::V4).await, Some(lease.clone()));
        assert!(table.lookup(&client(10), AddressFamily::V6).await.is_none());

        assert_eq!(table.remove(&client(10), AddressFamily::V4).await, Some(lease));
        assert!(table.lookup(&client(10), AddressFamily::V4).await.is_none());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_put_replaces_existing_key() {
        let table = LeaseTable::new();
        let now = Utc::now();
        let first = v4_lease(10, now);
        let mut second = first.clone();
        second.renew(60, now + TimeDelta::seconds(5));

        table.put(first.clone()).await;
        assert_eq!(table.put(second.clone()).await, Some(first));
        assert_eq!(table.len().await, 1);
        assert_eq!(table.lookup(&client(10), AddressFamily::V4).await, Some(second));
    }

    #[tokio::test]
    async fn test_list_active_filters_and_orders() {
        let table = LeaseTable::new();
        let now = Utc::now();

        let newer = v4_lease(11, now);
        let older = v4_lease(12, now - TimeDelta::seconds(600));
        let expired = v4_lease(13, now - TimeDelta::seconds(7200));
        let v6 = Lease::new(
            client(14),
            AddressFamily::V6,
            "2001:db8::1".parse().unwrap(),
            3600,
            now,
        );

        for lease in [newer.clone(), older.clone(), expired.clone(), v6.clone()] {
            table.put(lease).await;
        }

        assert_eq!(table.list_active(AddressFamily::V4, now).await, vec![older, newer]);
        assert_eq!(table.list_active(AddressFamily::V6, now).await, vec![v6]);
        assert_eq!(table.list_all().await.len(), 4);
        assert_eq!(table.list_all().await[0], expired);
    }

    #[tokio::test]
    async fn test_entry_serializes_same_key() {
        let table = Arc::new(LeaseTable::new());
        let key = LeaseKey::new(client(10), AddressFamily::V4);

        let mut entry = table.entry(key).await;

        let waiting = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.lookup(&client(10), AddressFamily::V4).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        let unrelated = table.lookup(&client(11), AddressFamily::V4).await;
        assert!(unrelated.is_none());

        let lease = v4_lease(10, Utc::now());
        entry.put(lease.clone());
        drop(entry);

        assert_eq!(waiting.await.unwrap(), Some(lease));
    }

    #[tokio::test]
    async fn test_compact_drops_only_idle_empty_slots() {
        let table = LeaseTable::new();
        table.put(v4_lease(10, Utc::now())).await;
        table.put(v4_lease(11, Utc::now())).await;
        table.remove(&client(11), AddressFamily::V4).await;

        let held = table.entry(LeaseKey::new(client(12), AddressFamily::V4)).await;

        assert_eq!(table.keys().await.len(), 3);
        assert_eq!(table.compact().await, 1);
        assert_eq!(table.keys().await.len(), 2);

        drop(held);
        assert_eq!(table.compact().await, 1);
        assert_eq!(table.keys().await, vec![LeaseKey::new(client(10), AddressFamily::V4)]);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        struct TestGuard(String);
        impl Drop for TestGuard {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
            }
        }

        let path = "test_lease_snapshot.json".to_string();
        let _guard = TestGuard(path.clone());

        let missing = LeaseSnapshot::load(&path).await.unwrap();
        assert!(missing.leases.is_empty());

        let lease = v4_lease(10, Utc::now());
        LeaseSnapshot {
            leases: vec![lease.clone()],
        }
        .save(&path)
        .await
        .unwrap();

        let loaded = LeaseSnapshot::load(&path).await.unwrap();
        assert_eq!(loaded.leases, vec![lease]);
    }
}
