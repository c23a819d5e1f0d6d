//! Assignable address state.
//!
//! IPv4 addresses come from a fixed contiguous range minus reserved
//! addresses; each is either free or leased. IPv6 addresses are never
//! pooled: they are derived from the client's hardware address with the
//! modified EUI-64 transform under the configured /64 prefix, so the space
//! is collision-free by construction and needs no bookkeeping.
//!
//! # Thread Safety
//!
//! The IPv4 free set sits behind a single [`Mutex`], so marking an address
//! leased or free is atomic with respect to concurrent allocations.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::client::{AddressFamily, ClientId};
use crate::config::Config;
use crate::error::{Error, Result};

/// Owner of IPv4 allocation state and the IPv6 derivation rule.
#[derive(Debug)]
pub struct AddressPool {
    config: Arc<Config>,
    /// Free IPv4 addresses, sorted so allocation always takes the lowest.
    free_v4: Mutex<BTreeSet<Ipv4Addr>>,
}

impl AddressPool {
    /// Builds a pool with every allocatable address in the range free.
    pub fn new(config: Arc<Config>) -> Self {
        let start = u32::from(config.v4_range_start);
        let end = u32::from(config.v4_range_end);
        let free_v4 = (start..=end)
            .map(Ipv4Addr::from)
            .filter(|ip| !config.is_reserved(*ip))
            .collect();

        Self {
            config,
            free_v4: Mutex::new(free_v4),
        }
    }

    /// Allocates an address for `client`.
    ///
    /// For V4 the lowest free address is marked leased and returned. For V6
    /// the EUI-64 derived address is returned and nothing is recorded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if no IPv4 address is free.
    pub async fn allocate(&self, family: AddressFamily, client: &ClientId) -> Result<IpAddr> {
        match family {
            AddressFamily::V4 => {
                let mut free = self.free_v4.lock().await;
                let ip = free.pop_first().ok_or(Error::PoolExhausted)?;
                debug!(client = %client, address = %ip, remaining = free.len(), "Allocated IPv4 address");
                Ok(IpAddr::V4(ip))
            }
            AddressFamily::V6 => Ok(IpAddr::V6(self.derive_v6(client))),
        }
    }

    /// Returns an address to the pool.
    ///
    /// No-op for IPv6, for addresses already free, and for addresses the
    /// pool never hands out (outside the range or reserved).
    pub async fn release(&self, address: IpAddr) {
        let IpAddr::V4(ip) = address else {
            return;
        };

        if !self.config.is_allocatable(ip) {
            return;
        }

        let mut free = self.free_v4.lock().await;
        if free.insert(ip) {
            debug!(address = %ip, free = free.len(), "Released IPv4 address");
        }
    }

    /// Marks a specific IPv4 address leased, e.g. when restoring a snapshot.
    ///
    /// Returns `false` if the address is not free to take.
    pub async fn claim(&self, ip: Ipv4Addr) -> bool {
        let mut free = self.free_v4.lock().await;
        free.remove(&ip)
    }

    /// Derives the IPv6 address for `client` under the configured prefix.
    pub fn derive_v6(&self, client: &ClientId) -> Ipv6Addr {
        derive_v6(self.config.v6_prefix, client)
    }

    pub async fn is_free(&self, ip: Ipv4Addr) -> bool {
        self.free_v4.lock().await.contains(&ip)
    }

    pub async fn free_count(&self) -> usize {
        self.free_v4.lock().await.len()
    }

    /// Number of IPv4 addresses the pool manages, leased or free.
    pub fn capacity(&self) -> u64 {
        self.config.allocatable_v4_count()
    }
}

/// Combines the upper 64 bits of `prefix` with the client's EUI-64 interface
/// identifier.
pub fn derive_v6(prefix: Ipv6Addr, client: &ClientId) -> Ipv6Addr {
    let mut octets = prefix.octets();
    octets[8..].copy_from_slice(&client.eui64());
    Ipv6Addr::from(octets)
}
