//! # leasewarden
//!
//! A DHCP-style lease manager: hands out IPv4 addresses from a fixed pool,
//! derives IPv6 addresses from hardware addresses with EUI-64, and reclaims
//! leases once they expire.
//!
//! ## Features
//!
//! - Sequential, deterministic IPv4 allocation with reserved addresses
//! - Stateless EUI-64 IPv6 derivation under a configurable /64 prefix
//! - One lease per client per family, serialized per key
//! - Background expiry reaper
//! - Best-effort lease events with a bounded sink timeout
//! - Optional JSON snapshot persistence, safe to share between processes
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use leasewarden::{AddressFamily, Config, ExpiryReaper, LeaseManager, LogSink};
//!
//! #[tokio::main]
//! async fn main() -> leasewarden::Result<()> {
//!     let config = Arc::new(Config::load_or_create("config.json")?);
//!     let manager = Arc::new(LeaseManager::load(config, Arc::new(LogSink)).await?);
//!
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     ExpiryReaper::new(Arc::clone(&manager)).spawn(shutdown_rx);
//!
//!     let assignment = manager.assign("00:1A:2B:3C:4D:5E", AddressFamily::V4).await?;
//!     println!("{}", assignment.lease.address);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`AddressPool`] - IPv4 free/leased state and the IPv6 derivation rule
//! - [`LeaseTable`] - Lease records keyed by client and family
//! - [`LeaseManager`] - Assign, renew, release, and expire
//! - [`ExpiryReaper`] - Periodic reclamation of expired leases
//! - [`EventSink`] - Receiver of lease events (log, audit file, channel)
//! - [`LeaseSession`] - Locked load/save cycle on a shared `leases_file`

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod lease;
pub mod manager;
pub mod pool;
pub mod reaper;
pub mod store;

pub use client::{AddressFamily, ClientId, Parity};
pub use clock::{ManualTimeSource, SystemTimeSource, TimeSource};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{
    AuditRecord, BroadcastSink, EventSink, FanoutSink, JsonLinesSink, LeaseEvent, LeaseEventKind,
    LogSink, NullSink,
};
pub use lease::{Lease, LeaseKey, LeaseSnapshot, LeaseTable};
pub use manager::{AssignOutcome, Assignment, LeaseChange, LeaseManager};
pub use pool::{AddressPool, derive_v6};
pub use reaper::{ExpiryReaper, StoreReaper, SweepReport};
pub use store::{LeaseSession, StoreLock};
