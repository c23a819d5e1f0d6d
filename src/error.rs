//! Error types for the lease manager.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use crate::client::AddressFamily;

/// Errors that can occur while managing leases.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system I/O error (config, lease snapshot, or audit log).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The client identifier is not six colon-separated hex octets.
    ///
    /// Never worth retrying: the caller must correct the input.
    #[error("Invalid client identifier: {0:?}")]
    InvalidClientIdentifier(String),

    /// The requested address family is not one of V4 or V6.
    #[error("Invalid address family: {0:?}")]
    InvalidAddressFamily(String),

    /// Every allocatable IPv4 address in the pool is leased.
    ///
    /// Raised by [`AddressPool`](crate::AddressPool); the manager reports it
    /// to callers as [`Error::NoAddressAvailable`].
    #[error("No free addresses left in the IPv4 pool")]
    PoolExhausted,

    /// No address could be assigned to the client.
    ///
    /// The caller may retry later, once the reaper has reclaimed expired
    /// leases, or request an IPv6 lease instead.
    #[error("No available IP addresses")]
    NoAddressAvailable,

    /// The event sink failed or timed out.
    ///
    /// Soft failure: it never invalidates the lease it was reporting.
    #[error("Event sink unavailable: {0}")]
    SinkUnavailable(String),

    /// No active lease exists for the client in the given family.
    #[error("No active {family} lease for client {client}")]
    LeaseNotFound {
        client: String,
        family: AddressFamily,
    },

    /// Invalid operator configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A specialized Result type for lease operations.
pub type Result<T> = std::result::Result<T, Error>;
