//! Client identifiers and address families.
//!
//! A client is identified by its 6-byte hardware (MAC) address. Input is
//! accepted in either case but must use the strict `XX:XX:XX:XX:XX:XX`
//! grammar; the canonical textual form is uppercase.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const OCTETS: usize = 6;

/// A 6-byte hardware address identifying a requesting device.
///
/// Equality and hashing are byte-wise, so `aa:bb:cc:dd:ee:ff` and
/// `AA:BB:CC:DD:EE:FF` name the same client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId([u8; OCTETS]);

/// Parity of the sum of a client's hardware address octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    Odd,
    Even,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parity::Odd => write!(f, "odd"),
            Parity::Even => write!(f, "even"),
        }
    }
}

impl ClientId {
    pub const fn new(octets: [u8; OCTETS]) -> Self {
        Self(octets)
    }

    /// Parses a hardware address, rejecting anything but six colon-separated
    /// pairs of hex digits.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || Error::InvalidClientIdentifier(input.to_string());

        let mut octets = [0u8; OCTETS];
        let mut groups = input.split(':');
        for octet in octets.iter_mut() {
            let group = groups.next().ok_or_else(invalid)?;
            if group.len() != 2 || !group.bytes().all(|byte| byte.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(group, 16).map_err(|_| invalid())?;
        }

        if groups.next().is_some() {
            return Err(invalid());
        }

        Ok(Self(octets))
    }

    pub fn octets(&self) -> [u8; OCTETS] {
        self.0
    }

    /// Derives the modified EUI-64 interface identifier (RFC 4291 appendix A).
    ///
    /// Flips the universal/local bit of the first octet and inserts `FF:FE`
    /// between the OUI and the device-specific half.
    pub fn eui64(&self) -> [u8; 8] {
        let mac = self.0;
        [
            mac[0] ^ 0x02,
            mac[1],
            mac[2],
            0xff,
            0xfe,
            mac[3],
            mac[4],
            mac[5],
        ]
    }

    /// Checks whether the octet sum is odd or even using its low bit.
    pub fn octet_parity(&self) -> Parity {
        let total: u32 = self.0.iter().map(|&octet| u32::from(octet)).sum();
        if total & 1 == 1 {
            Parity::Odd
        } else {
            Parity::Even
        }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for ClientId {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        Self::parse(input)
    }
}

impl TryFrom<String> for ClientId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ClientId> for String {
    fn from(client: ClientId) -> Self {
        client.to_string()
    }
}

/// Protocol family a lease is issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub const ALL: [AddressFamily; 2] = [AddressFamily::V4, AddressFamily::V6];
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "V4"),
            AddressFamily::V6 => write!(f, "V6"),
        }
    }
}

impl FromStr for AddressFamily {
    type Err = Error;

    /// Accepts `v4`/`ipv4`/`dhcpv4` and `v6`/`ipv6`/`dhcpv6`, in any case.
    fn from_str(input: &str) -> Result<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "v4" | "ipv4" | "dhcpv4" => Ok(AddressFamily::V4),
            "v6" | "ipv6" | "dhcpv6" => Ok(AddressFamily::V6),
            _ => Err(Error::InvalidAddressFamily(input.to_string())),
        }
    }
}
