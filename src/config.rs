use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Largest IPv4 range the pool will track (a /16).
pub const MAX_V4_RANGE_SIZE: u64 = 1 << 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub v4_range_start: Ipv4Addr,
    pub v4_range_end: Ipv4Addr,
    pub v4_reserved: Vec<Ipv4Addr>,
    pub v6_prefix: Ipv6Addr,
    pub default_lease_seconds: u32,
    pub reaper_interval_seconds: u64,
    pub renew_on_reassign: bool,
    pub sink_timeout_millis: u64,
    pub leases_file: Option<String>,
    pub events_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            v4_range_start: Ipv4Addr::new(192, 168, 1, 10),
            v4_range_end: Ipv4Addr::new(192, 168, 1, 254),
            v4_reserved: Vec::new(),
            v6_prefix: Ipv6Addr::new(0x2001, 0x0db8, 0, 0, 0, 0, 0, 0),
            default_lease_seconds: 3600,
            reaper_interval_seconds: 30,
            renew_on_reassign: false,
            sink_timeout_millis: 2000,
            leases_file: Some("leases.json".to_string()),
            events_file: None,
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let start = u32::from(self.v4_range_start);
        let end = u32::from(self.v4_range_end);

        if start > end {
            return Err(Error::InvalidConfig(
                "v4_range_start must be less than or equal to v4_range_end".to_string(),
            ));
        }

        if self.range_size() > MAX_V4_RANGE_SIZE {
            return Err(Error::InvalidConfig(format!(
                "v4 range {} - {} spans {} addresses, more than the limit of {}",
                self.v4_range_start,
                self.v4_range_end,
                self.range_size(),
                MAX_V4_RANGE_SIZE
            )));
        }

        if self.allocatable_v4_count() == 0 {
            return Err(Error::InvalidConfig(
                "v4_reserved leaves no allocatable address in the range".to_string(),
            ));
        }

        if u128::from(self.v6_prefix) & u128::from(u64::MAX) != 0 {
            return Err(Error::InvalidConfig(format!(
                "v6_prefix {} must be a /64 (low 64 bits zero)",
                self.v6_prefix
            )));
        }

        if self.default_lease_seconds == 0 {
            return Err(Error::InvalidConfig(
                "default_lease_seconds must be greater than 0".to_string(),
            ));
        }

        if self.reaper_interval_seconds == 0 {
            return Err(Error::InvalidConfig(
                "reaper_interval_seconds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn ip_in_range(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        let start = u32::from(self.v4_range_start);
        let end = u32::from(self.v4_range_end);
        addr >= start && addr <= end
    }

    pub fn is_reserved(&self, ip: Ipv4Addr) -> bool {
        self.v4_reserved.contains(&ip)
    }

    /// Whether the pool may ever hand out `ip`.
    pub fn is_allocatable(&self, ip: Ipv4Addr) -> bool {
        self.ip_in_range(ip) && !self.is_reserved(ip)
    }

    pub fn range_size(&self) -> u64 {
        u64::from(u32::from(self.v4_range_end))
            .saturating_sub(u64::from(u32::from(self.v4_range_start)))
            + 1
    }

    pub fn allocatable_v4_count(&self) -> u64 {
        let reserved_in_range = self
            .v4_reserved
            .iter()
            .filter(|ip| self.ip_in_range(**ip))
            .collect::<BTreeSet<_>>()
            .len() as u64;
        self.range_size().saturating_sub(reserved_in_range)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestGuard(String);
    impl Drop for TestGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_range_start_greater_than_end() {
        let config = Config {
            v4_range_start: Ipv4Addr::new(192, 168, 1, 200),
            v4_range_end: Ipv4Addr::new(192, 168, 1, 100),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_range_rejected() {
        let config = Config {
            v4_range_start: Ipv4Addr::new(0, 0, 0, 0),
            v4_range_end: Ipv4Addr::new(255, 255, 255, 255),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = Config {
            v4_range_start: Ipv4Addr::new(10, 0, 0, 0),
            v4_range_end: Ipv4Addr::new(10, 1, 0, 0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            v4_range_start: Ipv4Addr::new(10, 0, 0, 0),
            v4_range_end: Ipv4Addr::new(10, 0, 255, 255),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fully_reserved_range() {
        let config = Config {
            v4_range_start: Ipv4Addr::new(10, 0, 0, 1),
            v4_range_end: Ipv4Addr::new(10, 0, 0, 2),
            v4_reserved: vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_v6_prefix_must_be_slash_64() {
        let config = Config {
            v6_prefix: "2001:db8::1".parse().unwrap(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            v6_prefix: "fd00:1:2:3::".parse().unwrap(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_durations_rejected() {
        let config = Config {
            default_lease_seconds: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            reaper_interval_seconds: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_allocatable() {
        let config = Config {
            v4_reserved: vec![Ipv4Addr::new(192, 168, 1, 20), Ipv4Addr::new(192, 168, 1, 1)],
            ..Default::default()
        };
        assert!(config.is_allocatable(Ipv4Addr::new(192, 168, 1, 10)));
        assert!(!config.is_allocatable(Ipv4Addr::new(192, 168, 1, 20)));
        assert!(!config.is_allocatable(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!config.is_allocatable(Ipv4Addr::new(192, 168, 1, 255)));
    }

    #[test]
    fn test_pool_counts() {
        let config = Config::default();
        assert_eq!(config.range_size(), 245);
        assert_eq!(config.allocatable_v4_count(), 245);

        let config = Config {
            v4_reserved: vec![
                Ipv4Addr::new(192, 168, 1, 20),
                Ipv4Addr::new(192, 168, 1, 20),
                Ipv4Addr::new(192, 168, 1, 1),
            ],
            ..Default::default()
        };
        assert_eq!(config.allocatable_v4_count(), 244);
    }

    #[test]
    fn test_load_or_create_round_trip() {
        let path = "test_config_load_or_create.json".to_string();
        let _guard = TestGuard(path.clone());

        let created = Config::load_or_create(&path).unwrap();
        assert!(Path::new(&path).exists());

        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(loaded.v4_range_start, created.v4_range_start);
        assert_eq!(loaded.v6_prefix, created.v6_prefix);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "default_lease_seconds": 120 }"#).unwrap();
        assert_eq!(config.default_lease_seconds, 120);
        assert_eq!(config.v4_range_start, Ipv4Addr::new(192, 168, 1, 10));
    }
}
