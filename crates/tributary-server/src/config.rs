//! Environment-driven configuration for the pairing server and host binary.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PAIRING_PORT_START: u16 = 47360;
pub const DEFAULT_PAIRING_PORT_COUNT: u16 = 10;
pub const DEFAULT_CHANGE_TTL_SECS: u64 = 600;
pub const DEFAULT_ENRICHMENT_BASE_URL: &str = "https://v3-cinemeta.strem.io";

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone)]
pub struct PairingConfig {
    pub bind_addr: IpAddr,
    /// First candidate port.
    pub port_start: u16,
    /// Number of consecutive candidate ports.
    pub port_count: u16,
    /// How long a proposal stays confirmable.
    pub change_ttl: Duration,
    /// Upper bound on URLs in one proposal.
    pub max_proposed_urls: usize,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_start: DEFAULT_PAIRING_PORT_START,
            port_count: DEFAULT_PAIRING_PORT_COUNT,
            change_ttl: Duration::from_secs(DEFAULT_CHANGE_TTL_SECS),
            max_proposed_urls: 64,
        }
    }
}

impl PairingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_parse("PAIRING_BIND_ADDR").unwrap_or(defaults.bind_addr),
            port_start: env_parse("PAIRING_PORT_START").unwrap_or(defaults.port_start),
            port_count: env_parse::<u16>("PAIRING_PORT_COUNT")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.port_count),
            change_ttl: env_parse("PAIRING_CHANGE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.change_ttl),
            max_proposed_urls: defaults.max_proposed_urls,
        }
    }

    /// Candidate ports in bind order. Stops at `u16::MAX`.
    pub fn candidate_ports(&self) -> impl Iterator<Item = u16> {
        let start = self.port_start;
        (0..self.port_count).map_while(move |offset| start.checked_add(offset))
    }
}

/// Settings only the host binary needs.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub data_dir: PathBuf,
    pub enrichment_base_url: Option<String>,
}

impl HostConfig {
    pub fn from_env() -> Self {
        let enrichment_base_url = match std::env::var("ENRICHMENT_BASE_URL") {
            Ok(v) if v.trim().is_empty() || v.eq_ignore_ascii_case("off") => None,
            Ok(v) => Some(v.trim().to_string()),
            Err(_) => Some(DEFAULT_ENRICHMENT_BASE_URL.to_string()),
        };
        Self {
            data_dir: std::env::var("TRIBUTARY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            enrichment_base_url,
        }
    }
}
