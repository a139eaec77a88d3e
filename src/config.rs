//! Static configuration, loaded once at startup from a TOML file.
//!
//! This, together with `main.rs`, stands in for the "command-line entry
//! point and static configuration loading" that the design treats as an
//! external collaborator specified only by its interface: the rest of the
//! crate only ever sees a parsed [`Config`].

use std::net::Ipv4Addr;

use serde::Deserialize;

use crate::error::StartupError;

fn env_port(var: &str, default: u16) -> u16 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Reads `DHCPPORT` (default 6767) and `DNSPORT` (default 5353).
pub fn dhcp_port() -> u16 {
    env_port("DHCPPORT", 6767)
}

pub fn dns_port() -> u16 {
    env_port("DNSPORT", 5353)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReservationConfig {
    pub hwaddr: String,
    pub address: Option<Ipv4Addr>,
    pub hostname: Option<String>,
    #[serde(default)]
    pub options: std::collections::HashMap<u8, Vec<u8>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub nameservers: Vec<Ipv4Addr>,
    pub domain: Option<String>,
    #[serde(default)]
    pub reservation: Vec<ReservationConfig>,
    pub state_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixedRecordConfig {
    pub name: String,
    pub rtype: String,
    pub rdata: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuffixForwardConfig {
    pub suffix: String,
    pub resolver: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DnsConfig {
    pub base_domain: Option<String>,
    #[serde(default)]
    pub upstreams: Vec<String>,
    #[serde(default)]
    pub fixed_record: Vec<FixedRecordConfig>,
    #[serde(default)]
    pub suffix_forward: Vec<SuffixForwardConfig>,
    pub docker_socket: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MdsConfig {
    #[serde(default)]
    pub public_keys: Vec<String>,
    pub bind: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub pool: Vec<PoolConfig>,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub mds: MdsConfig,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, StartupError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StartupError::Config(format!("reading {path}: {e}")))?;
        toml::from_str(&raw).map_err(|e| StartupError::Config(format!("parsing {path}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_pool() {
        let toml = r#"
            [[pool]]
            address = "10.3.2.1"
            netmask = "255.255.255.0"
            domain = "lxcnet"

            [[pool.reservation]]
            hwaddr = "5254009FCCD0"
            address = "10.3.2.20"
            hostname = "node01"
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.pool.len(), 1);
        assert_eq!(cfg.pool[0].address, Ipv4Addr::new(10, 3, 2, 1));
        assert_eq!(cfg.pool[0].reservation[0].hostname.as_deref(), Some("node01"));
    }

    #[test]
    fn dns_defaults_to_empty() {
        let cfg: Config = toml::from_str("").unwrap();
        assert!(cfg.dns.upstreams.is_empty());
        assert!(cfg.pool.is_empty());
    }
}
