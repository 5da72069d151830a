use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use kestrel_net::{IpFilter, MAX_MULTICAST_GROUPS, StackConfig};

use crate::error::{Result, TftpError};
use crate::mtftp::MtftpInfo;
use crate::packet::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, TFTP_PORT};
use crate::session::{DEFAULT_RETRIES, TransferOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Network interface the raw-frame NIC binds to.
    pub interface: String,
    pub station_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub server_ip: Ipv4Addr,
    pub server_port: u16,
    /// Resolve uncached next hops with active ARP.
    pub auto_arp: bool,
    pub ttl: u8,
    pub tos: u8,
    /// Block size to request (RFC 2348); 512 sends no option.
    pub block_size: usize,
    /// Request 64-bit block numbers for very large transfers.
    pub big_blocks: bool,
    /// Ask the server to allow overwriting on upload.
    pub overwrite: bool,
    pub timeout_secs: u64,
    pub retries: u32,
    pub filter: FilterConfig,
    pub multicast: MtftpConfig,
    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            station_ip: Ipv4Addr::UNSPECIFIED,
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: None,
            server_ip: Ipv4Addr::UNSPECIFIED,
            server_port: TFTP_PORT,
            auto_arp: true,
            ttl: 16,
            tos: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            big_blocks: false,
            overwrite: false,
            timeout_secs: 5,
            retries: DEFAULT_RETRIES,
            filter: FilterConfig::default(),
            multicast: MtftpConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Destination filter installed when a session opens. Unicast traffic to
/// the station is always accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Accept datagrams addressed to the broadcast addresses.
    pub broadcast: bool,
    pub promiscuous: bool,
    pub promiscuous_multicast: bool,
    /// Multicast groups to join at startup; at most 8.
    pub groups: Vec<Ipv4Addr>,
}

/// Multicast TFTP parameters, normally handed out by the boot server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MtftpConfig {
    pub enabled: bool,
    pub group: Ipv4Addr,
    pub client_port: u16,
    pub server_port: u16,
    pub listen_timeout_secs: u64,
    pub transmit_timeout_secs: u64,
}

impl Default for MtftpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group: Ipv4Addr::new(224, 0, 1, 1),
            client_port: 1758,
            server_port: 1759,
            listen_timeout_secs: 10,
            transmit_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

impl ClientConfig {
    pub fn stack_config(&self) -> StackConfig {
        let mut cfg = StackConfig::new(self.station_ip, self.subnet_mask);
        cfg.gateway = self.gateway;
        cfg.ttl = self.ttl;
        cfg.tos = self.tos;
        cfg.auto_arp = self.auto_arp;
        cfg
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            block_size: self.block_size,
            big_blocks: self.big_blocks,
            overwrite: self.overwrite,
            timeout: Duration::from_secs(self.timeout_secs),
            retries: self.retries,
        }
    }

    pub fn ip_filter(&self) -> IpFilter {
        IpFilter {
            station: true,
            broadcast: self.filter.broadcast,
            promiscuous: self.filter.promiscuous,
            promiscuous_multicast: self.filter.promiscuous_multicast,
            groups: self.filter.groups.clone(),
        }
    }

    pub fn mtftp_info(&self) -> MtftpInfo {
        MtftpInfo {
            group: self.multicast.group,
            client_port: self.multicast.client_port,
            server_port: self.multicast.server_port,
            listen_timeout: Duration::from_secs(self.multicast.listen_timeout_secs),
            transmit_timeout: Duration::from_secs(self.multicast.transmit_timeout_secs),
        }
    }
}

pub fn load_config(path: &Path) -> Result<ClientConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: ClientConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Config(format!("invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    write_config(path, &ClientConfig::default())
}

pub fn write_config(path: &Path, config: &ClientConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Config(format!("failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn validate_config(config: &ClientConfig) -> Result<()> {
    if config.station_ip.is_unspecified() || config.station_ip.is_multicast() {
        return Err(TftpError::Config(
            "station_ip must be a unicast address".to_string(),
        ));
    }
    if !mask_is_contiguous(config.subnet_mask) {
        return Err(TftpError::Config(
            "subnet_mask must be a contiguous netmask".to_string(),
        ));
    }
    if config.server_ip.is_unspecified() || config.server_ip.is_multicast() {
        return Err(TftpError::Config(
            "server_ip must be a unicast address".to_string(),
        ));
    }
    if let Some(gw) = config.gateway
        && (gw.is_unspecified() || gw.is_multicast() || gw.is_broadcast())
    {
        return Err(TftpError::Config(
            "gateway must be a unicast address".to_string(),
        ));
    }
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&config.block_size) {
        return Err(TftpError::Config(format!(
            "block_size must be in range {}-{}",
            MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
        )));
    }
    if config.retries == 0 {
        return Err(TftpError::Config("retries must be at least 1".to_string()));
    }
    if config.timeout_secs == 0 {
        return Err(TftpError::Config(
            "timeout_secs must be at least 1".to_string(),
        ));
    }
    if config.server_port == 0 {
        return Err(TftpError::Config(
            "server_port must be non-zero".to_string(),
        ));
    }

    if config.filter.groups.len() > MAX_MULTICAST_GROUPS {
        return Err(TftpError::Config(format!(
            "at most {} filter groups may be configured",
            MAX_MULTICAST_GROUPS
        )));
    }
    for group in &config.filter.groups {
        if !group.is_multicast() {
            return Err(TftpError::Config(format!(
                "filter group {} is not a class D address",
                group
            )));
        }
    }

    if config.multicast.enabled {
        validate_mtftp_config(&config.multicast)?;
    }
    Ok(())
}

pub fn validate_mtftp_config(config: &MtftpConfig) -> Result<()> {
    if !config.group.is_multicast() {
        return Err(TftpError::Config(
            "multicast group must be a class D address".to_string(),
        ));
    }
    if config.client_port == 0 || config.server_port == 0 {
        return Err(TftpError::Config(
            "multicast ports must be non-zero".to_string(),
        ));
    }
    if config.listen_timeout_secs == 0 {
        return Err(TftpError::Config(
            "listen_timeout_secs must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn mask_is_contiguous(mask: Ipv4Addr) -> bool {
    let m = u32::from(mask);
    m != 0 && m.count_ones() + m.trailing_zeros() == 32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ClientConfig {
        ClientConfig {
            station_ip: Ipv4Addr::new(192, 168, 1, 2),
            server_ip: Ipv4Addr::new(192, 168, 1, 10),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn parses_minimal_toml() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let toml = r#"
station_ip = "192.168.1.2"
subnet_mask = "255.255.255.0"
server_ip = "192.168.1.10"

[multicast]
enabled = true
group = "224.0.1.1"
"#;
        let config: ClientConfig = toml::from_str(toml)?;
        validate_config(&config)?;
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.multicast.client_port, 1758);
        Ok(())
    }

    #[test]
    fn rejects_unspecified_station() {
        let config = ClientConfig {
            server_ip: Ipv4Addr::new(192, 168, 1, 10),
            ..ClientConfig::default()
        };
        match validate_config(&config) {
            Err(err) => assert!(format!("{err}").contains("station_ip")),
            Ok(()) => panic!("expected error for unspecified station_ip"),
        }
    }

    #[test]
    fn rejects_non_contiguous_mask() {
        let config = ClientConfig {
            subnet_mask: Ipv4Addr::new(255, 0, 255, 0),
            ..valid_config()
        };
        match validate_config(&config) {
            Err(err) => assert!(format!("{err}").contains("subnet_mask")),
            Ok(()) => panic!("expected error for non-contiguous mask"),
        }
    }

    #[test]
    fn rejects_block_size_out_of_range() {
        for size in [0usize, 4, 70000] {
            let config = ClientConfig {
                block_size: size,
                ..valid_config()
            };
            assert!(validate_config(&config).is_err(), "size {size} accepted");
        }
    }

    #[test]
    fn parses_filter_section() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let toml = r#"
station_ip = "192.168.1.2"
server_ip = "192.168.1.10"

[filter]
broadcast = true
groups = ["224.0.1.5", "239.1.1.1"]
"#;
        let config: ClientConfig = toml::from_str(toml)?;
        validate_config(&config)?;
        let filter = config.ip_filter();
        assert!(filter.station);
        assert!(filter.broadcast);
        assert!(!filter.promiscuous);
        assert_eq!(filter.groups.len(), 2);
        assert_eq!(filter.groups[0], Ipv4Addr::new(224, 0, 1, 5));
        Ok(())
    }

    #[test]
    fn rejects_too_many_filter_groups() {
        let mut config = valid_config();
        config.filter.groups = (0..9).map(|i| Ipv4Addr::new(224, 0, 1, i)).collect();
        match validate_config(&config) {
            Err(err) => assert!(format!("{err}").contains("filter groups")),
            Ok(()) => panic!("expected error for 9 filter groups"),
        }
    }

    #[test]
    fn rejects_unicast_filter_group() {
        let mut config = valid_config();
        config.filter.groups = vec![Ipv4Addr::new(10, 0, 0, 1)];
        match validate_config(&config) {
            Err(err) => assert!(format!("{err}").contains("filter group")),
            Ok(()) => panic!("expected error for unicast filter group"),
        }
    }

    #[test]
    fn rejects_non_multicast_group() {
        let mut config = valid_config();
        config.multicast.enabled = true;
        config.multicast.group = Ipv4Addr::new(192, 168, 1, 5);
        match validate_config(&config) {
            Err(err) => assert!(format!("{err}").contains("class D")),
            Ok(()) => panic!("expected error for unicast group"),
        }
    }

    #[test]
    fn disabled_multicast_skips_group_check() {
        let mut config = valid_config();
        config.multicast.enabled = false;
        config.multicast.group = Ipv4Addr::new(192, 168, 1, 5);
        validate_config(&config).expect("disabled multicast should not be validated");
    }

    #[test]
    fn config_write_read_roundtrip() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "kestrel_config_test_{}_{:?}.toml",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)?
                .as_nanos()
        ));

        let mut config = valid_config();
        config.block_size = 1432;
        config.multicast.enabled = true;
        write_config(&path, &config)?;

        let loaded = load_config(&path)?;
        std::fs::remove_file(&path)?;
        assert_eq!(loaded.block_size, 1432);
        assert_eq!(loaded.station_ip, config.station_ip);
        assert!(loaded.multicast.enabled);
        Ok(())
    }
}
