use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Which side of the protocol this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Coordinator,
    Agent,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub mode: Mode,
    pub multicast_address: Ipv4Addr,
    pub datagram_server_port: u16,
    pub datagram_client_port: u16,
    /// Agent control listener; announced in discovery datagrams.
    pub tcp_port: u16,
    /// Coordinator listener for bundle-transfer sockets.
    pub transfer_port: u16,
    pub environment: String,
    pub roles: Vec<String>,
    pub git_dir: PathBuf,
    pub apps_dir: PathBuf,
    pub config_dir: PathBuf,
    pub branch: String,
    pub reconnect_delay_ms: u64,
    pub discovery_interval_ms: u64,
    pub version_report_interval_secs: u64,
    pub challenge_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Agent,
            multicast_address: Ipv4Addr::new(230, 1, 2, 3),
            datagram_server_port: 5001,
            datagram_client_port: 5002,
            tcp_port: 5003,
            transfer_port: 5004,
            environment: "production".into(),
            roles: Vec::new(),
            git_dir: std::env::temp_dir().join("reparto-git"),
            apps_dir: std::env::temp_dir().join("reparto-apps"),
            config_dir: std::env::temp_dir().join("reparto-config"),
            branch: "master".into(),
            reconnect_delay_ms: 1000,
            discovery_interval_ms: 1000,
            version_report_interval_secs: 30,
            challenge_ttl_secs: 60,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::figment()
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("reparto.toml"))
            .merge(Json::file("reparto.json"))
            .merge(Env::prefixed("REPARTO_"))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn version_report_interval(&self) -> Duration {
        Duration::from_secs(self.version_report_interval_secs)
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.reconnect_delay(), Duration::from_millis(1000));
        assert_eq!(config.discovery_interval(), Duration::from_millis(1000));
        assert_eq!(config.multicast_address, Ipv4Addr::new(230, 1, 2, 3));
        assert_eq!(config.mode, Mode::Agent);
    }

    #[test]
    fn defaults_survive_a_figment_round_trip() {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .extract()
            .unwrap();
        assert_eq!(config.tcp_port, 5003);
        assert_eq!(config.branch, "master");
    }
}
