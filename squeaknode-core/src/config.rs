//! Node configuration, deserialized from a TOML file.
//!
//! Every section has workable defaults; a config file only overrides what
//! it names. Network-dependent defaults (ports) are resolved through
//! accessor methods rather than baked into the parsed struct.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use squeak_core::Network;

use crate::error::{NodeError, Result};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub network: NetworkSection,
    pub bitcoin: BitcoinConfig,
    pub lnd: LndConfig,
    pub node: NodeConfig,
    pub admin: AdminConfig,
    pub webadmin: WebAdminConfig,
}

/// `[network]` section: `name = "testnet"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub name: Network,
}

impl Default for NetworkSection {
    fn default() -> Self {
        NetworkSection {
            name: Network::Testnet,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BitcoinConfig {
    pub rpc_host: String,
    /// Defaults per network when unset.
    pub rpc_port: Option<u16>,
    pub rpc_user: String,
    pub rpc_pass: String,
    pub rpc_use_ssl: bool,
    pub rpc_ssl_cert: Option<PathBuf>,
    /// Parsed for compatibility; block notifications use RPC polling.
    pub zeromq_hashblock_port: u16,
}

impl Default for BitcoinConfig {
    fn default() -> Self {
        BitcoinConfig {
            rpc_host: "localhost".to_string(),
            rpc_port: None,
            rpc_user: String::new(),
            rpc_pass: String::new(),
            rpc_use_ssl: false,
            rpc_ssl_cert: None,
            zeromq_hashblock_port: 28334,
        }
    }
}

impl BitcoinConfig {
    pub fn rpc_port(&self, network: Network) -> u16 {
        self.rpc_port.unwrap_or(match network {
            Network::Mainnet => 8332,
            Network::Testnet => 18332,
            Network::Signet => 38332,
            Network::Regtest => 18443,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LndConfig {
    pub host: String,
    /// REST gateway port.
    pub rpc_port: u16,
    pub tls_cert_path: PathBuf,
    pub macaroon_path: PathBuf,
}

impl Default for LndConfig {
    fn default() -> Self {
        LndConfig {
            host: "localhost".to_string(),
            rpc_port: 8080,
            tls_cert_path: PathBuf::from("tls.cert"),
            macaroon_path: PathBuf::from("admin.macaroon"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub subscribe_invoices_retry_s: u64,
    pub squeak_deletion_interval_s: u64,
    pub offer_deletion_interval_s: u64,
    pub squeak_retention_s: u64,
    /// Default asking price for locked squeaks.
    pub price_msat: u64,
    /// Refuse new squeaks once the store holds this many.
    pub max_squeaks: u64,
    /// Ceiling on offers we are willing to pay; 0 disables the check.
    pub max_offer_price_msat: u64,
    pub peer_port: Option<u16>,
    pub external_address: Option<String>,
    pub max_peers: usize,
    /// Data directory; the database lives in a per-network subdirectory.
    pub sqk_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            subscribe_invoices_retry_s: 10,
            squeak_deletion_interval_s: 10,
            offer_deletion_interval_s: 10,
            squeak_retention_s: 7 * 24 * 3600,
            price_msat: 10_000,
            max_squeaks: 10_000,
            max_offer_price_msat: 0,
            peer_port: None,
            external_address: None,
            max_peers: 50,
            sqk_dir: PathBuf::from(".sqk"),
        }
    }
}

impl NodeConfig {
    pub fn peer_port(&self, network: Network) -> u16 {
        self.peer_port.unwrap_or(default_peer_port(network))
    }
}

pub fn default_peer_port(network: Network) -> u16 {
    match network {
        Network::Mainnet => 8555,
        Network::Testnet => 18555,
        Network::Signet => 28555,
        Network::Regtest => 18666,
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub rpc_enabled: bool,
    pub rpc_host: String,
    pub rpc_port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        AdminConfig {
            rpc_enabled: false,
            rpc_host: "localhost".to_string(),
            rpc_port: 8994,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebAdminConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_ssl: bool,
    pub login_disabled: bool,
    pub allow_cors: bool,
}

impl Default for WebAdminConfig {
    fn default() -> Self {
        WebAdminConfig {
            enabled: false,
            host: "localhost".to_string(),
            port: 12994,
            username: String::new(),
            password: String::new(),
            use_ssl: false,
            login_disabled: false,
            allow_cors: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            NodeError::Unavailable(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config> {
        toml::from_str(text)
            .map_err(|e| NodeError::Unavailable(format!("invalid config: {e}")))
    }

    pub fn network(&self) -> Network {
        self.network.name
    }

    /// Directory holding this network's database and state.
    pub fn data_dir(&self) -> PathBuf {
        self.node.sqk_dir.join(self.network().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.network(), Network::Testnet);
        assert_eq!(config.node.peer_port(config.network()), 18555);
        assert_eq!(config.bitcoin.rpc_port(config.network()), 18332);
        assert_eq!(config.node.price_msat, 10_000);
        assert!(!config.webadmin.enabled);
    }

    #[test]
    fn sections_override_defaults() {
        let text = r#"
            [network]
            name = "regtest"

            [bitcoin]
            rpc_host = "10.0.0.2"
            rpc_user = "user"
            rpc_pass = "pass"

            [node]
            price_msat = 1000
            peer_port = 7777

            [lnd]
            host = "lnd.local"
        "#;
        let config = Config::parse(text).unwrap();
        assert_eq!(config.network(), Network::Regtest);
        assert_eq!(config.bitcoin.rpc_host, "10.0.0.2");
        assert_eq!(config.bitcoin.rpc_port(config.network()), 18443);
        assert_eq!(config.node.price_msat, 1000);
        assert_eq!(config.node.peer_port(config.network()), 7777);
        assert_eq!(config.lnd.host, "lnd.local");
        assert_eq!(config.data_dir(), PathBuf::from(".sqk/regtest"));
    }

    #[test]
    fn rejects_malformed_config() {
        assert!(Config::parse("network = 12").is_err());
    }
}
