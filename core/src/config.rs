// Node and relay configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_name: String,
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Base URL of the relay, e.g. "http://relay.example:7445". Empty means
    /// no relay: direct delivery and the outbox only.
    #[serde(default)]
    pub relay_url: String,
    /// Advertise and browse on the LAN via mDNS.
    #[serde(default = "default_true")]
    pub enable_mdns: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "my-node".to_string(),
            host: "0.0.0.0".to_string(),
            port: 7443,
            data_dir: PathBuf::from("./agentmail_data"),
            relay_url: String::new(),
            enable_mdns: true,
        }
    }
}

impl NodeConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("mailbox.db")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    pub fn identity_path(&self) -> PathBuf {
        self.keys_dir().join("identity.json")
    }

    /// This node's routing address, `<name>@<name>.local`.
    pub fn address(&self) -> String {
        format!("{}@{}.local", self.node_name, self.node_name)
    }

    /// Relay base URL without a trailing slash, if one is configured.
    pub fn relay(&self) -> Option<String> {
        let trimmed = self.relay_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.keys_dir())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7445,
            data_dir: PathBuf::from("./relay_data"),
        }
    }
}

impl RelayConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("relay.db")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}
