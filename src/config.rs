//! Gate configuration, parsed from the TOML section the daemon hands to
//! the driver at prepare time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// SSH gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Where to listen for incoming SSH connections (default: "0.0.0.0:1022").
    /// After prepare this holds the concrete bound address, which matters
    /// when the configured port is 0.
    pub bind_address: String,

    /// Path to the server host key in OpenSSH format. Relative paths are
    /// resolved under the gate workdir. Empty means "<node_name>_id_ed25519".
    pub ssh_key: String,

    /// Name of the node this gate runs on, used for the default key path.
    pub node_name: String,

    /// Externally reachable `host:port` of this node, used to build the
    /// address advertised in issued credentials.
    pub node_address: String,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:1022".to_string(),
            ssh_key: String::new(),
            node_name: "fish-node".to_string(),
            node_address: String::new(),
        }
    }
}

impl GateConfig {
    /// Parse a TOML fragment and fill in the defaults. An empty fragment
    /// yields the default configuration.
    pub fn apply(config: &str) -> Result<Self> {
        let mut cfg: Self = if config.trim().is_empty() {
            Self::default()
        } else {
            toml::from_str(config).context("unable to apply the gate config")?
        };

        if cfg.bind_address.is_empty() {
            cfg.bind_address = "0.0.0.0:1022".to_string();
        }
        if cfg.ssh_key.is_empty() {
            cfg.ssh_key = format!("{}_id_ed25519", cfg.node_name);
        }

        Ok(cfg)
    }

    /// Host key path, with relative paths resolved under the workdir.
    pub fn key_path(&self, workdir: &Path) -> PathBuf {
        let path = PathBuf::from(&self.ssh_key);
        if path.is_absolute() {
            path
        } else {
            workdir.join(path)
        }
    }
}
