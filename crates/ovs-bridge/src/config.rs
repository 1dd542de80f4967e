//! Driver configuration

use ovs_ovsdb::{tls, ClientConfig, DEFAULT_ENDPOINT, OPEN_VSWITCH_DB};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DriverError, Result};

/// Ownership marker written to `external_ids:owner` on every port the driver creates
pub const DEFAULT_OWNER: &str = "ovs-cni.network.kubevirt.io";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Comma-separated OVSDB endpoints (default: unix:/var/run/openvswitch/db.sock)
    #[serde(default = "default_endpoints")]
    pub endpoints: String,

    /// Database name (default: Open_vSwitch)
    #[serde(default = "default_database")]
    pub database: String,

    /// Connect and per-call timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Identity recorded on created ports and required to delete them
    #[serde(default = "default_owner")]
    pub owner: String,

    /// PEM files for ssl: endpoints
    #[serde(default)]
    pub tls: Option<TlsFiles>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsFiles {
    pub ca_cert: PathBuf,
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
}

fn default_endpoints() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_database() -> String {
    OPEN_VSWITCH_DB.to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_owner() -> String {
    DEFAULT_OWNER.to_string()
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            database: default_database(),
            timeout_seconds: default_timeout(),
            owner: default_owner(),
            tls: None,
        }
    }
}

impl DriverConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DriverError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| DriverError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Build the client configuration, loading TLS material if configured
    pub fn client_config(&self) -> Result<ClientConfig> {
        if self.owner.is_empty() {
            return Err(DriverError::Config("owner must not be empty".to_string()));
        }
        let mut config = ClientConfig::with_endpoints(self.endpoints.clone())
            .database(self.database.clone())
            .timeout(Duration::from_secs(self.timeout_seconds));
        if let Some(files) = &self.tls {
            config = config.tls(tls::load_client_config(
                &files.ca_cert,
                files.client_cert.as_deref(),
                files.client_key.as_deref(),
            )?);
        }
        Ok(config)
    }
}
