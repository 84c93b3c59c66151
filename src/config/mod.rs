use std::env;
use std::str::FromStr;

use crate::error::VlanError;
use crate::vlan::VlanRange;

/// Where activation state is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    /// Process memory only, lost on restart
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend {}", other)),
        }
    }
}

/// Config holds all application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub store_backend: StoreBackend,
    pub db_path: String,
    pub db_max_connections: u32,
    pub controller_id: String,
    pub vlan_min: u16,
    pub vlan_max: u16,
    pub etree_root_min: u16,
    pub etree_root_max: u16,
    pub etree_cpe_start: u16,
    pub etree_cpe_end: u16,
    pub etree_spe_base: u16,
    pub sip_delimiter: String,
    pub request_queue_depth: usize,
}

impl Config {
    /// Load configuration from environment variables (and `.env`) with defaults
    pub fn load() -> Self {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {}", path.display());
        }

        Self {
            store_backend: get_env_parsed("STORE_BACKEND", StoreBackend::Sqlite),
            db_path: get_env("DB_PATH", "/data/ce-provisioner.db"),
            db_max_connections: get_env_parsed("DB_MAX_CONNECTIONS", 5),
            controller_id: get_env("CONTROLLER_ID", "controller-1"),
            vlan_min: get_env_parsed("VLAN_MIN", 1),
            vlan_max: get_env_parsed("VLAN_MAX", 4093),
            etree_root_min: get_env_parsed("ETREE_ROOT_MIN", 2048),
            etree_root_max: get_env_parsed("ETREE_ROOT_MAX", 4093),
            etree_cpe_start: get_env_parsed("ETREE_CPE_START", 10),
            etree_cpe_end: get_env_parsed("ETREE_CPE_END", 19),
            etree_spe_base: get_env_parsed("ETREE_SPE_BASE", 1000),
            sip_delimiter: get_env("SIP_DELIMITER", ":"),
            request_queue_depth: get_env_parsed("REQUEST_QUEUE_DEPTH", 100),
        }
    }

    pub fn vlan_range(&self) -> Result<VlanRange, VlanError> {
        VlanRange::new(self.vlan_min, self.vlan_max)
    }

    pub fn etree_root_range(&self) -> Result<VlanRange, VlanError> {
        VlanRange::new(self.etree_root_min, self.etree_root_max)
    }

    pub fn etree_cpe_range(&self) -> Result<VlanRange, VlanError> {
        VlanRange::new(self.etree_cpe_start, self.etree_cpe_end)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Sqlite,
            db_path: "/data/ce-provisioner.db".to_string(),
            db_max_connections: 5,
            controller_id: "controller-1".to_string(),
            vlan_min: 1,
            vlan_max: 4093,
            etree_root_min: 2048,
            etree_root_max: 4093,
            etree_cpe_start: 10,
            etree_cpe_end: 19,
            etree_spe_base: 1000,
            sip_delimiter: ":".to_string(),
            request_queue_depth: 100,
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parsed variable, or `default` when unset or malformed
fn get_env_parsed<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}
