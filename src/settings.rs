use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

/// Process-wide broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Root directory; each topic lives under `<storage_dir>/topics/<name>`.
    pub storage_dir: PathBuf,
    /// Messages per segment file before the log rolls to the next one.
    pub segment_split: u64,
    /// Addresses to bind; empty means one wildcard listener.
    pub bind_addrs: Vec<IpAddr>,
    pub port: u16,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./data"),
            segment_split: 10_000,
            bind_addrs: Vec::new(),
            port: 9044,
        }
    }
}
