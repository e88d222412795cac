use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Repair ticks shorter than this are clamped so the loop cannot spin a core.
pub const MIN_REPAIR_FREQUENCY_MS: u64 = 10;

/// Engine configuration.
///
/// `listen_addr`, `ctl_addr` and `log_level` are carried for the outer server
/// and control-plane collaborators; the engine itself only dials the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend transport. Only `tcp` is supported.
    pub network: String,
    /// Backend address, `host:port`.
    pub addr: String,
    /// Per-operation timeout (dial, read, write) in milliseconds.
    pub timeout_ms: u64,
    /// Whether this node is the master. Only the master runs repair.
    pub master: bool,
    pub repair_enabled: bool,
    pub repair_freq_ms: u64,
    /// Text values at or above this length are stored compressed. 0 disables.
    pub text_compress_threshold: usize,
    /// How many rows a single DELETE round removes before re-resolving ids.
    pub delete_chunk_size: usize,
    /// Upper bound on backend connections.
    pub max_conns: usize,
    pub listen_addr: String,
    pub ctl_addr: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: "tcp".to_string(),
            addr: "localhost:6379".to_string(),
            timeout_ms: 1000,
            master: true,
            repair_enabled: false,
            repair_freq_ms: 50,
            text_compress_threshold: 2048,
            delete_chunk_size: 100,
            max_conns: 16,
            listen_addr: "0.0.0.0:9977".to_string(),
            ctl_addr: "0.0.0.0:9966".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn repair_frequency(&self) -> Duration {
        Duration::from_millis(self.repair_freq_ms.max(MIN_REPAIR_FREQUENCY_MS))
    }
}
