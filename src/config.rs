//! Server configuration.
//!
//! Settings are layered: `tether.toml` on disk, then environment
//! (`TETHER_AGENT_CMD`), then CLI flags applied by the binary. Every field
//! has a default so an empty config file — or none at all — yields a
//! runnable server.
//!
//! ```toml
//! port = 8765
//! data_dir = "data"
//! agent_cmd = "claude"
//! execution_timeout_secs = 300
//! stats_interval_secs = 30
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default config filename looked up in the working directory.
pub const CONFIG_FILE: &str = "tether.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port the WebSocket server binds to.
    pub port: u16,
    /// Root of the durable state tree (`<data_dir>/projects/<id>/...`).
    pub data_dir: PathBuf,
    /// Agent CLI binary to invoke per execution.
    pub agent_cmd: String,
    /// Wall-clock ceiling for a single execution.
    pub execution_timeout_secs: u64,
    /// Interval between aggregate stats broadcasts.
    pub stats_interval_secs: u64,
    /// Bind on all interfaces and add a permissive CORS layer.
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8765,
            data_dir: PathBuf::from("data"),
            agent_cmd: "claude".to_string(),
            execution_timeout_secs: 300,
            stats_interval_secs: 30,
            dev_mode: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `path` (or `tether.toml` if present),
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = Path::new(CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        if let Ok(cmd) = std::env::var("TETHER_AGENT_CMD") {
            config.agent_cmd = cmd;
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    /// Bind address: loopback-only unless in dev mode.
    pub fn bind_addr(&self) -> String {
        let host = if self.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
        format!("{}:{}", host, self.port)
    }
}
