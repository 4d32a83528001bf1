use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub buffers: BufferConfig,
    pub workers: Vec<WorkerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `host:port`, `tcp://host:port`, or `unix:/path`
    pub listen_addr: String,
    /// Shared secret clients must send before anything else. Its exact
    /// length defines how many bytes are read during authentication.
    pub connect_password: String,
    pub connect_password_timeout_ms: u64,
    /// Optional deadline for reading the request header; absent = none
    pub header_timeout_ms: Option<u64>,
    /// Optional deadline for checking out a session; absent = none
    pub checkout_timeout_ms: Option<u64>,
    pub worker_connect_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:4080".to_string(),
            connect_password: String::new(),
            connect_password_timeout_ms: 15_000,
            header_timeout_ms: None,
            checkout_timeout_ms: None,
            worker_connect_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Directory for spill files
    pub temp_dir: PathBuf,
    /// Bytes a pipe may hold in memory before spilling to disk
    pub spill_watermark: usize,
    /// Upper bound on the request header frame
    pub max_header_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("/tmp"),
            spill_watermark: 1024 * 1024,
            max_header_size: 128 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Worker request socket, e.g. "tcp://127.0.0.1:4000" or "unix:/run/app.sock"
    pub address: String,
    /// Optional worker name for logging
    #[serde(default)]
    pub name: Option<String>,
    /// Handshake password forwarded with each dispatched request
    pub connect_password: String,
}

impl Config {
    /// Loads `config.yaml` when present, then applies environment
    /// overrides (`LISTEN`, `CONNECT_PASSWORD`).
    pub fn load() -> anyhow::Result<Self> {
        let mut config = if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::load_from_file(DEFAULT_CONFIG_FILE)?
        } else {
            Self::default()
        };

        if let Ok(addr) = std::env::var("LISTEN") {
            config.server.listen_addr = addr;
        }
        if let Ok(password) = std::env::var("CONNECT_PASSWORD") {
            config.server.connect_password = password;
        }
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = serde_yaml::from_str(&text)?;
        Ok(config)
    }

    pub fn connect_password_timeout(&self) -> Duration {
        Duration::from_millis(self.server.connect_password_timeout_ms)
    }

    pub fn header_timeout(&self) -> Option<Duration> {
        self.server.header_timeout_ms.map(Duration::from_millis)
    }

    pub fn checkout_timeout(&self) -> Option<Duration> {
        self.server.checkout_timeout_ms.map(Duration::from_millis)
    }

    pub fn worker_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.server.worker_connect_timeout_ms)
    }
}
