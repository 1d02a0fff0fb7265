use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ports at or below this value are rejected.
pub const PORT_MIN: u16 = 1023;

/// Top-level configuration loaded from tcpspool.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: ListenConfig,
    pub workers: WorkerConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub backlog: i32,
    /// Longest the acceptor sleeps before re-checking for shutdown.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Idle workers kept waiting on the client queue.
    pub pool_size: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    /// Upper bound on a single read from a client.
    pub buffer_size: usize,
    pub file_mode: u32,
}

// --- Default implementations ---

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: 0,
            backlog: 128,
            poll_interval_ms: 500,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { pool_size: 4 }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            buffer_size: 400,
            file_mode: 0o644,
        }
    }
}

impl ListenConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    PortTooLow {
        port: u16,
    },
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {}", path.display(), source)
            }
            ConfigError::PortTooLow { port } => {
                write!(f, "port must be greater than {PORT_MIN} (got {port})")
            }
            ConfigError::Invalid { field, reason } => write!(f, "{field}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::PortTooLow { .. } | ConfigError::Invalid { .. } => None,
        }
    }
}

impl ServerConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&text, path)
    }

    fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check the values the server cannot start without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.port <= PORT_MIN {
            return Err(ConfigError::PortTooLow {
                port: self.listen.port,
            });
        }
        if self.listen.backlog < 1 {
            return Err(ConfigError::Invalid {
                field: "listen.backlog",
                reason: "must be at least 1",
            });
        }
        if self.listen.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "listen.poll_interval_ms",
                reason: "must be at least 1",
            });
        }
        if self.workers.pool_size == 0 {
            return Err(ConfigError::Invalid {
                field: "workers.pool_size",
                reason: "must be at least 1",
            });
        }
        if self.output.buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "output.buffer_size",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}
