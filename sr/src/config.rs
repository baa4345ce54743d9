//! SessionReel configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main SessionReel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Durable event store
    pub storage: StorageConfig,

    /// Live fan-out
    pub broadcast: BroadcastConfig,

    /// Agent turn handling
    pub interaction: InteractionConfig,

    /// Replay pacing and polling
    pub replay: ReplayConfig,

    /// Historical reads
    pub history: HistoryConfig,

    /// Which session ids are accepted
    pub sessions: SessionsConfig,

    /// Control socket
    pub server: ServerConfig,
}

impl Config {
    /// Reject values that would make the service misbehave
    pub fn validate(&self) -> Result<()> {
        if self.broadcast.queue_capacity == 0 {
            return Err(eyre::eyre!("broadcast.queue-capacity must be at least 1"));
        }
        if self.replay.batch_size == 0 {
            return Err(eyre::eyre!("replay.batch-size must be at least 1"));
        }
        if self.replay.poll_interval_ms == 0 {
            return Err(eyre::eyre!("replay.poll-interval-ms must be at least 1"));
        }
        if self.history.max_limit == 0 {
            return Err(eyre::eyre!("history.max-limit must be at least 1"));
        }
        if self.server.max_request_bytes == 0 {
            return Err(eyre::eyre!("server.max-request-bytes must be at least 1"));
        }
        if self.sessions.mode == SessionMode::Static && self.sessions.known.is_empty() {
            return Err(eyre::eyre!("sessions.mode is static but sessions.known is empty"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: .sessionreel.yml
        let local_config = PathBuf::from(".sessionreel.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/sessionreel/sessionreel.yml
        if let Some(user_config) = Self::user_config_path()
            && user_config.exists()
        {
            match Self::load_from_file(&user_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read just the log level, before logging is initialised
    ///
    /// Errors are swallowed; the full load reports them once logging works.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => {
                let mut paths = vec![PathBuf::from(".sessionreel.yml")];
                paths.extend(Self::user_config_path());
                paths
            }
        };
        candidates
            .into_iter()
            .find(|p| p.exists())
            .and_then(|p| Self::load_from_file(p).ok())
            .and_then(|c| c.log_level)
    }

    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sessionreel").join("sessionreel.yml"))
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Which durable store backs the event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Jsonl,
    Sqlite,
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// JSONL root directory or SQLite database file; defaults under the data dir
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Jsonl,
            path: None,
        }
    }
}

impl StorageConfig {
    /// Path the chosen backend opens, with the default filled in
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sessionreel");
        match self.backend {
            StorageBackend::Sqlite => base.join("events.db"),
            StorageBackend::Jsonl | StorageBackend::Memory => base.join("sessions"),
        }
    }
}

/// Live fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Bounded delivery queue per live subscriber (events)
    #[serde(rename = "queue-capacity")]
    pub queue_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

/// Interaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionConfig {
    /// How long cancel waits for the producer to acknowledge
    #[serde(rename = "cancel-grace-ms")]
    pub cancel_grace_ms: u64,

    /// Per-word delay of the bundled echo producer
    #[serde(rename = "echo-delay-ms")]
    pub echo_delay_ms: u64,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            cancel_grace_ms: 3000,
            echo_delay_ms: 50,
        }
    }
}

impl InteractionConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn echo_delay(&self) -> Duration {
        Duration::from_millis(self.echo_delay_ms)
    }
}

/// Replay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// How often a caught-up replay re-reads the log while a turn is running
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// Events fetched per log read
    #[serde(rename = "batch-size")]
    pub batch_size: usize,

    /// Upper bound on any single pacing gap (before rate scaling)
    #[serde(rename = "max-gap-ms")]
    pub max_gap_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            batch_size: 64,
            max_gap_ms: 60_000,
        }
    }
}

/// History read configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Largest `limit` honoured by a single history read
    #[serde(rename = "max-limit")]
    pub max_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_limit: 1000 }
    }
}

/// How session existence is decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Any well-formed session id exists
    #[default]
    Open,
    /// Only ids listed in `known` exist
    Static,
}

/// Session directory configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub mode: SessionMode,
    pub known: Vec<String>,
}

/// Control socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unix socket path; defaults under the runtime dir
    #[serde(rename = "socket-path")]
    pub socket_path: Option<PathBuf>,

    /// Largest accepted request line
    #[serde(rename = "max-request-bytes")]
    pub max_request_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            max_request_bytes: 64 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn resolved_socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(crate::ipc::get_socket_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.storage.backend, StorageBackend::Jsonl);
        assert_eq!(config.broadcast.queue_capacity, 256);
        assert_eq!(config.interaction.cancel_grace_ms, 3000);
        assert_eq!(config.replay.poll_interval_ms, 200);
        assert_eq!(config.replay.batch_size, 64);
        assert_eq!(config.replay.max_gap_ms, 60_000);
        assert_eq!(config.history.max_limit, 1000);
        assert_eq!(config.sessions.mode, SessionMode::Open);
        assert_eq!(config.server.max_request_bytes, 65536);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
log-level: debug

storage:
  backend: sqlite
  path: /var/lib/sessionreel/events.db

broadcast:
  queue-capacity: 32

interaction:
  cancel-grace-ms: 500
  echo-delay-ms: 0

replay:
  poll-interval-ms: 50
  batch-size: 16
  max-gap-ms: 5000

sessions:
  mode: static
  known: [alpha, beta]

server:
  socket-path: /tmp/sr.sock
  max-request-bytes: 4096
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(
            config.storage.resolved_path(),
            PathBuf::from("/var/lib/sessionreel/events.db")
        );
        assert_eq!(config.broadcast.queue_capacity, 32);
        assert_eq!(config.interaction.cancel_grace(), Duration::from_millis(500));
        assert_eq!(config.replay.batch_size, 16);
        assert_eq!(config.sessions.mode, SessionMode::Static);
        assert_eq!(config.sessions.known, vec!["alpha", "beta"]);
        assert_eq!(config.server.resolved_socket_path(), PathBuf::from("/tmp/sr.sock"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
replay:
  batch-size: 8
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.replay.batch_size, 8);
        assert_eq!(config.replay.poll_interval_ms, 200);
        assert_eq!(config.broadcast.queue_capacity, 256);
        assert!(config.log_level.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.broadcast.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_static_sessions() {
        let mut config = Config::default();
        config.sessions.mode = SessionMode::Static;
        assert!(config.validate().is_err());
        config.sessions.known.push("s1".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_explicit_path() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("custom.yml");
        std::fs::write(&path, "log-level: warn\nhistory:\n  max-limit: 10\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.history.max_limit, 10);
        assert_eq!(Config::load_log_level(Some(&path)).as_deref(), Some("warn"));
    }

    #[test]
    fn test_load_explicit_missing_path_fails() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("missing.yml");
        assert!(Config::load(Some(&path)).is_err());
        assert!(Config::load_log_level(Some(&path)).is_none());
    }
}
