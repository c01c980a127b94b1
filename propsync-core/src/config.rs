//! Registry configuration.
//!
//! Sources, each overriding the previous one:
//! 1. Default values
//! 2. YAML config file (if specified via PROPSYNC_CONFIG or --config)
//! 3. `PROPSYNC_*` environment variables

use propsync_protocol::Framing;
use propsync_transport::{BackoffConfig, Endpoint, DEFAULT_MAX_CONNECTIONS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Receive buffer the master starts each client connection with.
pub const DEFAULT_RECEIVE_BUFFER: usize = 512;

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared segment name; also names the master's endpoint.
    pub segment_name: String,
    /// Whether this process owns the segment.
    pub role: ProcessRole,
    /// Socket configuration.
    pub transport: TransportConfig,
    /// Slave reconnect backoff.
    pub backoff: BackoffSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_name: "propsync".to_string(),
            role: ProcessRole::Master,
            transport: TransportConfig::default(),
            backoff: BackoffSettings::default(),
        }
    }
}

impl Config {
    /// Defaults, then the `PROPSYNC_CONFIG` file if set, then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("PROPSYNC_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reads a YAML file; missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Defaults plus environment overrides, without a file.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Defaults for a named segment.
    pub fn for_segment(name: impl Into<String>, role: ProcessRole) -> Self {
        Self {
            segment_name: name.into(),
            role,
            ..Self::default()
        }
    }

    /// Overrides fields from `PROPSYNC_*` variables that are set and parse.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("PROPSYNC_SEGMENT") {
            if !name.is_empty() {
                self.segment_name = name;
            }
        }

        if let Ok(role) = std::env::var("PROPSYNC_ROLE") {
            if let Some(parsed) = ProcessRole::parse(&role) {
                self.role = parsed;
            }
        }

        self.transport.apply_env_overrides();
        self.backoff.apply_env_overrides();
    }

    /// Checks values that would make the registry unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_name.trim_start_matches('/').is_empty()
            || self.segment_name.trim_start_matches('/').contains('/')
        {
            return Err(ConfigError::ValidationError(format!(
                "invalid segment name '{}'",
                self.segment_name
            )));
        }
        if self.transport.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.backoff.factor == 0 {
            return Err(ConfigError::ValidationError(
                "backoff factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Endpoint the master listens on and slaves connect to.
    pub fn endpoint(&self) -> Endpoint {
        match &self.transport.socket_path {
            Some(path) => Endpoint::Path(path.clone()),
            None => Endpoint::named(&self.segment_name),
        }
    }

    /// Framing used on every registry connection.
    pub fn framing(&self) -> Framing {
        Framing::controlled(self.transport.receive_buffer)
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial: self.backoff.initial(),
            max: self.backoff.max(),
            factor: self.backoff.factor,
        }
    }
}

/// Process role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    Master,
    Slave,
}

impl ProcessRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "master" | "server" => Some(ProcessRole::Master),
            "slave" | "client" => Some(ProcessRole::Slave),
            _ => None,
        }
    }
}

/// Socket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum concurrent slave connections.
    pub max_connections: usize,
    /// Initial receive buffer per connection, in bytes.
    pub receive_buffer: usize,
    /// Whether slaves keep reconnecting after failures and hang-ups.
    pub auto_connect: bool,
    /// Filesystem socket path instead of the abstract namespace.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            receive_buffer: DEFAULT_RECEIVE_BUFFER,
            auto_connect: true,
            socket_path: None,
        }
    }
}

impl TransportConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("PROPSYNC_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(auto) = std::env::var("PROPSYNC_AUTO_CONNECT") {
            self.auto_connect = auto == "1" || auto.to_lowercase() == "true";
        }

        if let Ok(size) = std::env::var("PROPSYNC_RECEIVE_BUFFER") {
            if let Ok(n) = size.parse() {
                self.receive_buffer = n;
            }
        }
    }
}

/// Reconnect backoff, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        let defaults = BackoffConfig::default();
        Self {
            initial_ms: defaults.initial.as_millis() as u64,
            max_ms: defaults.max.as_millis() as u64,
            factor: defaults.factor,
        }
    }
}

impl BackoffSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(initial) = std::env::var("PROPSYNC_BACKOFF_INITIAL_MS") {
            if let Ok(ms) = initial.parse() {
                self.initial_ms = ms;
            }
        }

        if let Ok(max) = std::env::var("PROPSYNC_BACKOFF_MAX_MS") {
            if let Ok(ms) = max.parse() {
                self.max_ms = ms;
            }
        }
    }

    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "cannot read {}: {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "cannot parse {}: {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "invalid configuration: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.segment_name, "propsync");
        assert_eq!(config.role, ProcessRole::Master);
        assert_eq!(config.transport.max_connections, 64);
        assert_eq!(config.framing(), Framing::controlled(512));
        assert_eq!(config.backoff_config(), BackoffConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "segment_name: audiod\nrole: slave\ntransport:\n  max_connections: 4\n  auto_connect: false\nbackoff:\n  initial_ms: 20"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.segment_name, "audiod");
        assert_eq!(config.role, ProcessRole::Slave);
        assert_eq!(config.transport.max_connections, 4);
        assert!(!config.transport.auto_connect);
        assert_eq!(config.transport.receive_buffer, DEFAULT_RECEIVE_BUFFER);
        assert_eq!(config.backoff.initial(), Duration::from_millis(20));
        assert_eq!(config.backoff.max(), Duration::from_millis(1000));
    }

    #[test]
    fn test_from_file_errors() {
        let err = Config::from_file("/nonexistent/propsync.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(..)));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "role: [not, a, role]").unwrap();
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(..)));
        assert!(err.to_string().contains("cannot parse"));
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("PROPSYNC_SEGMENT", "from-env");
        std::env::set_var("PROPSYNC_ROLE", "client");
        std::env::set_var("PROPSYNC_BACKOFF_MAX_MS", "250");
        let config = Config::from_env();
        std::env::remove_var("PROPSYNC_SEGMENT");
        std::env::remove_var("PROPSYNC_ROLE");
        std::env::remove_var("PROPSYNC_BACKOFF_MAX_MS");

        assert_eq!(config.segment_name, "from-env");
        assert_eq!(config.role, ProcessRole::Slave);
        assert_eq!(config.backoff.max(), Duration::from_millis(250));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::for_segment("a/b", ProcessRole::Master);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        config.segment_name = "ok".to_string();
        config.transport.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_selection() {
        let mut config = Config::for_segment("audiod", ProcessRole::Slave);
        assert_eq!(config.endpoint(), Endpoint::named("audiod"));

        config.transport.socket_path = Some(PathBuf::from("/tmp/audiod.sock"));
        assert_eq!(
            config.endpoint(),
            Endpoint::Path(PathBuf::from("/tmp/audiod.sock"))
        );
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::for_segment("roundtrip", ProcessRole::Slave);
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.segment_name, "roundtrip");
        assert_eq!(parsed.role, ProcessRole::Slave);
    }
}
