//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via DREDGE_CONFIG)
//! 3. Environment variables

use dredge_protocol::{
    AiLengthUnit, ChannelMap, ChannelMapError, FloatByteOrder, DEFAULT_BASE_INDEX,
    DEFAULT_MAX_BUFFER_SIZE, DEFAULT_PROFILE, DEFAULT_RELAY_PORT, MIN_FRAME_SIZE,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Downstream listener configuration.
    pub network: NetworkConfig,
    /// Sensor link configuration.
    pub sensor: SensorConfig,
    /// Relay output configuration.
    pub relay: RelayConfig,
    /// Vessel channel profiles.
    pub vessels: VesselsConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("DREDGE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.sensor.apply_env_overrides();
        self.relay.apply_env_overrides();
        self.vessels.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks values that would make sessions misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sensor.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "sensor.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.sensor.max_buffer_size < MIN_FRAME_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "sensor.max_buffer_size must be at least {} bytes",
                MIN_FRAME_SIZE
            )));
        }
        if self.sensor.read_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "sensor.read_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.relay.publish_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "relay.publish_timeout_ms must be greater than zero".to_string(),
            ));
        }
        self.vessels.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Downstream listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address presentation clients connect to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent downstream connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_RELAY_PORT)),
            max_connections: 64,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("DREDGE_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(max) = std::env::var("DREDGE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }
}

/// Sensor link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Dial timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Interval between poll commands in milliseconds.
    pub poll_interval_ms: u64,
    /// Size of a single socket read.
    pub read_buffer_size: usize,
    /// Bound on an unterminated frame.
    pub max_buffer_size: usize,
    /// How the header's AI length field is read.
    pub ai_length_unit: AiLengthUnit,
    /// Byte order of analog floats.
    pub float_byte_order: FloatByteOrder,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            poll_interval_ms: 1_000,
            read_buffer_size: 4096,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            ai_length_unit: AiLengthUnit::default(),
            float_byte_order: FloatByteOrder::default(),
        }
    }
}

impl SensorConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("DREDGE_CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.connect_timeout_ms = ms;
            }
        }

        if let Ok(interval) = std::env::var("DREDGE_POLL_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.poll_interval_ms = ms;
            }
        }

        if let Ok(size) = std::env::var("DREDGE_MAX_BUFFER_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_buffer_size = n;
            }
        }

        if let Ok(unit) = std::env::var("DREDGE_AI_LENGTH_UNIT") {
            match unit.to_lowercase().as_str() {
                "bytes" => self.ai_length_unit = AiLengthUnit::Bytes,
                "points" => self.ai_length_unit = AiLengthUnit::Points,
                other => tracing::warn!("Ignoring DREDGE_AI_LENGTH_UNIT={}", other),
            }
        }

        if let Ok(order) = std::env::var("DREDGE_FLOAT_BYTE_ORDER") {
            match order.to_lowercase().as_str() {
                "little" | "le" => self.float_byte_order = FloatByteOrder::Little,
                "big" | "be" => self.float_byte_order = FloatByteOrder::Big,
                other => tracing::warn!("Ignoring DREDGE_FLOAT_BYTE_ORDER={}", other),
            }
        }
    }

    /// Returns the dial timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Returns the poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Relay output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Longest a single sample write may block, in milliseconds.
    pub publish_timeout_ms: u64,
    /// Bound on the final `connection_lost` notice, in milliseconds.
    pub notice_timeout_ms: u64,
    /// Bound on shutting down each stream at teardown, in milliseconds.
    pub teardown_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            publish_timeout_ms: 2_000,
            notice_timeout_ms: 1_000,
            teardown_timeout_ms: 1_000,
        }
    }
}

impl RelayConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("DREDGE_PUBLISH_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.publish_timeout_ms = ms;
            }
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn notice_timeout(&self) -> Duration {
        Duration::from_millis(self.notice_timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

/// Channel table of one vessel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VesselProfile {
    /// Protocol index of the first analog point.
    #[serde(default = "default_base_index")]
    pub base_index: u32,
    /// Channel name to absolute protocol index.
    pub channels: BTreeMap<String, u32>,
}

fn default_base_index() -> u32 {
    DEFAULT_BASE_INDEX
}

impl VesselProfile {
    /// Builds the channel map for this profile.
    pub fn channel_map(&self) -> Result<ChannelMap, ChannelMapError> {
        ChannelMap::from_absolute(
            self.base_index,
            self.channels.iter().map(|(name, index)| (name.as_str(), *index)),
        )
    }
}

/// Vessel profiles.
///
/// The built-in `hua_an_long` table is used when no profile of that name is
/// configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VesselsConfig {
    /// Profile used when a client does not name one.
    pub default_profile: String,
    /// Configured profiles by name.
    pub profiles: BTreeMap<String, VesselProfile>,
}

impl Default for VesselsConfig {
    fn default() -> Self {
        Self {
            default_profile: DEFAULT_PROFILE.to_string(),
            profiles: BTreeMap::new(),
        }
    }
}

impl VesselsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("DREDGE_DEFAULT_VESSEL") {
            if !name.is_empty() {
                self.default_profile = name;
            }
        }
    }

    /// Resolves a profile name to its channel map.
    pub fn resolve(&self, name: &str) -> Result<ChannelMap, ConfigError> {
        match self.profiles.get(name) {
            Some(profile) => profile
                .channel_map()
                .map_err(|source| ConfigError::InvalidProfile {
                    name: name.to_string(),
                    source,
                }),
            None if name == DEFAULT_PROFILE => Ok(ChannelMap::dredger_default()),
            None => Err(ConfigError::UnknownProfile(name.to_string())),
        }
    }

    /// Returns the names of every resolvable profile.
    pub fn profile_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        if !self.profiles.contains_key(DEFAULT_PROFILE) {
            names.push(DEFAULT_PROFILE);
            names.sort_unstable();
        }
        names
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, profile) in &self.profiles {
            profile
                .channel_map()
                .map_err(|source| ConfigError::InvalidProfile {
                    name: name.clone(),
                    source,
                })?;
        }
        self.resolve(&self.default_profile).map(|_| ())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("DREDGE_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(addr) = std::env::var("DREDGE_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
    UnknownProfile(String),
    InvalidProfile {
        name: String,
        source: ChannelMapError,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
            ConfigError::UnknownProfile(name) => {
                write!(f, "unknown vessel profile '{}'", name)
            }
            ConfigError::InvalidProfile { name, source } => {
                write!(f, "invalid vessel profile '{}': {}", name, source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(_, e) => Some(e),
            ConfigError::InvalidProfile { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.to_string(), "127.0.0.1:12580");
        assert_eq!(config.sensor.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.sensor.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.sensor.max_buffer_size, 64 * 1024);
        assert_eq!(config.sensor.ai_length_unit, AiLengthUnit::Bytes);
        assert_eq!(config.sensor.float_byte_order, FloatByteOrder::Little);
        assert_eq!(config.relay.publish_timeout(), Duration::from_secs(2));
        assert_eq!(config.vessels.default_profile, "hua_an_long");
        assert!(!config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builtin_profile_resolves() {
        let vessels = VesselsConfig::default();
        let map = vessels.resolve("hua_an_long").unwrap();
        assert_eq!(map, ChannelMap::dredger_default());
        assert_eq!(vessels.profile_names(), vec!["hua_an_long"]);

        assert!(matches!(
            vessels.resolve("unknown"),
            Err(ConfigError::UnknownProfile(name)) if name == "unknown"
        ));
    }

    #[test]
    fn test_yaml_file_with_profile() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
network:
  bind_addr: "0.0.0.0:13000"
sensor:
  poll_interval_ms: 250
  ai_length_unit: points
  float_byte_order: big
vessels:
  default_profile: test_barge
  profiles:
    test_barge:
      base_index: 100
      channels:
        flowRate: 100
        concentration: 101
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 13000);
        assert_eq!(config.network.max_connections, 64);
        assert_eq!(config.sensor.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.sensor.ai_length_unit, AiLengthUnit::Points);
        assert_eq!(config.sensor.float_byte_order, FloatByteOrder::Big);
        assert!(config.validate().is_ok());

        let map = config.vessels.resolve("test_barge").unwrap();
        assert_eq!(map.get("flowRate"), Some(0));
        assert_eq!(map.get("concentration"), Some(1));
        assert_eq!(
            config.vessels.profile_names(),
            vec!["hua_an_long", "test_barge"]
        );
    }

    #[test]
    fn test_profile_base_index_defaults() {
        let profile: VesselProfile = serde_yaml::from_str("channels: { density: 341 }").unwrap();
        assert_eq!(profile.base_index, 327);
        assert_eq!(profile.channel_map().unwrap().get("density"), Some(14));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.sensor.poll_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.sensor.max_buffer_size = 8;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.vessels.profiles.insert(
            "broken".to_string(),
            VesselProfile {
                base_index: 327,
                channels: BTreeMap::from([("density".to_string(), 12)]),
            },
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidProfile { ref name, .. }) if name == "broken"
        ));

        let mut config = Config::default();
        config.vessels.profiles.insert(
            "clashing".to_string(),
            VesselProfile {
                base_index: 327,
                channels: BTreeMap::from([
                    ("density".to_string(), 341),
                    ("timestamp".to_string(), 342),
                ]),
            },
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidProfile {
                source: ChannelMapError::ReservedName(_),
                ..
            })
        ));

        let mut config = Config::default();
        config.vessels.default_profile = "missing".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownProfile(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file("/nonexistent/dredge.yaml");
        assert!(matches!(result, Err(ConfigError::IoError(_, _))));
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dredge.yaml");

        let mut config = Config::default();
        config.sensor.poll_interval_ms = 500;
        config.save(&path).unwrap();

        let parsed = Config::from_file(&path).unwrap();
        assert_eq!(parsed.sensor.poll_interval_ms, 500);
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("DREDGE_POLL_INTERVAL_MS", "300");
        std::env::set_var("DREDGE_FLOAT_BYTE_ORDER", "big");
        std::env::set_var("DREDGE_METRICS_ENABLED", "true");

        let config = Config::from_env();

        std::env::remove_var("DREDGE_POLL_INTERVAL_MS");
        std::env::remove_var("DREDGE_FLOAT_BYTE_ORDER");
        std::env::remove_var("DREDGE_METRICS_ENABLED");

        assert_eq!(config.sensor.poll_interval_ms, 300);
        assert_eq!(config.sensor.float_byte_order, FloatByteOrder::Big);
        assert!(config.metrics.enabled);
    }
}
