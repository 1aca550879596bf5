use crate::session::{DEFAULT_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "TVREMOTE_";
const APP_DIR: &str = "tv-remote-bridge";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config encode failed: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("{0} already exists")]
    AlreadyExists(PathBuf),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
    pub adb: AdbConfig,
    pub catalog: CatalogConfig,
    pub resolver: ResolverConfig,
    pub channels: ChannelsConfig,
    pub transcription: TranscriptionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub multicast_addr: String,
    pub search_target: String,
    pub window_ms: u64,
    pub device_port: u16,
    pub fetch_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_addr: "239.255.255.250:1900".to_string(),
            search_target: "urn:dial-multiscreen-org:service:dial:1".to_string(),
            window_ms: 5000,
            device_port: 5555,
            fetch_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub poll_interval_ms: u64,
    pub poll_attempts: u32,
    /// Free-text launches and commands require a connected session.
    pub gate_text_commands: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
            gate_text_commands: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdbConfig {
    pub binary: String,
    pub aapt_binary: String,
    pub command_timeout_ms: u64,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            binary: "adb".to_string(),
            aapt_binary: "aapt".to_string(),
            command_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub dir: String,
    pub file_name: String,
    pub population_deadline_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            dir: "all_firetv_app_list".to_string(),
            file_name: "app_labels.csv".to_string(),
            population_deadline_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub threshold: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            threshold: crate::resolver::DEFAULT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub worker_pool_size: usize,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 15000,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&active_config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match fs::read_to_string(path) {
            Ok(raw) => toml::from_str::<Config>(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => return Err(err.into()),
        };

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(format!("{ENV_PREFIX}{key}")).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Server settings
        if let Some(val) = var("SERVER_HOST") {
            self.server.host = val;
        }
        if let Some(port) = var("SERVER_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(val) = var("SERVER_TOKEN") {
            self.server.token = Some(val).filter(|t| !t.is_empty());
        }

        // Discovery settings
        if let Some(val) = var("DISCOVERY_MULTICAST_ADDR") {
            self.discovery.multicast_addr = val;
        }
        if let Some(ms) = var("DISCOVERY_WINDOW_MS").and_then(|v| v.parse().ok()) {
            self.discovery.window_ms = ms;
        }
        if let Some(port) = var("DISCOVERY_DEVICE_PORT").and_then(|v| v.parse().ok()) {
            self.discovery.device_port = port;
        }

        // Session settings
        if let Some(attempts) = var("SESSION_POLL_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.session.poll_attempts = attempts;
        }
        if let Some(val) = var("SESSION_GATE_TEXT_COMMANDS") {
            self.session.gate_text_commands = val.parse().unwrap_or(false);
        }

        // adb settings
        if let Some(val) = var("ADB_BINARY") {
            self.adb.binary = val;
        }
        if let Some(val) = var("AAPT_BINARY") {
            self.adb.aapt_binary = val;
        }

        // Catalog settings
        if let Some(val) = var("CATALOG_DIR") {
            self.catalog.dir = val;
        }

        if let Some(threshold) = var("RESOLVER_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.resolver.threshold = threshold;
        }

        if let Some(val) = var("TRANSCRIPTION_ENDPOINT") {
            self.transcription.endpoint = Some(val).filter(|e| !e.is_empty());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.server.port == 0 {
            return invalid("server.port must be non-zero");
        }
        if self.server.host.trim().is_empty() {
            return invalid("server.host must be set");
        }
        if self.discovery.multicast_addr.parse::<SocketAddr>().is_err() {
            return invalid("discovery.multicast_addr must be an ip:port address");
        }
        if self.discovery.window_ms == 0 {
            return invalid("discovery.window_ms must be non-zero");
        }
        if self.discovery.device_port == 0 {
            return invalid("discovery.device_port must be non-zero");
        }
        if self.session.poll_attempts == 0 {
            return invalid("session.poll_attempts must be >= 1");
        }
        if self.adb.command_timeout_ms < 100 {
            return invalid("adb.command_timeout_ms must be >= 100");
        }
        if self.catalog.file_name.trim().is_empty() {
            return invalid("catalog.file_name must be set");
        }
        if !(0.0..=1.0).contains(&self.resolver.threshold) {
            return invalid("resolver.threshold must be within 0.0..=1.0");
        }
        if self.channels.worker_pool_size == 0 {
            return invalid("channels.worker_pool_size must be >= 1");
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn catalog_path(&self) -> PathBuf {
        Path::new(&self.catalog.dir).join(&self.catalog.file_name)
    }
}

impl DiscoveryConfig {
    pub fn options(&self) -> Result<crate::discovery::DiscoveryOptions, ConfigError> {
        let multicast_addr = self
            .multicast_addr
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad multicast address {}", self.multicast_addr)))?;
        Ok(crate::discovery::DiscoveryOptions {
            multicast_addr,
            search_target: self.search_target.clone(),
            window: Duration::from_millis(self.window_ms),
            device_port: self.device_port,
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
        })
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{ENV_PREFIX}CONFIG_PATH")) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
