use comanda_core::{ReconnectPolicy, SyncTuning};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Sync settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SyncConfig {
    /// Staff role override (e.g. "Cozinha"); defaults to the logged-in role
    pub role: Option<String>,
    /// Seconds between reachability probes
    pub probe_interval_secs: Option<u64>,
    /// Timeouts and cooldowns
    pub tuning: SyncTuning,
    /// Websocket reconnection
    pub reconnect: ReconnectPolicy,
}

impl SyncConfig {
    pub fn probe_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.probe_interval_secs.unwrap_or(15).max(1))
    }
}

/// Receipt printer settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PrinterConfig {
    /// Network printer as "host" or "host:port"
    pub device: Option<String>,
    /// Paper width in columns (32 for 58 mm, 48 for 80 mm)
    pub width: Option<usize>,
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Sync server, e.g. "https://api.example.com"
    pub server_url: ConfigValue<Option<String>>,
    /// Workspace (cart) id attached to every request
    pub workspace: ConfigValue<Option<String>>,
    /// Where the saved session lives
    pub data_dir: ConfigValue<PathBuf>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    pub sync: SyncConfig,
    pub printer: PrinterConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    server_url: Option<String>,
    workspace: Option<String>,
    data_dir: Option<PathBuf>,
    sync: Option<SyncConfig>,
    printer: Option<PrinterConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut server_url = ConfigValue::new(None, ConfigSource::Default);
        let mut workspace = ConfigValue::new(None, ConfigSource::Default);
        let mut data_dir = ConfigValue::new(Self::default_data_dir(), ConfigSource::Default);
        let mut config_file = None;
        let mut sync = SyncConfig::default();
        let mut printer = PrinterConfig::default();

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(url) = file_config.server_url {
                server_url = ConfigValue::new(Some(url), ConfigSource::File);
            }
            if let Some(id) = file_config.workspace {
                workspace = ConfigValue::new(Some(id), ConfigSource::File);
            }
            if let Some(dir) = file_config.data_dir {
                // Relative paths are relative to the config file
                let resolved = if dir.is_relative() {
                    path.parent().map(|p| p.join(&dir)).unwrap_or(dir)
                } else {
                    dir
                };
                data_dir = ConfigValue::new(resolved, ConfigSource::File);
            }
            if let Some(sync_config) = file_config.sync {
                sync = sync_config;
            }
            if let Some(printer_config) = file_config.printer {
                printer = printer_config;
            }
        }

        if let Ok(url) = std::env::var("COMANDA_SERVER_URL") {
            server_url = ConfigValue::new(Some(url), ConfigSource::Environment);
        }
        if let Ok(id) = std::env::var("COMANDA_WORKSPACE") {
            workspace = ConfigValue::new(Some(id), ConfigSource::Environment);
        }
        if let Ok(dir) = std::env::var("COMANDA_DATA_DIR") {
            data_dir = ConfigValue::new(PathBuf::from(dir), ConfigSource::Environment);
        }

        Ok(Self {
            server_url,
            workspace,
            data_dir,
            config_file,
            sync,
            printer,
        })
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/comanda/
    /// - macOS: ~/Library/Application Support/comanda/
    /// - Windows: %APPDATA%/comanda/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("comanda")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/comanda/
    /// - macOS: ~/Library/Application Support/comanda/
    /// - Windows: %APPDATA%/comanda/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("comanda")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }

    /// Directory holding the saved session.
    pub fn session_dir(&self) -> PathBuf {
        self.data_dir.value.join("session")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
