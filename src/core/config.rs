//! Configuration module for miflasher
//!
//! Supports loading configuration from a TOML file.
//! Configuration is stored in a standard location:
//! - Windows: %APPDATA%\miflasher\config.toml
//! - Linux: ~/.config/miflasher/config.toml
//! - macOS: ~/Library/Application Support/miflasher/config.toml
//!
//! The loaded [`Config`] is passed explicitly to every component that needs
//! it; nothing reads configuration from global state.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::slot::SlotSelector;

/// Application name used for config directory
const APP_NAME: &str = "miflasher";

/// Default config file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Project-local override looked up in the current directory
const LOCAL_CONFIG_NAME: &str = "./miflasher.toml";

/// Get the standard configuration directory for the application.
pub fn get_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_NAME))
}

/// Get the standard configuration file path.
pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Ensure the configuration directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let config_dir = get_config_dir().ok_or(ConfigError::ConfigDirNotFound)?;

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)
            .map_err(|e| ConfigError::WriteError(config_dir.clone(), e.to_string()))?;
    }

    Ok(config_dir)
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Where downloads, backups and extraction scratch space live
    pub paths: PathsConfig,

    /// Flashing defaults
    pub flash: FlashConfig,

    /// Detection and watch settings
    pub device: DeviceConfig,

    /// External program names
    pub tools: ToolsConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

/// Directory configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// Destination for downloaded ROMs
    pub download_dir: PathBuf,

    /// Parent directory for partition backups
    pub backup_dir: PathBuf,

    /// Parent directory for archive extraction (removed after each flash)
    pub scratch_dir: PathBuf,
}

/// Flash configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlashConfig {
    /// Slot selector used when `--slot` is not given
    pub slot: SlotSelector,

    /// Reboot the device after a fully successful flash
    pub auto_reboot: bool,

    /// Verify downloads when a checksum is supplied
    pub auto_verify: bool,

    /// Timeout for detection probes and property reads (seconds)
    pub probe_timeout_secs: u64,

    /// Timeout for a single image transfer (seconds)
    pub flash_timeout_secs: u64,

    /// Timeout for a vendor flashing script (seconds)
    pub script_timeout_secs: u64,
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Poll interval for watch mode (milliseconds)
    pub watch_interval_ms: u64,

    /// Print device info as JSON by default
    pub json: bool,
}

/// External tool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolsConfig {
    /// OS-shell backend program
    pub adb: String,

    /// Bootloader-shell backend program
    pub fastboot: String,

    /// Raw USB enumerator program
    pub usb_enum: String,

    /// Payload dumpers, tried in order
    pub payload_dumpers: Vec<String>,

    /// Bootloader unlock tool
    pub unlock_tool: String,

    /// Interpreter for vendor flashing scripts
    pub shell: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,

    /// Whether to also write logs to a file
    pub log_to_file: bool,

    /// Log file path
    pub log_file: PathBuf,

    /// Record each run as a JSON-lines session file
    pub session_log: bool,

    /// Directory holding the session files
    pub session_dir: PathBuf,
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

impl PathsConfig {
    pub fn download_dir(&self) -> PathBuf {
        expand_home(&self.download_dir)
    }

    pub fn backup_dir(&self) -> PathBuf {
        expand_home(&self.backup_dir)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        expand_home(&self.scratch_dir)
    }
}

impl LoggingConfig {
    pub fn session_dir(&self) -> PathBuf {
        expand_home(&self.session_dir)
    }
}

impl FlashConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn flash_timeout(&self) -> Duration {
        Duration::from_secs(self.flash_timeout_secs.max(1))
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs.max(1))
    }
}

fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = data_dir();
        Self {
            download_dir: base.join("downloads"),
            backup_dir: base.join("backups"),
            scratch_dir: std::env::temp_dir().join(APP_NAME),
        }
    }
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            slot: SlotSelector::All,
            auto_reboot: true,
            auto_verify: true,
            probe_timeout_secs: 8,
            flash_timeout_secs: 300,
            script_timeout_secs: 1800,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            watch_interval_ms: 2000,
            json: false,
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            adb: "adb".to_string(),
            fastboot: "fastboot".to_string(),
            usb_enum: "termux-usb".to_string(),
            payload_dumpers: vec!["payload-dumper-go".to_string(), "payload_dumper".to_string()],
            unlock_tool: "miunlock".to_string(),
            shell: "bash".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: false,
            log_file: data_dir().join("logs").join("miflasher.log"),
            session_log: true,
            session_dir: dirs::data_dir()
                .map(|d| d.join(APP_NAME))
                .unwrap_or_else(data_dir)
                .join("sessions"),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;

        Ok(config)
    }

    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./miflasher.toml (current directory - project override)
    /// 2. Standard config location
    ///
    /// If no config file is found, returns default configuration.
    pub fn load_default() -> Result<Self, ConfigError> {
        let local = PathBuf::from(LOCAL_CONFIG_NAME);
        if local.exists() {
            return Self::load(&local);
        }

        if let Some(config_path) = get_config_path() {
            if config_path.exists() {
                return Self::load(&config_path);
            }
        }

        Ok(Self::default())
    }

    /// Get the path where the config file is (or would be) located.
    pub fn get_active_config_path() -> PathBuf {
        let local = PathBuf::from(LOCAL_CONFIG_NAME);
        if local.exists() {
            return local;
        }

        get_config_path().unwrap_or(local)
    }

    /// Save configuration to a TOML file, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteError(parent.to_path_buf(), e.to_string()))?;
        }

        fs::write(path, content)
            .map_err(|e| ConfigError::WriteError(path.to_path_buf(), e.to_string()))?;

        Ok(())
    }

    /// Generate a default config file with comments
    pub fn generate_default_config() -> String {
        include_str!("../../config.example.toml").to_string()
    }

    fn to_table(&self) -> Result<toml::Table, ConfigError> {
        match toml::Value::try_from(self) {
            Ok(toml::Value::Table(table)) => Ok(table),
            Ok(_) => Err(ConfigError::SerializeError(
                "configuration is not a table".to_string(),
            )),
            Err(e) => Err(ConfigError::SerializeError(e.to_string())),
        }
    }

    /// Look up a value by dotted key (e.g. `flash.auto_reboot`)
    pub fn get_value(&self, key: &str) -> Result<toml::Value, ConfigError> {
        let table = self.to_table()?;
        let mut current: Option<&toml::Value> = None;
        for part in key.split('.') {
            current = match current {
                None => table.get(part),
                Some(toml::Value::Table(t)) => t.get(part),
                Some(_) => None,
            };
            if current.is_none() {
                return Err(ConfigError::UnknownKey(key.to_string()));
            }
        }
        current
            .cloned()
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))
    }

    /// Set a value by dotted key. The raw string is cast to the type of the
    /// existing value; sections cannot be replaced wholesale.
    pub fn set_value(&mut self, key: &str, raw: &str) -> Result<(), ConfigError> {
        let mut table = self.to_table()?;
        let parts: Vec<&str> = key.split('.').collect();
        let (last, sections) = parts
            .split_last()
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;

        let mut current = &mut table;
        for section in sections {
            current = match current.get_mut(*section) {
                Some(toml::Value::Table(t)) => t,
                _ => return Err(ConfigError::UnknownKey(key.to_string())),
            };
        }

        let existing = current
            .get(*last)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        let value = cast_like(existing, raw)
            .ok_or_else(|| ConfigError::InvalidValue(key.to_string(), raw.to_string()))?;
        current.insert((*last).to_string(), value);

        *self = toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| {
                ConfigError::InvalidValue(key.to_string(), e.message().to_string())
            })?;
        Ok(())
    }
}

/// Parse `raw` into the same TOML type as `existing`
fn cast_like(existing: &toml::Value, raw: &str) -> Option<toml::Value> {
    let raw = raw.trim();
    match existing {
        toml::Value::Boolean(_) => match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Some(toml::Value::Boolean(true)),
            "false" | "no" | "0" | "off" => Some(toml::Value::Boolean(false)),
            _ => None,
        },
        toml::Value::Integer(_) => raw.parse::<i64>().ok().map(toml::Value::Integer),
        toml::Value::Float(_) => raw.parse::<f64>().ok().map(toml::Value::Float),
        toml::Value::String(_) => Some(toml::Value::String(raw.to_string())),
        toml::Value::Array(_) => Some(toml::Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| toml::Value::String(s.to_string()))
                .collect(),
        )),
        toml::Value::Datetime(_) | toml::Value::Table(_) => None,
    }
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// Configuration file was not found at the specified path
    FileNotFound(PathBuf),
    /// Failed to read the configuration file
    ReadError(PathBuf, String),
    /// Failed to parse the configuration file (invalid TOML)
    ParseError(PathBuf, String),
    /// Failed to serialize configuration to TOML
    SerializeError(String),
    /// Failed to write configuration file
    WriteError(PathBuf, String),
    /// Could not determine config directory
    ConfigDirNotFound,
    /// Dotted key does not name a setting
    UnknownKey(String),
    /// Value could not be cast to the setting's type
    InvalidValue(String, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => {
                write!(f, "Configuration file not found: {}", path.display())
            }
            ConfigError::ReadError(path, err) => {
                write!(
                    f,
                    "Failed to read config file '{}': {}",
                    path.display(),
                    err
                )
            }
            ConfigError::ParseError(path, err) => {
                write!(
                    f,
                    "Failed to parse config file '{}': {}",
                    path.display(),
                    err
                )
            }
            ConfigError::SerializeError(err) => {
                write!(f, "Failed to serialize configuration: {}", err)
            }
            ConfigError::WriteError(path, err) => {
                write!(
                    f,
                    "Failed to write config file '{}': {}",
                    path.display(),
                    err
                )
            }
            ConfigError::ConfigDirNotFound => {
                write!(f, "Could not determine configuration directory")
            }
            ConfigError::UnknownKey(key) => write!(f, "Unknown config key: {}", key),
            ConfigError::InvalidValue(key, value) => {
                write!(f, "Invalid value for '{}': {}", key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
