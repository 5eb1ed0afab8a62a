//! User settings stored as TOML.
//!
//! Every field has a default. A missing settings file is created with the
//! defaults; an unreadable or invalid one is left untouched and the defaults
//! are used instead.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use corridor_core::ConnectionDescriptor;
use serde::{Deserialize, Serialize};

/// Settings errors.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Reading or writing the file failed.
    #[error("settings file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid settings TOML.
    #[error("invalid settings: {0}")]
    Parse(#[from] toml::de::Error),

    /// Settings could not be encoded.
    #[error("failed to encode settings: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

/// Application settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Base connection parameters, overridden per field by the URI.
    pub vpn: ConnectionDescriptor,
    pub browser: BrowserSettings,
    pub logging: LoggingSettings,
    pub proxy: ProxySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub title: String,
    pub home_url: String,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            title: "Lightweight Browser with VLESS VPN".to_string(),
            home_url: "https://www.google.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level when neither `--debug` nor `--log-level` is given.
    pub level: String,
    /// Rotated log files kept on disk.
    pub max_files: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            max_files: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Whether the VPN is started at all.
    pub enabled: bool,
    /// How long startup waits for the proxy before opening the browser.
    pub ready_timeout_secs: u64,
    /// Liveness poll interval; 0 disables the watchdog.
    pub watchdog_interval_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ready_timeout_secs: 30,
            watchdog_interval_secs: 5,
        }
    }
}

impl ProxySettings {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn watchdog_interval(&self) -> Option<Duration> {
        (self.watchdog_interval_secs > 0).then(|| Duration::from_secs(self.watchdog_interval_secs))
    }
}

impl AppSettings {
    /// Reads settings from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Writes settings to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        let io_err = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };

        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(path, content).map_err(io_err)
    }

    /// Loads settings, falling back to defaults.
    ///
    /// Runs before logging is set up, so problems are returned as a message
    /// for the caller to log.
    pub fn load_or_create(path: &Path) -> (Self, Option<String>) {
        if !path.exists() {
            let settings = Self::default();
            let warning = settings.save(path).err().map(|e| {
                format!("Could not create default settings at {:?}: {}", path, e)
            });
            return (settings, warning);
        }

        match Self::load(path) {
            Ok(settings) => (settings, None),
            Err(e) => (
                Self::default(),
                Some(format!("Ignoring settings at {:?}, using defaults: {}", path, e)),
            ),
        }
    }
}
