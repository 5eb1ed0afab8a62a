//! Deployment layout.
//!
//! Resolves where the proxy binary, its configuration, the connection URI
//! files and the settings file live. A `portable.txt` marker next to the
//! executable switches everything to paths relative to the install
//! directory.

use std::io;
use std::path::{Path, PathBuf};

/// Marker file enabling portable mode.
pub const PORTABLE_MARKER: &str = "portable.txt";

/// Directory holding the proxy binary.
pub const BIN_DIR: &str = "bin";

/// Directory holding configuration files.
pub const CONFIG_DIR: &str = "config";

/// Proxy configuration file name.
pub const PROXY_CONFIG_FILE: &str = "config.json";

/// Connection URI file name.
pub const URI_FILE: &str = "vless.txt";

/// Settings file name.
pub const SETTINGS_FILE: &str = "config.toml";

/// Resolved deployment layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    work_dir: PathBuf,
    install_dir: PathBuf,
    portable: bool,
}

impl Layout {
    /// Creates a layout from explicit directories.
    pub fn new(work_dir: impl Into<PathBuf>, install_dir: impl Into<PathBuf>, portable: bool) -> Self {
        Self {
            work_dir: work_dir.into(),
            install_dir: install_dir.into(),
            portable,
        }
    }

    /// Detects the layout of the running process.
    pub fn detect() -> io::Result<Self> {
        let work_dir = std::env::current_dir()?;
        let exe = std::env::current_exe()?;
        let install_dir = exe
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| work_dir.clone());
        let portable = install_dir.join(PORTABLE_MARKER).exists();

        if portable {
            tracing::info!("Running in portable mode from {:?}", install_dir);
        }

        Ok(Self::new(work_dir, install_dir, portable))
    }

    /// Working directory.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Directory of the running executable.
    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Whether portable mode is active.
    pub fn is_portable(&self) -> bool {
        self.portable
    }

    /// Base directory for files the application owns.
    pub fn root(&self) -> &Path {
        if self.portable {
            &self.install_dir
        } else {
            &self.work_dir
        }
    }

    /// Directories searched for the proxy binary, in priority order.
    ///
    /// The first entry is also where a downloaded binary is placed.
    pub fn binary_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if self.portable {
            dirs.push(self.install_dir.join(BIN_DIR));
            dirs.push(self.install_dir.clone());
        }
        dirs.push(self.work_dir.join(BIN_DIR));
        dirs.push(self.install_dir.join(BIN_DIR));

        let mut unique: Vec<PathBuf> = Vec::with_capacity(dirs.len());
        for dir in dirs {
            if !unique.contains(&dir) {
                unique.push(dir);
            }
        }
        unique
    }

    /// Where the generated proxy configuration is written.
    pub fn proxy_config_path(&self) -> PathBuf {
        if self.portable {
            self.root().join(CONFIG_DIR).join(PROXY_CONFIG_FILE)
        } else {
            self.root().join(PROXY_CONFIG_FILE)
        }
    }

    /// Files searched for the connection URI, in priority order.
    pub fn uri_files(&self) -> Vec<PathBuf> {
        vec![
            self.root().join(URI_FILE),
            self.root().join(CONFIG_DIR).join(URI_FILE),
        ]
    }

    /// Default settings file location.
    pub fn settings_path(&self) -> PathBuf {
        self.root().join(CONFIG_DIR).join(SETTINGS_FILE)
    }
}
