//! Corridor - browser shell routed through a VLESS/REALITY tunnel.
//!
//! This crate provides the application layer on top of `corridor-core`:
//!
//! - TOML settings with per-field defaults
//! - Frontend fallback chain (system browser, headless)
//! - Log directory resolution for portable and installed deployments

pub mod frontend;
pub mod settings;

use std::path::PathBuf;

use corridor_core::Layout;
use directories::ProjectDirs;

/// Directory name for log files.
pub const LOGS_DIR: &str = "logs";

/// Where log files are written.
///
/// Portable deployments keep logs next to the executable; otherwise the
/// platform data directory is used.
pub fn logs_dir(layout: &Layout) -> Option<PathBuf> {
    if layout.is_portable() {
        return Some(layout.install_dir().join(LOGS_DIR));
    }
    ProjectDirs::from("", "corridor", "Corridor").map(|dirs| dirs.data_dir().join(LOGS_DIR))
}
