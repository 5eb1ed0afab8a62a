//! Xray binary provisioning.
//!
//! Locates the proxy engine executable in a fixed list of directories and,
//! when it is missing everywhere, downloads the platform release archive and
//! extracts the executable into the first directory of the list.

use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error types for binary provisioning.
///
/// Every variant means the binary is unavailable; callers decide whether to
/// continue without the proxy.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Download failed with HTTP status {0}")]
    Status(u16),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("ZIP extraction error: {0}")]
    Zip(String),

    #[error("{0} not found in archive")]
    MissingEntry(String),

    #[error("No download available for this platform")]
    UnsupportedPlatform,
}

/// Result type for provisioning.
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Executable name of the proxy engine.
#[cfg(target_os = "windows")]
pub const XRAY_BINARY: &str = "xray.exe";

#[cfg(not(target_os = "windows"))]
pub const XRAY_BINARY: &str = "xray";

const RELEASE_BASE_URL: &str = "https://github.com/XTLS/Xray-core/releases/latest/download";

/// Release archive for Windows x64.
#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
const XRAY_ARCHIVE: &str = "Xray-windows-64.zip";

/// Release archive for Linux x64.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
const XRAY_ARCHIVE: &str = "Xray-linux-64.zip";

/// Release archive for Linux ARM64.
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
const XRAY_ARCHIVE: &str = "Xray-linux-arm64-v8a.zip";

/// Release archive for macOS x64.
#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
const XRAY_ARCHIVE: &str = "Xray-macos-64.zip";

/// Release archive for macOS ARM64.
#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
const XRAY_ARCHIVE: &str = "Xray-macos-arm64-v8a.zip";

/// Fallback for unsupported platforms.
#[cfg(not(any(
    all(target_os = "windows", target_arch = "x86_64"),
    all(target_os = "linux", target_arch = "x86_64"),
    all(target_os = "linux", target_arch = "aarch64"),
    all(target_os = "macos", target_arch = "x86_64"),
    all(target_os = "macos", target_arch = "aarch64"),
)))]
const XRAY_ARCHIVE: &str = "";

/// Connect timeout for the release download.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Total timeout for the release download.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Download URL of the release archive for this platform, if there is one.
pub fn default_download_url() -> Option<String> {
    if XRAY_ARCHIVE.is_empty() {
        None
    } else {
        Some(format!("{}/{}", RELEASE_BASE_URL, XRAY_ARCHIVE))
    }
}

/// Locates or downloads the proxy engine executable.
#[derive(Debug, Clone)]
pub struct BinaryProvisioner {
    /// Directories searched, in priority order. Downloads go to the first.
    search_dirs: Vec<PathBuf>,
    /// Executable file name.
    binary_name: String,
    /// Release archive URL.
    download_url: Option<String>,
    connect_timeout: Duration,
    download_timeout: Duration,
}

impl BinaryProvisioner {
    /// Creates a provisioner for the Xray binary searching `search_dirs`.
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self {
            search_dirs,
            binary_name: XRAY_BINARY.to_string(),
            download_url: default_download_url(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }

    /// Overrides the executable name.
    pub fn with_binary_name(mut self, name: impl Into<String>) -> Self {
        self.binary_name = name.into();
        self
    }

    /// Overrides the release archive URL.
    pub fn with_download_url(mut self, url: Option<String>) -> Self {
        self.download_url = url;
        self
    }

    /// Overrides the download timeouts.
    pub fn with_timeouts(mut self, connect: Duration, total: Duration) -> Self {
        self.connect_timeout = connect;
        self.download_timeout = total;
        self
    }

    /// Returns the searched directories.
    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Returns the executable name.
    pub fn binary_name(&self) -> &str {
        &self.binary_name
    }

    /// Path a downloaded binary is written to.
    pub fn install_path(&self) -> Option<PathBuf> {
        self.search_dirs
            .first()
            .map(|dir| dir.join(&self.binary_name))
    }

    /// Returns the first existing binary in the search directories.
    pub fn locate(&self) -> Option<PathBuf> {
        self.search_dirs
            .iter()
            .map(|dir| dir.join(&self.binary_name))
            .find(|path| path.is_file())
    }

    /// Returns the binary path, downloading it first if it is missing.
    ///
    /// Makes no network request when the binary already exists. The
    /// download is attempted once per call.
    pub async fn ensure(&self) -> Result<PathBuf> {
        if let Some(path) = self.locate() {
            tracing::info!("Xray binary found at {:?}", path);
            return Ok(path);
        }

        let result = self.download().await;
        match &result {
            Ok(path) => tracing::info!("Xray binary installed at {:?}", path),
            Err(e) => tracing::error!("Xray binary unavailable: {}", e),
        }
        result
    }

    async fn download(&self) -> Result<PathBuf> {
        let url = self
            .download_url
            .as_deref()
            .ok_or(ProvisionError::UnsupportedPlatform)?;
        let target = self.install_path().ok_or_else(|| {
            ProvisionError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no binary directory configured",
            ))
        })?;

        tracing::info!("Xray binary not found, downloading {}", url);

        let client = reqwest::Client::builder()
            .user_agent(format!("Corridor/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(self.connect_timeout)
            .timeout(self.download_timeout)
            .build()
            .map_err(|e| ProvisionError::Network(e.to_string()))?;

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| ProvisionError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProvisionError::Status(response.status().as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProvisionError::Network(e.to_string()))?;

        tracing::debug!("Downloaded {} bytes, extracting {}", bytes.len(), self.binary_name);

        let binary = extract_entry(&bytes, &self.binary_name)?;
        install_file(&target, &binary)?;

        Ok(target)
    }
}

/// Extracts the archive entry whose file name is `name` (at any depth).
pub fn extract_entry(archive: &[u8], name: &str) -> Result<Vec<u8>> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(archive)).map_err(|e| ProvisionError::Zip(e.to_string()))?;

    let suffix = format!("/{}", name);
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| ProvisionError::Zip(e.to_string()))?;
        let entry_name = file.name().replace('\\', "/");

        if file.is_file() && (entry_name == name || entry_name.ends_with(&suffix)) {
            let mut buffer = Vec::new();
            file.read_to_end(&mut buffer)?;
            return Ok(buffer);
        }
    }

    Err(ProvisionError::MissingEntry(name.to_string()))
}

/// Writes `contents` to a temporary sibling of `target`, marks it
/// executable and renames it into place.
fn install_file(target: &Path, contents: &[u8]) -> Result<()> {
    let dir = target.parent().ok_or_else(|| {
        ProvisionError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "binary path has no parent directory",
        ))
    })?;
    fs::create_dir_all(dir)?;

    let tmp = dir.join(format!(
        ".{}.download",
        target.file_name().and_then(|n| n.to_str()).unwrap_or("xray")
    ));

    let written = write_executable(&tmp, contents).and_then(|()| fs::rename(&tmp, target));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn write_executable(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(())
}
