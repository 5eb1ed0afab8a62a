//! Xray configuration generation.
//!
//! Maps a [`ConnectionDescriptor`] onto the two-section document Xray-core
//! reads at startup: one local SOCKS inbound and one VLESS/REALITY outbound.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::descriptor::ConnectionDescriptor;
use crate::error::{ConfigError, SchemaViolation};

/// Address the local SOCKS inbound listens on.
pub const LOCAL_LISTEN_HOST: &str = "127.0.0.1";

/// Port the local SOCKS inbound listens on.
pub const LOCAL_LISTEN_PORT: u16 = 1080;

/// Complete Xray configuration document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyConfig {
    pub log: LogSettings,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogSettings {
    pub loglevel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inbound {
    pub port: u16,
    pub listen: String,
    pub protocol: String,
    pub sniffing: Sniffing,
    pub settings: SocksSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sniffing {
    pub enabled: bool,
    pub dest_override: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SocksSettings {
    pub auth: String,
    pub udp: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub protocol: String,
    pub settings: VlessSettings,
    pub stream_settings: StreamSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VlessSettings {
    pub vnext: Vec<VlessServer>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VlessServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<VlessUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VlessUser {
    pub id: String,
    pub encryption: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    pub security: String,
    pub reality_settings: RealitySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    pub show: bool,
    pub fingerprint: String,
    pub server_name: String,
    pub public_key: String,
    pub short_id: String,
}

impl ProxyConfig {
    /// Builds the configuration for `descriptor`. Pure and deterministic.
    pub fn from_descriptor(descriptor: &ConnectionDescriptor) -> Self {
        Self {
            log: LogSettings {
                loglevel: "info".to_string(),
            },
            inbounds: vec![Inbound {
                port: LOCAL_LISTEN_PORT,
                listen: LOCAL_LISTEN_HOST.to_string(),
                protocol: "socks".to_string(),
                sniffing: Sniffing {
                    enabled: true,
                    dest_override: vec!["http".to_string(), "tls".to_string()],
                },
                settings: SocksSettings {
                    auth: "noauth".to_string(),
                    udp: true,
                },
            }],
            outbounds: vec![Outbound {
                protocol: "vless".to_string(),
                settings: VlessSettings {
                    vnext: vec![VlessServer {
                        address: descriptor.address.clone(),
                        port: descriptor.port,
                        users: vec![VlessUser {
                            id: descriptor.id.clone(),
                            encryption: "none".to_string(),
                        }],
                    }],
                },
                stream_settings: StreamSettings {
                    network: "tcp".to_string(),
                    security: "reality".to_string(),
                    reality_settings: RealitySettings {
                        show: false,
                        fingerprint: descriptor.fingerprint.clone(),
                        server_name: descriptor.server_name.clone(),
                        public_key: descriptor.public_key.clone(),
                        short_id: descriptor.short_id.clone(),
                    },
                },
            }],
        }
    }

    /// Local port the generated inbound listens on.
    pub fn local_port(&self) -> u16 {
        self.inbounds
            .first()
            .map(|inbound| inbound.port)
            .unwrap_or(LOCAL_LISTEN_PORT)
    }

    /// Renders the document as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks the rendered document against the fixed schema.
    pub fn validate(&self) -> Result<(), SchemaViolation> {
        let value = serde_json::to_value(self)
            .map_err(|e| SchemaViolation::new("$", e.to_string()))?;
        validate_document(&value)
    }
}

/// Validates an arbitrary JSON document against the proxy config schema:
/// exactly one inbound with integer `port`, string `listen` and `protocol`,
/// and exactly one outbound with string `protocol` and object `settings`.
pub fn validate_document(doc: &Value) -> Result<(), SchemaViolation> {
    let root = doc
        .as_object()
        .ok_or_else(|| SchemaViolation::new("$", "root must be an object"))?;

    if let Some(log) = root.get("log") {
        if !log.is_object() {
            return Err(SchemaViolation::new("$.log", "must be an object"));
        }
    }

    let inbound = single_entry(root.get("inbounds"), "$.inbounds")?;
    require(inbound, "$.inbounds[0]", "port", Value::is_u64, "an integer")?;
    require(inbound, "$.inbounds[0]", "listen", Value::is_string, "a string")?;
    require(inbound, "$.inbounds[0]", "protocol", Value::is_string, "a string")?;

    let outbound = single_entry(root.get("outbounds"), "$.outbounds")?;
    require(outbound, "$.outbounds[0]", "protocol", Value::is_string, "a string")?;
    require(outbound, "$.outbounds[0]", "settings", Value::is_object, "an object")?;

    Ok(())
}

fn single_entry<'a>(value: Option<&'a Value>, path: &str) -> Result<&'a Value, SchemaViolation> {
    let entries = value
        .and_then(Value::as_array)
        .ok_or_else(|| SchemaViolation::new(path, "must be an array"))?;
    match entries.as_slice() {
        [entry] if entry.is_object() => Ok(entry),
        [_] => Err(SchemaViolation::new(format!("{path}[0]"), "must be an object")),
        _ => Err(SchemaViolation::new(
            path,
            format!("must contain exactly one entry, found {}", entries.len()),
        )),
    }
}

fn require(
    entry: &Value,
    path: &str,
    field: &str,
    check: fn(&Value) -> bool,
    expected: &str,
) -> Result<(), SchemaViolation> {
    match entry.get(field) {
        Some(value) if check(value) => Ok(()),
        Some(_) => Err(SchemaViolation::new(
            format!("{path}.{field}"),
            format!("must be {expected}"),
        )),
        None => Err(SchemaViolation::new(format!("{path}.{field}"), "is required")),
    }
}

/// Generates the proxy configuration and persists it to a fixed path.
#[derive(Debug, Clone)]
pub struct ConfigGenerator {
    path: PathBuf,
}

impl ConfigGenerator {
    /// Creates a generator writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path the configuration is written to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Builds, validates and writes the configuration for `descriptor`.
    ///
    /// A schema violation is logged and does not stop the write; only I/O
    /// and serialization failures are returned.
    pub fn generate(&self, descriptor: &ConnectionDescriptor) -> Result<ProxyConfig, ConfigError> {
        let config = ProxyConfig::from_descriptor(descriptor);

        match config.validate() {
            Ok(()) => tracing::debug!("Proxy configuration validated"),
            Err(violation) => tracing::error!("Generated proxy configuration is invalid: {}", violation),
        }

        tracing::info!(
            "Writing proxy configuration for {}:{} to {:?}",
            descriptor.address,
            descriptor.port,
            self.path
        );
        write_atomically(&self.path, config.to_json()?.as_bytes())?;

        Ok(config)
    }
}

/// Writes `contents` next to `path` and renames it into place, replacing
/// any previous file.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(|source| {
        let _ = fs::remove_file(&tmp);
        io_err(source)
    })
}
