//! Corridor Core - connection parsing, Xray configuration and process supervision.
//!
//! This crate brings up a local SOCKS5 proxy backed by an external Xray-core
//! process tunneling over VLESS with REALITY, and publishes its address for
//! HTTP clients in the same process.
//!
//! ## Features
//!
//! - Parses `vless://` connection URIs, falling back to defaults per field
//! - Generates and persists the Xray configuration document
//! - Locates the Xray binary or downloads the release archive
//! - Launches Xray with bounded retries and stops it gracefully
//! - Confirms the SOCKS inbound answers before publishing the proxy
//!
//! ## Startup
//!
//! ```text
//! URI → Descriptor → config.json → ensure binary → launch → probe → publish
//!                                        │             │         │
//!                                        └─────────────┴─────────┴──→ Unavailable
//! ```

pub mod descriptor;
mod error;
pub mod layout;
pub mod provision;
pub mod proxy_env;
pub mod readiness;
pub mod service;
pub mod supervisor;
pub mod xray_config;

pub use descriptor::{ConnectionDescriptor, UriSource, URI_ENV_VAR};
pub use error::{ConfigError, Result, SchemaViolation, ServiceError};
pub use layout::Layout;
pub use provision::{BinaryProvisioner, ProvisionError};
pub use proxy_env::{ProxyEndpoint, ProxyEnvironment, ProxyScheme};
pub use readiness::ReadinessProbe;
pub use service::{VpnService, VpnStatus};
pub use supervisor::{LaunchError, ProcessInfo, ProcessSupervisor, SupervisorConfig};
pub use xray_config::{ConfigGenerator, ProxyConfig};
