//! Process-wide proxy address for HTTP clients.

use std::fmt;

use crate::xray_config::{LOCAL_LISTEN_HOST, LOCAL_LISTEN_PORT};

/// Proxy protocol spoken by the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Socks5,
    Http,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Socks5 => "socks5",
            ProxyScheme::Http => "http",
        }
    }
}

impl fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a local proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn new(scheme: ProxyScheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// The SOCKS inbound of the generated Xray configuration.
    pub fn local_socks() -> Self {
        Self::new(ProxyScheme::Socks5, LOCAL_LISTEN_HOST, LOCAL_LISTEN_PORT)
    }

    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Names of the environment variables HTTP clients read their proxy from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEnvironment {
    http_var: String,
    https_var: String,
}

impl Default for ProxyEnvironment {
    fn default() -> Self {
        Self::with_vars("HTTP_PROXY", "HTTPS_PROXY")
    }
}

impl ProxyEnvironment {
    pub fn with_vars(http_var: impl Into<String>, https_var: impl Into<String>) -> Self {
        Self {
            http_var: http_var.into(),
            https_var: https_var.into(),
        }
    }

    /// Points both variables at `endpoint`.
    pub fn publish(&self, endpoint: &ProxyEndpoint) {
        self.publish_url(&endpoint.url());
    }

    /// Points both variables at `url`.
    ///
    /// The process environment is shared without locking: call this once,
    /// before starting anything that reads the variables.
    pub fn publish_url(&self, url: &str) {
        std::env::set_var(&self.http_var, url);
        std::env::set_var(&self.https_var, url);
        tracing::info!("Proxy published: {}={} {}={}", self.http_var, url, self.https_var, url);
    }

    /// Removes both variables.
    pub fn clear(&self) {
        std::env::remove_var(&self.http_var);
        std::env::remove_var(&self.https_var);
        tracing::debug!("Proxy environment cleared");
    }

    /// Current values of the HTTP and HTTPS variables.
    pub fn current(&self) -> (Option<String>, Option<String>) {
        (
            std::env::var(&self.http_var).ok(),
            std::env::var(&self.https_var).ok(),
        )
    }
}
