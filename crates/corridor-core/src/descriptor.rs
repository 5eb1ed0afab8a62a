//! VLESS connection descriptor and URI parsing.
//!
//! A connection URI has the shape
//! `vless://<id>@<address>:<port>?fp=<fp>&pbk=<key>&sni=<host>&sid=<short id>`.
//! Parsing never fails: every field that is missing or malformed falls back
//! to its default on its own, so a half-broken URI still yields a usable
//! descriptor.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

/// Environment variable consulted first for the connection URI.
pub const URI_ENV_VAR: &str = "VLESS_URI";

/// The only accepted URI scheme.
const SCHEME: &str = "vless";

/// Number of public key characters kept in diagnostics.
const REDACTED_KEY_PREFIX: usize = 20;

const DEFAULT_ID: &str = "331564911";
const DEFAULT_ADDRESS: &str = "94.131.110.172";
const DEFAULT_PORT: u16 = 23209;
const DEFAULT_FINGERPRINT: &str = "random";
const DEFAULT_PUBLIC_KEY: &str = "EhZf6JqOLErCdliMk1UBlpojo3cfw244QWtoZ-qUFTc";
const DEFAULT_SERVER_NAME: &str = "yahoo.com";
const DEFAULT_SHORT_ID: &str = "68c55e5189f67c90";

/// Remote endpoint and REALITY parameters for the outbound tunnel.
///
/// Serialized with the same short keys the URI query uses, so a settings
/// file section can provide a base descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionDescriptor {
    /// User/auth identifier.
    pub id: String,
    /// Remote hostname or IP.
    pub address: String,
    /// Remote port.
    pub port: u16,
    /// uTLS fingerprint.
    #[serde(rename = "fp")]
    pub fingerprint: String,
    /// REALITY public key.
    #[serde(rename = "pbk")]
    pub public_key: String,
    /// SNI presented to the camouflage host.
    #[serde(rename = "sni")]
    pub server_name: String,
    /// REALITY short id.
    #[serde(rename = "sid")]
    pub short_id: String,
}

impl Default for ConnectionDescriptor {
    fn default() -> Self {
        Self {
            id: DEFAULT_ID.to_string(),
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            fingerprint: DEFAULT_FINGERPRINT.to_string(),
            public_key: DEFAULT_PUBLIC_KEY.to_string(),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            short_id: DEFAULT_SHORT_ID.to_string(),
        }
    }
}

impl ConnectionDescriptor {
    /// Parses a connection URI on top of the built-in defaults.
    pub fn parse(uri: &str) -> Self {
        Self::parse_with_base(uri, &Self::default())
    }

    /// Parses a connection URI on top of `base`.
    ///
    /// Fields present in the URI replace the corresponding `base` field;
    /// everything else is copied from `base` unchanged.
    pub fn parse_with_base(uri: &str, base: &Self) -> Self {
        let mut descriptor = base.clone();
        let uri = uri.trim();

        if uri.is_empty() {
            tracing::warn!("No connection URI configured, using default connection settings");
            return descriptor;
        }

        let Some(rest) = strip_scheme(uri) else {
            tracing::warn!("Connection URI is not a {}:// URI, using defaults", SCHEME);
            return descriptor;
        };

        let parts = UriParts::split(rest);

        if let Some(userinfo) = parts.userinfo {
            // Anything after ':' is a password, which VLESS does not use.
            let user = userinfo.split(':').next().unwrap_or_default();
            match percent_decode_str(user).decode_utf8() {
                Ok(id) if !id.is_empty() => descriptor.id = id.into_owned(),
                Ok(_) => {}
                Err(e) => tracing::warn!("Ignoring undecodable user id in connection URI: {}", e),
            }
        }

        let (host, port) = split_host_port(parts.host_port);
        if let Some(host) = host {
            descriptor.address = host.to_string();
        }
        if let Some(port) = port {
            match port.parse::<u16>() {
                Ok(value) if value != 0 => descriptor.port = value,
                _ => tracing::warn!("Ignoring invalid port {:?} in connection URI", port),
            }
        }

        if let Some(query) = parts.query {
            apply_query(&mut descriptor, query);
        }

        tracing::debug!(
            "Parsed connection {}:{} (sni: {}, fp: {}, pbk: {})",
            descriptor.address,
            descriptor.port,
            descriptor.server_name,
            descriptor.fingerprint,
            descriptor.redacted_public_key()
        );

        descriptor
    }

    /// Returns the public key shortened for log output.
    pub fn redacted_public_key(&self) -> String {
        if self.public_key.chars().count() <= REDACTED_KEY_PREFIX {
            return self.public_key.clone();
        }
        let prefix: String = self.public_key.chars().take(REDACTED_KEY_PREFIX).collect();
        format!("{}...", prefix)
    }
}

fn strip_scheme(uri: &str) -> Option<&str> {
    let (scheme, rest) = uri.split_once("://")?;
    scheme.eq_ignore_ascii_case(SCHEME).then_some(rest)
}

/// Raw, still-encoded components of a URI after the scheme.
struct UriParts<'a> {
    userinfo: Option<&'a str>,
    host_port: &'a str,
    query: Option<&'a str>,
}

impl<'a> UriParts<'a> {
    fn split(rest: &'a str) -> Self {
        let rest = rest.split_once('#').map(|(head, _)| head).unwrap_or(rest);
        let (before_query, query) = match rest.split_once('?') {
            Some((head, query)) => (head, Some(query)),
            None => (rest, None),
        };
        let authority = before_query
            .split_once('/')
            .map(|(head, _)| head)
            .unwrap_or(before_query);
        let (userinfo, host_port) = match authority.rsplit_once('@') {
            Some((user, host)) => (Some(user), host),
            None => (None, authority),
        };

        Self {
            userinfo,
            host_port,
            query,
        }
    }
}

/// Splits `host[:port]` or `[v6]:port`, returning non-empty pieces only.
fn split_host_port(value: &str) -> (Option<&str>, Option<&str>) {
    if let Some(bracketed) = value.strip_prefix('[') {
        return match bracketed.split_once(']') {
            Some((host, tail)) => (
                non_empty(host),
                tail.strip_prefix(':').and_then(non_empty),
            ),
            None => (None, None),
        };
    }

    match value.rsplit_once(':') {
        Some((host, port)) => (non_empty(host), non_empty(port)),
        None => (non_empty(value), None),
    }
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

fn apply_query(descriptor: &mut ConnectionDescriptor, query: &str) {
    let mut fp = None;
    let mut pbk = None;
    let mut sid = None;
    let mut sni = None;
    let mut spx = None;

    // First occurrence of a key wins; blank or undecodable values count as absent.
    for pair in query.split('&') {
        let (key, raw) = pair.split_once('=').unwrap_or((pair, ""));
        let slot = match key {
            "fp" => &mut fp,
            "pbk" => &mut pbk,
            "sid" => &mut sid,
            "sni" => &mut sni,
            "spx" => &mut spx,
            _ => continue,
        };
        if slot.is_some() {
            continue;
        }
        match decode_query_value(raw) {
            Some(value) if !value.is_empty() => *slot = Some(value),
            Some(_) => {}
            None => tracing::warn!("Ignoring undecodable {} in connection URI", key),
        }
    }

    if let Some(value) = fp {
        descriptor.fingerprint = value;
    }
    if let Some(value) = pbk {
        descriptor.public_key = value;
    }
    if let Some(value) = sid {
        descriptor.short_id = value;
    }
    if let Some(value) = sni.or(spx) {
        descriptor.server_name = value;
    }
}

/// Decodes a form-encoded query value, `None` if it is not valid UTF-8.
fn decode_query_value(raw: &str) -> Option<String> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .ok()
        .map(|value| value.into_owned())
}

/// Where the connection URI was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriSource {
    /// Read from the `VLESS_URI` environment variable.
    Environment,
    /// Read from the first line of a file.
    File(PathBuf),
    /// No URI anywhere.
    Missing,
}

impl fmt::Display for UriSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Environment => write!(f, "${}", URI_ENV_VAR),
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Missing => write!(f, "nowhere"),
        }
    }
}

impl UriSource {
    /// Looks for a connection URI in the environment, then in `files` in order.
    pub fn discover(files: &[PathBuf]) -> (Self, String) {
        Self::discover_with(std::env::var(URI_ENV_VAR).ok(), files)
    }

    /// Same as [`UriSource::discover`] with an explicit environment value.
    pub fn discover_with(env_value: Option<String>, files: &[PathBuf]) -> (Self, String) {
        if let Some(uri) = env_value.map(|v| v.trim().to_string()) {
            if !uri.is_empty() {
                tracing::info!("Connection URI loaded from ${} (length: {})", URI_ENV_VAR, uri.len());
                return (Self::Environment, uri);
            }
        }

        for path in files {
            match read_first_line(path) {
                Ok(Some(uri)) => {
                    tracing::info!(
                        "Connection URI loaded from {} (length: {})",
                        path.display(),
                        uri.len()
                    );
                    return (Self::File(path.clone()), uri);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to read {}: {}", path.display(), e),
            }
        }

        tracing::warn!("Connection URI not found (checked ${} and {} files)", URI_ENV_VAR, files.len());
        (Self::Missing, String::new())
    }
}

/// Returns the trimmed first line of `path`, or `None` if the file is absent or blank.
fn read_first_line(path: &Path) -> std::io::Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let line = content.lines().next().unwrap_or_default().trim();
    Ok(non_empty(line).map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_uri_overrides_every_field() {
        let d = ConnectionDescriptor::parse(
            "vless://abc123@1.2.3.4:443?fp=chrome&pbk=KEY&sni=test.com&sid=SID1",
        );
        assert_eq!(d.id, "abc123");
        assert_eq!(d.address, "1.2.3.4");
        assert_eq!(d.port, 443);
        assert_eq!(d.fingerprint, "chrome");
        assert_eq!(d.public_key, "KEY");
        assert_eq!(d.server_name, "test.com");
        assert_eq!(d.short_id, "SID1");
    }

    #[test]
    fn empty_uri_yields_defaults() {
        assert_eq!(ConnectionDescriptor::parse(""), ConnectionDescriptor::default());
        assert_eq!(ConnectionDescriptor::parse("   "), ConnectionDescriptor::default());
    }

    #[test]
    fn defaults_match_documented_values() {
        let d = ConnectionDescriptor::default();
        assert_eq!(d.id, "331564911");
        assert_eq!(d.address, "94.131.110.172");
        assert_eq!(d.port, 23209);
        assert_eq!(d.fingerprint, "random");
        assert_eq!(d.server_name, "yahoo.com");
        assert_eq!(d.short_id, "68c55e5189f67c90");
    }

    #[test]
    fn other_schemes_yield_defaults() {
        let d = ConnectionDescriptor::parse("vmess://abc@1.2.3.4:443?sni=x.com");
        assert_eq!(d, ConnectionDescriptor::default());

        let d = ConnectionDescriptor::parse("not a uri at all");
        assert_eq!(d, ConnectionDescriptor::default());
    }

    #[test]
    fn legacy_spx_used_when_sni_absent() {
        let d = ConnectionDescriptor::parse("vless://id@host.example:8443?spx=example.org");
        assert_eq!(d.server_name, "example.org");
    }

    #[test]
    fn sni_wins_over_spx() {
        let d = ConnectionDescriptor::parse("vless://id@h:1?spx=legacy.org&sni=modern.org");
        assert_eq!(d.server_name, "modern.org");
    }

    #[test]
    fn partial_query_keeps_defaults_per_field() {
        let d = ConnectionDescriptor::parse("vless://user@10.0.0.1:2053?fp=firefox");
        let defaults = ConnectionDescriptor::default();

        assert_eq!(d.id, "user");
        assert_eq!(d.address, "10.0.0.1");
        assert_eq!(d.port, 2053);
        assert_eq!(d.fingerprint, "firefox");
        assert_eq!(d.public_key, defaults.public_key);
        assert_eq!(d.server_name, defaults.server_name);
        assert_eq!(d.short_id, defaults.short_id);
    }

    #[test]
    fn invalid_port_does_not_discard_other_fields() {
        let d = ConnectionDescriptor::parse("vless://keep-me@host.example:99999?sid=abcd");
        assert_eq!(d.id, "keep-me");
        assert_eq!(d.address, "host.example");
        assert_eq!(d.port, 23209);
        assert_eq!(d.short_id, "abcd");

        let d = ConnectionDescriptor::parse("vless://keep-me@host.example:http");
        assert_eq!(d.port, 23209);
        assert_eq!(d.address, "host.example");
    }

    #[test]
    fn malformed_percent_encoding_falls_back_for_id_only() {
        // %FF is not valid UTF-8 once decoded.
        let d = ConnectionDescriptor::parse("vless://bad%FFid@1.1.1.1:443?sni=ok.com");
        assert_eq!(d.id, "331564911");
        assert_eq!(d.address, "1.1.1.1");
        assert_eq!(d.port, 443);
        assert_eq!(d.server_name, "ok.com");
    }

    #[test]
    fn undecodable_query_value_falls_back_for_that_field_only() {
        let d = ConnectionDescriptor::parse("vless://bad%FFid@1.1.1.1:443?pbk=%FFkey&sni=ok.com");
        let defaults = ConnectionDescriptor::default();
        assert_eq!(d.id, defaults.id);
        assert_eq!(d.public_key, defaults.public_key);
        assert_eq!(d.server_name, "ok.com");
        assert_eq!(d.address, "1.1.1.1");
    }

    #[test]
    fn undecodable_first_value_does_not_block_later_occurrence() {
        let d = ConnectionDescriptor::parse("vless://id@h:1?sid=%C3%28&sid=abcd&fp=a+b");
        assert_eq!(d.short_id, "abcd");
        assert_eq!(d.fingerprint, "a b");
    }

    #[test]
    fn scheme_match_ignores_case() {
        let d = ConnectionDescriptor::parse("VLESS://abc@1.2.3.4:443");
        assert_eq!(d.id, "abc");
        assert_eq!(d.address, "1.2.3.4");
    }

    #[test]
    fn percent_encoded_values_are_decoded() {
        let d = ConnectionDescriptor::parse("vless://a%2Db@h:1?pbk=ab%2Bcd&sni=x.com");
        assert_eq!(d.id, "a-b");
        assert_eq!(d.public_key, "ab+cd");
    }

    #[test]
    fn first_occurrence_wins_and_blank_values_are_ignored() {
        let d = ConnectionDescriptor::parse("vless://id@h:1?fp=&fp=chrome&fp=safari&sid=");
        assert_eq!(d.fingerprint, "chrome");
        assert_eq!(d.short_id, "68c55e5189f67c90");
    }

    #[test]
    fn unknown_parameters_and_fragment_are_ignored() {
        let d = ConnectionDescriptor::parse(
            "vless://id@h.example:443?type=tcp&security=reality&flow=xtls-rprx-vision&sni=s.com#My%20Node",
        );
        assert_eq!(d.server_name, "s.com");
        assert_eq!(d.port, 443);
    }

    #[test]
    fn ipv6_host_is_unbracketed() {
        let d = ConnectionDescriptor::parse("vless://id@[2001:db8::1]:8443");
        assert_eq!(d.address, "2001:db8::1");
        assert_eq!(d.port, 8443);
    }

    #[test]
    fn missing_user_and_port_keep_defaults() {
        let d = ConnectionDescriptor::parse("vless://only.host.example/?sni=a.com");
        assert_eq!(d.id, "331564911");
        assert_eq!(d.address, "only.host.example");
        assert_eq!(d.port, 23209);
        assert_eq!(d.server_name, "a.com");
    }

    #[test]
    fn base_descriptor_fills_absent_fields() {
        let base = ConnectionDescriptor {
            address: "base.example".to_string(),
            fingerprint: "edge".to_string(),
            ..ConnectionDescriptor::default()
        };
        let d = ConnectionDescriptor::parse_with_base("vless://id@:443?sni=s.com", &base);
        assert_eq!(d.address, "base.example");
        assert_eq!(d.fingerprint, "edge");
        assert_eq!(d.port, 443);
        assert_eq!(d.server_name, "s.com");
    }

    #[test]
    fn public_key_redaction() {
        let d = ConnectionDescriptor::default();
        assert_eq!(d.redacted_public_key(), "EhZf6JqOLErCdliMk1UB...");

        let short = ConnectionDescriptor {
            public_key: "KEY".to_string(),
            ..ConnectionDescriptor::default()
        };
        assert_eq!(short.redacted_public_key(), "KEY");
    }

    #[test]
    fn descriptor_deserializes_partially() {
        let d: ConnectionDescriptor =
            serde_json::from_str(r#"{"address": "x.example", "sni": "y.example"}"#).unwrap();
        assert_eq!(d.address, "x.example");
        assert_eq!(d.server_name, "y.example");
        assert_eq!(d.port, 23209);
    }

    #[test]
    fn discover_prefers_environment() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("vless.txt");
        fs::write(&file, "vless://from-file@h:1\n").unwrap();

        let (source, uri) =
            UriSource::discover_with(Some("  vless://from-env@h:1 ".to_string()), &[file]);
        assert_eq!(source, UriSource::Environment);
        assert_eq!(uri, "vless://from-env@h:1");
    }

    #[test]
    fn discover_walks_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("vless.txt");
        let second = dir.path().join("config").join("vless.txt");
        fs::create_dir_all(second.parent().unwrap()).unwrap();
        fs::write(&second, "vless://second@h:1\nignored line\n").unwrap();

        let files = vec![first.clone(), second.clone()];
        let (source, uri) = UriSource::discover_with(Some(String::new()), &files);
        assert_eq!(source, UriSource::File(second));
        assert_eq!(uri, "vless://second@h:1");

        fs::write(&first, "vless://first@h:1").unwrap();
        let (source, uri) = UriSource::discover_with(None, &files);
        assert_eq!(source, UriSource::File(first));
        assert_eq!(uri, "vless://first@h:1");
    }

    #[test]
    fn discover_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let (source, uri) = UriSource::discover_with(None, &[dir.path().join("vless.txt")]);
        assert_eq!(source, UriSource::Missing);
        assert!(uri.is_empty());
    }
}
