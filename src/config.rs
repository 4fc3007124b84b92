//! Configuration management
//!
//! All settings come from the environment, prefixed with `TAKAGI_` (GitHub
//! mode) or `SNOWFLAKE_` (Discord mode). Every option has an explicit
//! default; validation runs once at startup and configuration faults are
//! fatal.

use std::path::PathBuf;
use std::time::Duration;

use figment::{Figment, providers::Env};
use serde::Deserialize;
use tracing::warn;

use crate::{Error, Result};

/// Loopback hosts — always on the host allowlist, always treated as secure
/// when `treat_loopback_as_secure` is enabled.
pub const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1"];

/// Minimum permitted token lifetime when one is configured.
const MIN_TOKEN_LIFETIME: Duration = Duration::from_secs(60);

/// Behavior of `GET /`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootRedirect {
    /// Redirect to the project repository
    Repo,
    /// Redirect to the upstream provider's application settings page
    Settings,
    /// Redirect to the local `/docs` page (forces `enable_docs`)
    Docs,
    /// Respond 404
    Off,
}

/// Main configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Host-header allowlist; wildcard domains supported, `*` means any host
    #[serde(with = "csv_list")]
    pub allowed_hosts: Vec<String>,
    /// Client-ID allowlist for `/authorize` and `/token`
    #[serde(with = "csv_list")]
    pub allowed_clients: Vec<String>,
    /// URL prefix under which the service is mounted
    pub base_path: String,
    /// Rewrite non-`/r/` redirect URIs instead of rejecting them
    pub fix_redirect_uris: bool,
    /// Token TTL; absent means tokens effectively never expire
    #[serde(with = "duration_opt")]
    pub token_lifetime: Option<Duration>,
    /// Behavior of `GET /`
    pub root_redirect: RootRedirect,
    /// Permit plain HTTP for loopback origins
    pub treat_loopback_as_secure: bool,
    /// Default for the per-request `return` parameter
    pub return_to_referrer: bool,
    /// WebFinger domain allowlist; wildcard domains allowed, bare `*` is not
    #[serde(with = "csv_list")]
    pub allowed_webfinger_hosts: Vec<String>,
    /// Externally-supplied JWK Set JSON
    pub keyset: Option<String>,
    /// Path to an externally-supplied JWK Set (mutually exclusive with `keyset`)
    pub keyset_file: Option<PathBuf>,
    /// Serve `/docs` and `/openapi.json`
    pub enable_docs: bool,
    /// Directory holding the managed keyset file
    pub data_dir: PathBuf,
    /// Lifetime of in-flight authorization transactions and codes
    #[serde(with = "duration_str")]
    pub auth_request_ttl: Duration,
    /// Deadline for upstream HTTP calls
    #[serde(with = "duration_str")]
    pub upstream_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            allowed_hosts: Vec::new(),
            allowed_clients: vec!["*".to_string()],
            base_path: "/".to_string(),
            fix_redirect_uris: false,
            token_lifetime: None,
            root_redirect: RootRedirect::Repo,
            treat_loopback_as_secure: true,
            return_to_referrer: false,
            allowed_webfinger_hosts: Vec::new(),
            keyset: None,
            keyset_file: None,
            enable_docs: false,
            data_dir: PathBuf::from("data"),
            auth_request_ttl: Duration::from_secs(600),
            upstream_timeout: Duration::from_secs(10),
        }
    }
}

impl Settings {
    /// Load settings from environment variables with the given prefix
    /// (e.g. `TAKAGI_`), then validate and normalize them.
    pub fn load(env_prefix: &str) -> Result<Self> {
        let mut settings: Self = Figment::new()
            .merge(Env::prefixed(env_prefix))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        settings.validate(env_prefix)?;
        Ok(settings)
    }

    /// Validate the configuration and normalize derived fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on any fatal configuration fault; the
    /// process must not start in that case.
    pub fn validate(&mut self, env_prefix: &str) -> Result<()> {
        if self.keyset.is_some() && self.keyset_file.is_some() {
            return Err(Error::Config(format!(
                "{env_prefix}KEYSET and {env_prefix}KEYSET_FILE are mutually exclusive"
            )));
        }

        if let Some(lifetime) = self.token_lifetime {
            if lifetime < MIN_TOKEN_LIFETIME {
                return Err(Error::Config(format!(
                    "{env_prefix}TOKEN_LIFETIME must be at least 60 seconds"
                )));
            }
        }

        if self.allowed_webfinger_hosts.iter().any(|h| h == "*") {
            return Err(Error::Config(format!(
                "The unqualified wildcard ('*') is not permitted in {env_prefix}ALLOWED_WEBFINGER_HOSTS"
            )));
        }

        // `docs` as the root redirect target only makes sense with docs enabled.
        if self.root_redirect == RootRedirect::Docs {
            self.enable_docs = true;
        }

        // Warn on the exact `*` entry only; wildcard domains like
        // `*.example.com` are a deliberate, narrower choice.
        if self.allowed_hosts.iter().any(|h| h == "*") {
            warn!("Setting {env_prefix}ALLOWED_HOSTS to '*' is insecure and not recommended");
        }

        // Loopbacks are always allowed.
        for loopback in LOOPBACK_HOSTS {
            if !self.allowed_hosts.iter().any(|h| h == loopback) {
                self.allowed_hosts.push((*loopback).to_string());
            }
        }

        self.base_path = normalize_base_path(&self.base_path);

        Ok(())
    }
}

/// Normalize a base path to either `""` (mounted at the root) or
/// `/some/prefix` with a leading slash and no trailing slash.
fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Parse a duration with the extended unit grammar.
///
/// Standard units `ns`, `us`, `ms`, `s`, `m`, `h` plus `d` (24h), `w` (7d),
/// `mm` (30d), and `y` (365d). Segments may be chained (`1h30m`); a bare
/// integer is taken as seconds.
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let bytes = s.as_bytes();
    let mut total = Duration::ZERO;
    let mut i = 0;

    while i < s.len() {
        let start = i;
        while i < s.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
            i += 1;
        }
        if i == start {
            return Err(format!("invalid duration {s:?}"));
        }
        let value: f64 = s[start..i]
            .parse()
            .map_err(|_| format!("invalid duration {s:?}"))?;

        let unit_start = i;
        while i < s.len() && bytes[i].is_ascii_alphabetic() {
            i += 1;
        }
        let unit_secs = match &s[unit_start..i] {
            "ns" => 1e-9,
            "us" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "d" => 86400.0,
            "w" => 604_800.0,
            "mm" => 2_592_000.0,
            "y" => 31_536_000.0,
            other => return Err(format!("unknown duration unit {other:?}")),
        };

        total += Duration::from_secs_f64(value * unit_secs);
    }

    Ok(total)
}

/// A raw environment value that the provider may have parsed as a number
/// (e.g. a purely numeric Discord client ID or a bare-seconds duration).
#[derive(Deserialize)]
#[serde(untagged)]
enum RawValue {
    Num(u64),
    Str(String),
}

impl RawValue {
    fn into_string(self) -> String {
        match self {
            Self::Num(n) => n.to_string(),
            Self::Str(s) => s,
        }
    }
}

/// Serde helper for comma-separated list values.
mod csv_list {
    use serde::{Deserialize, Deserializer};

    use super::RawValue;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawValue::deserialize(deserializer)?.into_string();
        Ok(raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Serde helper for required durations in the extended grammar.
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    use super::RawValue;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawValue::deserialize(deserializer)?.into_string();
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Serde helper for optional durations in the extended grammar.
mod duration_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    use super::RawValue;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawValue::deserialize(deserializer)?.into_string();
        super::parse_duration(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Duration grammar
    // =========================================================================

    #[test]
    fn parse_duration_standard_units() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn parse_duration_extended_units() {
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("1w").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse_duration("1mm").unwrap(), Duration::from_secs(2_592_000));
        assert_eq!(parse_duration("1y").unwrap(), Duration::from_secs(31_536_000));
    }

    #[test]
    fn parse_duration_chained_segments() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn parse_duration_bare_integer_is_seconds() {
        assert_eq!(parse_duration("3600").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("1parsec").is_err());
        assert!(parse_duration("h").is_err());
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn validate_rejects_both_keyset_sources() {
        let mut settings = Settings {
            keyset: Some("{}".to_string()),
            keyset_file: Some(PathBuf::from("keys.json")),
            ..Settings::default()
        };

        let err = settings.validate("TAKAGI_").unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn validate_rejects_short_token_lifetime() {
        let mut settings = Settings {
            token_lifetime: Some(Duration::from_secs(59)),
            ..Settings::default()
        };

        assert!(settings.validate("TAKAGI_").is_err());
    }

    #[test]
    fn validate_accepts_minimum_token_lifetime() {
        let mut settings = Settings {
            token_lifetime: Some(Duration::from_secs(60)),
            ..Settings::default()
        };

        assert!(settings.validate("TAKAGI_").is_ok());
    }

    #[test]
    fn validate_rejects_bare_wildcard_webfinger_host() {
        let mut settings = Settings {
            allowed_webfinger_hosts: vec!["*".to_string()],
            ..Settings::default()
        };

        assert!(settings.validate("SNOWFLAKE_").is_err());
    }

    #[test]
    fn validate_allows_wildcard_domain_webfinger_host() {
        let mut settings = Settings {
            allowed_webfinger_hosts: vec!["*.example.com".to_string()],
            ..Settings::default()
        };

        assert!(settings.validate("SNOWFLAKE_").is_ok());
    }

    #[test]
    fn validate_always_includes_loopbacks() {
        let mut settings = Settings {
            allowed_hosts: vec!["takagi.example.com".to_string()],
            ..Settings::default()
        };
        settings.validate("TAKAGI_").unwrap();

        for loopback in LOOPBACK_HOSTS {
            assert!(settings.allowed_hosts.iter().any(|h| h == loopback));
        }
        assert!(settings.allowed_hosts.iter().any(|h| h == "takagi.example.com"));
    }

    #[test]
    fn validate_does_not_duplicate_loopbacks() {
        let mut settings = Settings {
            allowed_hosts: vec!["localhost".to_string()],
            ..Settings::default()
        };
        settings.validate("TAKAGI_").unwrap();

        let count = settings.allowed_hosts.iter().filter(|h| *h == "localhost").count();
        assert_eq!(count, 1);
    }

    #[test]
    fn validate_docs_root_redirect_forces_docs() {
        let mut settings = Settings {
            root_redirect: RootRedirect::Docs,
            enable_docs: false,
            ..Settings::default()
        };
        settings.validate("TAKAGI_").unwrap();

        assert!(settings.enable_docs);
    }

    // =========================================================================
    // Base path normalization
    // =========================================================================

    #[test]
    fn base_path_root_normalizes_to_empty() {
        assert_eq!(normalize_base_path("/"), "");
        assert_eq!(normalize_base_path(""), "");
    }

    #[test]
    fn base_path_gets_leading_slash_and_no_trailing() {
        assert_eq!(normalize_base_path("oidc/"), "/oidc");
        assert_eq!(normalize_base_path("/oidc"), "/oidc");
        assert_eq!(normalize_base_path("/a/b/"), "/a/b");
    }
}
