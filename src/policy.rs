//! Host, transport, client, and redirect-URI policy.
//!
//! This module is the trust boundary for everything that arrives in a URL or
//! a `Host` header. All checks are pure functions over the loaded settings so
//! they can be tested without a running server.
//!
//! # Host patterns
//!
//! | Pattern | Matches |
//! |---------|---------|
//! | `example.com` | exactly `example.com` |
//! | `*.example.com` | any host ending in `.example.com` with a non-empty prefix |
//! | `*` | any host |
//!
//! Loopback hosts (`localhost`, `127.0.0.1`, `::1`) are always accepted
//! regardless of the allowlist.

use url::Url;

use crate::config::LOOPBACK_HOSTS;

/// Returns `true` if `host` is a loopback address.
#[must_use]
pub fn is_loopback(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    LOOPBACK_HOSTS.iter().any(|l| l.eq_ignore_ascii_case(host))
}

/// Match a single allowlist pattern against a hostname.
///
/// Wildcard patterns (`*.example.com`) match one **or more** label prefixes:
/// both `a.example.com` and `a.b.example.com` match, `example.com` itself
/// does not.
#[must_use]
pub fn host_matches(pattern: &str, host: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(suffix) = pattern.strip_prefix("*.") {
        // The prefix before the suffix must be at least one non-empty label.
        return host
            .strip_suffix(suffix)
            .and_then(|rest| rest.strip_suffix('.'))
            .is_some_and(|labels| !labels.is_empty());
    }

    pattern.eq_ignore_ascii_case(host)
}

/// Returns `true` if `host` passes the allowlist (or is loopback).
#[must_use]
pub fn host_allowed(allowed_hosts: &[String], host: &str) -> bool {
    if is_loopback(host) {
        return true;
    }
    allowed_hosts.iter().any(|p| host_matches(p, host))
}

/// Strip an optional `:port` suffix from a `Host` header value.
///
/// IPv6 literals keep their brackets stripped (`[::1]:8080` → `::1`).
#[must_use]
pub fn strip_port(host_header: &str) -> &str {
    if let Some(stripped) = host_header.strip_prefix('[') {
        // Bracketed IPv6, possibly with a port after the closing bracket.
        if let Some(end) = stripped.find(']') {
            return &stripped[..end];
        }
    }
    host_header.split(':').next().unwrap_or(host_header)
}

/// Returns `true` if the URL is HTTPS, or points at a loopback host while
/// loopback traffic is treated as secure.
#[must_use]
pub fn is_secure_transport(url: &Url, treat_loopback_as_secure: bool) -> bool {
    if url.scheme() == "https" {
        return true;
    }
    treat_loopback_as_secure && url.host_str().is_some_and(is_loopback)
}

/// Returns `true` if the client ID passes the allowlist.
#[must_use]
pub fn client_allowed(allowed_clients: &[String], client_id: &str) -> bool {
    allowed_clients
        .iter()
        .any(|c| c == "*" || c == client_id)
}

/// Rewrite a redirect URI into a subpath of the `/r/` callback endpoint.
///
/// `redirect_endpoint` is the absolute URL of `/r` under the observed base.
/// A URI that already points below it is returned unchanged; anything else
/// becomes `<redirect_endpoint>/<original-uri>`.
#[must_use]
pub fn fix_redirect_uri(redirect_endpoint: &str, redirect_uri: &str) -> String {
    let prefix = format!("{redirect_endpoint}/");
    if redirect_uri.starts_with(&prefix) {
        redirect_uri.to_string()
    } else {
        format!("{prefix}{redirect_uri}")
    }
}

/// Returns `true` if the WebFinger email domain passes the allowlist.
///
/// Wildcard domains are permitted here; the bare `*` is rejected at
/// configuration time and never reaches this function.
#[must_use]
pub fn webfinger_host_allowed(allowed_hosts: &[String], domain: &str) -> bool {
    allowed_hosts.iter().any(|p| host_matches(p, domain))
}

/// Parse a WebFinger `resource` of the form `acct:<email>`.
///
/// Returns the `(local, domain)` parts when the resource is an `acct:` URI
/// wrapping a syntactically plausible email address; `None` otherwise.
#[must_use]
pub fn parse_acct_resource(resource: &str) -> Option<(&str, &str)> {
    let email = resource.strip_prefix("acct:")?;
    let (local, domain) = email.rsplit_once('@')?;

    if local.is_empty() || domain.is_empty() || local.contains(char::is_whitespace) {
        return None;
    }
    // Domains are dot-separated labels of alphanumerics and hyphens.
    let valid_domain = domain.split('.').all(|label| {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    if !valid_domain {
        return None;
    }

    Some((local, domain))
}
