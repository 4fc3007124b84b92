//! Takagi Library
//!
//! Takagi lets you use GitHub as an OpenID Connect 1.0 provider; its
//! sibling, Snowflake, does the same for Discord. Relying parties speak
//! vanilla OIDC while Takagi translates each flow into the upstream
//! provider's OAuth2 API and re-issues JWT tokens signed by a local keyset.
//!
//! # Features
//!
//! - **Authorization-code flow** with PKCE (S256 and plain) and single-use
//!   refresh tokens
//! - **Local keyset**: RS256 signing plus A256GCM encryption, managed or
//!   user-supplied, with atomic rotation
//! - **Claims projection**: `profile`, `email`, and `groups` scopes gate the
//!   identity claims; null claims are omitted
//! - **Discovery surface**: openid-configuration, JWKS, WebFinger
//! - **Host & redirect policy**: wildcard host allowlists, `/r/`-subpath
//!   redirect URIs, loopback/HTTPS rules

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod flow;
pub mod keyset;
pub mod policy;
pub mod server;
pub mod token;
pub mod upstream;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
