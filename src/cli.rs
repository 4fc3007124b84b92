//! Command-line interface definitions for `takagi`.
//!
//! Defines the top-level [`Cli`] struct parsed by `clap` and the
//! [`Command`] subcommand enum that drives the binary.

use clap::{Parser, Subcommand};

use crate::upstream::ProviderKind;

/// Takagi - use GitHub (or Discord) as an OpenID Connect provider
///
/// Presents the upstream provider's OAuth2 API as a standards-compliant
/// OIDC 1.0 issuer: authorization-code flow with PKCE and refresh tokens,
/// locally signed ID and access tokens, discovery, JWKS, and WebFinger.
///
/// Run without a subcommand to start the server.
#[derive(Parser, Debug)]
#[command(name = "takagi")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Upstream identity provider to front
    #[arg(
        short,
        long,
        value_enum,
        default_value = "github",
        env = "TAKAGI_PROVIDER",
        global = true
    )]
    pub provider: ProviderKind,

    /// Minimum log level: trace, debug, info, warn, or error
    #[arg(long, default_value = "info", env = "TAKAGI_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log output format: "text" for human-readable, "json" for structured
    #[arg(long, env = "TAKAGI_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand to run (defaults to server mode when omitted)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Top-level subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the OIDC provider server (default when no subcommand is given)
    #[command(about = "Start the server")]
    Serve,

    /// Print a fresh private JWK Set to stdout, suitable as the KEYSET value
    #[command(about = "Generate a new keyset")]
    Keygen,

    /// Replace the managed keyset on disk, invalidating all issued tokens
    #[command(about = "Rotate the managed keyset")]
    Rotate,
}
