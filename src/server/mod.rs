//! HTTP server.

mod authorize;
mod context;
mod router;
mod token;
mod userinfo;
mod wellknown;

pub use context::RequestContext;
pub use router::create_router;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::config::Settings;
use crate::flow::{FlowStores, spawn_reaper};
use crate::keyset::KeysetManager;
use crate::token::TokenService;
use crate::upstream::{ProviderKind, UpstreamProvider};
use crate::{Error, Result};

/// How often the background reaper sweeps expired flow state.
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Shared application state
pub struct AppState {
    /// Loaded configuration
    pub settings: Settings,
    /// Upstream provider adapter (GitHub or Discord)
    pub provider: Arc<dyn UpstreamProvider>,
    /// Active keyset
    pub keys: Arc<KeysetManager>,
    /// Token minting / verification
    pub tokens: TokenService,
    /// In-flight transactions, codes, and consumed refresh JTIs
    pub stores: Arc<FlowStores>,
}

/// The OIDC provider server
pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    /// Assemble the application state: keyset, provider adapter, token
    /// service, and flow stores.
    pub fn new(settings: Settings, kind: ProviderKind) -> Result<Self> {
        let keys = Arc::new(KeysetManager::from_settings(&settings)?);
        let provider = crate::upstream::create(kind, settings.upstream_timeout)?;
        let tokens = TokenService::new(Arc::clone(&keys), settings.token_lifetime);
        let stores = Arc::new(FlowStores::new(settings.auth_request_ttl));

        Ok(Self {
            state: Arc::new(AppState {
                settings,
                provider,
                keys,
                tokens,
                stores,
            }),
        })
    }

    /// Run the server until ctrl-c / SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.state
                .settings
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.state.settings.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        spawn_reaper(
            Arc::clone(&self.state.stores),
            REAPER_INTERVAL,
            shutdown_tx.subscribe(),
        );

        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;

        info!(
            service = self.state.provider.kind().service_name(),
            version = env!("CARGO_PKG_VERSION"),
            host = %self.state.settings.host,
            port = self.state.settings.port,
            "Listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(wait_for_stop(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Shutdown complete");
        Ok(())
    }
}

/// Resolves once the process is asked to stop (ctrl-c, or SIGTERM on unix),
/// then tells the background tasks to wind down.
///
/// A signal stream that cannot be installed is logged and skipped; the
/// remaining stream still stops the server.
async fn wait_for_stop(stop: tokio::sync::broadcast::Sender<()>) {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm_stream = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(|e| warn!(error = %e, "Cannot listen for SIGTERM"))
        .ok();
    #[cfg(unix)]
    let terminated = async move {
        match sigterm_stream {
            Some(mut stream) => {
                stream.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminated = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {},
        () = terminated => {},
    }

    info!("Stop requested, draining");
    let _ = stop.send(());
}
