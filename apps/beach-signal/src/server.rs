use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{body::Body, http::Request, routing::get, Router};
use axum_server::tls_rustls::RustlsConfig;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, Span};

use crate::config::{ServerConfig, TlsPaths};

const TLS_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
use crate::handlers::{debug_offers, health_check, metrics_handler};
use crate::hub::{RelayState, SignalingHub};
use crate::websocket::websocket_handler;

#[derive(Clone)]
pub struct AppState {
    pub hub: SignalingHub,
    pub handshake_timeout: Duration,
    pub metrics: Option<PrometheusHandle>,
    pub static_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(config: &ServerConfig, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            hub: SignalingHub::new(RelayState::new(&config.shared_secret)),
            handshake_timeout: config.handshake_timeout,
            metrics,
            static_dir: config.static_dir.clone(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/debug/offers", get(debug_offers))
        .route("/ws", get(websocket_handler));
    if let Some(dir) = &state.static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
}

/// The `/ws` query string carries the shared secret, so spans record the
/// path only.
fn request_span(request: &Request<Body>) -> Span {
    tracing::debug_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
        version = ?request.version(),
    )
}

/// Serves until the listener fails or `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error")
}

pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let state = AppState::new(&config, metrics);

    let sweeper = config
        .offer_ttl
        .map(|ttl| state.hub.spawn_offer_sweeper(ttl, config.sweep_interval));

    match &config.tls {
        Some(tls) => serve_tls(config.listen_addr, tls, state).await?,
        None => {
            let listener = TcpListener::bind(config.listen_addr)
                .await
                .with_context(|| format!("failed to bind {}", config.listen_addr))?;
            info!(listen_addr = %config.listen_addr, "beach-signal listening");
            serve(listener, state, shutdown_signal()).await?;
        }
    }

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    info!("shutdown complete");
    Ok(())
}

pub async fn load_tls(paths: &TlsPaths) -> Result<RustlsConfig> {
    RustlsConfig::from_pem_file(&paths.cert, &paths.key)
        .await
        .with_context(|| {
            format!(
                "failed to load TLS certificate {} and key {}",
                paths.cert.display(),
                paths.key.display()
            )
        })
}

/// HTTPS/WSS variant of [`serve`]; stops on ctrl-c.
async fn serve_tls(addr: SocketAddr, paths: &TlsPaths, state: AppState) -> Result<()> {
    let tls = load_tls(paths).await?;
    let handle = axum_server::Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown_signal().await;
            handle.graceful_shutdown(Some(TLS_SHUTDOWN_GRACE));
        }
    });

    info!(listen_addr = %addr, "beach-signal listening with TLS");
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(build_router(state).into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("tls server shutdown with error")
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test_timeout::timeout]
    fn request_span_omits_query_string() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let request = Request::get("/ws?identity=alice&credential=s3cret")
            .body(Body::empty())
            .unwrap();
        tracing::subscriber::with_default(subscriber, || {
            let span = request_span(&request);
            let _entered = span.enter();
            tracing::debug!("upgrading");
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("path=/ws"), "{output}");
        assert!(!output.contains("s3cret"), "{output}");
        assert!(!output.contains("credential"), "{output}");
    }

    #[test_timeout::tokio_timeout_test]
    async fn missing_tls_files_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let paths = TlsPaths {
            cert: dir.path().join("cert.crt"),
            key: dir.path().join("cert.key"),
        };
        let err = load_tls(&paths).await.unwrap_err();
        assert!(err.to_string().contains("failed to load TLS certificate"));
    }
}
