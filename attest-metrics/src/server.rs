//! The sideband scrape listener.
//!
//! Bound separately from the data listeners (a shared spec is refused
//! at config validation) and serving `GET /metrics` only.

use std::{sync::Arc, time::Duration};

use attest_common::{config::ConnectionSpec, Signal};
use axum::{extract::State, routing::get, Router};
use tokio::net::{TcpListener, UnixListener};
use tower_http::timeout::TimeoutLayer;

use crate::{MetricsError, MetricsRegistry};

async fn metrics_handler(State(registry): State<Arc<MetricsRegistry>>) -> String {
    registry.render()
}

fn router(registry: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
        .layer(TimeoutLayer::new(Duration::from_secs(1)))
}

/// Serve scrapes on `spec` until a shutdown signal arrives.
pub async fn serve(
    spec: ConnectionSpec,
    registry: Arc<MetricsRegistry>,
    mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
) -> Result<(), MetricsError> {
    let app = router(registry);
    let graceful = async move {
        while let Ok(signal) = shutdown.recv().await {
            if matches!(signal, Signal::Shutdown | Signal::Drain) {
                break;
            }
        }
        tracing::info!("Metrics listener shutting down");
    };

    tracing::info!(listener = %spec, "Metrics listener starting");

    match spec {
        ConnectionSpec::Inet { port, ref host } => {
            let address = format!("{host}:{port}");
            let listener =
                TcpListener::bind(&address)
                    .await
                    .map_err(|source| MetricsError::Bind {
                        address: address.clone(),
                        source,
                    })?;

            axum::serve(listener, app)
                .with_graceful_shutdown(graceful)
                .await
                .map_err(|err| MetricsError::Server(err.to_string()))
        }
        ConnectionSpec::Unix { ref path } => {
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path).map_err(|source| MetricsError::Bind {
                address: path.display().to_string(),
                source,
            })?;

            axum::serve(listener, app)
                .with_graceful_shutdown(graceful)
                .await
                .map_err(|err| MetricsError::Server(err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scrape_returns_registry_contents() {
        let registry = Arc::new(MetricsRegistry::new());
        registry.counter(crate::FORKED_CHILDREN_TOTAL).add(4);

        let response = metrics_handler(State(Arc::clone(&registry))).await;
        assert!(response.contains("forked_children_total 4"));
    }

    #[tokio::test]
    async fn listener_binds_and_stops_on_shutdown() {
        let registry = Arc::new(MetricsRegistry::new());
        let (tx, rx) = tokio::sync::broadcast::channel(4);

        let spec = ConnectionSpec::Inet {
            port: 0,
            host: "127.0.0.1".to_string(),
        };

        let server = tokio::spawn(serve(spec, registry, rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        tx.send(Signal::Shutdown).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server should stop after shutdown")
            .unwrap();
        assert!(result.is_ok());
    }
}
