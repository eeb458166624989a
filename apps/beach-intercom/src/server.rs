use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, signal};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    config::RelayConfig,
    handlers::{health_check, metrics_handler, session_status, view_for_role},
    poll,
    relay::Relay,
    websocket::websocket_handler,
};

/// Both transport bindings plus the auxiliary routes, sharing one relay.
pub fn build_router(relay: Relay, metrics: Option<PrometheusHandle>) -> Router {
    let relay_routes = Router::new()
        .route("/health", get(health_check))
        .route("/session", get(session_status))
        .route("/view/:role", get(view_for_role))
        .route("/offer", post(poll::post_offer).get(poll::get_offer))
        .route("/answer", post(poll::post_answer).get(poll::get_answer))
        .route("/reset", post(poll::reset))
        .route("/ws/:role", get(websocket_handler))
        .with_state(relay);

    let mut app = Router::new().merge(relay_routes);
    if let Some(handle) = metrics {
        app = app.merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(handle),
        );
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn run(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    serve(listener, config, metrics).await
}

/// Serve on an already-bound listener until ctrl-c.
pub async fn serve(
    listener: TcpListener,
    config: RelayConfig,
    metrics: Option<PrometheusHandle>,
) -> Result<()> {
    let relay = Relay::new(config.settings.clone());
    let reaper = relay.spawn_reaper();
    let app = build_router(relay, metrics);

    info!(
        listen_addr = %listener.local_addr().context("listener has no local address")?,
        outbound_buffer = config.settings.outbound_buffer,
        notify_on_disconnect = config.settings.notify_on_disconnect,
        "beach-intercom listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    reaper.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
