use std::{net::SocketAddr, sync::Arc, time::SystemTime};

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::detour::{relay::server::Connections, telemetry};

#[derive(Clone)]
pub struct AdminState {
    pub prometheus: Option<telemetry::SharedPrometheusHandle>,
    pub connections: Arc<Connections>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/sessions", get(sessions))
        .route("/metrics", get(metrics))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);

    tracing::info!(admin_addr = %addr, "admin: listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await?;

    Ok(())
}

async fn index() -> impl IntoResponse {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    connections: usize,
    sessions: usize,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            connections: st.connections.len(),
            sessions: st.connections.active_sessions(),
        }),
    )
}

async fn sessions(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.connections.snapshot()))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    match &st.prometheus {
        Some(h) => (StatusCode::OK, h.render()),
        None => (StatusCode::NOT_FOUND, "metrics disabled\n".to_string()),
    }
}
