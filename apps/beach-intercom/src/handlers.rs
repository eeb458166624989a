use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use intercom_proto::Role;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;

use crate::{
    call::{CallSnapshot, View},
    registry::EndpointInfo,
    relay::Relay,
};

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub session: CallSnapshot,
    pub endpoints: Vec<EndpointInfo>,
}

#[derive(Debug, Serialize)]
pub struct ViewResponse {
    pub role: Role,
    pub view: View,
}

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn session_status(State(relay): State<Relay>) -> Json<SessionResponse> {
    Json(SessionResponse {
        session: relay.call().snapshot(),
        endpoints: relay.registry().endpoints(),
    })
}

/// Which page `role`'s UI should be showing right now.
pub async fn view_for_role(Path(role): Path<String>, State(relay): State<Relay>) -> Response {
    match role.parse::<Role>() {
        Ok(role) => Json(ViewResponse {
            role,
            view: relay.call().view_for(role),
        })
        .into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

pub async fn metrics_handler(State(metrics): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    )
}
