//! Polling fallback for endpoints that cannot hold a socket open. Offers and
//! answers live in single last-writer-wins slots; there is no candidate
//! channel.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::Value;
use tracing::debug;

use crate::relay::Relay;

pub async fn post_offer(State(relay): State<Relay>, Json(offer): Json<Value>) -> impl IntoResponse {
    debug!("offer posted");
    relay.post_offer(offer);
    (StatusCode::OK, "Offer received")
}

/// Stored offer, or `null` when none is waiting.
pub async fn get_offer(State(relay): State<Relay>) -> Json<Option<Value>> {
    Json(relay.poll_offer())
}

pub async fn post_answer(
    State(relay): State<Relay>,
    Json(answer): Json<Value>,
) -> impl IntoResponse {
    debug!("answer posted");
    relay.post_answer(answer);
    (StatusCode::OK, "Answer received")
}

pub async fn get_answer(State(relay): State<Relay>) -> Json<Option<Value>> {
    Json(relay.poll_answer())
}

pub async fn reset(State(relay): State<Relay>) -> impl IntoResponse {
    relay.reset();
    (StatusCode::OK, "Reset complete")
}
