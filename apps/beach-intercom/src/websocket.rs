use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use intercom_proto::{Notice, Role};
use metrics::counter;
use std::time::{Duration, Instant};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    registry::{CloseSignal, ConnectionId, EndpointHandle, Outbound},
    relay::{IngestError, Relay},
    router::{DropReason, RouteOutcome},
};

/// Time allowed for the closing notice and close frame to go out.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// `GET /ws/:role` upgrades to a signaling socket registered under `role`.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(role): Path<String>,
    State(relay): State<Relay>,
) -> Response {
    let role: Role = match role.parse() {
        Ok(role) => role,
        Err(err) => {
            warn!(requested = %role, "rejecting websocket for unknown role");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, role, relay))
}

async fn handle_socket(socket: WebSocket, role: Role, relay: Relay) {
    let (sender, mut receiver) = socket.split();
    let (handle, rx) = relay.connect(role);
    let connection_id = handle.id();
    let close = handle.close_signal();

    let mut writer = tokio::spawn(write_outbound(
        sender,
        rx,
        close.clone(),
        relay.settings().ping_interval,
        role,
        connection_id,
    ));

    loop {
        let message = tokio::select! {
            reason = close.closed() => {
                debug!(%role, %connection_id, reason, "relay closing connection");
                break;
            }
            message = receiver.next() => message,
        };
        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                warn!(%role, %connection_id, error = %err, "websocket receive error");
                break;
            }
            None => break,
        };

        match message {
            Message::Text(text) => {
                if !ingest_frame(&relay, &handle, role, &text) {
                    break;
                }
            }
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => {
                    if !ingest_frame(&relay, &handle, role, text) {
                        break;
                    }
                }
                Err(_) => {
                    counter!("intercom_frames_rejected_total", 1, "reason" => "binary");
                    relay.notify(
                        &handle,
                        Notice::Error {
                            reason: "binary frames must carry utf-8 json".into(),
                        },
                    );
                }
            },
            Message::Ping(_) | Message::Pong(_) => {
                if !relay.registry().touch(connection_id, Instant::now()) {
                    debug!(%role, %connection_id, "heartbeat from replaced connection");
                    break;
                }
            }
            Message::Close(frame) => {
                info!(
                    %role,
                    %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
        }
    }

    relay.disconnect(connection_id);
    if close.is_closed() {
        // Let the writer deliver the closing notice before tearing down.
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            debug!(%role, %connection_id, "close flush timed out");
        }
    }
    writer.abort();
    debug!(%role, %connection_id, "websocket handler finished");
}

/// Returns `false` when the connection no longer speaks for its role.
fn ingest_frame(relay: &Relay, handle: &EndpointHandle, role: Role, text: &str) -> bool {
    match relay.ingest(role, handle.id(), text) {
        Ok(delivery) => {
            if delivery.outcome == RouteOutcome::Dropped(DropReason::PeerOffline) {
                relay.notify(handle, Notice::PeerUnavailable { peer: delivery.to });
            }
            true
        }
        Err(err @ IngestError::Unregistered(_)) => {
            debug!(%role, connection_id = %handle.id(), error = %err, "dropping frame");
            counter!("intercom_frames_rejected_total", 1, "reason" => err.metric_label());
            false
        }
        Err(err) => {
            debug!(%role, connection_id = %handle.id(), error = %err, "rejecting frame");
            counter!(
                "intercom_frames_rejected_total",
                1,
                "reason" => err.metric_label()
            );
            relay.notify(
                handle,
                Notice::Error {
                    reason: err.to_string(),
                },
            );
            true
        }
    }
}

async fn write_outbound(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    close: CloseSignal,
    ping_interval: Duration,
    role: Role,
    connection_id: ConnectionId,
) {
    let start = tokio::time::Instant::now() + ping_interval;
    let mut ping = tokio::time::interval_at(start, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let outbound = tokio::select! {
            biased;
            reason = close.closed() => {
                send_closing(&mut sender, reason).await;
                break;
            }
            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                continue;
            }
            outbound = rx.recv() => match outbound {
                Some(outbound) => outbound,
                None => break,
            },
        };

        let encoded = match &outbound {
            Outbound::Envelope(envelope) => envelope.to_json(),
            Outbound::Notice(notice) => notice.to_json(),
        };
        match encoded {
            Ok(text) => {
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!(%role, %connection_id, error = %err, "failed to encode frame"),
        }
    }
    debug!(%role, %connection_id, "writer task finished");
}

async fn send_closing(sender: &mut SplitSink<WebSocket, Message>, reason: &'static str) {
    let notice = Notice::Closing {
        reason: reason.to_string(),
    };
    if let Ok(text) = notice.to_json() {
        let _ = sender.send(Message::Text(text)).await;
    }
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: reason.into(),
        })))
        .await;
}
