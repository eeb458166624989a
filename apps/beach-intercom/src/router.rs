use std::sync::Arc;

use intercom_proto::Envelope;
use metrics::counter;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::registry::{ConnectionId, Outbound, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Recipient role has no registered connection.
    PeerOffline,
    /// Recipient's outbound queue is full.
    Backpressure,
    /// Recipient's writer is gone; the connection needs cleanup.
    Closed(ConnectionId),
}

impl DropReason {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DropReason::PeerOffline => "peer_offline",
            DropReason::Backpressure => "backpressure",
            DropReason::Closed(_) => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    Dropped(DropReason),
}

impl RouteOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, RouteOutcome::Delivered)
    }
}

/// Forwards envelopes to the addressed role without looking at the payload.
///
/// Delivery is a non-blocking push onto the recipient's bounded queue, so
/// envelopes routed in order from one sender reach the recipient's writer
/// in that order.
#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn route(&self, envelope: Envelope) -> RouteOutcome {
        let kind = envelope.kind;
        let from = envelope.from;
        let to = envelope.to;

        let outcome = match self.registry.lookup(to) {
            None => RouteOutcome::Dropped(DropReason::PeerOffline),
            Some(handle) if !handle.is_writable() => {
                RouteOutcome::Dropped(DropReason::Closed(handle.id()))
            }
            Some(handle) => match handle.try_send(Outbound::Envelope(envelope)) {
                Ok(()) => RouteOutcome::Delivered,
                Err(TrySendError::Full(_)) => RouteOutcome::Dropped(DropReason::Backpressure),
                Err(TrySendError::Closed(_)) => {
                    RouteOutcome::Dropped(DropReason::Closed(handle.id()))
                }
            },
        };

        match outcome {
            RouteOutcome::Delivered => {
                debug!(%kind, %from, %to, "envelope forwarded");
                counter!(
                    "intercom_envelopes_delivered_total",
                    1,
                    "kind" => kind.as_str()
                );
            }
            RouteOutcome::Dropped(reason) => {
                warn!(
                    %kind,
                    %from,
                    %to,
                    reason = reason.metric_label(),
                    "envelope dropped"
                );
                counter!(
                    "intercom_envelopes_dropped_total",
                    1,
                    "reason" => reason.metric_label()
                );
            }
        }

        outcome
    }
}
