use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use intercom_proto::{Envelope, EnvelopeError, EnvelopeKind, Notice, Role};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    call::{CallEvent, CallMachine},
    registry::{ConnectionId, EndpointHandle, Outbound, Registry},
    router::{DropReason, RouteOutcome, Router},
};

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub outbound_buffer: usize,
    pub idle_timeout: Duration,
    pub ring_timeout: Duration,
    pub reap_interval: Duration,
    /// How often the relay pings each socket; pongs count as activity.
    pub ping_interval: Duration,
    pub notify_on_disconnect: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            outbound_buffer: 64,
            idle_timeout: Duration::from_secs(600),
            ring_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
            notify_on_disconnect: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    /// The connection was replaced or reaped; its frames no longer speak for
    /// any role.
    #[error("connection {0} is no longer registered")]
    Unregistered(ConnectionId),
}

impl IngestError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            IngestError::Envelope(err) => err.metric_label(),
            IngestError::Unregistered(_) => "unregistered",
        }
    }
}

/// Outcome of one inbound envelope, reported back to the sender's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub kind: EnvelopeKind,
    pub to: Role,
    pub outcome: RouteOutcome,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    pub idle_closed: usize,
    pub session_expired: bool,
}

/// Single-slot offer/answer storage backing the HTTP polling binding.
#[derive(Debug, Default)]
struct PollSlots {
    offer: Option<Value>,
    answer: Option<Value>,
}

/// Process-scoped relay state: created once at startup and shared by both
/// transport bindings.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    registry: Arc<Registry>,
    router: Router,
    call: CallMachine,
    /// Held across a route and the call transition it confirms, so a reply
    /// can never be observed before the delivery that provoked it.
    sequencer: Mutex<()>,
    slots: Mutex<PollSlots>,
    settings: RelaySettings,
}

impl Relay {
    pub fn new(settings: RelaySettings) -> Self {
        let registry = Arc::new(Registry::new());
        Self {
            inner: Arc::new(RelayInner {
                router: Router::new(registry.clone()),
                registry,
                call: CallMachine::new(),
                sequencer: Mutex::new(()),
                slots: Mutex::new(PollSlots::default()),
                settings,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn call(&self) -> &CallMachine {
        &self.inner.call
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.inner.settings
    }

    /// Register a fresh connection for `role`, evicting any previous one.
    pub fn connect(&self, role: Role) -> (EndpointHandle, mpsc::Receiver<Outbound>) {
        let (handle, receiver) = EndpointHandle::channel(self.inner.settings.outbound_buffer);
        let displaced = self
            .inner
            .registry
            .register(role, handle.clone(), Instant::now());

        if let Some(old) = displaced {
            info!(
                %role,
                connection_id = %handle.id(),
                replaced = %old,
                "endpoint reconnected; previous connection closed"
            );
            counter!("intercom_endpoints_replaced_total", 1, "role" => role.as_str());
        } else {
            info!(%role, connection_id = %handle.id(), "endpoint registered");
        }
        gauge!("intercom_endpoints_connected", self.inner.registry.len() as f64);

        (handle, receiver)
    }

    /// Validate one text frame from `connection` and route it. Frames from a
    /// connection that has been replaced or reaped are refused.
    pub fn ingest(
        &self,
        role: Role,
        connection: ConnectionId,
        text: &str,
    ) -> Result<Delivery, IngestError> {
        if !self.inner.registry.touch(connection, Instant::now()) {
            return Err(IngestError::Unregistered(connection));
        }

        let envelope = Envelope::parse(text)?;
        envelope.check_sender(role)?;

        let kind = envelope.kind;
        let to = envelope.to;
        let outcome = self.dispatch(envelope);
        Ok(Delivery { kind, to, outcome })
    }

    /// Route an already-validated envelope and feed the call session.
    pub fn dispatch(&self, envelope: Envelope) -> RouteOutcome {
        let outcome = self.route_and_observe(envelope);
        if let RouteOutcome::Dropped(DropReason::Closed(stale)) = outcome {
            self.disconnect(stale);
        }
        outcome
    }

    fn route_and_observe(&self, envelope: Envelope) -> RouteOutcome {
        let kind = envelope.kind;
        let from = envelope.from;
        let to = envelope.to;

        let _sequenced = self.inner.sequencer.lock();
        if kind == EnvelopeKind::Hangup {
            self.inner.call.observe(CallEvent::Hangup { from });
        }

        let outcome = self.inner.router.route(envelope);
        if outcome.is_delivered() {
            match kind {
                EnvelopeKind::Offer => {
                    self.inner.call.observe(CallEvent::OfferDelivered { from, to });
                }
                EnvelopeKind::Answer => {
                    self.inner.call.observe(CallEvent::AnswerDelivered { from, to });
                }
                EnvelopeKind::Candidate | EnvelopeKind::Hangup => {}
            }
        }
        outcome
    }

    /// Clean up after a connection ends. A no-op for connections that were
    /// already replaced or evicted.
    pub fn disconnect(&self, connection: ConnectionId) {
        let Some(role) = self.inner.registry.unregister(connection) else {
            debug!(connection_id = %connection, "connection already unregistered");
            return;
        };
        info!(%role, connection_id = %connection, "endpoint disconnected");
        gauge!("intercom_endpoints_connected", self.inner.registry.len() as f64);

        let session = self.inner.call.snapshot();
        if !session.involves(role) {
            return;
        }

        if !self.inner.settings.notify_on_disconnect {
            self.inner.call.observe(CallEvent::Hangup { from: role });
            return;
        }
        let outcome = self.route_and_observe(Envelope::hangup(role, role.peer()));
        debug!(%role, ?outcome, "synthesized hangup for departed endpoint");
        if let RouteOutcome::Dropped(DropReason::Closed(stale)) = outcome {
            self.disconnect(stale);
        }
    }

    /// Close idle connections and expire calls that never connected.
    pub fn reap(&self, now: Instant) -> ReapReport {
        let mut report = ReapReport::default();
        let settings = &self.inner.settings;

        for (role, handle) in self.inner.registry.idle(now, settings.idle_timeout) {
            info!(%role, connection_id = %handle.id(), "closing idle endpoint");
            handle.close("idle timeout");
            self.disconnect(handle.id());
            counter!("intercom_idle_pruned_total", 1, "role" => role.as_str());
            report.idle_closed += 1;
        }

        report.session_expired = self.inner.call.expire_stale(now, settings.ring_timeout);
        report
    }

    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let relay = self.clone();
        let mut interval = tokio::time::interval(self.inner.settings.reap_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let report = relay.reap(Instant::now());
                if report != ReapReport::default() {
                    debug!(?report, "reaper pass complete");
                }
            }
        })
    }

    /// Store the caller's offer for the callee to poll. A new offer starts a
    /// new exchange, so any answer left from the previous one is cleared.
    pub fn post_offer(&self, offer: Value) {
        {
            let mut slots = self.inner.slots.lock();
            slots.offer = Some(offer).filter(|value| !value.is_null());
            slots.answer = None;
        }
        self.inner.call.observe(CallEvent::OfferPosted {
            from: Role::Caller,
            to: Role::Callee,
        });
    }

    pub fn poll_offer(&self) -> Option<Value> {
        let offer = self.inner.slots.lock().offer.clone();
        if offer.is_some() {
            self.inner.call.observe(CallEvent::OfferDelivered {
                from: Role::Caller,
                to: Role::Callee,
            });
        }
        offer
    }

    pub fn post_answer(&self, answer: Value) {
        self.inner.slots.lock().answer = Some(answer).filter(|value| !value.is_null());
    }

    pub fn poll_answer(&self) -> Option<Value> {
        let answer = self.inner.slots.lock().answer.clone();
        if answer.is_some() {
            self.inner.call.observe(CallEvent::AnswerDelivered {
                from: Role::Callee,
                to: Role::Caller,
            });
        }
        answer
    }

    /// Clear both poll slots and return the call session to idle.
    pub fn reset(&self) {
        *self.inner.slots.lock() = PollSlots::default();
        self.inner.call.observe(CallEvent::Reset);
        info!("signaling state reset");
    }

    /// Tell a connection its frame was rejected or undeliverable.
    pub fn notify(&self, handle: &EndpointHandle, notice: Notice) {
        if let Err(err) = handle.try_send(Outbound::Notice(notice)) {
            warn!(connection_id = %handle.id(), error = %err, "failed to queue notice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallStatus;
    use serde_json::json;

    fn offer_text(payload: &str) -> String {
        json!({"type": "offer", "from": "caller", "to": "callee", "payload": payload}).to_string()
    }

    fn expect_envelope(rx: &mut mpsc::Receiver<Outbound>) -> Envelope {
        match rx.try_recv() {
            Ok(Outbound::Envelope(envelope)) => envelope,
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn offer_to_offline_callee_leaves_session_idle() {
        let relay = Relay::new(RelaySettings::default());
        let (caller, _caller_rx) = relay.connect(Role::Caller);

        let delivery = relay
            .ingest(Role::Caller, caller.id(), &offer_text("SDP1"))
            .unwrap();

        assert_eq!(
            delivery.outcome,
            RouteOutcome::Dropped(DropReason::PeerOffline)
        );
        assert_eq!(relay.call().status(), CallStatus::Idle);
        assert_eq!(relay.registry().len(), 1);
    }

    #[test_timeout::timeout]
    fn full_exchange_connects_session() {
        let relay = Relay::new(RelaySettings::default());
        let (caller, mut caller_rx) = relay.connect(Role::Caller);
        let (callee, mut callee_rx) = relay.connect(Role::Callee);

        relay
            .ingest(Role::Caller, caller.id(), &offer_text("SDP1"))
            .unwrap();
        assert_eq!(expect_envelope(&mut callee_rx).payload, json!("SDP1"));
        assert_eq!(relay.call().status(), CallStatus::Ringing);

        let answer =
            json!({"type": "answer", "from": "callee", "to": "caller", "payload": "ANS1"});
        relay
            .ingest(Role::Callee, callee.id(), &answer.to_string())
            .unwrap();
        assert_eq!(expect_envelope(&mut caller_rx).payload, json!("ANS1"));
        assert_eq!(relay.call().status(), CallStatus::Connected);
    }

    #[test_timeout::timeout]
    fn spoofed_sender_is_rejected_before_routing() {
        let relay = Relay::new(RelaySettings::default());
        let (_caller, mut caller_rx) = relay.connect(Role::Caller);
        let (callee, _callee_rx) = relay.connect(Role::Callee);

        let err = relay
            .ingest(Role::Callee, callee.id(), &offer_text("SDP1"))
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::Envelope(EnvelopeError::SenderMismatch { .. })
        ));
        assert_eq!(err.metric_label(), "sender_mismatch");
        assert!(caller_rx.try_recv().is_err());
        assert_eq!(relay.call().status(), CallStatus::Idle);
    }

    #[test_timeout::timeout]
    fn replaced_connection_cannot_route_even_when_its_queue_is_full() {
        let settings = RelaySettings {
            outbound_buffer: 1,
            ..RelaySettings::default()
        };
        let relay = Relay::new(settings);
        let (old_caller, _old_rx) = relay.connect(Role::Caller);
        let (_callee, mut callee_rx) = relay.connect(Role::Callee);
        relay.notify(&old_caller, Notice::PeerUnavailable { peer: Role::Callee });
        assert!(old_caller.try_send(Outbound::Notice(Notice::PeerUnavailable {
            peer: Role::Callee
        }))
        .is_err());

        let (new_caller, _new_rx) = relay.connect(Role::Caller);

        assert!(old_caller.close_signal().is_closed());
        let err = relay
            .ingest(Role::Caller, old_caller.id(), &offer_text("SDP1"))
            .unwrap_err();
        assert!(matches!(err, IngestError::Unregistered(id) if id == old_caller.id()));
        assert!(callee_rx.try_recv().is_err());
        assert_eq!(relay.call().status(), CallStatus::Idle);

        let delivery = relay
            .ingest(Role::Caller, new_caller.id(), &offer_text("SDP2"))
            .unwrap();
        assert!(delivery.outcome.is_delivered());
        assert_eq!(expect_envelope(&mut callee_rx).payload, json!("SDP2"));
    }

    #[test_timeout::timeout]
    fn disconnect_hangs_up_and_notifies_peer() {
        let relay = Relay::new(RelaySettings::default());
        let (caller, _caller_rx) = relay.connect(Role::Caller);
        let (_callee, mut callee_rx) = relay.connect(Role::Callee);
        relay
            .ingest(Role::Caller, caller.id(), &offer_text("SDP1"))
            .unwrap();
        expect_envelope(&mut callee_rx);

        relay.disconnect(caller.id());

        assert!(relay.registry().lookup(Role::Caller).is_none());
        assert_eq!(relay.call().status(), CallStatus::Idle);
        assert_eq!(
            expect_envelope(&mut callee_rx),
            Envelope::hangup(Role::Caller, Role::Callee)
        );
    }

    #[test_timeout::timeout]
    fn disconnect_without_notification_still_ends_call() {
        let relay = Relay::new(RelaySettings {
            notify_on_disconnect: false,
            ..RelaySettings::default()
        });
        let (caller, _caller_rx) = relay.connect(Role::Caller);
        let (_callee, mut callee_rx) = relay.connect(Role::Callee);
        relay
            .ingest(Role::Caller, caller.id(), &offer_text("SDP1"))
            .unwrap();
        expect_envelope(&mut callee_rx);

        relay.disconnect(caller.id());

        assert_eq!(relay.call().status(), CallStatus::Idle);
        assert!(callee_rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn replaced_connection_disconnect_is_ignored() {
        let relay = Relay::new(RelaySettings::default());
        let (first, _first_rx) = relay.connect(Role::Callee);
        let (second, _second_rx) = relay.connect(Role::Callee);

        relay.disconnect(first.id());

        assert_eq!(
            relay.registry().lookup(Role::Callee).map(|h| h.id()),
            Some(second.id())
        );
    }

    #[test_timeout::timeout]
    fn closed_recipient_is_cleaned_up_on_route() {
        let relay = Relay::new(RelaySettings::default());
        let (caller, _caller_rx) = relay.connect(Role::Caller);
        let (_callee, callee_rx) = relay.connect(Role::Callee);
        drop(callee_rx);

        let delivery = relay
            .ingest(Role::Caller, caller.id(), &offer_text("SDP1"))
            .unwrap();

        assert!(matches!(
            delivery.outcome,
            RouteOutcome::Dropped(DropReason::Closed(_))
        ));
        assert!(relay.registry().lookup(Role::Callee).is_none());
    }

    #[test_timeout::timeout]
    fn answer_racing_the_offer_transition_still_connects() {
        for _ in 0..100 {
            let relay = Relay::new(RelaySettings::default());
            let (caller, _caller_rx) = relay.connect(Role::Caller);
            let (callee, mut callee_rx) = relay.connect(Role::Callee);

            let answering = {
                let relay = relay.clone();
                std::thread::spawn(move || {
                    loop {
                        match callee_rx.try_recv() {
                            Ok(Outbound::Envelope(offer)) => {
                                assert_eq!(offer.kind, EnvelopeKind::Offer);
                                break;
                            }
                            Ok(other) => panic!("unexpected {other:?}"),
                            Err(_) => std::thread::yield_now(),
                        }
                    }
                    let answer = json!({
                        "type": "answer",
                        "from": "callee",
                        "to": "caller",
                        "payload": "ANS1"
                    });
                    relay
                        .ingest(Role::Callee, callee.id(), &answer.to_string())
                        .unwrap();
                })
            };

            relay
                .ingest(Role::Caller, caller.id(), &offer_text("SDP1"))
                .unwrap();
            answering.join().unwrap();

            assert_eq!(relay.call().status(), CallStatus::Connected);
        }
    }

    #[test_timeout::timeout]
    fn reaper_closes_idle_endpoints_and_stale_calls() {
        let settings = RelaySettings {
            idle_timeout: Duration::from_secs(10),
            ring_timeout: Duration::from_secs(5),
            ..RelaySettings::default()
        };
        let relay = Relay::new(settings);
        let (caller, _caller_rx) = relay.connect(Role::Caller);

        let report = relay.reap(Instant::now() + Duration::from_secs(11));

        assert_eq!(report.idle_closed, 1);
        assert!(caller.close_signal().is_closed());
        assert!(relay.registry().lookup(Role::Caller).is_none());
        assert!(matches!(
            relay.ingest(Role::Caller, caller.id(), &offer_text("SDP1")),
            Err(IngestError::Unregistered(_))
        ));

        relay.post_offer(json!("SDP1"));
        let report = relay.reap(Instant::now() + Duration::from_secs(6));
        assert!(report.session_expired);
        assert_eq!(relay.call().status(), CallStatus::Idle);
    }

    #[test_timeout::timeout]
    fn poll_slots_follow_the_call() {
        let relay = Relay::new(RelaySettings::default());
        assert_eq!(relay.poll_offer(), None);

        relay.post_offer(json!({"sdp": "SDP1"}));
        assert_eq!(relay.call().status(), CallStatus::OfferSent);
        assert_eq!(relay.poll_offer(), Some(json!({"sdp": "SDP1"})));
        assert_eq!(relay.call().status(), CallStatus::Ringing);

        assert_eq!(relay.poll_answer(), None);
        relay.post_answer(json!({"sdp": "ANS1"}));
        assert_eq!(relay.poll_answer(), Some(json!({"sdp": "ANS1"})));
        assert_eq!(relay.call().status(), CallStatus::Connected);

        relay.reset();
        assert_eq!(relay.poll_offer(), None);
        assert_eq!(relay.poll_answer(), None);
        assert_eq!(relay.call().status(), CallStatus::Idle);
    }

    #[test_timeout::timeout]
    fn notice_reaches_sender() {
        let relay = Relay::new(RelaySettings::default());
        let (caller, mut caller_rx) = relay.connect(Role::Caller);
        relay.notify(&caller, Notice::PeerUnavailable { peer: Role::Callee });
        assert!(matches!(
            caller_rx.try_recv(),
            Ok(Outbound::Notice(Notice::PeerUnavailable { peer: Role::Callee }))
        ));
    }
}
