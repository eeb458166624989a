//! Singleton call session driven by the envelopes the relay sees.
//!
//! Offers and answers only move the session once delivery is confirmed
//! (`OfferDelivered`, `AnswerDelivered`); a send attempt to an offline peer
//! leaves it untouched. Hangup and reset apply on observation.

use std::time::{Duration, Instant};

use intercom_proto::Role;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Idle,
    OfferSent,
    Ringing,
    Connected,
    Ended,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::OfferSent => "offer-sent",
            CallStatus::Ringing => "ringing",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
        }
    }

    /// Whether `self -> next` is an edge of the session lifecycle.
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        use CallStatus::*;
        matches!(
            (self, next),
            (Idle, OfferSent)
                | (OfferSent, Ringing)
                | (Ringing, Connected)
                | (OfferSent | Ringing | Connected, Ended)
                | (Ended, Idle)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSnapshot {
    pub status: CallStatus,
    pub caller: Option<Role>,
    pub callee: Option<Role>,
}

impl CallSnapshot {
    fn idle() -> Self {
        Self {
            status: CallStatus::Idle,
            caller: None,
            callee: None,
        }
    }

    pub fn involves(&self, role: Role) -> bool {
        self.caller == Some(role) || self.callee == Some(role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    /// Poll binding stored an offer that nobody has fetched yet.
    OfferPosted { from: Role, to: Role },
    OfferDelivered { from: Role, to: Role },
    AnswerDelivered { from: Role, to: Role },
    Hangup { from: Role },
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied { from: CallStatus, to: CallStatus },
    Ignored,
}

/// Page a role's UI should show for the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum View {
    Lobby,
    Call,
}

pub struct CallMachine {
    inner: Mutex<CallInner>,
    updates: watch::Sender<CallSnapshot>,
}

struct CallInner {
    session: CallSnapshot,
    since: Instant,
}

impl Default for CallMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CallMachine {
    pub fn new() -> Self {
        let (updates, _) = watch::channel(CallSnapshot::idle());
        Self {
            inner: Mutex::new(CallInner {
                session: CallSnapshot::idle(),
                since: Instant::now(),
            }),
            updates,
        }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.inner.lock().session.clone()
    }

    pub fn status(&self) -> CallStatus {
        self.inner.lock().session.status
    }

    /// Every status change, including the transient `ended`.
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.updates.subscribe()
    }

    pub fn view_for(&self, role: Role) -> View {
        let status = self.status();
        let in_call = match role {
            Role::Caller => status != CallStatus::Idle,
            Role::Callee => matches!(status, CallStatus::Ringing | CallStatus::Connected),
        };
        if in_call {
            View::Call
        } else {
            View::Lobby
        }
    }

    pub fn observe(&self, event: CallEvent) -> Transition {
        self.observe_at(event, Instant::now())
    }

    pub fn observe_at(&self, event: CallEvent, now: Instant) -> Transition {
        use CallStatus::*;

        let mut inner = self.inner.lock();
        let session = &inner.session;
        let matches_session =
            |from: Role, to: Role| session.caller == Some(from) && session.callee == Some(to);

        const POSTED: &[CallStatus] = &[CallStatus::OfferSent];
        const RING: &[CallStatus] = &[CallStatus::OfferSent, CallStatus::Ringing];
        const PICKED_UP: &[CallStatus] = &[CallStatus::Ringing];
        const CONNECT: &[CallStatus] = &[CallStatus::Connected];
        const END: &[CallStatus] = &[CallStatus::Ended, CallStatus::Idle];

        let (path, parties) = match (event, session.status) {
            (CallEvent::OfferPosted { from, to }, Idle) => (POSTED, Some((from, to))),
            (CallEvent::OfferDelivered { from, to }, Idle) => (RING, Some((from, to))),
            (CallEvent::OfferDelivered { from, to }, OfferSent) if matches_session(from, to) => {
                (PICKED_UP, None)
            }
            // The answer travels back from the recorded callee.
            (CallEvent::AnswerDelivered { from, to }, Ringing) if matches_session(to, from) => {
                (CONNECT, None)
            }
            (CallEvent::Hangup { from }, status) if status != Idle && session.involves(from) => {
                (END, None)
            }
            (CallEvent::Reset, status) if status != Idle => (END, None),
            (event, status) => {
                debug!(?event, status = status.as_str(), "ignoring stale call event");
                return Transition::Ignored;
            }
        };

        let start = inner.session.status;
        if let Some((caller, callee)) = parties {
            inner.session.caller = Some(caller);
            inner.session.callee = Some(callee);
        }
        for next in path {
            self.enter(&mut inner, *next, now);
        }

        Transition::Applied {
            from: start,
            to: inner.session.status,
        }
    }

    /// Reset a session stuck before `connected` for longer than `timeout`.
    pub fn expire_stale(&self, now: Instant, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        let pending = matches!(
            inner.session.status,
            CallStatus::OfferSent | CallStatus::Ringing
        );
        if !pending || now.saturating_duration_since(inner.since) <= timeout {
            return false;
        }

        info!(
            status = inner.session.status.as_str(),
            waited_secs = now.saturating_duration_since(inner.since).as_secs(),
            "call never connected; resetting session"
        );
        counter!("intercom_calls_expired_total", 1);
        self.enter(&mut inner, CallStatus::Ended, now);
        self.enter(&mut inner, CallStatus::Idle, now);
        true
    }

    fn enter(&self, inner: &mut CallInner, next: CallStatus, now: Instant) {
        let previous = inner.session.status;
        debug_assert!(
            previous.can_transition_to(next),
            "illegal call transition {previous:?} -> {next:?}"
        );
        inner.session.status = next;
        inner.since = now;
        if next == CallStatus::Idle {
            inner.session.caller = None;
            inner.session.callee = None;
        }
        debug!(
            from = previous.as_str(),
            to = next.as_str(),
            "call status changed"
        );
        counter!("intercom_call_transitions_total", 1, "to" => next.as_str());
        self.updates.send_replace(inner.session.clone());
    }
}
