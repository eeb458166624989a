use async_trait::async_trait;
use intercom_proto::{Envelope, EnvelopeKind, Role};
use serde_json::Value;
use tracing::{debug, warn};

use crate::candidates::{Admission, CandidateQueue, QueuePhase};
use crate::error::PeerError;

/// The local media stack as seen by the signaling layer.
#[async_trait]
pub trait Negotiator: Send {
    /// Apply a remote session description. When `kind` is an offer the
    /// implementation returns the local answer to send back.
    async fn apply_remote_description(
        &mut self,
        kind: EnvelopeKind,
        description: Value,
    ) -> Result<Option<Value>, PeerError>;

    async fn add_candidate(&mut self, candidate: Value) -> Result<(), PeerError>;

    /// Tear down local negotiation state after a hangup.
    async fn close(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    /// Local offer sent, waiting for the answer.
    Offering,
    /// Remote description applied.
    Connected,
    Ended,
}

/// One endpoint's side of a call: routes inbound envelopes into the
/// negotiator, holding candidates back until a remote description exists.
pub struct PeerLink<N> {
    role: Role,
    negotiator: N,
    candidates: CandidateQueue<Value>,
    state: LinkState,
}

impl<N: Negotiator> PeerLink<N> {
    pub fn new(role: Role, negotiator: N) -> Self {
        Self {
            role,
            negotiator,
            candidates: CandidateQueue::new(),
            state: LinkState::Idle,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn negotiator(&self) -> &N {
        &self.negotiator
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Start a new negotiation cycle with a locally created offer.
    pub fn start_offer(&mut self, offer: Value) -> Envelope {
        self.candidates.restart();
        self.state = LinkState::Offering;
        Envelope::new(EnvelopeKind::Offer, self.role, self.role.peer(), offer)
    }

    pub fn local_candidate(&self, candidate: Value) -> Envelope {
        Envelope::new(
            EnvelopeKind::Candidate,
            self.role,
            self.role.peer(),
            candidate,
        )
    }

    /// Hang up locally. Returns the envelope that tells the peer.
    pub async fn hang_up(&mut self) -> Envelope {
        self.end().await;
        Envelope::hangup(self.role, self.role.peer())
    }

    /// Process one inbound envelope and return any replies to send.
    pub async fn handle(&mut self, envelope: Envelope) -> Result<Vec<Envelope>, PeerError> {
        if envelope.to != self.role {
            warn!(
                to = %envelope.to,
                role = %self.role,
                "ignoring envelope addressed to another role"
            );
            return Ok(Vec::new());
        }

        match envelope.kind {
            EnvelopeKind::Offer => {
                if self.candidates.phase() != QueuePhase::AwaitingDescription {
                    // Renegotiation or a call after hangup.
                    self.candidates.restart();
                }
                let answer = self
                    .negotiator
                    .apply_remote_description(EnvelopeKind::Offer, envelope.payload)
                    .await?;
                self.flush_candidates().await?;
                self.state = LinkState::Connected;
                Ok(answer
                    .map(|answer| {
                        Envelope::new(EnvelopeKind::Answer, self.role, envelope.from, answer)
                    })
                    .into_iter()
                    .collect())
            }
            EnvelopeKind::Answer => {
                if self.state != LinkState::Offering {
                    debug!(state = ?self.state, "ignoring answer without an outstanding offer");
                    return Ok(Vec::new());
                }
                self.negotiator
                    .apply_remote_description(EnvelopeKind::Answer, envelope.payload)
                    .await?;
                self.flush_candidates().await?;
                self.state = LinkState::Connected;
                Ok(Vec::new())
            }
            EnvelopeKind::Candidate => {
                match self.candidates.enqueue(envelope.payload) {
                    Admission::Queued => {
                        debug!(
                            pending = self.candidates.len(),
                            "remote description not set; queued candidate"
                        );
                    }
                    Admission::Apply(candidate) => {
                        self.negotiator.add_candidate(candidate).await?;
                    }
                    Admission::Stale(_) => {
                        debug!("dropping candidate from an ended session");
                    }
                }
                Ok(Vec::new())
            }
            EnvelopeKind::Hangup => {
                self.end().await;
                Ok(Vec::new())
            }
        }
    }

    async fn flush_candidates(&mut self) -> Result<(), PeerError> {
        let queued = self.candidates.flush()?;
        if !queued.is_empty() {
            debug!(count = queued.len(), "applying queued candidates");
        }
        for candidate in queued {
            self.negotiator.add_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn end(&mut self) {
        let dropped = self.candidates.discard();
        if dropped > 0 {
            debug!(dropped, "discarded pending candidates on hangup");
        }
        self.negotiator.close().await;
        self.state = LinkState::Ended;
    }
}
