//! Client-side collaborator of the intercom relay.
//!
//! The relay forwards envelopes verbatim and never reorders anything, so
//! the edge is responsible for holding back network candidates that race
//! ahead of the remote session description. [`CandidateQueue`] does that
//! bookkeeping, [`PeerLink`] applies it to a [`Negotiator`], and
//! [`SignalingClient`] carries envelopes to and from the relay.

mod candidates;
mod client;
mod error;
mod link;

pub use candidates::{Admission, CandidateQueue, QueuePhase};
pub use client::SignalingClient;
pub use error::PeerError;
pub use link::{LinkState, Negotiator, PeerLink};
