//! Signaling envelopes exchanged between the two intercom endpoints.
//! Kept free of runtime dependencies so the relay, the CLI and any
//! embedded client can share one definition of the wire format.

mod envelope;

pub use envelope::{Envelope, EnvelopeError, EnvelopeKind, Frame, Notice, Role};
