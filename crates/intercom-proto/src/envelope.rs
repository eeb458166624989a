use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One of the two fixed endpoints of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[serde(alias = "mobile")]
    Caller,
    #[serde(alias = "raspberry")]
    Callee,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Caller, Role::Callee];

    /// The endpoint on the other side of the call.
    pub fn peer(self) -> Role {
        match self {
            Role::Caller => Role::Callee,
            Role::Callee => Role::Caller,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Caller => "caller",
            Role::Callee => "callee",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = EnvelopeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "caller" | "mobile" => Ok(Role::Caller),
            "callee" | "raspberry" => Ok(Role::Callee),
            _ => Err(EnvelopeError::UnknownRole(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Offer,
    Answer,
    #[serde(alias = "ice_candidate")]
    Candidate,
    Hangup,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::Candidate => "candidate",
            EnvelopeKind::Hangup => "hangup",
        }
    }

    /// Offers and answers carry session descriptions.
    pub fn is_description(self) -> bool {
        matches!(self, EnvelopeKind::Offer | EnvelopeKind::Answer)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeKind {
    type Err = EnvelopeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "offer" => Ok(EnvelopeKind::Offer),
            "answer" => Ok(EnvelopeKind::Answer),
            "candidate" | "ice_candidate" => Ok(EnvelopeKind::Candidate),
            "hangup" => Ok(EnvelopeKind::Hangup),
            other => Err(EnvelopeError::UnknownKind(other.to_string())),
        }
    }
}

/// A routed signaling message. The payload is opaque to the relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub from: Role,
    pub to: Role,
    pub payload: Value,
}

/// Ingress shape: every field optional so missing ones map to a precise error.
/// Older browser pages put the payload under `sdp` or `candidate`.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    from: Option<String>,
    to: Option<String>,
    #[serde(default, alias = "sdp", alias = "candidate")]
    payload: Option<Value>,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, from: Role, to: Role, payload: Value) -> Self {
        Self {
            kind,
            from,
            to,
            payload,
        }
    }

    pub fn hangup(from: Role, to: Role) -> Self {
        Self::new(EnvelopeKind::Hangup, from, to, Value::Null)
    }

    /// Parse and structurally validate an inbound text frame.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        if !value.is_object() {
            return Err(EnvelopeError::NotAnObject);
        }
        let raw: RawEnvelope = serde_json::from_value(value)?;

        let kind = raw
            .kind
            .ok_or(EnvelopeError::MissingField("type"))?
            .parse::<EnvelopeKind>()?;
        let from = raw
            .from
            .ok_or(EnvelopeError::MissingField("from"))?
            .parse::<Role>()?;
        let to = raw
            .to
            .ok_or(EnvelopeError::MissingField("to"))?
            .parse::<Role>()?;
        if from == to {
            return Err(EnvelopeError::SelfAddressed(from));
        }

        Ok(Self {
            kind,
            from,
            to,
            payload: raw.payload.unwrap_or(Value::Null),
        })
    }

    /// Reject envelopes whose `from` disagrees with the connection identity.
    pub fn check_sender(&self, registered: Role) -> Result<(), EnvelopeError> {
        if self.from != registered {
            return Err(EnvelopeError::SenderMismatch {
                claimed: self.from,
                registered,
            });
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Relay-originated frames that are not routed envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// The last frame was rejected at ingress and not routed.
    Error { reason: String },
    /// The addressed peer is not connected; the envelope was dropped.
    PeerUnavailable { peer: Role },
    /// The relay is about to close this connection.
    Closing { reason: String },
}

impl Notice {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Anything a client can receive from the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Envelope(Envelope),
    Notice(Notice),
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        let is_notice = matches!(
            value.get("type").and_then(Value::as_str),
            Some("error" | "peer_unavailable" | "closing")
        );
        if is_notice {
            Ok(Frame::Notice(serde_json::from_value(value)?))
        } else {
            Envelope::from_value(value).map(Frame::Envelope)
        }
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid envelope json: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope must be a json object")]
    NotAnObject,
    #[error("envelope missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown envelope type `{0}`")]
    UnknownKind(String),
    #[error("unknown role `{0}`")]
    UnknownRole(String),
    #[error("envelope claims to be from {claimed} on a connection registered as {registered}")]
    SenderMismatch { claimed: Role, registered: Role },
    #[error("envelope addressed to its own sender ({0})")]
    SelfAddressed(Role),
}

impl EnvelopeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            EnvelopeError::Malformed(_) => "malformed",
            EnvelopeError::NotAnObject => "not_an_object",
            EnvelopeError::MissingField(_) => "missing_field",
            EnvelopeError::UnknownKind(_) => "unknown_kind",
            EnvelopeError::UnknownRole(_) => "unknown_role",
            EnvelopeError::SenderMismatch { .. } => "sender_mismatch",
            EnvelopeError::SelfAddressed(_) => "self_addressed",
        }
    }
}
