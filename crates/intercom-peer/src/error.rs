use intercom_proto::EnvelopeError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("failed to connect to relay: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("relay transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("invalid frame from relay: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("relay rejected frame: {0}")]
    Rejected(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("candidate queue already flushed for this negotiation")]
    AlreadyFlushed,
    #[error("candidate queue was discarded")]
    QueueDiscarded,
}
