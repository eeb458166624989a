use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use intercom_proto::{Envelope, Frame, Notice, Role};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::PeerError;
use crate::link::{Negotiator, PeerLink};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A WebSocket connection to the relay, registered under one role.
pub struct SignalingClient {
    role: Role,
    write: SplitSink<Socket, Message>,
    read: SplitStream<Socket>,
}

impl SignalingClient {
    /// Connect to `{base_url}/ws/{role}`, e.g. `ws://localhost:8080`.
    pub async fn connect(base_url: &str, role: Role) -> Result<Self, PeerError> {
        let url = format!("{}/ws/{}", base_url.trim_end_matches('/'), role);
        debug!(%url, "connecting to relay");

        let (stream, _) = timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| PeerError::Timeout(CONNECT_TIMEOUT))?
            .map_err(PeerError::Connect)?;
        let (write, read) = stream.split();

        Ok(Self { role, write, read })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), PeerError> {
        let text = envelope.to_json().map_err(PeerError::Encode)?;
        self.send_text(text).await
    }

    /// Send a raw text frame, bypassing envelope serialization.
    pub async fn send_text(&mut self, text: String) -> Result<(), PeerError> {
        self.write.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Next frame from the relay, or `None` once the connection closes.
    pub async fn recv(&mut self) -> Result<Option<Frame>, PeerError> {
        while let Some(message) = self.read.next().await {
            match message? {
                Message::Text(text) => return Ok(Some(Frame::parse(&text)?)),
                Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                    Ok(text) => return Ok(Some(Frame::parse(text)?)),
                    Err(_) => warn!(len = bytes.len(), "ignoring non-utf8 binary frame"),
                },
                Message::Close(frame) => {
                    debug!(reason = ?frame.map(|f| f.reason.to_string()), "relay closed connection");
                    return Ok(None);
                }
                _ => continue,
            }
        }
        Ok(None)
    }

    pub async fn recv_timeout(&mut self, wait: Duration) -> Result<Option<Frame>, PeerError> {
        timeout(wait, self.recv())
            .await
            .map_err(|_| PeerError::Timeout(wait))?
    }

    /// Pump inbound envelopes through `link`, sending its replies, until
    /// `done` reports true or the relay closes the connection.
    pub async fn drive<N, F>(&mut self, link: &mut PeerLink<N>, done: F) -> Result<(), PeerError>
    where
        N: Negotiator,
        F: Fn(&PeerLink<N>) -> bool,
    {
        while !done(link) {
            let Some(frame) = self.recv().await? else {
                return Ok(());
            };
            match frame {
                Frame::Envelope(envelope) => {
                    for reply in link.handle(envelope).await? {
                        self.send(&reply).await?;
                    }
                }
                Frame::Notice(Notice::Error { reason }) => return Err(PeerError::Rejected(reason)),
                Frame::Notice(Notice::PeerUnavailable { peer }) => {
                    warn!(%peer, "peer unavailable; envelope dropped by relay");
                }
                Frame::Notice(Notice::Closing { reason }) => {
                    debug!(%reason, "relay is closing this connection");
                }
            }
        }
        Ok(())
    }

    pub async fn close(mut self) -> Result<(), PeerError> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
