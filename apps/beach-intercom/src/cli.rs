use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use intercom_peer::{PeerError, SignalingClient};
use intercom_proto::{Envelope, EnvelopeKind, Frame, Role};
use serde_json::Value;
use tracing::debug;

use crate::config::ServerArgs;

#[derive(Parser, Debug)]
#[command(
    name = "beach-intercom",
    author,
    version,
    about = "Beach intercom signaling relay and debug client"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub server: ServerArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect as one endpoint, send a single envelope and print replies
    Send {
        /// Relay URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Role to register as
        #[arg(long = "as")]
        from: Role,

        /// Recipient role; defaults to the other endpoint
        #[arg(long)]
        to: Option<Role>,

        /// Envelope type: offer, answer, candidate or hangup
        #[arg(long = "type")]
        kind: EnvelopeKind,

        /// JSON payload, passed through untouched
        #[arg(long)]
        payload: Option<String>,

        /// How long to keep printing inbound frames
        #[arg(long, default_value_t = 3)]
        wait_secs: u64,
    },
}

pub async fn run_send(
    url: String,
    from: Role,
    to: Option<Role>,
    kind: EnvelopeKind,
    payload: Option<String>,
    wait_secs: u64,
) -> Result<()> {
    let payload = match payload {
        Some(raw) => serde_json::from_str(&raw).context("payload is not valid json")?,
        None => Value::Null,
    };
    let envelope = Envelope::new(kind, from, to.unwrap_or(from.peer()), payload);

    let mut client = SignalingClient::connect(&url, from)
        .await
        .with_context(|| format!("failed to connect to {url} as {from}"))?;
    client.send(&envelope).await?;
    debug!(%kind, %from, "envelope sent; waiting for frames");

    let wait = Duration::from_secs(wait_secs);
    loop {
        let frame = match client.recv_timeout(wait).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                println!("relay closed the connection");
                break;
            }
            Err(PeerError::Timeout(_)) => break,
            Err(err) => return Err(err.into()),
        };
        let text = match &frame {
            Frame::Envelope(envelope) => envelope.to_json()?,
            Frame::Notice(notice) => notice.to_json()?,
        };
        println!("{text}");
    }

    client.close().await.ok();
    Ok(())
}
