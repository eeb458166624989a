use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use clap::Args;

use crate::relay::RelaySettings;

#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "BEACH_INTERCOM_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Envelopes queued per connection before further sends are dropped.
    #[arg(long, env = "BEACH_INTERCOM_OUTBOUND_BUFFER", default_value_t = 64)]
    pub outbound_buffer: usize,

    /// Close connections with no inbound traffic for this long.
    #[arg(long, env = "BEACH_INTERCOM_IDLE_TIMEOUT_SECS", default_value_t = 600)]
    pub idle_timeout_secs: u64,

    /// Reset calls that have not connected within this long.
    #[arg(long, env = "BEACH_INTERCOM_RING_TIMEOUT_SECS", default_value_t = 60)]
    pub ring_timeout_secs: u64,

    #[arg(long, env = "BEACH_INTERCOM_REAP_INTERVAL_SECS", default_value_t = 30)]
    pub reap_interval_secs: u64,

    /// Ping every socket this often; pongs keep waiting endpoints alive.
    #[arg(long, env = "BEACH_INTERCOM_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Send a hangup to the remaining endpoint when its peer disconnects mid-call.
    #[arg(
        long,
        env = "BEACH_INTERCOM_NOTIFY_ON_DISCONNECT",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub notify_on_disconnect: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_INTERCOM_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub settings: RelaySettings,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServerArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.outbound_buffer == 0 {
            bail!("outbound buffer must hold at least one envelope");
        }
        if args.reap_interval_secs == 0 {
            bail!("reap interval must be at least one second");
        }
        if args.ping_interval_secs == 0 {
            bail!("ping interval must be at least one second");
        }
        if args.ping_interval_secs >= args.idle_timeout_secs {
            bail!(
                "ping interval ({}s) must be shorter than the idle timeout ({}s)",
                args.ping_interval_secs,
                args.idle_timeout_secs
            );
        }

        Ok(RelayConfig {
            listen_addr,
            settings: RelaySettings {
                outbound_buffer: args.outbound_buffer,
                idle_timeout: Duration::from_secs(args.idle_timeout_secs),
                ring_timeout: Duration::from_secs(args.ring_timeout_secs),
                reap_interval: Duration::from_secs(args.reap_interval_secs),
                ping_interval: Duration::from_secs(args.ping_interval_secs),
                notify_on_disconnect: args.notify_on_disconnect,
            },
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
