use anyhow::Result;
use beach_intercom::{
    cli::{self, Cli, Commands},
    config::RelayConfig,
    server,
    telemetry::{self, Telemetry},
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    if let Some(Commands::Send {
        url,
        from,
        to,
        kind,
        payload,
        wait_secs,
    }) = args.command
    {
        telemetry::init_tracing()?;
        return cli::run_send(url, from, to, kind, payload, wait_secs).await;
    }

    let telemetry = Telemetry::init()?;
    let config = RelayConfig::try_from(args.server)?;
    info!(
        listen_addr = %config.listen_addr,
        idle_timeout_secs = config.settings.idle_timeout.as_secs(),
        ring_timeout_secs = config.settings.ring_timeout.as_secs(),
        "starting beach-intercom relay"
    );

    server::run(config, Some(telemetry.metrics_handle())).await
}
