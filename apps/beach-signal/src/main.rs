use anyhow::Result;
use clap::Parser;
use tracing::info;

use beach_signal::{
    cli::{self, Cli, Commands},
    config::ServerConfig,
    server,
    telemetry::Telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;
    let cli = Cli::parse();

    if let Some(Commands::Probe {
        url,
        identity,
        credential,
        watch,
    }) = cli.command
    {
        return cli::run_probe(url, identity, credential, watch).await;
    }

    let config = ServerConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        handshake_timeout_secs = config.handshake_timeout.as_secs(),
        offer_ttl_secs = config.offer_ttl.map(|ttl| ttl.as_secs()),
        "starting beach-signal relay"
    );

    server::run(config, telemetry.metrics_handle()).await
}
