use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info};

use mexchange::{
    broker::Broker,
    cli::{BrokerArgs, Cli, Command, ViolationPolicy},
    client, FatalHook,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn violation_hook(policy: ViolationPolicy) -> FatalHook {
    match policy {
        ViolationPolicy::Exit => FatalHook::exit_process(),
        // The offending connection is already torn down by the time the
        // hook runs.
        ViolationPolicy::Disconnect => FatalHook::new(|err| {
            info!(error = %err, "broker stays up after protocol violation");
        }),
    }
}

async fn run_broker(args: BrokerArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let broker = Broker::with_fatal_hook(listener, violation_hook(args.on_violation));
    debug!(policy = ?args.on_violation, "protocol violation policy");
    info!("broker listening on {}", broker.local_addr()?);
    broker.run_until_ctrl_c().await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    match Cli::parse().command {
        Command::Broker(args) => run_broker(args).await,
        Command::Client(args) => client::run(args).await,
    }
}
