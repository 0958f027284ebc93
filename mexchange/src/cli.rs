use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the exchange broker, accepting wire clients over TCP.
    Broker(BrokerArgs),
    /// Subscribe to a channel and publish stdin lines to it.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Socket address the broker should bind to. Use 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:7400")]
    pub listen: SocketAddr,

    /// What to do when a client breaks the wire protocol.
    #[arg(long, value_enum, default_value_t = ViolationPolicy::Exit)]
    pub on_violation: ViolationPolicy,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationPolicy {
    /// Terminate the broker process.
    Exit,
    /// Log the violation and keep serving the other connections.
    Disconnect,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Broadcast id to subscribe and publish to.
    #[arg(long)]
    pub channel: String,

    /// Address of the broker to connect to.
    #[arg(long, default_value = "127.0.0.1:7400", conflicts_with = "config")]
    pub server: SocketAddr,

    /// JSON exchange config to use instead of a single broker address.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Claim the channel exclusively instead of subscribing to it.
    #[arg(long)]
    pub register: bool,
}
