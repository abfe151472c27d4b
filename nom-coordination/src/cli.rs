use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the coordinator that owns the canonical nom.
    Coordinator(CoordinatorArgs),
    /// Connect a replica that caches the nom and writes random entries into it.
    Replica(ReplicaArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CoordinatorArgs {
    /// TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Socket address to bind, overriding the config file. Use port 0 for an ephemeral port.
    #[arg(long)]
    pub listen: Option<SocketAddr>,
}

#[derive(Args, Debug, Clone)]
pub struct ReplicaArgs {
    /// Name this replica registers under.
    #[arg(long)]
    pub identity: String,

    /// Address of the coordinator.
    #[arg(long, default_value = crate::config::DEFAULT_LISTEN)]
    pub server: SocketAddr,

    /// Stop after this many writes instead of running until Ctrl-C.
    #[arg(long)]
    pub writes: Option<u64>,

    /// Upper bound, in seconds, of the random pause between writes.
    #[arg(long, default_value_t = 4)]
    pub max_pause_secs: u64,
}
