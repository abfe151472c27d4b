use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use nom_coordination::{
    cli::{Cli, Command, CoordinatorArgs},
    config::Config,
    coordinator::Coordinator,
    replica,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Coordinator(args) => run_coordinator(args).await?,
        Command::Replica(args) => replica::run(args).await?,
    }

    Ok(())
}

async fn run_coordinator(args: CoordinatorArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    let listen = args.listen.unwrap_or(config.listen);

    let coordinator = Coordinator::new(config.initial_nom()?, config.delivery_settings());
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    let server = Server::new(listener, Arc::new(coordinator));
    let addr = server.local_addr()?;
    info!("coordinator listening on {}", addr);

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("coordinator exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
