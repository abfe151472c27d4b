use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{coordinator::Coordinator, session};

/// Accepts replica connections and hands each one to its own session task.
pub struct Server {
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
}

impl Server {
    pub fn new(listener: TcpListener, coordinator: Arc<Coordinator>) -> Self {
        Self {
            listener,
            coordinator,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            coordinator,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&coordinator).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &coordinator);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(coordinator: &Coordinator) {
    let closed = coordinator.disconnect_all().await;
    info!(closed, "coordinator shutting down");
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    coordinator: &Arc<Coordinator>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, coordinator),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, coordinator: &Arc<Coordinator>) {
    let coordinator = Arc::clone(coordinator);
    tokio::spawn(async move {
        if let Err(err) = session::handle_connection(stream, &coordinator).await {
            warn!(peer = %peer, error = ?err, "session closed with error");
        }
    });
}
