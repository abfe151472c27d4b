//! Per-connection side of the coordinator.
//!
//! A connection starts unclaimed. The first valid `{"identify": ...}` claims it
//! and registers it with the [`Coordinator`]; from then on every line is a
//! request. The session ends on end-of-stream, `bye`, a transport failure or a
//! close request from the coordinator, and always releases its registration.

use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    sync::mpsc,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    coordinator::{ChannelHandle, Closer, Coordinator},
    error::ProtocolError,
    message::{Action, Handshake, Inbound, Request, Update, read_frame, write_message},
};

pub async fn handle_connection(stream: TcpStream, coordinator: &Coordinator) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    serve_channel(BufReader::new(reader), writer, peer, coordinator).await
}

/// Drives one channel from handshake to close over any split byte stream.
pub async fn serve_channel<R, W>(
    mut reader: R,
    writer: W,
    peer: Option<SocketAddr>,
    coordinator: &Coordinator,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (handle, inbox) = coordinator.open_channel();
    let write_timeout = coordinator.settings().write_timeout;
    let writer_task = tokio::spawn(drain_outbound(writer, inbox, handle.closer(), write_timeout));

    let outcome = match await_handshake(&mut reader, peer).await {
        Ok(Some(identity)) => {
            // A superseded connection is left open. It can still get, put and
            // say bye; it just no longer receives broadcasts.
            let _superseded = coordinator.register(identity.clone(), handle.clone()).await;
            info!(?peer, %identity, "started conversation");

            let result = run_session(&mut reader, &handle, &identity, coordinator).await;
            coordinator.release(&identity, handle.id()).await;
            info!(?peer, %identity, "conversation finished");
            result
        }
        Ok(None) => {
            debug!(?peer, "connection closed before handshake");
            Ok(())
        }
        Err(err) => Err(err),
    };

    // The writer drains whatever is queued and stops once the last sender is gone.
    drop(handle);
    if let Err(err) = writer_task.await {
        warn!(?peer, error = ?err, "writer task failed");
    }

    outcome
}

async fn await_handshake<R>(reader: &mut R, peer: Option<SocketAddr>) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let Some(line) = read_frame(reader)
            .await
            .context("read failed before handshake")?
        else {
            return Ok(None);
        };

        match Inbound::decode(&line) {
            Ok(Inbound::Handshake(handshake)) => match claim(handshake) {
                Ok(identity) => return Ok(Some(identity)),
                Err(error) => warn!(?peer, %error, "handshake rejected"),
            },
            Ok(Inbound::Request(_)) => debug!(?peer, "ignoring request on unclaimed channel"),
            Err(error) => warn!(?peer, %error, "discarding message"),
        }
    }
}

fn claim(handshake: Handshake) -> Result<String, ProtocolError> {
    let identity = handshake.identify.trim();
    if identity.is_empty() {
        return Err(ProtocolError::EmptyIdentity);
    }
    Ok(identity.to_string())
}

async fn run_session<R>(
    reader: &mut R,
    handle: &ChannelHandle,
    identity: &str,
    coordinator: &Coordinator,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let line = select! {
            line = read_frame(reader) => line.with_context(|| format!("read from {identity} failed"))?,
            _ = handle.closed() => {
                info!(%identity, "channel closed by coordinator");
                return Ok(());
            }
        };

        let Some(line) = line else {
            return Ok(());
        };

        match Inbound::decode(&line) {
            Ok(Inbound::Request(request)) => {
                if !handle_request(request, handle, identity, coordinator).await {
                    return Ok(());
                }
            }
            Ok(Inbound::Handshake(_)) => {
                warn!(%identity, "ignoring handshake on a registered channel");
            }
            Err(error) => warn!(%identity, %error, "discarding message"),
        }
    }
}

/// Applies one request. Returns `false` once the channel should close.
async fn handle_request(
    request: Request,
    handle: &ChannelHandle,
    identity: &str,
    coordinator: &Coordinator,
) -> bool {
    match request.action() {
        Some(Action::Bye) => {
            debug!(%identity, "goodbye");
            false
        }
        Some(Action::Get) => {
            coordinator.get(handle).await;
            true
        }
        Some(Action::Put(nom)) => {
            coordinator.put(nom).await;
            true
        }
        None => {
            debug!(%identity, "request carries no action");
            true
        }
    }
}

async fn drain_outbound<W>(
    mut writer: W,
    mut inbox: mpsc::Receiver<Update>,
    closer: Closer,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(update) = inbox.recv().await {
        match timeout(write_timeout, write_message(&mut writer, &update)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(error = ?err, "failed to deliver update");
                closer.close();
                return;
            }
            Err(_) => {
                warn!(?write_timeout, "update write timed out");
                closer.close();
                return;
            }
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(error = ?err, "failed to shut down writer cleanly");
    }
}
