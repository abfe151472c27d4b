use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result, ensure};
use rand::Rng;
use serde_json::{Map, Value};
use tokio::{
    io::{self, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ReplicaArgs,
    message::{Handshake, Nom, Request, Update, read_update, write_message},
};

const INITIAL_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

/// The replica's single cache slot, written only by the session worker.
pub struct ReplicaCache {
    slot: watch::Sender<Option<Nom>>,
}

impl ReplicaCache {
    pub fn new() -> (Self, watch::Receiver<Option<Nom>>) {
        let (slot, snapshots) = watch::channel(None);
        (Self { slot }, snapshots)
    }

    /// Replaces the cached state with `nom`, whatever was there before.
    pub fn on_update(&self, nom: Nom) -> bool {
        let previous = self.slot.send_replace(Some(nom));
        debug!(
            previous = ?previous.as_ref().map(ToString::to_string),
            current = ?self.slot.borrow().as_ref().map(ToString::to_string),
            "updating nom"
        );
        true
    }
}

/// A locally cached copy of the coordinator's state.
///
/// Writes go straight to the coordinator; the cache only changes when the
/// coordinator's broadcast comes back, including the echo of our own writes.
pub struct Replica {
    identity: String,
    writer: OwnedWriteHalf,
    snapshots: watch::Receiver<Option<Nom>>,
    worker: JoinHandle<Result<()>>,
}

impl Replica {
    /// Connects, registers as `identity` and waits for the first snapshot.
    pub async fn connect(server: SocketAddr, identity: &str) -> Result<Self> {
        let identity = identity.trim();
        ensure!(!identity.is_empty(), "replica identity cannot be empty");

        let stream = TcpStream::connect(server)
            .await
            .with_context(|| format!("failed to connect to {server}"))?;
        info!("connected to {}", server);

        let (reader, writer) = stream.into_split();
        let (cache, snapshots) = ReplicaCache::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let worker = tokio::spawn(serve_updates(
            BufReader::new(reader),
            cache,
            ready_tx,
            identity.to_string(),
        ));
        ready_rx
            .await
            .context("session worker stopped before it was ready")?;

        let mut replica = Self {
            identity: identity.to_string(),
            writer,
            snapshots,
            worker,
        };
        replica.send_handshake().await?;
        replica.refresh().await?;

        tokio::time::timeout(
            INITIAL_SNAPSHOT_TIMEOUT,
            replica.snapshots.wait_for(Option::is_some),
        )
        .await
        .context("timed out waiting for the initial snapshot")?
        .context("coordinator closed the connection before sending a snapshot")?;
        debug!(identity = %replica.identity, "fetched nom from coordinator");

        Ok(replica)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The last state received from the coordinator.
    pub fn current(&self) -> Nom {
        self.snapshots.borrow().clone().unwrap_or_default()
    }

    /// A receiver that observes every update applied to the cache.
    pub fn subscribe(&self) -> watch::Receiver<Option<Nom>> {
        self.snapshots.clone()
    }

    /// Sends `nom` to the coordinator. The cache is left untouched until the
    /// resulting update arrives.
    pub async fn write(&mut self, nom: Nom) -> Result<()> {
        self.send(&Request::put(nom)).await
    }

    /// Asks the coordinator to resend the current state.
    pub async fn refresh(&mut self) -> Result<()> {
        self.send(&Request::get()).await
    }

    /// Says goodbye and waits for the coordinator to close the channel.
    pub async fn close(mut self) -> Result<()> {
        self.send(&Request::bye()).await?;
        if let Err(error) = self.writer.shutdown().await {
            warn!(?error, "failed to shutdown replica writer cleanly");
        }
        self.worker.await.context("session worker panicked")?
    }

    async fn send_handshake(&mut self) -> Result<()> {
        let handshake = Handshake {
            identify: self.identity.clone(),
        };
        self.send(&handshake).await
    }

    async fn send<T: serde::Serialize>(&mut self, message: &T) -> Result<()> {
        write_message(&mut self.writer, message)
            .await
            .context("failed to send to coordinator")
    }
}

async fn serve_updates(
    mut reader: BufReader<OwnedReadHalf>,
    cache: ReplicaCache,
    ready: oneshot::Sender<()>,
    identity: String,
) -> Result<()> {
    // A dropped receiver means connect() already gave up; nothing to tell.
    let _ = ready.send(());

    loop {
        match read_update(&mut reader).await {
            Ok(Some(Update { update })) => {
                let applied = cache.on_update(update);
                debug!(%identity, applied, "applied update");
            }
            Ok(None) => {
                debug!(%identity, "coordinator closed the connection");
                return Ok(());
            }
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                warn!(%identity, error = %err, "discarding malformed update");
            }
            Err(err) => return Err(err).context("read from coordinator failed"),
        }
    }
}

/// Demo driver: keeps reading the cache and writing random entries into it.
pub async fn run(args: ReplicaArgs) -> Result<()> {
    let mut replica = Replica::connect(args.server, &args.identity).await?;
    info!(identity = %replica.identity(), nom = %replica.current(), "replica ready");

    let mut writes = 0u64;
    loop {
        if args.writes.is_some_and(|limit| writes >= limit) {
            break;
        }

        let pause = Duration::from_secs(rand::thread_rng().gen_range(0..=args.max_pause_secs));
        select! {
            _ = tokio::time::sleep(pause) => {}
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }

        let current = replica.current();
        debug!(nom = %current, "read");
        let next = random_write(current, &mut rand::thread_rng());
        replica.write(next).await?;
        writes += 1;
    }

    info!(writes, nom = %replica.current(), "replica leaving");
    replica.close().await
}

/// Sets a random key in 0..=100 to a random value in 0..=100. A state that is
/// not an object is replaced by one.
pub fn random_write<R: Rng>(nom: Nom, rng: &mut R) -> Nom {
    let mut fields = match nom.into_value() {
        Value::Object(fields) => fields,
        _ => Map::new(),
    };
    let key = rng.gen_range(0..=100u32);
    let value = rng.gen_range(0..=100u32);
    fields.insert(key.to_string(), Value::from(value));
    Nom::new(Value::Object(fields))
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}
