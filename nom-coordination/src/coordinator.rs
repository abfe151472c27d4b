use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, info, warn};

use crate::{
    error::DeliveryError,
    message::{Nom, Update},
};

pub type ConnectionId = u64;

/// Bounds on how much a slow or dead replica may cost everyone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverySettings {
    /// Updates buffered per replica before deliveries start failing.
    pub queue_capacity: usize,
    /// Longest a single socket write may take before the session is dropped.
    pub write_timeout: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// The coordinator's reference to one replica connection. The socket itself
/// belongs to the session; this only feeds its outbound queue and can ask it to close.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Update>,
    close: Arc<Notify>,
}

impl ChannelHandle {
    pub fn new(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<Update>) {
        let (outbound, inbox) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            outbound,
            close: Arc::new(Notify::new()),
        };
        (handle, inbox)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues an update without waiting on the socket.
    pub fn send(&self, update: Update) -> Result<(), DeliveryError> {
        self.outbound.try_send(update).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Asks the owning session to shut the connection down.
    pub fn close(&self) {
        self.closer().close();
    }

    /// A close trigger that does not keep the outbound queue alive.
    pub fn closer(&self) -> Closer {
        Closer(Arc::clone(&self.close))
    }

    /// Resolves once [`close`](Self::close) has been called on any clone.
    pub async fn closed(&self) {
        self.close.notified().await;
    }
}

#[derive(Debug, Clone)]
pub struct Closer(Arc<Notify>);

impl Closer {
    pub fn close(&self) {
        // notify_one keeps a permit, so a close issued before the session
        // starts waiting is not lost.
        self.0.notify_one();
    }
}

struct CoordinatorState {
    nom: Nom,
    registry: HashMap<String, ChannelHandle>,
}

/// Owns the canonical state and the set of registered replicas.
///
/// Every operation takes the same lock, so gets, puts and registry changes
/// are applied one at a time and every replica sees puts in the same order.
pub struct Coordinator {
    state: Mutex<CoordinatorState>,
    settings: DeliverySettings,
    next_id: AtomicU64,
}

impl Coordinator {
    pub fn new(initial: Nom, settings: DeliverySettings) -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                nom: initial,
                registry: HashMap::new(),
            }),
            settings,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    /// Allocates a handle for a freshly accepted connection.
    pub fn open_channel(&self) -> (ChannelHandle, mpsc::Receiver<Update>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        ChannelHandle::new(id, self.settings.queue_capacity)
    }

    /// Binds `identity` to `handle`. A previous registration under the same
    /// identity is replaced and returned; it receives nothing from now on.
    pub async fn register(&self, identity: String, handle: ChannelHandle) -> Option<ChannelHandle> {
        let mut state = self.state.lock().await;
        info!(%identity, connection = handle.id(), "register");
        let previous = state.registry.insert(identity.clone(), handle);
        if let Some(handle) = &previous {
            info!(%identity, connection = handle.id(), "superseded earlier registration");
        }
        previous
    }

    /// Removes `identity` from the broadcast set and releases its handle.
    pub async fn unregister(&self, identity: &str) -> Option<ChannelHandle> {
        let mut state = self.state.lock().await;
        let removed = state.registry.remove(identity);
        if let Some(handle) = &removed {
            info!(%identity, connection = handle.id(), "unregister");
        }
        removed
    }

    /// Unregisters `identity` only while it is still bound to `connection`.
    /// A superseded session ending must not evict its replacement.
    pub async fn release(&self, identity: &str, connection: ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        let owned = state
            .registry
            .get(identity)
            .is_some_and(|handle| handle.id() == connection);

        if owned {
            state.registry.remove(identity);
            info!(%identity, connection, "unregister");
        } else {
            debug!(%identity, connection, "no registration left to release");
        }
        owned
    }

    /// Sends the current canonical state to `requester`.
    pub async fn get(&self, requester: &ChannelHandle) {
        let state = self.state.lock().await;
        debug!(connection = requester.id(), "get");
        let snapshot = Update {
            update: state.nom.clone(),
        };
        if let Err(error) = requester.send(snapshot) {
            warn!(connection = requester.id(), %error, "failed to answer get");
        }
    }

    /// Replaces the canonical state and pushes it to every registered replica,
    /// the writer included. Delivery failures are contained per replica: one
    /// that cannot take the update is unregistered and its channel closed, so a
    /// replica is either sent every put or dropped.
    pub async fn put(&self, nom: Nom) {
        let mut state = self.state.lock().await;
        info!(registered = state.registry.len(), "put");
        debug!(%nom, "new canonical state");
        state.nom = nom;

        let update = Update {
            update: state.nom.clone(),
        };
        let mut stale = Vec::new();

        for (identity, handle) in state.registry.iter() {
            debug!(%identity, "invalidating/updating");
            if let Err(error) = handle.send(update.clone()) {
                warn!(%identity, %error, "update not delivered");
                stale.push(identity.clone());
            }
        }

        for identity in stale {
            if let Some(handle) = state.registry.remove(&identity) {
                warn!(%identity, connection = handle.id(), "dropping stale replica");
                handle.close();
            }
        }
    }

    /// Empties the registry and asks every registered session to close.
    pub async fn disconnect_all(&self) -> usize {
        let mut state = self.state.lock().await;
        let count = state.registry.len();
        for (identity, handle) in state.registry.drain() {
            debug!(%identity, connection = handle.id(), "closing channel");
            handle.close();
        }
        count
    }

    pub async fn snapshot(&self) -> Nom {
        self.state.lock().await.nom.clone()
    }

    /// Registered identities, sorted.
    pub async fn registered(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut identities: Vec<String> = state.registry.keys().cloned().collect();
        identities.sort();
        identities
    }
}
