//! Shared-state coordination: one coordinator owns the canonical "nom" and
//! any number of replicas keep a cached copy of it.
//!
//! Replicas write through to the coordinator, which replaces the canonical
//! state and pushes the new value to every registered replica, the writer
//! included. Delivery is best effort and per replica: a slow or dead replica
//! is dropped without holding up the others.
//!
//! - [`coordinator`] owns the state and registry and performs the fan-out.
//! - [`session`] runs the handshake and request loop for one connection.
//! - [`server`] accepts TCP connections and spawns sessions.
//! - [`replica`] is the client side with its local cache.
//! - [`message`] defines the JSON line protocol.
//! - [`config`] and [`cli`] wire the binary together.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod replica;
pub mod server;
pub mod session;
