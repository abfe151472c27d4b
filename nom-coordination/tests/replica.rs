use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use nom_coordination::{
    coordinator::{Coordinator, DeliverySettings},
    message::Nom,
    replica::Replica,
    server::Server,
};
use serde_json::json;
use tokio::{net::TcpListener, sync::watch, time::timeout};

const WAIT: Duration = Duration::from_secs(2);

async fn start_server(initial: Nom) -> Result<(SocketAddr, Arc<Coordinator>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let coordinator = Arc::new(Coordinator::new(initial, DeliverySettings::default()));
    let server = Server::new(listener, Arc::clone(&coordinator));
    let addr = server.local_addr()?;
    // Runs until the test's runtime shuts down.
    tokio::spawn(server.run_until(std::future::pending()));
    Ok((addr, coordinator))
}

async fn wait_until(updates: &mut watch::Receiver<Option<Nom>>, expected: &Nom) -> Result<()> {
    timeout(WAIT, updates.wait_for(|nom| nom.as_ref() == Some(expected))).await??;
    Ok(())
}

#[tokio::test]
async fn connect_fetches_the_initial_snapshot() -> Result<()> {
    let (addr, coordinator) = start_server(Nom::new(json!({"switches": 3}))).await?;

    let replica = Replica::connect(addr, "alice").await?;

    assert_eq!(replica.identity(), "alice");
    assert_eq!(replica.current(), Nom::new(json!({"switches": 3})));
    assert_eq!(coordinator.registered().await, vec!["alice".to_string()]);
    replica.close().await
}

#[tokio::test]
async fn write_is_applied_only_when_the_echo_arrives() -> Result<()> {
    let (addr, coordinator) = start_server(Nom::empty()).await?;
    let mut alice = Replica::connect(addr, "alice").await?;
    let mut updates = alice.subscribe();

    let value = Nom::new(json!({"x": 1}));
    alice.write(value.clone()).await?;
    wait_until(&mut updates, &value).await?;

    assert_eq!(alice.current(), value);
    assert_eq!(coordinator.snapshot().await, value);
    alice.close().await
}

#[tokio::test]
async fn writes_propagate_to_other_replicas() -> Result<()> {
    let (addr, _coordinator) = start_server(Nom::empty()).await?;
    let mut alice = Replica::connect(addr, "alice").await?;
    let bob = Replica::connect(addr, "bob").await?;
    let mut bob_updates = bob.subscribe();

    let value = Nom::new(json!({"link": ["s1", "s2"]}));
    alice.write(value.clone()).await?;
    wait_until(&mut bob_updates, &value).await?;
    assert_eq!(bob.current(), value);

    alice.close().await?;
    bob.close().await
}

#[tokio::test]
async fn last_write_wins_across_replicas() -> Result<()> {
    let (addr, coordinator) = start_server(Nom::empty()).await?;
    let mut alice = Replica::connect(addr, "alice").await?;
    let mut bob = Replica::connect(addr, "bob").await?;
    let mut alice_updates = alice.subscribe();
    let mut bob_updates = bob.subscribe();

    alice.write(Nom::new(json!({"v": 1}))).await?;
    wait_until(&mut bob_updates, &Nom::new(json!({"v": 1}))).await?;
    bob.write(Nom::new(json!({"v": 2}))).await?;

    let last = Nom::new(json!({"v": 2}));
    wait_until(&mut alice_updates, &last).await?;
    wait_until(&mut bob_updates, &last).await?;
    assert_eq!(coordinator.snapshot().await, last);

    alice.close().await?;
    bob.close().await
}

#[tokio::test]
async fn close_unregisters_the_replica() -> Result<()> {
    let (addr, coordinator) = start_server(Nom::empty()).await?;
    let replica = Replica::connect(addr, "alice").await?;

    replica.close().await?;
    assert!(coordinator.registered().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn empty_identity_is_rejected_locally() -> Result<()> {
    let (addr, _coordinator) = start_server(Nom::empty()).await?;
    assert!(Replica::connect(addr, "   ").await.is_err());
    Ok(())
}
