//! Metadata propagation over HTTP between one authority and several clients

mod support;

use metasync::config::MetaClientConfig;
use metasync::meta::{MetaClient, RetentionPolicySpec};
use metasync::Error;
use std::sync::Arc;
use std::time::Duration;
use support::{free_addr, MetaServer};

const VISIBLE_WITHIN: Duration = Duration::from_secs(5);

/// Wait until `check` holds on `client`, re-checking on every cache change.
async fn eventually<F>(client: &MetaClient, check: F) -> bool
where
    F: Fn(&MetaClient) -> bool,
{
    let deadline = tokio::time::Instant::now() + VISIBLE_WITHIN;
    loop {
        let gate = client.wait_for_data_changed();
        if check(client) {
            return true;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        gate.wait_timeout(remaining).await;
    }
}

#[tokio::test]
async fn test_mutation_reaches_every_client() {
    let server = MetaServer::start().await;
    let clients = [
        server.client().await,
        server.client().await,
        server.client().await,
    ];

    let db = clients[0].create_database("db0").await.unwrap();
    assert_eq!(db.name, "db0");
    assert!(clients[0].database("db0").is_some(), "visible on return");

    for client in &clients[1..] {
        assert!(eventually(client, |c| c.database("db0").is_some()).await);
    }
    for client in &clients {
        assert_eq!(client.index(), server.store.index());
        client.close();
    }
}

#[tokio::test]
async fn test_concurrent_mutations_from_many_clients() {
    let server = MetaServer::start().await;
    let clients: Vec<Arc<MetaClient>> = vec![
        server.client().await,
        server.client().await,
        server.client().await,
    ];

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..30 {
        let client = clients[i % clients.len()].clone();
        tasks.spawn(async move {
            let name = format!("db{}", i);
            client.create_database(&name).await.map(|db| db.name)
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    let final_index = server.store.index();
    for client in &clients {
        assert!(eventually(client, |c| c.index() == final_index).await);
        assert_eq!(client.databases().len(), 30);
    }
}

#[tokio::test]
async fn test_rejection_surfaces_to_caller() {
    let server = MetaServer::start().await;
    let client = server.client().await;
    client.create_database("db0").await.unwrap();
    let before = client.index();

    let spec = RetentionPolicySpec::new("short")
        .with_duration(Duration::from_secs(60));
    let err = client
        .create_retention_policy("db0", spec, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Rejected(_)), "{:?}", err);
    assert_eq!(server.store.index(), before);
}

#[tokio::test]
async fn test_failover_past_dead_server() {
    let server = MetaServer::start().await;
    let mut config = MetaClientConfig::new(vec!["127.0.0.1:1".to_string(), server.addr.clone()]);
    config.password_hash_cost = 4;
    let client = MetaClient::new(config).unwrap();

    client.open().await.unwrap();
    client.create_database("db0").await.unwrap();
    assert!(server.store.snapshot().database("db0").is_some());
    client.close();
}

#[tokio::test]
async fn test_open_waits_for_authority() {
    let addr = free_addr().await;
    let mut config = MetaClientConfig::new(vec![addr.clone()]);
    config.retry_delay = Duration::from_millis(20);
    let client = Arc::new(MetaClient::new(config).unwrap());

    let opener = {
        let client = client.clone();
        tokio::spawn(async move { client.open().await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!opener.is_finished());

    let _server = MetaServer::start_on(&addr).await;
    tokio::time::timeout(VISIBLE_WITHIN, opener)
        .await
        .expect("open should finish once the authority is up")
        .unwrap()
        .unwrap();
    assert!(client.index() > 0);
    client.close();
}

#[tokio::test]
async fn test_users_propagate_with_hashes() {
    let server = MetaServer::start().await;
    let writer = server.client().await;
    let reader = server.client().await;

    writer.create_user("alice", "secret", true).await.unwrap();
    assert!(eventually(&reader, |c| c.admin_user_exists()).await);

    let user = reader.authenticate("alice", "secret").await.unwrap();
    assert!(user.admin);
    assert!(matches!(
        reader.authenticate("alice", "wrong").await,
        Err(Error::Authentication(_))
    ));
}

#[tokio::test]
async fn test_long_poll_wakes_idle_clients() {
    let server = MetaServer::start().await;
    let idle = server.client().await;
    let gate = idle.wait_for_data_changed();

    let writer = server.client().await;
    writer.create_database("db0").await.unwrap();

    assert!(gate.wait_timeout(VISIBLE_WITHIN).await);
    assert!(idle.database("db0").is_some());
}
