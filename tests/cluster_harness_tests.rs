//! Cluster harness tests against mock data nodes sharing one metadata authority

mod support;

use metasync::cluster::{
    converge, parse_result, Cluster, CommandKind, DatabaseOptions, NodeSet, Outcome, Probe,
    RemoteCluster, Scenario, Suite, NO_NODES_ANSWERED,
};
use metasync::Error;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use support::MockCluster;

const SETTLE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_start_maps_every_data_node() {
    let mock = MockCluster::start(3).await;
    let cluster = mock.remote().await;

    assert_eq!(cluster.info().data_n, 3);
    assert_eq!(cluster.nodes().len(), 3);

    let servers = cluster.query_any("SHOW SERVERS", "").await.into_result().unwrap();
    let servers = parse_result(CommandKind::ShowServers, &servers).unwrap();
    let mut addrs: Vec<&str> = servers.data_servers.values().map(String::as_str).collect();
    let mut expected: Vec<&str> = mock.nodes.iter().map(|n| n.addr.as_str()).collect();
    addrs.sort_unstable();
    expected.sort_unstable();
    assert_eq!(addrs, expected);
}

#[tokio::test]
async fn test_query_all_answers_for_unreachable_nodes() {
    let mock = MockCluster::start(4).await;
    let nodes = NodeSet::new(Duration::from_secs(2));
    let mut addrs: BTreeMap<u64, String> = mock
        .nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (i as u64 + 1, node.addr.clone()))
        .collect();
    addrs.insert(5, "127.0.0.1:1".to_string());
    nodes.connect(&addrs).unwrap();

    let mut rx = nodes.query_all("SHOW DATABASES", "");
    let mut ok = Vec::new();
    let mut failed = Vec::new();
    while let Some(response) = rx.recv().await {
        match response.outcome {
            Ok(_) => ok.push(response.node_id),
            Err(_) => failed.push(response.node_id),
        }
    }
    ok.sort_unstable();
    assert_eq!(ok, vec![1, 2, 3, 4]);
    assert_eq!(failed, vec![5]);

    let missing = nodes.query(42, "SHOW DATABASES", "").await;
    let err = missing.into_result().unwrap_err().to_string();
    assert!(err.contains("cannot find client for node 42"), "{}", err);
}

#[tokio::test]
async fn test_database_created_anywhere_converges_everywhere() {
    let mock = MockCluster::start(3).await;
    let cluster = mock.remote().await;

    let db = cluster.new_database(DatabaseOptions::default()).await.unwrap();
    let results = converge(cluster.as_ref(), &Probe::show_databases(), SETTLE, |r| {
        r.has_database(&db)
    })
    .await
    .unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.windows(2).all(|w| w[0].0 < w[1].0));

    cluster
        .query_any(&format!("DROP DATABASE {:?}", db), "")
        .await
        .into_result()
        .unwrap();
    converge(cluster.as_ref(), &Probe::show_databases(), SETTLE, |r| {
        !r.has_database(&db)
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_lagging_node_is_named_on_timeout() {
    let mock = MockCluster::start(3).await;
    let cluster = mock.remote().await;

    let servers = cluster.query_any("SHOW SERVERS", "").await.into_result().unwrap();
    let servers = parse_result(CommandKind::ShowServers, &servers).unwrap();
    let frozen = &mock.nodes[2];
    let frozen_id = servers
        .data_servers
        .iter()
        .find(|(_, addr)| **addr == frozen.addr)
        .map(|(id, _)| *id)
        .unwrap();
    frozen.freeze();

    let live = servers
        .data_servers
        .keys()
        .copied()
        .find(|id| *id != frozen_id)
        .unwrap();
    cluster
        .query(live, "CREATE DATABASE \"late\"", "")
        .await
        .into_result()
        .unwrap();

    let err = converge(
        cluster.as_ref(),
        &Probe::show_databases(),
        Duration::from_millis(300),
        |r| r.has_database("late"),
    )
    .await
    .unwrap_err();
    match err {
        Error::NotConverged { statement, lagging } => {
            assert_eq!(statement, "SHOW DATABASES");
            assert_eq!(lagging, vec![format!("node {}", frozen_id)]);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_zero_settle_checks_once() {
    let mock = MockCluster::start(2).await;
    let cluster = mock.remote().await;

    let started = tokio::time::Instant::now();
    let err = converge(cluster.as_ref(), &Probe::show_databases(), Duration::ZERO, |r| {
        r.has_database("never")
    })
    .await
    .unwrap_err();
    assert!(matches!(err, Error::NotConverged { .. }));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_cluster_without_nodes_never_converges() {
    let cluster = RemoteCluster::new("127.0.0.1:1", Duration::from_secs(1)).unwrap();
    assert!(cluster.nodes().is_empty());

    let err = converge(&cluster, &Probe::show_databases(), Duration::from_millis(100), |_| true)
        .await
        .unwrap_err();
    match err {
        Error::NotConverged { lagging, .. } => {
            assert_eq!(lagging, vec![NO_NODES_ANSWERED.to_string()])
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_query_error_is_reported_with_node() {
    let mock = MockCluster::start(1).await;
    let cluster = mock.remote().await;

    let err = cluster
        .query_any("SELECT * FROM nowhere", "")
        .await
        .into_result()
        .unwrap_err()
        .to_string();
    assert!(err.starts_with("[node "), "{}", err);
    assert!(err.contains("unsupported statement"), "{}", err);
}

#[tokio::test]
async fn test_write_rejected_for_unknown_database() {
    let mock = MockCluster::start(1).await;
    let cluster = mock.remote().await;

    let response = cluster.write_any("missing", None, &["cpu value=1"]).await;
    let err = response.into_result().unwrap_err().to_string();
    assert!(err.contains("database not found"), "{}", err);
}

#[tokio::test]
async fn test_suite_passes_against_mock_cluster() {
    let mock = MockCluster::start(3).await;
    let cluster: Arc<dyn Cluster> = mock.remote().await;
    let suite = Suite::with_settings(cluster, SETTLE, 10);

    let reports = suite.run_all().await;
    assert_eq!(reports.len(), Scenario::ALL.len());
    for report in &reports {
        match (&report.scenario, &report.outcome) {
            (Scenario::DropDatabaseLocal | Scenario::DropRetentionPolicyLocal, outcome) => {
                assert!(matches!(outcome, Outcome::Skipped(_)), "{:?}", report)
            }
            (_, outcome) => assert_eq!(*outcome, Outcome::Passed, "{:?}", report),
        }
    }
}

#[tokio::test]
async fn test_run_selected_scenarios_in_order() {
    let mock = MockCluster::start(3).await;
    let cluster: Arc<dyn Cluster> = mock.remote().await;
    let suite = Suite::with_settings(cluster, SETTLE, 100);

    let reports = suite
        .run(&[Scenario::CreateDropDatabase, Scenario::ShowDropDatabase])
        .await;
    let order: Vec<Scenario> = reports.iter().map(|r| r.scenario).collect();
    assert_eq!(
        order,
        vec![Scenario::ShowDropDatabase, Scenario::CreateDropDatabase]
    );
    assert!(reports.iter().all(|r| r.outcome == Outcome::Passed), "{:?}", reports);
}
