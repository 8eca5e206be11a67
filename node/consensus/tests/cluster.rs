// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Multi-node store behavior over the in-memory transport.

use grove_consensus::loopback::LoopbackRaftNet;
use grove_consensus::{
    Consistency, ConsensusConfig, Error, Expect, Store, StoreService,
};
use grove_identity::NodeId;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

fn test_config(dir: &Path, bootstrap: bool) -> ConsensusConfig {
    ConsensusConfig {
        data_dir: dir.to_path_buf(),
        bootstrap,
        tick_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(40),
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        op_timeout: Duration::from_millis(700),
        ..ConsensusConfig::default()
    }
}

fn start_node(net: &LoopbackRaftNet, id: &str, dir: &Path, bootstrap: bool) -> Store {
    let addr = format!("{id}:7373");
    let (transport, incoming) = net.endpoint(&addr);
    let service = StoreService::new(
        NodeId::from(id),
        addr,
        test_config(dir, bootstrap),
        transport,
        incoming,
    )
    .unwrap();
    let store = service.store();
    async_std::task::spawn(service.run());
    store
}

/// Polls `probe` until it returns `Some` or the deadline passes.
async fn wait_for<T, F, Fut>(deadline: Duration, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = std::time::Instant::now();
    loop {
        if let Some(value) = probe().await {
            return value;
        }
        assert!(start.elapsed() < deadline, "condition not reached in time");
        async_std::task::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_for_leader(stores: &[&Store]) -> NodeId {
    wait_for(Duration::from_secs(5), || async {
        for store in stores {
            if store.is_leader().await {
                return Some(store.self_id().clone());
            }
        }
        None
    })
    .await
}

/// Boot a three-voter cluster: n1 bootstraps, n2 and n3 are added by the
/// leader, as membership admission would do.
async fn three_nodes(
    net: &LoopbackRaftNet,
    dirs: &[tempfile::TempDir; 3],
) -> (Store, Store, Store) {
    let s1 = start_node(net, "n1", dirs[0].path(), true);
    let s2 = start_node(net, "n2", dirs[1].path(), false);
    let s3 = start_node(net, "n3", dirs[2].path(), false);
    wait_for_leader(&[&s1]).await;
    s1.add_voter(NodeId::from("n2"), "n2:7373".into())
        .await
        .unwrap();
    s1.add_voter(NodeId::from("n3"), "n3:7373".into())
        .await
        .unwrap();
    (s1, s2, s3)
}

#[async_std::test]
async fn bootstrap_node_elects_itself_and_serves_writes() {
    let net = LoopbackRaftNet::new();
    let dir = tempfile::tempdir().unwrap();
    let store = start_node(&net, "n1", dir.path(), true);

    let leader = wait_for_leader(&[&store]).await;
    assert_eq!(leader, NodeId::from("n1"));

    let version = store.put("secret/munge", b"key".to_vec()).await.unwrap();
    assert_eq!(version, 1);
    let (value, v) = store
        .get("secret/munge", Consistency::Strong)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, b"key");
    assert_eq!(v, 1);
}

#[async_std::test]
async fn committed_writes_converge_on_every_voter() {
    let net = LoopbackRaftNet::new();
    let dirs = [
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    ];
    let (s1, s2, s3) = three_nodes(&net, &dirs).await;

    let voters = s1.voters().await;
    assert_eq!(voters.len(), 3);

    s1.put("secret/munge", b"shared-key".to_vec()).await.unwrap();

    for store in [&s1, &s2, &s3] {
        let (value, version) = wait_for(Duration::from_secs(5), || async {
            store
                .get("secret/munge", Consistency::Local)
                .await
                .ok()
                .flatten()
        })
        .await;
        assert_eq!(value, b"shared-key");
        assert_eq!(version, 1);
    }

    // Strong reads through a follower are forwarded to the leader.
    let (value, _) = s3
        .get("secret/munge", Consistency::Strong)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, b"shared-key");
}

#[async_std::test]
async fn follower_writes_are_forwarded_to_the_leader() {
    let net = LoopbackRaftNet::new();
    let dirs = [
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    ];
    let (s1, s2, _s3) = three_nodes(&net, &dirs).await;

    assert!(!s2.is_leader().await);
    let version = s2.put("leader/slurm-controller", b"n2".to_vec()).await.unwrap();
    assert_eq!(version, 1);
    let (value, _) = s1
        .get("leader/slurm-controller", Consistency::Strong)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, b"n2");
}

#[async_std::test]
async fn conditional_writes_serialize_claims() {
    let net = LoopbackRaftNet::new();
    let dirs = [
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    ];
    let (s1, s2, _s3) = three_nodes(&net, &dirs).await;

    s1.put_if("leader/k3s-server", Expect::Absent, b"n1".to_vec())
        .await
        .unwrap();
    let second = s2
        .put_if("leader/k3s-server", Expect::Absent, b"n2".to_vec())
        .await;
    match second {
        Err(Error::CasFailed { current }) => assert_eq!(current, Some(b"n1".to_vec())),
        other => panic!("expected CasFailed, got {other:?}"),
    }

    // Swapping from the known value succeeds.
    s2.put_if(
        "leader/k3s-server",
        Expect::Value(b"n1".to_vec()),
        b"n2".to_vec(),
    )
    .await
    .unwrap();
    let (value, _) = s1
        .get("leader/k3s-server", Consistency::Strong)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, b"n2");
}

#[async_std::test]
async fn surviving_majority_elects_a_new_leader() {
    let net = LoopbackRaftNet::new();
    let dirs = [
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    ];
    let (s1, s2, s3) = three_nodes(&net, &dirs).await;
    s1.put("secret/munge", b"stable".to_vec()).await.unwrap();

    // Wait until both followers have replicated before the crash.
    for store in [&s2, &s3] {
        wait_for(Duration::from_secs(5), || async {
            store.get("secret/munge", Consistency::Local).await.ok().flatten()
        })
        .await;
    }

    net.kill("n1:7373");
    s1.shutdown();

    let new_leader = wait_for_leader(&[&s2, &s3]).await;
    assert_ne!(new_leader, NodeId::from("n1"));

    // The value survives the leader change untouched.
    let (value, version) = wait_for(Duration::from_secs(5), || async {
        s2.get("secret/munge", Consistency::Strong).await.ok().flatten()
    })
    .await;
    assert_eq!(value, b"stable");
    assert_eq!(version, 1);
}

#[async_std::test]
async fn minority_partition_loses_quorum_and_recovers() {
    let net = LoopbackRaftNet::new();
    let dirs = [
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    ];
    let (s1, s2, s3) = three_nodes(&net, &dirs).await;
    s1.put("secret/munge", b"before".to_vec()).await.unwrap();
    wait_for(Duration::from_secs(5), || async {
        s3.get("secret/munge", Consistency::Local).await.ok().flatten()
    })
    .await;

    net.partition(&[&["n1:7373", "n2:7373"], &["n3:7373"]]);
    // Give the minority node time to lose its leader.
    async_std::task::sleep(Duration::from_millis(600)).await;

    // The majority side keeps accepting writes.
    let majority = wait_for(Duration::from_secs(5), || async {
        for store in [&s1, &s2] {
            if store.is_leader().await {
                return Some(store.clone());
            }
        }
        None
    })
    .await;
    majority.put("secret/munge", b"after".to_vec()).await.unwrap();

    // The minority side returns the quorum-lost error.
    let minority_write = s3.put("anything", b"x".to_vec()).await;
    assert!(
        matches!(minority_write, Err(ref e) if e.is_retryable()),
        "expected a retryable quorum error, got {minority_write:?}"
    );

    net.heal();
    let (value, version) = wait_for(Duration::from_secs(10), || async {
        match s3.get("secret/munge", Consistency::Strong).await {
            Ok(Some(found)) if found.0 == b"after" => Some(found),
            _ => None,
        }
    })
    .await;
    assert_eq!(value, b"after");
    assert_eq!(version, 2);
}

#[async_std::test]
async fn state_survives_restart() {
    let net = LoopbackRaftNet::new();
    let dir = tempfile::tempdir().unwrap();
    let store = start_node(&net, "n1", dir.path(), true);
    wait_for_leader(&[&store]).await;
    store.put("secret/k3s-token", b"token".to_vec()).await.unwrap();
    store.shutdown();
    net.kill("n1:7373");
    async_std::task::sleep(Duration::from_millis(100)).await;

    // Same directory, bootstrap flag still set: bootstrap must not run
    // twice, and the committed value must come back.
    let restarted = start_node(&net, "n1", dir.path(), true);
    wait_for_leader(&[&restarted]).await;
    let (value, version) = wait_for(Duration::from_secs(5), || async {
        restarted
            .get("secret/k3s-token", Consistency::Strong)
            .await
            .ok()
            .flatten()
    })
    .await;
    assert_eq!(value, b"token");
    assert_eq!(version, 1);
}

#[async_std::test]
async fn removed_voter_leaves_the_configuration() {
    let net = LoopbackRaftNet::new();
    let dirs = [
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    ];
    let (s1, _s2, _s3) = three_nodes(&net, &dirs).await;

    s1.remove_voter(NodeId::from("n3")).await.unwrap();
    let voters = s1.voters().await;
    assert_eq!(voters.len(), 2);
    assert!(!voters.contains_key(&NodeId::from("n3")));

    // Idempotent: removing again succeeds without a new entry.
    s1.remove_voter(NodeId::from("n3")).await.unwrap();
}
