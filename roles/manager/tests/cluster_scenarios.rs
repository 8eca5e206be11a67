// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! End-to-end control-plane scenarios over the in-memory transports:
//! admission, membership, replication, election and role lifecycle wired
//! together the way the daemon wires them.

use grove_admission::ClusterSecret;
use grove_consensus::loopback::LoopbackRaftNet;
use grove_consensus::{Consistency, ConsensusConfig, Store, StoreService};
use grove_identity::NodeId;
use grove_ipam::Subnet;
use grove_leadership::{LeaderRegistry, LeaderRegistryService};
use grove_membership::{Membership, MembershipService, MemberStatus, VoterSink};
use grove_net::loopback::LoopbackHub;
use grove_net::{MemberCard, TAG_AUTH_TOKEN, TAG_ROLES, TAG_TUNNEL_PUB};
use grove_roles::{
    MockRoleService, RoleManager, RoleManagerConfig, RoleManagerService, RoleService, RoleSpec,
    RoleState, SecretSpec, SECRET_MUNGE,
};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn cluster_secret() -> ClusterSecret {
    ClusterSecret::decode(&base64::encode([17u8; 32])).unwrap()
}

fn signed_node(byte: u8) -> NodeId {
    use ed25519_dalek::SigningKey;
    let key = SigningKey::from_bytes(&[byte; 32]);
    NodeId::from_verifying_key(&key.verifying_key())
}

struct StoreVoterSink(Store);

impl VoterSink for StoreVoterSink {
    fn peer_alive(&self, node_id: &NodeId, consensus_addr: &str) {
        self.0
            .add_voter_nowait(node_id.clone(), consensus_addr.to_string());
    }
    fn peer_gone(&self, node_id: &NodeId) {
        self.0.remove_voter_nowait(node_id.clone());
    }
}

/// Service fake that records whether the shared secret file existed at the
/// moment the service process was started.
struct SecretCheckingService {
    inner: MockRoleService,
    secret_path: PathBuf,
    secret_present_at_start: AtomicBool,
}

impl SecretCheckingService {
    fn new(secret_path: PathBuf) -> Self {
        SecretCheckingService {
            inner: MockRoleService::new(),
            secret_path,
            secret_present_at_start: AtomicBool::new(false),
        }
    }
}

impl RoleService for SecretCheckingService {
    fn prepare(&self, config: &str) -> Result<(), grove_roles::Error> {
        self.inner.prepare(config)
    }
    fn start(&self) -> Result<(), grove_roles::Error> {
        self.secret_present_at_start
            .store(self.secret_path.exists(), Ordering::SeqCst);
        self.inner.start()
    }
    fn reload(&self) -> Result<(), grove_roles::Error> {
        self.inner.reload()
    }
    fn stop(&self) -> Result<(), grove_roles::Error> {
        self.inner.stop()
    }
    fn health(&self) -> Result<bool, grove_roles::Error> {
        self.inner.health()
    }
}

struct TestNode {
    id: NodeId,
    membership: Membership,
    store: Store,
    registry: LeaderRegistry,
    manager: RoleManager,
    services: HashMap<String, Arc<SecretCheckingService>>,
    munge_path: PathBuf,
    consensus_addr: String,
    _dir: tempfile::TempDir,
}

async fn boot_node(
    hub: &LoopbackHub,
    net: &LoopbackRaftNet,
    name: &str,
    byte: u8,
    roles: &[&str],
    bootstrap: bool,
) -> TestNode {
    let secret = cluster_secret();
    let id = signed_node(byte);
    let dir = tempfile::tempdir().unwrap();
    let consensus_addr = format!("{name}.local:7373");

    let mut tags = BTreeMap::new();
    tags.insert(
        TAG_AUTH_TOKEN.to_string(),
        grove_admission::issue_join_proof(&secret, &id),
    );
    tags.insert(TAG_TUNNEL_PUB.to_string(), format!("{name}-tunnel"));
    tags.insert(TAG_ROLES.to_string(), roles.join(","));
    let card = MemberCard {
        node_id: id.clone(),
        name: name.to_string(),
        addr: format!("{name}.local:7946"),
        incarnation: 1,
        tags,
    };

    let (transport, incoming) = net.endpoint(&consensus_addr);
    let consensus_config = ConsensusConfig {
        data_dir: dir.path().join("consensus"),
        bootstrap,
        tick_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(40),
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        op_timeout: Duration::from_millis(800),
        ..ConsensusConfig::default()
    };
    let store_service = StoreService::new(
        id.clone(),
        consensus_addr.clone(),
        consensus_config,
        transport,
        incoming,
    )
    .unwrap();
    let store = store_service.store();
    async_std::task::spawn(store_service.run());

    let membership_service = MembershipService::new(card.clone(), secret, hub.attach(card), 7373)
        .with_voter_sink(Arc::new(StoreVoterSink(store.clone())));
    let membership = membership_service.handle();
    async_std::task::spawn(membership_service.run());

    let elected: Vec<String> = roles
        .iter()
        .filter(|r| **r == "slurm-controller" || **r == "k3s-server")
        .map(|r| r.to_string())
        .collect();
    let registry_service =
        LeaderRegistryService::new(store.clone(), membership.clone(), elected)
            .await
            .unwrap();
    let registry = registry_service.registry();
    async_std::task::spawn(registry_service.run());

    let munge_path = dir.path().join("munge.key");
    let munge_secret = SecretSpec {
        store_key: SECRET_MUNGE.to_string(),
        path: munge_path.clone(),
        generate_len: 1024,
    };
    let mut specs = Vec::new();
    let mut services = HashMap::new();
    for role in roles {
        let service = Arc::new(SecretCheckingService::new(munge_path.clone()));
        services.insert(role.to_string(), service.clone());
        specs.push(RoleSpec {
            name: role.to_string(),
            elected: *role == "slurm-controller" || *role == "k3s-server",
            publishes: (*role == "slurm-controller").then(|| munge_secret.clone()),
            fetches: role.starts_with("slurm").then(|| munge_secret.clone()),
            restart_on_change: false,
            service,
            health_deadline: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(2),
        });
    }
    let manager_config = RoleManagerConfig {
        cluster_name: "grove".to_string(),
        subnet: Subnet::parse("10.42.0.0/16").unwrap(),
        health_interval: Duration::from_millis(200),
        reconcile_interval: Duration::from_secs(2),
        ..RoleManagerConfig::default()
    };
    let manager_service = RoleManagerService::new(
        manager_config,
        specs,
        membership.clone(),
        registry.clone(),
        store.clone(),
    )
    .await;
    let manager = manager_service.manager();
    async_std::task::spawn(manager_service.run());

    TestNode {
        id,
        membership,
        store,
        registry,
        manager,
        services,
        munge_path,
        consensus_addr,
        _dir: dir,
    }
}

async fn wait_for<T, F, Fut>(deadline: Duration, what: &str, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = std::time::Instant::now();
    loop {
        if let Some(value) = probe().await {
            return value;
        }
        assert!(
            start.elapsed() < deadline,
            "timed out waiting for: {what}"
        );
        async_std::task::sleep(Duration::from_millis(100)).await;
    }
}

/// S1: three nodes converge to one controller, a replicated munge key, and
/// followers that fetched it before their services started.
#[async_std::test]
async fn three_nodes_self_assemble() {
    let hub = LoopbackHub::new();
    let net = LoopbackRaftNet::new();
    let roles = ["slurm-controller", "slurm-worker"];
    let n1 = boot_node(&hub, &net, "n1", 1, &roles, true).await;
    let n2 = boot_node(&hub, &net, "n2", 2, &roles, false).await;
    let n3 = boot_node(&hub, &net, "n3", 3, &roles, false).await;
    let nodes = [&n1, &n2, &n3];

    // Every node lists the other two as alive.
    for node in nodes {
        wait_for(Duration::from_secs(30), "full membership", || async {
            (node.membership.alive_members().await.len() == 3).then_some(())
        })
        .await;
    }

    // The consensus voter set is exactly the three nodes.
    wait_for(Duration::from_secs(30), "full voter set", || async {
        let voters = n1.store.voters().await;
        (voters.len() == 3
            && nodes
                .iter()
                .all(|n| voters.get(&n.id) == Some(&n.consensus_addr)))
        .then_some(())
    })
    .await;

    // Exactly one live node holds the controller role.
    let holder = wait_for(Duration::from_secs(30), "controller elected", || async {
        n1.registry.current_holder("slurm-controller").await
    })
    .await
    .0;
    assert!(nodes.iter().any(|n| n.id == holder));

    // The holder published a non-empty munge key.
    let (munge, munge_version) = wait_for(Duration::from_secs(30), "munge key", || async {
        n1.store
            .get(SECRET_MUNGE, Consistency::Strong)
            .await
            .ok()
            .flatten()
    })
    .await;
    assert!(!munge.is_empty());
    assert_eq!(munge_version, 1);

    // Every node's worker role reaches follower with the identical key
    // fetched to its local filesystem before the service started.
    for node in nodes {
        wait_for(
            Duration::from_secs(30),
            "worker follower healthy",
            || async {
                (node.manager.state("slurm-worker").await == Some(RoleState::Follower))
                    .then_some(())
            },
        )
        .await;
        assert_eq!(std::fs::read(&node.munge_path).unwrap(), munge);
        assert!(node.services["slurm-worker"]
            .secret_present_at_start
            .load(Ordering::SeqCst));
    }

    // Single-holder invariant: exactly one node runs the controller as
    // leader.
    wait_for(Duration::from_secs(30), "single controller", || async {
        let mut leaders = 0;
        for node in nodes {
            if node.manager.state("slurm-controller").await == Some(RoleState::Leader) {
                leaders += 1;
            }
        }
        (leaders == 1).then_some(())
    })
    .await;
    let mut holds = 0;
    for node in nodes {
        if node.registry.holds("slurm-controller").await {
            holds += 1;
        }
    }
    assert_eq!(holds, 1);
}

/// S2: killing the controller hands the role to another node; the munge
/// key is unchanged and nobody refetches a different value.
#[async_std::test]
async fn controller_failover_keeps_the_secret() {
    let hub = LoopbackHub::new();
    let net = LoopbackRaftNet::new();
    let roles = ["slurm-controller", "slurm-worker"];
    let n1 = boot_node(&hub, &net, "n1", 1, &roles, true).await;
    let n2 = boot_node(&hub, &net, "n2", 2, &roles, false).await;
    let n3 = boot_node(&hub, &net, "n3", 3, &roles, false).await;
    let nodes = [&n1, &n2, &n3];

    let (first_holder, _) = wait_for(Duration::from_secs(30), "controller", || async {
        n1.registry.current_holder("slurm-controller").await
    })
    .await;
    let (munge_before, version_before) =
        wait_for(Duration::from_secs(30), "munge key", || async {
            n1.store
                .get(SECRET_MUNGE, Consistency::Strong)
                .await
                .ok()
                .flatten()
        })
        .await;

    // Kill the holder's process: gossip sees a failure, consensus loses a
    // voter endpoint.
    let victim = nodes.iter().find(|n| n.id == first_holder).unwrap();
    hub.fail(&victim.id);
    net.kill(&victim.consensus_addr);
    victim.store.shutdown();

    let survivors: Vec<&&TestNode> = nodes.iter().filter(|n| n.id != first_holder).collect();
    let new_holder = wait_for(Duration::from_secs(30), "new controller", || async {
        for node in &survivors {
            if let Some((holder, _)) = node.registry.current_holder("slurm-controller").await {
                if holder != first_holder && node.membership.is_alive(&holder).await {
                    return Some(holder);
                }
            }
        }
        None
    })
    .await;
    assert_ne!(new_holder, first_holder);

    // The key was already replicated; same bytes, same version.
    let survivor = survivors[0];
    let (munge_after, version_after) =
        wait_for(Duration::from_secs(30), "munge after failover", || async {
            survivor
                .store
                .get(SECRET_MUNGE, Consistency::Strong)
                .await
                .ok()
                .flatten()
        })
        .await;
    assert_eq!(munge_after, munge_before);
    assert_eq!(version_after, version_before);
}

/// S3: a node presenting a proof from the wrong secret never enters any
/// member view and never reaches the voter set.
#[async_std::test]
async fn wrong_secret_node_is_rejected_everywhere() {
    let hub = LoopbackHub::new();
    let net = LoopbackRaftNet::new();
    let roles = ["slurm-controller", "slurm-worker"];
    let n1 = boot_node(&hub, &net, "n1", 1, &roles, true).await;
    let n2 = boot_node(&hub, &net, "n2", 2, &roles, false).await;

    for node in [&n1, &n2] {
        wait_for(Duration::from_secs(30), "membership", || async {
            (node.membership.alive_members().await.len() == 2).then_some(())
        })
        .await;
    }

    // The intruder signs its proof with a different secret.
    let wrong = ClusterSecret::decode(&base64::encode([99u8; 32])).unwrap();
    let intruder = signed_node(4);
    let mut tags = BTreeMap::new();
    tags.insert(
        TAG_AUTH_TOKEN.to_string(),
        grove_admission::issue_join_proof(&wrong, &intruder),
    );
    hub.attach(MemberCard {
        node_id: intruder.clone(),
        name: "n4".to_string(),
        addr: "n4.local:7946".to_string(),
        incarnation: 1,
        tags,
    });
    async_std::task::sleep(Duration::from_secs(1)).await;

    for node in [&n1, &n2] {
        assert!(node.membership.member(&intruder).await.is_none());
        assert!(!node.store.voters().await.contains_key(&intruder));
    }
}

/// S6 (control-plane half): a clean shutdown releases the role, peers
/// observe `left` rather than `failed`, and the store closes.
#[async_std::test]
async fn graceful_shutdown_is_observed_as_left() {
    let hub = LoopbackHub::new();
    let net = LoopbackRaftNet::new();
    let roles = ["slurm-controller", "slurm-worker"];
    let n1 = boot_node(&hub, &net, "n1", 1, &roles, true).await;
    let n2 = boot_node(&hub, &net, "n2", 2, &roles, false).await;

    wait_for(Duration::from_secs(30), "membership", || async {
        (n1.membership.alive_members().await.len() == 2
            && n2.membership.alive_members().await.len() == 2)
            .then_some(())
    })
    .await;
    wait_for(Duration::from_secs(30), "worker running on n2", || async {
        (n2.manager.state("slurm-worker").await == Some(RoleState::Follower)).then_some(())
    })
    .await;

    // Shutdown order: roles stop, claims release, gossip leaves, store
    // closes.
    n2.manager.shutdown().await;
    assert_eq!(
        n2.manager.state("slurm-worker").await,
        Some(RoleState::Disabled)
    );
    assert!(!n2.services["slurm-worker"].inner.is_running());
    n2.registry.release_owned().await;
    n2.membership.leave();
    n2.store.shutdown();

    let observed = wait_for(Duration::from_secs(10), "left observed", || async {
        n1.membership
            .member(&n2.id)
            .await
            .map(|m| m.status)
            .filter(|s| *s != MemberStatus::Alive)
    })
    .await;
    assert_eq!(observed, MemberStatus::Left);
}
