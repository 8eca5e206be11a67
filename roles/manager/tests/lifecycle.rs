// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Single-node role lifecycle behavior: failure backoff, health demotion,
//! and the publish-before-start contract of elected roles.

use grove_admission::ClusterSecret;
use grove_consensus::loopback::LoopbackRaftNet;
use grove_consensus::{Consistency, ConsensusConfig, Store, StoreService};
use grove_identity::NodeId;
use grove_ipam::Subnet;
use grove_leadership::LeaderRegistryService;
use grove_membership::{Membership, MembershipService};
use grove_net::loopback::LoopbackHub;
use grove_net::MemberCard;
use grove_roles::{
    MockRoleService, RoleManager, RoleManagerConfig, RoleManagerService, RoleSpec, RoleState,
    SecretSpec, SECRET_MUNGE,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

struct Rig {
    manager: RoleManager,
    service: Arc<MockRoleService>,
    store: Store,
    membership: Membership,
    _dir: tempfile::TempDir,
}

async fn rig(role: &str, elected: bool, fail_starts: u32) -> Rig {
    let hub = LoopbackHub::new();
    let net = LoopbackRaftNet::new();
    let secret = ClusterSecret::decode(&base64::encode([8u8; 32])).unwrap();
    let id = {
        use ed25519_dalek::SigningKey;
        let key = SigningKey::from_bytes(&[21u8; 32]);
        NodeId::from_verifying_key(&key.verifying_key())
    };
    let dir = tempfile::tempdir().unwrap();

    let (transport, incoming) = net.endpoint("solo.local:7373");
    let store_service = StoreService::new(
        id.clone(),
        "solo.local:7373".to_string(),
        ConsensusConfig {
            data_dir: dir.path().join("consensus"),
            bootstrap: true,
            tick_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(40),
            election_timeout_min: Duration::from_millis(100),
            election_timeout_max: Duration::from_millis(200),
            op_timeout: Duration::from_millis(800),
            ..ConsensusConfig::default()
        },
        transport,
        incoming,
    )
    .unwrap();
    let store = store_service.store();
    async_std::task::spawn(store_service.run());

    let card = MemberCard {
        node_id: id.clone(),
        name: "solo".to_string(),
        addr: "solo.local:7946".to_string(),
        incarnation: 1,
        tags: BTreeMap::new(),
    };
    let membership_service = MembershipService::new(card.clone(), secret, hub.attach(card), 7373);
    let membership = membership_service.handle();
    async_std::task::spawn(membership_service.run());

    let eligible = if elected { vec![role.to_string()] } else { Vec::new() };
    let registry_service = LeaderRegistryService::new(store.clone(), membership.clone(), eligible)
        .await
        .unwrap();
    let registry = registry_service.registry();
    async_std::task::spawn(registry_service.run());

    let service = Arc::new(MockRoleService::new());
    service.fail_next_starts(fail_starts);
    let spec = RoleSpec {
        name: role.to_string(),
        elected,
        publishes: elected.then(|| SecretSpec {
            store_key: SECRET_MUNGE.to_string(),
            path: dir.path().join("munge.key"),
            generate_len: 64,
        }),
        fetches: None,
        restart_on_change: false,
        service: service.clone(),
        health_deadline: Duration::from_secs(3),
        stop_timeout: Duration::from_secs(1),
    };
    let manager_service = RoleManagerService::new(
        RoleManagerConfig {
            cluster_name: "grove".to_string(),
            subnet: Subnet::parse("10.42.0.0/16").unwrap(),
            health_interval: Duration::from_millis(150),
            reconcile_interval: Duration::from_secs(2),
            ..RoleManagerConfig::default()
        },
        vec![spec],
        membership.clone(),
        registry,
        store.clone(),
    )
    .await;
    let manager = manager_service.manager();
    async_std::task::spawn(manager_service.run());

    Rig {
        manager,
        service,
        store,
        membership,
        _dir: dir,
    }
}

async fn wait_for_state(rig: &Rig, role: &str, state: RoleState) {
    let start = std::time::Instant::now();
    loop {
        if rig.manager.state(role).await == Some(state) {
            return;
        }
        assert!(
            start.elapsed() < Duration::from_secs(20),
            "role {role} never reached {state}"
        );
        async_std::task::sleep(Duration::from_millis(100)).await;
    }
}

#[async_std::test]
async fn follower_role_starts_and_runs() {
    let rig = rig("slurm-worker", false, 0).await;
    wait_for_state(&rig, "slurm-worker", RoleState::Follower).await;
    let calls = rig.service.calls();
    assert_eq!(calls, vec!["prepare".to_string(), "start".to_string()]);
    assert!(!rig.membership.members().await.is_empty());
}

#[async_std::test]
async fn failed_start_retries_after_backoff() {
    let rig = rig("slurm-worker", false, 1).await;
    // First attempt fails and lands in failed; the backoff retry brings it
    // up.
    wait_for_state(&rig, "slurm-worker", RoleState::Follower).await;
    let starts = rig
        .service
        .calls()
        .iter()
        .filter(|c| c.as_str() == "start")
        .count();
    assert_eq!(starts, 2);
}

#[async_std::test]
async fn unhealthy_running_role_is_demoted_and_recovered() {
    let rig = rig("slurm-worker", false, 0).await;
    wait_for_state(&rig, "slurm-worker", RoleState::Follower).await;

    rig.service.set_healthy(Some(false));
    wait_for_state(&rig, "slurm-worker", RoleState::Failed).await;
    rig.service.set_healthy(None);
    wait_for_state(&rig, "slurm-worker", RoleState::Follower).await;
}

#[async_std::test]
async fn elected_role_publishes_before_start() {
    let rig = rig("slurm-controller", true, 0).await;
    wait_for_state(&rig, "slurm-controller", RoleState::Leader).await;

    // The secret was in the store before the service started.
    let (value, _) = rig
        .store
        .get(SECRET_MUNGE, Consistency::Strong)
        .await
        .unwrap()
        .expect("munge key published");
    assert!(!value.is_empty());
    assert_eq!(
        rig.service.calls(),
        vec!["prepare".to_string(), "start".to_string()]
    );
}
