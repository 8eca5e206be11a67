// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::cli::{
    block_until_sigint, resolve_cluster_secret, resolve_gossip_key, Config, EXIT_ADMISSION,
    EXIT_CONFIG, EXIT_CONSENSUS, EXIT_IDENTITY, EXIT_OVERLAY,
};
use grove_consensus::{ConsensusConfig, Store, StoreService, TcpTransport};
use grove_identity::{Identity, NodeId};
use grove_ipam::Subnet;
use grove_leadership::LeaderRegistryService;
use grove_membership::{MembershipService, VoterSink};
use grove_net::{
    GossipConfig, GossipService, MemberCard, TAG_ARCH, TAG_AUTH_TOKEN, TAG_CPU, TAG_GPU,
    TAG_OVERLAY_IP, TAG_RAM, TAG_ROLES, TAG_TUNNEL_PUB, TAG_VOTERS_DIGEST,
};
use grove_overlay::{OverlayConfig, OverlayService, WgQuickDevice};
use grove_roles::{role_spec, RoleManagerConfig, RoleManagerService, RolePaths, SystemRunner};

use async_std::task;
use log::{error, info};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Roles whose holder is elected cluster-wide.
const ELECTED_ROLES: [&str; 2] = ["slurm-controller", "k3s-server"];

/// Admission needs clocks within a few minutes of each other; a clock
/// before this epoch means no time source is configured at all.
const MIN_SANE_UNIX_SECS: u64 = 1_577_836_800; // 2020-01-01

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

/// Boots the daemon and runs until SIGINT. Returns the process exit code.
pub(super) async fn start(config: Config) -> i32 {
    info!(
        "Starting grove daemon, version {}",
        env!("CARGO_PKG_VERSION")
    );

    // Configuration that cannot possibly work is rejected before anything
    // touches the network.
    let subnet = match Subnet::parse(&config.networking.subnet) {
        Ok(subnet) => subnet,
        Err(e) => {
            error!("invalid networking.subnet: {e}");
            return EXIT_CONFIG;
        }
    };
    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    if now_secs < MIN_SANE_UNIX_SECS {
        error!("system clock is unset; admission requires a configured time source");
        return EXIT_ADMISSION;
    }

    // A: identity.
    let identity = match Identity::init(config.data_dir()) {
        Ok(identity) => identity,
        Err(e) => {
            error!("identity unavailable: {e}");
            return EXIT_IDENTITY;
        }
    };
    let node_id = identity.node_id().clone();
    info!("node identity {node_id}");

    // B: admission secret.
    let secret = match resolve_cluster_secret(&config) {
        Ok(secret) => secret,
        Err(e) => {
            error!("admission secret invalid: {e}");
            return EXIT_ADMISSION;
        }
    };

    // E: replicated store.
    let consensus_addr = format!(
        "{}:{}",
        config.discovery.node_name, config.consensus.bind_port
    );
    let (transport, incoming) =
        match TcpTransport::bind(&config.consensus.bind_addr, config.consensus.bind_port).await {
            Ok(bound) => bound,
            Err(e) => {
                error!("consensus unable to start: {e}");
                return EXIT_CONSENSUS;
            }
        };
    let store_service = match StoreService::new(
        node_id.clone(),
        consensus_addr,
        ConsensusConfig {
            data_dir: config.data_dir().join("consensus"),
            bind_addr: config.consensus.bind_addr.clone(),
            bind_port: config.consensus.bind_port,
            bootstrap: config.consensus.bootstrap,
            ..ConsensusConfig::default()
        },
        transport,
        incoming,
    ) {
        Ok(service) => service,
        Err(e) => {
            error!("consensus unable to start: {e}");
            return EXIT_CONSENSUS;
        }
    };
    let store = store_service.store();
    task::spawn(store_service.run());

    // D: gossip membership, advertising the admission token.
    let card = build_member_card(&config, &identity, &secret, now_secs);
    let gossip = match GossipService::new(
        GossipConfig {
            cluster_name: config.cluster.name.clone(),
            bind_addr: config.discovery.bind_addr.clone(),
            bind_port: config.discovery.bind_port,
            bootstrap_peers: config.discovery.bootstrap_peers.clone(),
            encrypt_key: resolve_gossip_key(&config),
            ..GossipConfig::default()
        },
        identity.transport_seed(),
        card.clone(),
    ) {
        Ok(gossip) => gossip,
        Err(e) => {
            error!("gossip transport unable to start: {e}");
            return 1;
        }
    };
    let channels = gossip.channels();
    task::spawn(gossip.run());

    let membership_service = MembershipService::new(
        card.clone(),
        secret.clone(),
        channels,
        config.consensus.bind_port,
    )
    .with_voter_sink(Arc::new(StoreVoterSink(store.clone())));
    let membership = membership_service.handle();
    task::spawn(membership_service.run());

    // Wait for the first membership sync before allocating the overlay
    // address, so known peers count in conflict detection.
    if !config.discovery.bootstrap_peers.is_empty() {
        let deadline = Instant::now() + Duration::from_secs(10);
        while membership.alive_members().await.len() < 2 && Instant::now() < deadline {
            task::sleep(Duration::from_millis(250)).await;
        }
    }

    // C: overlay address.
    let mut self_ip = grove_ipam::allocate(&subnet, &node_id);
    let peers = membership.alive_members().await;
    let taken: std::collections::HashSet<std::net::Ipv4Addr> = peers
        .iter()
        .filter(|m| m.node_id != node_id)
        .map(|m| grove_overlay::member_ip(m, &subnet))
        .collect();
    if taken.contains(&self_ip) {
        let salt = grove_ipam::conflict_salt(&node_id);
        match grove_ipam::allocate_randomized(&subnet, &taken, &salt) {
            Ok(ip) => {
                info!("ip.conflict peer_node_id=unknown old_ip={self_ip} new_ip={ip}");
                self_ip = ip;
            }
            Err(e) => {
                error!("overlay unable to start: {e}");
                return EXIT_OVERLAY;
            }
        }
    }
    let mut tags = card.tags.clone();
    tags.insert(TAG_OVERLAY_IP.to_string(), self_ip.to_string());
    membership.update_tags(tags).await;

    // G: overlay mesh.
    let mut overlay_service = OverlayService::new(
        OverlayConfig {
            interface: config.networking.interface.clone(),
            listen_port: config.networking.listen_port,
            subnet,
            mtu: config.networking.mtu,
            config_dir: config.data_dir().join("overlay"),
            ..OverlayConfig::default()
        },
        Arc::new(WgQuickDevice),
        membership.clone(),
        identity.tunnel_secret(),
        self_ip,
    )
    .await;
    let overlay = overlay_service.overlay();
    if let Err(e) = overlay_service.reconcile(false).await {
        error!("overlay unable to start: {e}");
        return EXIT_OVERLAY;
    }
    task::spawn(overlay_service.run());

    // F: leader registry over E and D.
    let eligible: Vec<String> = config
        .roles
        .enabled
        .iter()
        .filter(|r| ELECTED_ROLES.contains(&r.as_str()))
        .cloned()
        .collect();
    let registry_service =
        match LeaderRegistryService::new(store.clone(), membership.clone(), eligible).await {
            Ok(service) => service,
            Err(e) => {
                error!("leader registry unable to start: {e}");
                return EXIT_CONSENSUS;
            }
        };
    let registry = registry_service.registry();
    task::spawn(registry_service.run());

    // H: role manager.
    let runner = Arc::new(SystemRunner);
    let paths = RolePaths::default();
    let mut specs = Vec::new();
    for role in &config.roles.enabled {
        match role_spec(role, &paths, runner.clone()) {
            Ok(spec) => specs.push(spec),
            Err(e) => {
                error!("invalid role configuration: {e}");
                return EXIT_CONFIG;
            }
        }
    }
    let manager_service = RoleManagerService::new(
        RoleManagerConfig {
            cluster_name: config.cluster.name.clone(),
            subnet,
            ..RoleManagerConfig::default()
        },
        specs,
        membership.clone(),
        registry.clone(),
        store.clone(),
    )
    .await;
    let manager = manager_service.manager();
    task::spawn(manager_service.run());

    // Merge detection: advertise a digest of the known voter set and flag
    // peers whose digest stays different. Two independently bootstrapped
    // clusters sharing a secret are detectable this way; merging them is
    // operator work.
    {
        let membership = membership.clone();
        let store = store.clone();
        task::spawn(async move {
            let mut advertised = String::new();
            loop {
                task::sleep(Duration::from_secs(30)).await;
                let voters = store.voters().await;
                if voters.is_empty() {
                    continue;
                }
                let digest = voters_digest(voters.keys().map(|id| id.as_str()));
                if digest != advertised {
                    if let Some(me) = membership.member(membership.self_id()).await {
                        let mut tags = me.tags.clone();
                        tags.insert(TAG_VOTERS_DIGEST.to_string(), digest.clone());
                        membership.update_tags(tags).await;
                    }
                    advertised = digest.clone();
                }
                for member in membership.alive_members().await {
                    if member.node_id == *membership.self_id() {
                        continue;
                    }
                    let theirs = member.tags.get(TAG_VOTERS_DIGEST);
                    // A brief disagreement is normal while a voter change
                    // propagates; a persistent one is a split brain.
                    if theirs.is_some_and(|d| !d.is_empty() && *d != digest) {
                        log::warn!(
                            "cluster merge conflict suspected: {} reports a different voter set",
                            member.node_id
                        );
                    }
                }
            }
        });
    }

    info!(
        "grove node {} is up (cluster {}, overlay {})",
        node_id, config.cluster.name, self_ip
    );

    // Block until ctrl-c is hit.
    block_until_sigint().await;

    // Shutdown in reverse order: roles, claims, overlay, gossip, store.
    info!("shutting down");
    manager.shutdown().await;
    registry.release_owned().await;
    overlay.shutdown().await;
    membership.leave();
    // Give the leave tombstone a moment to fan out so peers observe
    // `left` rather than `failed`.
    task::sleep(Duration::from_millis(500)).await;
    store.shutdown();
    info!("shutdown complete");
    0
}

/// Short stable digest of the voter set, order independent.
fn voters_digest<'a>(ids: impl Iterator<Item = &'a str>) -> String {
    use sha2::{Digest, Sha256};
    let mut sorted: Vec<&str> = ids.collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    for id in sorted {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(&hasher.finalize()[..8])
}

fn build_member_card(
    config: &Config,
    identity: &Identity,
    secret: &grove_admission::ClusterSecret,
    now_secs: u64,
) -> MemberCard {
    let caps = &config.roles.capabilities;
    let mut tags = BTreeMap::new();
    tags.insert(
        TAG_AUTH_TOKEN.to_string(),
        grove_admission::issue_join_proof(secret, identity.node_id()),
    );
    tags.insert(TAG_TUNNEL_PUB.to_string(), identity.tunnel_public());
    tags.insert(TAG_ROLES.to_string(), config.roles.enabled.join(","));
    tags.insert(
        TAG_ARCH.to_string(),
        caps.arch.clone().unwrap_or_else(grove_utils::machine_arch),
    );
    tags.insert(
        TAG_CPU.to_string(),
        caps.cpu
            .unwrap_or_else(|| grove_utils::machine_cpus() as u64)
            .to_string(),
    );
    tags.insert(
        TAG_RAM.to_string(),
        caps.ram
            .unwrap_or_else(grove_utils::machine_ram_mb)
            .to_string(),
    );
    tags.insert(TAG_GPU.to_string(), caps.gpu.unwrap_or(0).to_string());

    MemberCard {
        node_id: identity.node_id().clone(),
        name: config.discovery.node_name.clone(),
        addr: format!(
            "{}:{}",
            config.discovery.node_name, config.discovery.bind_port
        ),
        // Seeding the incarnation with the boot time lets a restarted
        // node supersede its previous advertisement.
        incarnation: now_secs,
        tags,
    }
}
