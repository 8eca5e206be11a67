// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::card::{GossipPayload, MemberCard};
use crate::{Error, GossipChannels, GossipCommand, GossipConfig, GossipEvent};
use futures::prelude::*;
use futures::select;
use grove_identity::NodeId;
use libp2p::gossipsub::{self, IdentTopic, MessageAuthenticity};
use libp2p::identity::Keypair;
use libp2p::pnet::{PnetConfig, PreSharedKey};
use libp2p::swarm::{NetworkBehaviour, Swarm, SwarmEvent};
use libp2p::{identify, noise, ping, Multiaddr, PeerId, Transport as _};
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};

/// Gossip protocol name advertised over identify.
const PROTOCOL_VERSION: &str = "/grove/1.0.0";

fn member_topic(cluster_name: &str) -> IdentTopic {
    IdentTopic::new(format!("/grove/members/{cluster_name}"))
}

#[derive(NetworkBehaviour)]
#[behaviour(out_event = "GroveBehaviourEvent")]
struct GroveBehaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
}

#[derive(Debug)]
enum GroveBehaviourEvent {
    Gossipsub(gossipsub::Event),
    Identify(Box<identify::Event>),
    Ping(ping::Event),
}

impl From<gossipsub::Event> for GroveBehaviourEvent {
    fn from(event: gossipsub::Event) -> Self {
        GroveBehaviourEvent::Gossipsub(event)
    }
}

impl From<identify::Event> for GroveBehaviourEvent {
    fn from(event: identify::Event) -> Self {
        GroveBehaviourEvent::Identify(Box::new(event))
    }
}

impl From<ping::Event> for GroveBehaviourEvent {
    fn from(event: ping::Event) -> Self {
        GroveBehaviourEvent::Ping(event)
    }
}

struct SeenPeer {
    card: MemberCard,
    last_refresh: Instant,
}

/// The gossip service owns the libp2p swarm and the freshness bookkeeping
/// that turns raw publications into settled membership transitions.
pub struct GossipService {
    swarm: Swarm<GroveBehaviour>,
    topic: IdentTopic,
    config: GossipConfig,
    card: MemberCard,
    command_tx: flume::Sender<GossipCommand>,
    command_rx: flume::Receiver<GossipCommand>,
    event_tx: flume::Sender<GossipEvent>,
    event_rx: flume::Receiver<GossipEvent>,
}

impl GossipService {
    /// Build the swarm. The keypair seed is the node's signing seed, so the
    /// libp2p peer ID is bound to the grove node ID and cards from an
    /// impersonating peer can be dropped at the transport.
    pub fn new(config: GossipConfig, keypair_seed: [u8; 32], card: MemberCard) -> Result<Self, Error> {
        let keypair = Keypair::ed25519_from_bytes(keypair_seed)
            .map_err(|e| Error::Transport(e.to_string()))?;
        let peer_id = PeerId::from(keypair.public());

        let psk = match &config.encrypt_key {
            Some(encoded) => Some(decode_psk(encoded)?),
            None => {
                warn!("gossip encryption key not set; transport is noise-only");
                None
            }
        };
        let transport = build_transport(&keypair, psk)?;

        let gossipsub = gossipsub::Behaviour::new(
            MessageAuthenticity::Signed(keypair.clone()),
            gossipsub::Config::default(),
        )
        .map_err(|e| Error::Transport(e.to_string()))?;
        let identify = identify::Behaviour::new(identify::Config::new(
            PROTOCOL_VERSION.to_string(),
            keypair.public(),
        ));
        let behaviour = GroveBehaviour {
            gossipsub,
            identify,
            ping: ping::Behaviour::default(),
        };

        let swarm_config = libp2p::swarm::Config::with_async_std_executor()
            .with_idle_connection_timeout(Duration::from_secs(60));
        let mut swarm = Swarm::new(transport, behaviour, peer_id, swarm_config);

        let topic = member_topic(&config.cluster_name);
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&topic)
            .map_err(|e| Error::Transport(e.to_string()))?;

        let (command_tx, command_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();
        Ok(GossipService {
            swarm,
            topic,
            config,
            card,
            command_tx,
            command_rx,
            event_tx,
            event_rx,
        })
    }

    /// The channel pair the membership layer consumes.
    pub fn channels(&self) -> GossipChannels {
        (self.command_tx.clone(), self.event_rx.clone())
    }

    /// Run the transport loop until a `Shutdown` command. Resolves with an
    /// error only for unrecoverable transport failures; dial and publish
    /// hiccups are retried on the next advertisement round.
    pub async fn run(self) -> Result<(), Error> {
        let GossipService {
            mut swarm,
            topic,
            config,
            mut card,
            command_rx,
            event_tx,
            ..
        } = self;

        let listen: Multiaddr = format!("/ip4/{}/tcp/{}", config.bind_addr, config.bind_port)
            .parse()
            .map_err(|_| Error::Addr(format!("{}:{}", config.bind_addr, config.bind_port)))?;
        swarm
            .listen_on(listen)
            .map_err(|e| Error::Transport(e.to_string()))?;

        for peer in &config.bootstrap_peers {
            match resolve_multiaddr(peer) {
                Ok(addr) => {
                    if let Err(e) = swarm.dial(addr) {
                        warn!("failed to dial bootstrap peer {peer}: {e}");
                    }
                }
                Err(e) => warn!("skipping bootstrap peer {peer}: {e}"),
            }
        }

        let mut seen: HashMap<NodeId, SeenPeer> = HashMap::new();
        let mut tombstones: HashMap<NodeId, u64> = HashMap::new();

        let mut swarm_stream = swarm.fuse();
        let mut command_stream = command_rx.stream().fuse();
        let mut advertise = async_std::stream::interval(config.advertise_interval).fuse();
        let sweep_period = config.suspicion_timeout / 2;
        let mut sweep = async_std::stream::interval(sweep_period).fuse();

        info!("gossip service running on topic {}", topic);
        loop {
            select! {
                swarm_event = swarm_stream.next() => match swarm_event {
                    Some(SwarmEvent::Behaviour(GroveBehaviourEvent::Gossipsub(
                        gossipsub::Event::Message { message, .. },
                    ))) => {
                        handle_publication(
                            &message.data,
                            message.source,
                            &card.node_id,
                            &mut seen,
                            &mut tombstones,
                            &event_tx,
                        );
                    }
                    Some(SwarmEvent::NewListenAddr { address, .. }) => {
                        info!("gossip listening on {address}");
                    }
                    Some(SwarmEvent::ConnectionEstablished { peer_id, .. }) => {
                        debug!("gossip connection established with {peer_id}");
                    }
                    Some(SwarmEvent::OutgoingConnectionError { peer_id, error, .. }) => {
                        debug!("gossip dial failure to {peer_id:?}: {error}");
                    }
                    None => break,
                    _ => {}
                },
                command = command_stream.next() => match command {
                    Some(GossipCommand::UpdateTags(tags)) => {
                        card.tags = tags;
                        card.incarnation += 1;
                        publish(swarm_stream.get_mut(), &topic, &GossipPayload::Alive(card.clone()));
                    }
                    Some(GossipCommand::Leave) => {
                        publish(
                            swarm_stream.get_mut(),
                            &topic,
                            &GossipPayload::Leave {
                                node_id: card.node_id.clone(),
                                incarnation: card.incarnation,
                            },
                        );
                    }
                    Some(GossipCommand::ForceLeave(node_id)) => {
                        let incarnation = seen
                            .get(&node_id)
                            .map(|p| p.card.incarnation)
                            .unwrap_or(u64::MAX);
                        publish(
                            swarm_stream.get_mut(),
                            &topic,
                            &GossipPayload::Leave { node_id: node_id.clone(), incarnation },
                        );
                        // Settle locally even when no peer relays it back.
                        if seen.remove(&node_id).is_some() {
                            tombstones.insert(node_id.clone(), incarnation);
                            let _ = event_tx.send(GossipEvent::Left(node_id));
                        }
                    }
                    Some(GossipCommand::Shutdown) | None => break,
                },
                _ = advertise.next() => {
                    publish(swarm_stream.get_mut(), &topic, &GossipPayload::Alive(card.clone()));
                }
                _ = sweep.next() => {
                    let deadline = config.suspicion_timeout;
                    let expired: Vec<NodeId> = seen
                        .iter()
                        .filter(|(_, peer)| peer.last_refresh.elapsed() > deadline)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for node_id in expired {
                        seen.remove(&node_id);
                        debug!("gossip peer {node_id} missed its refresh deadline");
                        let _ = event_tx.send(GossipEvent::Failed(node_id));
                    }
                }
            }
        }
        info!("gossip service stopped");
        Ok(())
    }
}

fn handle_publication(
    data: &[u8],
    source: Option<PeerId>,
    self_id: &NodeId,
    seen: &mut HashMap<NodeId, SeenPeer>,
    tombstones: &mut HashMap<NodeId, u64>,
    event_tx: &flume::Sender<GossipEvent>,
) {
    let payload: GossipPayload = match serde_json::from_slice(data) {
        Ok(payload) => payload,
        Err(e) => {
            trace!("dropping undecodable gossip publication: {e}");
            return;
        }
    };
    match payload {
        GossipPayload::Alive(card) => {
            if card.node_id == *self_id {
                return;
            }
            // The card must come from the peer it describes; gossipsub
            // signs messages, so the source peer ID is authenticated.
            if let Some(source) = source {
                if !source_matches(&source, &card.node_id) {
                    warn!(
                        "dropping member card for {} published by unrelated peer {source}",
                        card.node_id
                    );
                    return;
                }
            }
            if tombstones.get(&card.node_id).is_some_and(|t| card.incarnation <= *t) {
                trace!("ignoring stale card for departed peer {}", card.node_id);
                return;
            }
            match seen.get_mut(&card.node_id) {
                Some(peer) if peer.card.incarnation > card.incarnation => {}
                Some(peer) if peer.card == card => {
                    peer.last_refresh = Instant::now();
                }
                _ => {
                    seen.insert(
                        card.node_id.clone(),
                        SeenPeer {
                            card: card.clone(),
                            last_refresh: Instant::now(),
                        },
                    );
                    tombstones.remove(&card.node_id);
                    let _ = event_tx.send(GossipEvent::Alive(card));
                }
            }
        }
        GossipPayload::Leave { node_id, incarnation } => {
            if node_id == *self_id {
                return;
            }
            let superseded = seen
                .get(&node_id)
                .is_some_and(|p| p.card.incarnation > incarnation);
            if superseded {
                return;
            }
            tombstones.insert(node_id.clone(), incarnation);
            if seen.remove(&node_id).is_some() {
                let _ = event_tx.send(GossipEvent::Left(node_id));
            }
        }
    }
}

fn source_matches(source: &PeerId, node_id: &NodeId) -> bool {
    let Ok(bytes) = base64::decode_config(node_id.as_str(), base64::URL_SAFE_NO_PAD) else {
        return false;
    };
    let Ok(public) = libp2p::identity::ed25519::PublicKey::try_from_bytes(&bytes) else {
        return false;
    };
    PeerId::from_public_key(&libp2p::identity::PublicKey::from(public)) == *source
}

fn publish(swarm: &mut Swarm<GroveBehaviour>, topic: &IdentTopic, payload: &GossipPayload) {
    let bytes = serde_json::to_vec(payload).expect("gossip payload serializes");
    if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic.clone(), bytes) {
        // InsufficientPeers is routine before the first connection settles.
        trace!("gossip publish deferred: {e:?}");
    }
}

fn decode_psk(encoded: &str) -> Result<PreSharedKey, Error> {
    let bytes = base64::decode(encoded.trim()).map_err(|_| Error::EncryptKey)?;
    let key = <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| Error::EncryptKey)?;
    Ok(PreSharedKey::new(key))
}

fn build_transport(
    keypair: &Keypair,
    psk: Option<PreSharedKey>,
) -> Result<libp2p::core::transport::Boxed<(PeerId, libp2p::core::muxing::StreamMuxerBox)>, Error> {
    let tcp = libp2p::tcp::async_io::Transport::new(libp2p::tcp::Config::default().nodelay(true));
    let noise = noise::Config::new(keypair).map_err(|e| Error::Transport(e.to_string()))?;
    let yamux = libp2p::yamux::Config::default();
    let transport = match psk {
        Some(psk) => tcp
            .and_then(move |socket, _| PnetConfig::new(psk).handshake(socket))
            .upgrade(libp2p::core::upgrade::Version::V1)
            .authenticate(noise)
            .multiplex(yamux)
            .boxed(),
        None => tcp
            .upgrade(libp2p::core::upgrade::Version::V1)
            .authenticate(noise)
            .multiplex(yamux)
            .boxed(),
    };
    Ok(transport)
}

/// Resolve `host:port` into a dialable multiaddr. Hostname resolution
/// happens here so the transport needs no DNS layer.
fn resolve_multiaddr(peer: &str) -> Result<Multiaddr, Error> {
    let addr = peer
        .to_socket_addrs()
        .map_err(|_| Error::Addr(peer.to_string()))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| Error::Addr(peer.to_string()))?;
    format!("/ip4/{}/tcp/{}", addr.ip(), addr.port())
        .parse()
        .map_err(|_| Error::Addr(peer.to_string()))
}
