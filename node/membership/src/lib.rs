// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Gossip-backed membership with cluster admission.
//!
//! The service consumes settled transitions from the gossip transport,
//! verifies each newly observed peer's join proof against the shared
//! cluster secret, and maintains the member table. Peers that fail
//! verification are rejected from the local view entirely; they never
//! appear in `members()` and never reach subscribers.

mod member;

pub use member::{Member, MemberEvent, MemberStatus};

use async_std::sync::RwLock;
use chrono::Utc;
use grove_admission::ClusterSecret;
use grove_identity::NodeId;
use grove_net::{GossipChannels, GossipCommand, GossipEvent, MemberCard, TAG_AUTH_TOKEN};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Sink for consensus voter-set changes driven by membership transitions.
/// Only the node that is currently the consensus leader acts on these; the
/// sink implementation is expected to check.
pub trait VoterSink: Send + Sync {
    fn peer_alive(&self, node_id: &NodeId, consensus_addr: &str);
    fn peer_gone(&self, node_id: &NodeId);
}

struct State {
    members: BTreeMap<NodeId, Member>,
    /// Last token verified per peer; an unchanged token is not re-verified
    /// on every card refresh.
    verified_tokens: HashMap<NodeId, String>,
    subscribers: Vec<flume::Sender<MemberEvent>>,
}

/// Cloneable query/control handle onto the membership view.
#[derive(Clone)]
pub struct Membership {
    self_id: NodeId,
    state: Arc<RwLock<State>>,
    command_tx: flume::Sender<GossipCommand>,
}

impl Membership {
    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Snapshot of all known members, every status.
    pub async fn members(&self) -> Vec<Member> {
        self.state.read().await.members.values().cloned().collect()
    }

    pub async fn alive_members(&self) -> Vec<Member> {
        self.state
            .read()
            .await
            .members
            .values()
            .filter(|m| m.is_alive())
            .cloned()
            .collect()
    }

    pub async fn member(&self, node_id: &NodeId) -> Option<Member> {
        self.state.read().await.members.get(node_id).cloned()
    }

    pub async fn is_alive(&self, node_id: &NodeId) -> bool {
        self.state
            .read()
            .await
            .members
            .get(node_id)
            .map(Member::is_alive)
            .unwrap_or(false)
    }

    /// Register an event subscriber. Subscribe before the service runs to
    /// observe every transition.
    pub async fn subscribe(&self) -> flume::Receiver<MemberEvent> {
        let (tx, rx) = flume::unbounded();
        self.state.write().await.subscribers.push(tx);
        rx
    }

    /// Operator escape hatch: evict a peer from the cluster view.
    pub fn force_leave(&self, node_id: NodeId) {
        let _ = self.command_tx.send(GossipCommand::ForceLeave(node_id));
    }

    /// Replace this node's advertised tag bag, locally and on the wire.
    pub async fn update_tags(&self, tags: BTreeMap<String, String>) {
        {
            let mut state = self.state.write().await;
            if let Some(me) = state.members.get_mut(&self.self_id) {
                me.tags = tags.clone();
                me.last_change = Utc::now();
            }
        }
        let _ = self.command_tx.send(GossipCommand::UpdateTags(tags));
    }

    /// Publish the leave tombstone; peers observe `left`, not `failed`.
    pub fn leave(&self) {
        let _ = self.command_tx.send(GossipCommand::Leave);
        let _ = self.command_tx.send(GossipCommand::Shutdown);
    }
}

/// The membership service; owns the member table mutation path.
pub struct MembershipService {
    handle: Membership,
    secret: ClusterSecret,
    event_rx: flume::Receiver<GossipEvent>,
    voter_sink: Option<Arc<dyn VoterSink>>,
    consensus_port: u16,
}

impl MembershipService {
    /// `self_card` is this node's own advertisement; it is inserted into
    /// the view immediately (the member set is self plus what gossip
    /// reports).
    pub fn new(
        self_card: MemberCard,
        secret: ClusterSecret,
        channels: GossipChannels,
        consensus_port: u16,
    ) -> Self {
        let (command_tx, event_rx) = channels;
        let now = Utc::now();
        let self_id = self_card.node_id.clone();
        let mut members = BTreeMap::new();
        members.insert(self_id.clone(), Member::from_card(self_card, now));
        let state = State {
            members,
            verified_tokens: HashMap::new(),
            subscribers: Vec::new(),
        };
        MembershipService {
            handle: Membership {
                self_id,
                state: Arc::new(RwLock::new(state)),
                command_tx,
            },
            secret,
            event_rx,
            voter_sink: None,
            consensus_port,
        }
    }

    /// Wire the consensus voter-set interlock.
    pub fn with_voter_sink(mut self, sink: Arc<dyn VoterSink>) -> Self {
        self.voter_sink = Some(sink);
        self
    }

    pub fn handle(&self) -> Membership {
        self.handle.clone()
    }

    /// Consume gossip events until the transport closes its channel.
    pub async fn run(self) {
        let MembershipService {
            handle,
            secret,
            event_rx,
            voter_sink,
            consensus_port,
        } = self;
        while let Ok(event) = event_rx.recv_async().await {
            match event {
                GossipEvent::Alive(card) => {
                    on_alive(&handle, &secret, card, voter_sink.as_deref(), consensus_port).await;
                }
                GossipEvent::Failed(node_id) => {
                    on_gone(&handle, &node_id, MemberStatus::Failed, voter_sink.as_deref()).await;
                }
                GossipEvent::Left(node_id) => {
                    on_gone(&handle, &node_id, MemberStatus::Left, voter_sink.as_deref()).await;
                }
            }
        }
        debug!("membership service stopped");
    }
}

async fn on_alive(
    handle: &Membership,
    secret: &ClusterSecret,
    card: MemberCard,
    voter_sink: Option<&dyn VoterSink>,
    consensus_port: u16,
) {
    if card.node_id == handle.self_id {
        return;
    }
    let mut state = handle.state.write().await;

    let token = match card.tag(TAG_AUTH_TOKEN) {
        Some(token) => token.to_string(),
        None => {
            warn!(
                "admission.reject peer_node_id={} peer_name={} reason=missing",
                card.node_id, card.name
            );
            return;
        }
    };
    let already_verified = state
        .verified_tokens
        .get(&card.node_id)
        .is_some_and(|t| *t == token);
    if !already_verified {
        if let Err(e) =
            grove_admission::verify_join_proof(secret, &token, &card.node_id, Utc::now())
        {
            warn!(
                "admission.reject peer_node_id={} peer_name={} reason={}",
                card.node_id,
                card.name,
                e.audit_reason()
            );
            return;
        }
        state.verified_tokens.insert(card.node_id.clone(), token);
    }

    let now = Utc::now();
    let consensus_addr = format!("{}:{}", card.host(), consensus_port);
    let (event, member) = match state.members.get(&card.node_id) {
        Some(existing) if existing.is_alive() => {
            let mut updated = existing.clone();
            updated.name = card.name;
            updated.addr = card.addr;
            updated.tags = card.tags;
            updated.incarnation = card.incarnation;
            if updated == *existing {
                return;
            }
            updated.last_change = now;
            (MemberEvent::Update(updated.clone()), updated)
        }
        Some(existing) => {
            info!(
                "membership.change peer_node_id={} from={} to=alive",
                card.node_id, existing.status
            );
            let member = Member::from_card(card, now);
            (MemberEvent::Join(member.clone()), member)
        }
        None => {
            info!(
                "admission.accept peer_node_id={} peer_name={}",
                card.node_id, card.name
            );
            info!(
                "membership.change peer_node_id={} from=none to=alive",
                card.node_id
            );
            let member = Member::from_card(card, now);
            (MemberEvent::Join(member.clone()), member)
        }
    };
    state.members.insert(member.node_id.clone(), member.clone());
    if matches!(event, MemberEvent::Join(_)) {
        if let Some(sink) = voter_sink {
            sink.peer_alive(&member.node_id, &consensus_addr);
        }
    }
    deliver(&mut state, event);
}

async fn on_gone(
    handle: &Membership,
    node_id: &NodeId,
    status: MemberStatus,
    voter_sink: Option<&dyn VoterSink>,
) {
    if node_id == &handle.self_id {
        return;
    }
    let mut state = handle.state.write().await;
    let Some(member) = state.members.get_mut(node_id) else {
        return;
    };
    if member.status == status {
        return;
    }
    info!(
        "membership.change peer_node_id={} from={} to={}",
        node_id, member.status, status
    );
    member.status = status;
    member.last_change = Utc::now();
    let member = member.clone();
    state.verified_tokens.remove(node_id);
    if let Some(sink) = voter_sink {
        sink.peer_gone(node_id);
    }
    let event = match status {
        MemberStatus::Left => MemberEvent::Leave(member),
        _ => MemberEvent::Failed(member),
    };
    deliver(&mut state, event);
}

fn deliver(state: &mut State, event: MemberEvent) {
    state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_net::loopback::LoopbackHub;
    use std::time::Duration;

    fn secret() -> ClusterSecret {
        ClusterSecret::decode(&base64::encode([5u8; 32])).unwrap()
    }

    fn signed_node(byte: u8) -> NodeId {
        use ed25519_dalek::SigningKey;
        let key = SigningKey::from_bytes(&[byte; 32]);
        NodeId::from_verifying_key(&key.verifying_key())
    }

    fn card_for(node_id: &NodeId, name: &str, token: Option<String>) -> MemberCard {
        let mut tags = BTreeMap::new();
        if let Some(token) = token {
            tags.insert(TAG_AUTH_TOKEN.to_string(), token);
        }
        MemberCard {
            node_id: node_id.clone(),
            name: name.to_string(),
            addr: format!("{name}.local:7946"),
            incarnation: 1,
            tags,
        }
    }

    async fn settle() {
        async_std::task::sleep(Duration::from_millis(100)).await;
    }

    #[async_std::test]
    async fn verified_peer_joins_the_view() {
        let hub = LoopbackHub::new();
        let me = signed_node(1);
        let peer = signed_node(2);
        let s = secret();

        let my_token = grove_admission::issue_join_proof(&s, &me);
        let service = MembershipService::new(
            card_for(&me, "me", Some(my_token)),
            s.clone(),
            hub.attach(card_for(&me, "me", None)),
            7373,
        );
        let membership = service.handle();
        let events = membership.subscribe().await;
        async_std::task::spawn(service.run());

        let peer_token = grove_admission::issue_join_proof(&s, &peer);
        hub.attach(card_for(&peer, "peer", Some(peer_token)));
        settle().await;

        let alive = membership.alive_members().await;
        assert_eq!(alive.len(), 2);
        assert!(membership.is_alive(&peer).await);
        match events.try_recv().unwrap() {
            MemberEvent::Join(m) => assert_eq!(m.node_id, peer),
            other => panic!("expected join, got {other:?}"),
        }
    }

    #[async_std::test]
    async fn wrong_secret_peer_is_rejected() {
        let hub = LoopbackHub::new();
        let me = signed_node(1);
        let peer = signed_node(2);
        let s = secret();
        let wrong = ClusterSecret::decode(&base64::encode([6u8; 32])).unwrap();

        let service = MembershipService::new(
            card_for(&me, "me", None),
            s,
            hub.attach(card_for(&me, "me", None)),
            7373,
        );
        let membership = service.handle();
        async_std::task::spawn(service.run());

        let bad_token = grove_admission::issue_join_proof(&wrong, &peer);
        hub.attach(card_for(&peer, "peer", Some(bad_token)));
        settle().await;

        assert_eq!(membership.members().await.len(), 1);
        assert!(!membership.is_alive(&peer).await);
    }

    #[async_std::test]
    async fn missing_token_peer_is_rejected() {
        let hub = LoopbackHub::new();
        let me = signed_node(1);
        let peer = signed_node(2);

        let service = MembershipService::new(
            card_for(&me, "me", None),
            secret(),
            hub.attach(card_for(&me, "me", None)),
            7373,
        );
        let membership = service.handle();
        async_std::task::spawn(service.run());

        hub.attach(card_for(&peer, "peer", None));
        settle().await;
        assert_eq!(membership.members().await.len(), 1);
    }

    #[async_std::test]
    async fn leave_and_fail_transitions_are_tracked() {
        let hub = LoopbackHub::new();
        let me = signed_node(1);
        let peer = signed_node(2);
        let s = secret();

        let service = MembershipService::new(
            card_for(&me, "me", None),
            s.clone(),
            hub.attach(card_for(&me, "me", None)),
            7373,
        );
        let membership = service.handle();
        let events = membership.subscribe().await;
        async_std::task::spawn(service.run());

        let token = grove_admission::issue_join_proof(&s, &peer);
        let (peer_cmd, _peer_rx) = hub.attach(card_for(&peer, "peer", Some(token)));
        settle().await;
        assert!(membership.is_alive(&peer).await);

        peer_cmd.send(GossipCommand::Leave).unwrap();
        settle().await;
        let member = membership.member(&peer).await.unwrap();
        assert_eq!(member.status, MemberStatus::Left);
        assert_eq!(membership.alive_members().await.len(), 1);

        let observed: Vec<MemberEvent> = events.drain().collect();
        assert!(matches!(observed.first(), Some(MemberEvent::Join(_))));
        assert!(matches!(observed.last(), Some(MemberEvent::Leave(_))));
    }

    #[async_std::test]
    async fn force_leave_evicts_a_peer_from_the_view() {
        let hub = LoopbackHub::new();
        let me = signed_node(1);
        let peer = signed_node(2);
        let s = secret();

        let service = MembershipService::new(
            card_for(&me, "me", None),
            s.clone(),
            hub.attach(card_for(&me, "me", None)),
            7373,
        );
        let membership = service.handle();
        async_std::task::spawn(service.run());

        let token = grove_admission::issue_join_proof(&s, &peer);
        hub.attach(card_for(&peer, "peer", Some(token)));
        settle().await;
        assert!(membership.is_alive(&peer).await);

        membership.force_leave(peer.clone());
        settle().await;
        let member = membership.member(&peer).await.unwrap();
        assert_eq!(member.status, MemberStatus::Left);
    }

    #[async_std::test]
    async fn voter_sink_tracks_join_and_leave() {
        use std::sync::Mutex;

        #[derive(Default)]
        struct Recorder {
            calls: Mutex<Vec<String>>,
        }
        impl VoterSink for Recorder {
            fn peer_alive(&self, node_id: &NodeId, consensus_addr: &str) {
                self.calls
                    .lock()
                    .unwrap()
                    .push(format!("alive {node_id} {consensus_addr}"));
            }
            fn peer_gone(&self, node_id: &NodeId) {
                self.calls.lock().unwrap().push(format!("gone {node_id}"));
            }
        }

        let hub = LoopbackHub::new();
        let me = signed_node(1);
        let peer = signed_node(2);
        let s = secret();
        let recorder = Arc::new(Recorder::default());

        let service = MembershipService::new(
            card_for(&me, "me", None),
            s.clone(),
            hub.attach(card_for(&me, "me", None)),
            7373,
        )
        .with_voter_sink(recorder.clone());
        let membership = service.handle();
        async_std::task::spawn(service.run());

        let token = grove_admission::issue_join_proof(&s, &peer);
        hub.attach(card_for(&peer, "peer", Some(token)));
        settle().await;
        hub.fail(&peer);
        settle().await;
        drop(membership);

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                format!("alive {peer} peer.local:7373"),
                format!("gone {peer}"),
            ]
        );
    }
}
