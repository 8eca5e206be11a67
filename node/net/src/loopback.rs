// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-memory gossip transport for tests.
//!
//! The hub routes member cards between in-process nodes over the same
//! channel contract as [`GossipService`](crate::GossipService), and adds the
//! knobs integration tests need: simulated crashes and network partitions.

use crate::card::MemberCard;
use crate::{GossipChannels, GossipCommand, GossipEvent};
use grove_identity::NodeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<NodeId, HubNode>,
}

struct HubNode {
    card: MemberCard,
    event_tx: flume::Sender<GossipEvent>,
    group: usize,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. The returned channels behave like a running gossip
    /// service: existing cards are delivered immediately, the new card is
    /// broadcast to everyone else, and commands are processed in the
    /// background.
    pub fn attach(&self, card: MemberCard) -> GossipChannels {
        let (command_tx, command_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();
        let node_id = card.node_id.clone();

        {
            let mut inner = self.inner.lock().expect("hub lock");
            for node in inner.nodes.values() {
                if node.group == 0 {
                    let _ = event_tx.send(GossipEvent::Alive(node.card.clone()));
                }
            }
            inner.broadcast_from(&node_id, 0, GossipEvent::Alive(card.clone()));
            inner.nodes.insert(
                node_id.clone(),
                HubNode {
                    card,
                    event_tx,
                    group: 0,
                },
            );
        }

        let inner = Arc::clone(&self.inner);
        async_std::task::spawn(async move {
            while let Ok(command) = command_rx.recv_async().await {
                let mut guard = inner.lock().expect("hub lock");
                match command {
                    GossipCommand::UpdateTags(tags) => {
                        let (group, card) = match guard.nodes.get_mut(&node_id) {
                            Some(node) => {
                                node.card.tags = tags;
                                node.card.incarnation += 1;
                                (node.group, node.card.clone())
                            }
                            None => continue,
                        };
                        guard.broadcast_from(&node_id, group, GossipEvent::Alive(card));
                    }
                    GossipCommand::Leave => {
                        if let Some(node) = guard.nodes.remove(&node_id) {
                            guard.broadcast_from(
                                &node_id,
                                node.group,
                                GossipEvent::Left(node_id.clone()),
                            );
                        }
                    }
                    GossipCommand::ForceLeave(target) => {
                        let group = match guard.nodes.get(&node_id) {
                            Some(node) => node.group,
                            None => continue,
                        };
                        guard.nodes.remove(&target);
                        guard.broadcast_from(&node_id, group, GossipEvent::Left(target.clone()));
                        if let Some(node) = guard.nodes.get(&node_id) {
                            let _ = node.event_tx.send(GossipEvent::Left(target));
                        }
                    }
                    GossipCommand::Shutdown => break,
                }
            }
        });

        (command_tx, event_rx)
    }

    /// Simulate a crash: the node vanishes and everyone else observes
    /// `Failed`, as the suspicion sweep of the real transport would report.
    pub fn fail(&self, node_id: &NodeId) {
        let mut inner = self.inner.lock().expect("hub lock");
        if let Some(node) = inner.nodes.remove(node_id) {
            inner.broadcast_from(node_id, node.group, GossipEvent::Failed(node_id.clone()));
        }
    }

    /// Split the hub into groups. Nodes in different groups observe each
    /// other as failed until [`heal`](Self::heal).
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut inner = self.inner.lock().expect("hub lock");
        for (index, group) in groups.iter().enumerate() {
            for node_id in group.iter() {
                if let Some(node) = inner.nodes.get_mut(node_id) {
                    node.group = index;
                }
            }
        }
        let snapshot: Vec<(NodeId, usize, flume::Sender<GossipEvent>)> = inner
            .nodes
            .iter()
            .map(|(id, n)| (id.clone(), n.group, n.event_tx.clone()))
            .collect();
        for (id_a, group_a, tx_a) in &snapshot {
            for (id_b, group_b, _) in &snapshot {
                if id_a != id_b && group_a != group_b {
                    let _ = tx_a.send(GossipEvent::Failed(id_b.clone()));
                }
            }
        }
    }

    /// Remove all partitions; separated nodes observe each other alive
    /// again.
    pub fn heal(&self) {
        let mut inner = self.inner.lock().expect("hub lock");
        let snapshot: Vec<(NodeId, usize, flume::Sender<GossipEvent>, MemberCard)> = inner
            .nodes
            .iter()
            .map(|(id, n)| (id.clone(), n.group, n.event_tx.clone(), n.card.clone()))
            .collect();
        for (id_a, group_a, tx_a, _) in &snapshot {
            for (id_b, group_b, _, card_b) in &snapshot {
                if id_a != id_b && group_a != group_b {
                    let _ = tx_a.send(GossipEvent::Alive(card_b.clone()));
                }
            }
        }
        for node in inner.nodes.values_mut() {
            node.group = 0;
        }
    }
}

impl Inner {
    fn broadcast_from(&self, from: &NodeId, group: usize, event: GossipEvent) {
        for (id, node) in &self.nodes {
            if id != from && node.group == group {
                let _ = node.event_tx.send(event.clone());
            }
        }
    }
}
