// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Gossip transport for the membership layer.
//!
//! The production transport is a libp2p swarm (gossipsub + identify + ping)
//! publishing member cards on a cluster-scoped topic, with the whole
//! transport wrapped in a pre-shared-key handshake so only holders of the
//! gossip key can even open a connection. The membership layer never sees
//! libp2p: it consumes [`GossipEvent`]s and issues [`GossipCommand`]s over
//! flume channels, and tests drive the same channels from the in-memory
//! [`loopback`] hub.

mod card;
mod config;
mod errors;
pub mod loopback;
mod service;

pub use card::{
    MemberCard, TAG_ARCH, TAG_AUTH_TOKEN, TAG_CPU, TAG_GPU, TAG_OVERLAY_IP, TAG_RAM, TAG_ROLES,
    TAG_TUNNEL_PUB, TAG_VOTERS_DIGEST,
};
pub use config::GossipConfig;
pub use errors::Error;
pub use service::GossipService;

use grove_identity::NodeId;
use std::collections::BTreeMap;

/// Settled transitions surfaced to the membership layer. Per-peer ordering
/// is preserved by the channel; cross-peer ordering is not guaranteed.
#[derive(Debug, Clone, PartialEq)]
pub enum GossipEvent {
    /// A peer is alive: first sight, or its card content changed.
    Alive(MemberCard),
    /// A peer missed enough advertisement rounds to be declared failed.
    Failed(NodeId),
    /// A peer announced a graceful leave (or was force-left).
    Left(NodeId),
}

/// Commands into the transport service.
#[derive(Debug, Clone)]
pub enum GossipCommand {
    /// Replace this node's advertised tag bag.
    UpdateTags(BTreeMap<String, String>),
    /// Publish a leave tombstone for this node.
    Leave,
    /// Operator escape hatch: publish a tombstone on behalf of a peer.
    ForceLeave(NodeId),
    /// Stop the service loop.
    Shutdown,
}

/// The channel pair a transport hands to its consumer.
pub type GossipChannels = (flume::Sender<GossipCommand>, flume::Receiver<GossipEvent>);
