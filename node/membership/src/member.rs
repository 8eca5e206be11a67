// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use chrono::{DateTime, Utc};
use grove_identity::NodeId;
use grove_net::{MemberCard, TAG_OVERLAY_IP, TAG_ROLES, TAG_TUNNEL_PUB};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Alive,
    Failed,
    Left,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemberStatus::Alive => write!(f, "alive"),
            MemberStatus::Failed => write!(f, "failed"),
            MemberStatus::Left => write!(f, "left"),
        }
    }
}

/// One peer as seen by the local membership view (including self).
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub node_id: NodeId,
    pub name: String,
    /// Reachable `host:port` of the gossip transport.
    pub addr: String,
    pub status: MemberStatus,
    pub tags: BTreeMap<String, String>,
    pub incarnation: u64,
    pub last_change: DateTime<Utc>,
    pub joined_at: DateTime<Utc>,
}

impl Member {
    pub(crate) fn from_card(card: MemberCard, now: DateTime<Utc>) -> Self {
        Member {
            node_id: card.node_id,
            name: card.name,
            addr: card.addr,
            status: MemberStatus::Alive,
            tags: card.tags,
            incarnation: card.incarnation,
            last_change: now,
            joined_at: now,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status == MemberStatus::Alive
    }

    pub fn host(&self) -> &str {
        self.addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.addr)
    }

    pub fn tunnel_pub(&self) -> Option<&str> {
        self.tags.get(TAG_TUNNEL_PUB).map(String::as_str)
    }

    /// The overlay IP this member advertises, when it has resolved one.
    /// Absent means the deterministic allocation applies.
    pub fn overlay_ip(&self) -> Option<Ipv4Addr> {
        self.tags
            .get(TAG_OVERLAY_IP)
            .and_then(|ip| ip.parse().ok())
    }

    /// Roles this member wants to run, from the `roles` tag.
    pub fn roles(&self) -> Vec<&str> {
        self.tags
            .get(TAG_ROLES)
            .map(|r| r.split(',').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

/// Membership transitions delivered to subscribers. Per-peer ordering is
/// preserved; cross-peer ordering is not.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberEvent {
    Join(Member),
    Update(Member),
    Leave(Member),
    Failed(Member),
}

impl MemberEvent {
    pub fn member(&self) -> &Member {
        match self {
            MemberEvent::Join(m)
            | MemberEvent::Update(m)
            | MemberEvent::Leave(m)
            | MemberEvent::Failed(m) => m,
        }
    }
}
