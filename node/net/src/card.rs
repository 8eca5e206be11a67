// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use grove_identity::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag carrying the admission token.
pub const TAG_AUTH_TOKEN: &str = "auth_token";
/// Tag carrying the overlay tunnel public key.
pub const TAG_TUNNEL_PUB: &str = "tunnel_pub";
/// Tag carrying the comma-separated desired role list.
pub const TAG_ROLES: &str = "roles";
/// Tag carrying the node's chosen overlay IP. Usually the deterministic
/// allocation; differs after a collision was resolved, and peers follow the
/// advertised value so every view converges on the resolved address.
pub const TAG_OVERLAY_IP: &str = "overlay_ip";
/// Tag carrying a digest of the consensus voter set this node knows.
/// Two independently bootstrapped clusters sharing an admission secret
/// show up as stable digest disagreement; merging them is operator work.
pub const TAG_VOTERS_DIGEST: &str = "voters_digest";
pub const TAG_ARCH: &str = "arch";
pub const TAG_CPU: &str = "cpu";
pub const TAG_RAM: &str = "ram";
pub const TAG_GPU: &str = "gpu";

/// One node's membership advertisement: identity, reachable gossip address
/// and the tag bag. Republished periodically; a changed card supersedes the
/// previous one for the same node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberCard {
    pub node_id: NodeId,
    pub name: String,
    /// Reachable `host:port` for the gossip transport.
    pub addr: String,
    /// Bumped on restart and on every tag change; stale cards never
    /// overwrite fresher ones.
    pub incarnation: u64,
    pub tags: BTreeMap<String, String>,
}

impl MemberCard {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Host part of the gossip address, used for the fixed port
    /// translations of the overlay and consensus layers.
    pub fn host(&self) -> &str {
        self.addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.addr)
    }
}

/// Wire form of a gossip publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipPayload {
    Alive(MemberCard),
    Leave { node_id: NodeId, incarnation: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_strips_the_port() {
        let card = MemberCard {
            node_id: NodeId::from("n1"),
            name: "n1".into(),
            addr: "192.0.2.17:7946".into(),
            incarnation: 1,
            tags: BTreeMap::new(),
        };
        assert_eq!(card.host(), "192.0.2.17");
    }

    #[test]
    fn payload_roundtrips_as_json() {
        let card = MemberCard {
            node_id: NodeId::from("n1"),
            name: "n1".into(),
            addr: "10.0.0.1:7946".into(),
            incarnation: 3,
            tags: [(TAG_ROLES.to_string(), "slurm-worker".to_string())]
                .into_iter()
                .collect(),
        };
        let bytes = serde_json::to_vec(&GossipPayload::Alive(card.clone())).unwrap();
        match serde_json::from_slice(&bytes).unwrap() {
            GossipPayload::Alive(decoded) => assert_eq!(decoded, card),
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
