// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use grove_identity::NodeId;
use grove_ipam::Subnet;
use grove_membership::Member;
use std::fmt::Write;
use std::net::Ipv4Addr;

const PERSISTENT_KEEPALIVE_SECS: u32 = 25;

/// This node's side of the tunnel configuration.
pub struct InterfaceSpec {
    /// Base64 tunnel private key.
    pub private_key: String,
    pub address: Ipv4Addr,
    pub prefix: u8,
    pub listen_port: u16,
    pub mtu: Option<u32>,
}

/// One peer block. Each peer may only route its own /32.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSpec {
    pub node_id: NodeId,
    pub public_key: String,
    pub endpoint: String,
    pub allowed_ip: Ipv4Addr,
}

/// The overlay IP a member occupies: its advertised resolved address when
/// present, the deterministic allocation otherwise.
pub fn member_ip(member: &Member, subnet: &Subnet) -> Ipv4Addr {
    member
        .overlay_ip()
        .unwrap_or_else(|| grove_ipam::allocate(subnet, &member.node_id))
}

/// Build the peer list from the alive member snapshot. Members without a
/// tunnel key are skipped; they cannot participate in the mesh yet.
pub fn peers_from_members(
    members: &[Member],
    self_id: &NodeId,
    subnet: &Subnet,
    overlay_port: u16,
) -> Vec<PeerSpec> {
    let mut peers: Vec<PeerSpec> = members
        .iter()
        .filter(|m| m.is_alive() && m.node_id != *self_id)
        .filter_map(|m| {
            let public_key = m.tunnel_pub()?.to_string();
            Some(PeerSpec {
                node_id: m.node_id.clone(),
                public_key,
                endpoint: format!("{}:{}", m.host(), overlay_port),
                allowed_ip: member_ip(m, subnet),
            })
        })
        .collect();
    peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    peers
}

/// Render the full wg-quick configuration. Deterministic: the same inputs
/// produce byte-identical output, which is what makes the unchanged-render
/// no-op check work.
pub fn render(interface: &InterfaceSpec, peers: &[PeerSpec]) -> String {
    let mut out = String::new();
    writeln!(out, "[Interface]").unwrap();
    writeln!(out, "PrivateKey = {}", interface.private_key).unwrap();
    writeln!(out, "Address = {}/{}", interface.address, interface.prefix).unwrap();
    writeln!(out, "ListenPort = {}", interface.listen_port).unwrap();
    if let Some(mtu) = interface.mtu {
        writeln!(out, "MTU = {mtu}").unwrap();
    }
    for peer in peers {
        writeln!(out).unwrap();
        writeln!(out, "# {}", peer.node_id).unwrap();
        writeln!(out, "[Peer]").unwrap();
        writeln!(out, "PublicKey = {}", peer.public_key).unwrap();
        writeln!(out, "Endpoint = {}", peer.endpoint).unwrap();
        writeln!(out, "AllowedIPs = {}/32", peer.allowed_ip).unwrap();
        writeln!(out, "PersistentKeepalive = {PERSISTENT_KEEPALIVE_SECS}").unwrap();
    }
    out
}
