// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Deterministic overlay address allocation.
//!
//! Every node hashes its own ID into the overlay subnet, so the whole
//! cluster agrees on everyone's address without coordination. When two node
//! IDs hash to the same address, both sides fall back to a salted randomized
//! probe that avoids every address currently observed in membership.

mod subnet;

pub use subnet::Subnet;

use grove_identity::NodeId;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Bound on randomized probes before allocation gives up.
pub const MAX_RANDOM_ATTEMPTS: u32 = 64;

#[derive(Debug, Error)]
pub enum Error {
    #[error("subnet {0:?} is not a valid IPv4 CIDR")]
    BadSubnet(String),
    #[error("subnet /{0} leaves no allocatable addresses")]
    SubnetTooSmall(u8),
    #[error("no free address found after {0} randomized attempts")]
    Exhausted(u32),
}

/// The address a node claims by default: a pure function of its ID and the
/// subnet. Two calls with the same inputs always agree, on every node.
pub fn allocate(subnet: &Subnet, node_id: &NodeId) -> Ipv4Addr {
    let digest = Sha256::digest(node_id.as_str().as_bytes());
    let h = u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
    subnet.ip_at_offset(1 + (h % subnet.allocatable()) as u32)
}

/// Salted fallback used after a collision: probe HMAC-derived offsets until
/// one avoids `avoid`, bounded by [`MAX_RANDOM_ATTEMPTS`].
pub fn allocate_randomized(
    subnet: &Subnet,
    avoid: &HashSet<Ipv4Addr>,
    salt: &[u8],
) -> Result<Ipv4Addr, Error> {
    type HmacSha256 = Hmac<Sha256>;
    for attempt in 0..MAX_RANDOM_ATTEMPTS {
        let mut mac =
            HmacSha256::new_from_slice(salt).expect("hmac accepts keys of any length");
        mac.update(&attempt.to_be_bytes());
        let digest = mac.finalize().into_bytes();
        let h = u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
        let candidate = subnet.ip_at_offset(1 + (h % subnet.allocatable()) as u32);
        if !avoid.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(Error::Exhausted(MAX_RANDOM_ATTEMPTS))
}

/// The deterministic address `other` would claim; equality with `self_ip`
/// means the two nodes collide.
pub fn detect_conflict(subnet: &Subnet, self_ip: Ipv4Addr, other: &NodeId) -> bool {
    allocate(subnet, other) == self_ip
}

/// Salt for conflict resolution: the node's own ID plus fresh randomness,
/// so the two colliding sides probe different sequences.
pub fn conflict_salt(node_id: &NodeId) -> Vec<u8> {
    let mut salt = node_id.as_str().as_bytes().to_vec();
    let mut fresh = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut fresh);
    salt.extend_from_slice(&fresh);
    salt
}
