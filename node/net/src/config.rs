// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Gossip transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Cluster name; scopes the gossip topic so unrelated clusters sharing
    /// a network never mix views.
    pub cluster_name: String,
    pub bind_addr: String,
    pub bind_port: u16,
    /// `host:port` seed peers dialed at start.
    pub bootstrap_peers: Vec<String>,
    /// Base64 32-byte pre-shared key; when set, connections require the
    /// pnet handshake before anything else.
    pub encrypt_key: Option<String>,
    /// How often this node republishes its member card.
    pub advertise_interval: Duration,
    /// A peer whose card has not been refreshed for this long is failed.
    pub suspicion_timeout: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            cluster_name: "grove".to_string(),
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 7946,
            bootstrap_peers: Vec::new(),
            encrypt_key: None,
            advertise_interval: Duration::from_secs(2),
            suspicion_timeout: Duration::from_secs(10),
        }
    }
}
