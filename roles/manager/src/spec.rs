// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Minimal interface to an external service process. The role manager
/// treats the process as opaque; adapters translate these five calls into
/// whatever the service needs.
pub trait RoleService: Send + Sync {
    /// Write the rendered configuration wherever the service reads it.
    fn prepare(&self, config: &str) -> Result<(), Error>;
    fn start(&self) -> Result<(), Error>;
    /// Apply a configuration-only change to a running service.
    fn reload(&self) -> Result<(), Error>;
    fn stop(&self) -> Result<(), Error>;
    fn health(&self) -> Result<bool, Error>;
}

/// A secret shared through the replicated store: the role's leader
/// generates and publishes it, followers fetch it to a local file before
/// their service starts.
#[derive(Debug, Clone)]
pub struct SecretSpec {
    /// Key in the replicated store, e.g. `secret/munge`.
    pub store_key: String,
    /// Local file the secret is written to, owner-only.
    pub path: PathBuf,
    /// Length in bytes when this node has to generate it.
    pub generate_len: usize,
}

/// Everything the manager needs to run one role on this node.
#[derive(Clone)]
pub struct RoleSpec {
    pub name: String,
    /// Elected roles have a cluster-wide holder; the rest only ever run as
    /// followers.
    pub elected: bool,
    /// Secret the leader must publish before its service starts.
    pub publishes: Option<SecretSpec>,
    /// Secret a follower must fetch before its service starts.
    pub fetches: Option<SecretSpec>,
    /// Restart instead of reload on membership-driven config changes.
    pub restart_on_change: bool,
    pub service: Arc<dyn RoleService>,
    /// How long the service may take to become healthy.
    pub health_deadline: Duration,
    /// How long a stop may take before it is abandoned.
    pub stop_timeout: Duration,
}

/// The elected role whose holder anchors configuration rendering for a
/// given role (the controller for slurm, the server for k3s).
pub fn anchor_role(role: &str) -> &str {
    match role {
        "slurm-controller" | "slurm-worker" => "slurm-controller",
        "k3s-server" | "k3s-agent" => "k3s-server",
        other => other,
    }
}
