// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use grove_identity::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A replicated command. Voter-set changes travel through the log like any
/// other write, so a node added by the current leader sees all prior
/// entries once it has caught up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Committed by a fresh leader to settle the commit index of entries
    /// from earlier terms.
    Noop,
    Put {
        key: String,
        value: Vec<u8>,
    },
    /// Conditional write, evaluated against the applied state at apply
    /// time; deterministic on every voter.
    PutIf {
        key: String,
        expect: Expect,
        value: Vec<u8>,
    },
    AddVoter {
        node_id: NodeId,
        addr: String,
    },
    RemoveVoter {
        node_id: NodeId,
    },
}

/// Precondition of a conditional write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expect {
    /// Key must be absent.
    Absent,
    /// Key must currently hold exactly this value.
    Value(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Command,
}

/// A value in the applied key/value state, with its per-key monotonic
/// version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: u64,
}

/// Current voter configuration: node ID to consensus address.
pub type VoterConfig = BTreeMap<NodeId, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Events delivered to `on_state_change` subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// This node's view of leadership changed.
    LeaderChanged {
        is_self: bool,
        leader: Option<NodeId>,
    },
    /// A write committed and was applied locally.
    Committed {
        key: String,
        value: Vec<u8>,
        version: u64,
    },
}

/// Read consistency selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Serialized through the leader; reflects every committed write.
    Strong,
    /// Local applied state; may lag behind the leader.
    Local,
}
