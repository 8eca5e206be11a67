// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;

/// Lifecycle of one role on this node. Transitions are serialized per role
/// by the role's worker task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    Disabled,
    StartingFollower,
    Follower,
    StartingLeader,
    Leader,
    Stopping,
    Failed,
}

impl RoleState {
    pub fn is_running(&self) -> bool {
        matches!(self, RoleState::Follower | RoleState::Leader)
    }
}

impl fmt::Display for RoleState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RoleState::Disabled => write!(f, "disabled"),
            RoleState::StartingFollower => write!(f, "starting-follower"),
            RoleState::Follower => write!(f, "follower"),
            RoleState::StartingLeader => write!(f, "starting-leader"),
            RoleState::Leader => write!(f, "leader"),
            RoleState::Stopping => write!(f, "stopping"),
            RoleState::Failed => write!(f, "failed"),
        }
    }
}

/// What this node currently wants the role to be, derived from local
/// configuration and the leader registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleGoal {
    Disabled,
    Follower,
    Leader,
}
