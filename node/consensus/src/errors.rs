// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use grove_identity::NodeId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The write needs the leader and this node is not it. Carries the
    /// current hint so callers can decide whether to retry.
    #[error("not the consensus leader (current: {leader:?})")]
    NotLeader { leader: Option<NodeId> },
    /// No quorum of voters acknowledged within the deadline. Retryable.
    #[error("consensus quorum unavailable")]
    NoQuorum,
    /// A conditional write found different current state.
    #[error("compare-and-set precondition failed")]
    CasFailed { current: Option<Vec<u8>> },
    #[error("consensus operation timed out")]
    Timeout,
    #[error("consensus store is closed")]
    Closed,
    #[error("consensus storage error: {0}")]
    Storage(String),
    #[error("bootstrap requested but prior consensus state exists")]
    AlreadyBootstrapped,
}

impl Error {
    /// Transient errors callers should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NoQuorum | Error::Timeout | Error::NotLeader { .. })
    }
}
