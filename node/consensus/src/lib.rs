// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Linearizable replicated register for cluster-wide state.
//!
//! The store is used sparingly: it holds shared role secrets and the
//! `leader/<role>` bindings, nothing else. Writes go through the current
//! consensus leader and commit at quorum; voter-set changes are replicated
//! entries like any other write, so a freshly added voter observes every
//! prior commit once it has caught up.

mod errors;
pub mod loopback;
mod rpc;
mod service;
mod storage;
mod types;

pub use errors::Error;
pub use storage::DurableLog;
pub use rpc::{Envelope, RaftTransport, TcpTransport};
pub use service::{ConsensusConfig, Status, Store, StoreService};
pub use types::{Command, Consistency, Expect, LogEntry, Role, StoreEvent, Versioned, VoterConfig};
