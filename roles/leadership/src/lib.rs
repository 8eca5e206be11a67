// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-role leader election on top of the replicated store.
//!
//! Each role has a key `leader/<role>`. An eligible node claims a role with
//! a compare-and-set that only succeeds while the binding is vacant or
//! names a member that is no longer alive. Role leadership is deliberately
//! decoupled from the store's own consensus leadership: different roles can
//! be held by different nodes, and a consensus leader change does not hand
//! any role over.

use futures::channel::oneshot;
use futures::prelude::*;
use futures::select;
use grove_consensus::{Consistency, Error as StoreError, Expect, Store, StoreEvent};
use grove_identity::NodeId;
use grove_membership::{MemberEvent, Membership};
use log::{debug, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const LEADER_PREFIX: &str = "leader/";

/// Upper bound of the randomized delay before a claim attempt; damps the
/// herd when every eligible node notices a vacancy at once.
const CLAIM_JITTER: Duration = Duration::from_millis(750);

/// Period of the retry sweep that re-attempts claims after transient store
/// errors.
const RETRY_PERIOD: Duration = Duration::from_secs(2);

/// After voluntarily releasing a role, this node stays out of the race for
/// a while so the release actually hands the role over.
const RELEASE_QUIET: Duration = Duration::from_secs(10);

pub fn leader_key(role: &str) -> String {
    format!("{LEADER_PREFIX}{role}")
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The store had no quorum; retry later.
    #[error("claim failed, store unavailable: {0}")]
    StoreUnavailable(StoreError),
    #[error("another live node holds the role")]
    AlreadyHeld,
    #[error("leadership registry is closed")]
    Closed,
}

/// A change of role holder observed through the store.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaderEvent {
    pub role: String,
    pub from: Option<NodeId>,
    pub to: Option<NodeId>,
    pub version: u64,
}

enum RegistryCommand {
    Claim {
        role: String,
        reply: Option<oneshot::Sender<Result<(), Error>>>,
    },
    Release {
        role: String,
        reply: Option<oneshot::Sender<Result<(), Error>>>,
    },
    ReleaseOwned {
        reply: oneshot::Sender<()>,
    },
}

type HolderMap = HashMap<String, (Option<NodeId>, u64)>;

/// Cloneable query/control handle onto the registry.
#[derive(Clone)]
pub struct LeaderRegistry {
    self_id: NodeId,
    holders: Arc<async_std::sync::RwLock<HolderMap>>,
    subscribers: Arc<async_std::sync::RwLock<Vec<flume::Sender<LeaderEvent>>>>,
    command_tx: flume::Sender<RegistryCommand>,
}

impl LeaderRegistry {
    /// Last-known holder of `role`, possibly stale while the store has no
    /// quorum. Consumers must cross-check aliveness against membership.
    pub async fn current_holder(&self, role: &str) -> Option<(NodeId, u64)> {
        self.holders
            .read()
            .await
            .get(role)
            .and_then(|(holder, version)| holder.clone().map(|h| (h, *version)))
    }

    /// Does the last-known state name this node as holder?
    pub async fn holds(&self, role: &str) -> bool {
        self.current_holder(role)
            .await
            .map(|(holder, _)| holder == self.self_id)
            .unwrap_or(false)
    }

    pub async fn subscribe(&self) -> flume::Receiver<LeaderEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.write().await.push(tx);
        rx
    }

    /// Attempt to claim `role` now, without jitter.
    pub async fn claim(&self, role: &str) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(RegistryCommand::Claim {
                role: role.to_string(),
                reply: Some(reply),
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Release `role` if this node holds it.
    pub async fn release(&self, role: &str) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(RegistryCommand::Release {
                role: role.to_string(),
                reply: Some(reply),
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Release every role this node holds; used during shutdown, before
    /// the store closes.
    pub async fn release_owned(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RegistryCommand::ReleaseOwned { reply })
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }
}

/// The registry service: watches membership and the store, schedules claim
/// attempts with randomized backoff, and publishes holder changes.
pub struct LeaderRegistryService {
    handle: LeaderRegistry,
    store: Store,
    membership: Membership,
    eligible_roles: Vec<String>,
    command_rx: flume::Receiver<RegistryCommand>,
    member_events: flume::Receiver<MemberEvent>,
    store_events: flume::Receiver<StoreEvent>,
}

impl LeaderRegistryService {
    pub async fn new(
        store: Store,
        membership: Membership,
        eligible_roles: Vec<String>,
    ) -> Result<Self, Error> {
        let store_events = store
            .subscribe()
            .await
            .map_err(|_| Error::Closed)?;
        let member_events = membership.subscribe().await;
        let (command_tx, command_rx) = flume::unbounded();
        let self_id = membership.self_id().clone();
        Ok(LeaderRegistryService {
            handle: LeaderRegistry {
                self_id,
                holders: Arc::new(async_std::sync::RwLock::new(HashMap::new())),
                subscribers: Arc::new(async_std::sync::RwLock::new(Vec::new())),
                command_tx,
            },
            store,
            membership,
            eligible_roles,
            command_rx,
            member_events,
            store_events,
        })
    }

    pub fn registry(&self) -> LeaderRegistry {
        self.handle.clone()
    }

    pub async fn run(self) {
        let LeaderRegistryService {
            handle,
            store,
            membership,
            eligible_roles,
            command_rx,
            member_events,
            store_events,
        } = self;

        // role -> when the next automatic claim attempt is due.
        let mut due_claims: HashMap<String, Instant> = HashMap::new();
        // Roles this node voluntarily released, with the release time.
        let mut recently_released: HashMap<String, Instant> = HashMap::new();
        for role in &eligible_roles {
            due_claims.insert(role.clone(), jittered_now());
        }

        let mut commands = command_rx.stream().fuse();
        let mut members = member_events.stream().fuse();
        let mut stores = store_events.stream().fuse();
        let mut ticker = async_std::stream::interval(Duration::from_millis(250)).fuse();
        let mut retry_at = Instant::now() + RETRY_PERIOD;

        loop {
            select! {
                command = commands.next() => match command {
                    Some(RegistryCommand::Claim { role, reply }) => {
                        let result = try_claim(&store, &membership, &handle, &role).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                    Some(RegistryCommand::Release { role, reply }) => {
                        let result = release_role(&store, &handle, &role).await;
                        if result.is_ok() {
                            recently_released.insert(role.clone(), Instant::now());
                            due_claims.remove(&role);
                        }
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                    Some(RegistryCommand::ReleaseOwned { reply }) => {
                        for role in &eligible_roles {
                            if handle.holds(role).await {
                                match release_role(&store, &handle, role).await {
                                    Ok(()) => {
                                        recently_released.insert(role.clone(), Instant::now());
                                        due_claims.remove(role);
                                    }
                                    Err(e) => {
                                        warn!("failed to release {role} on shutdown: {e}");
                                    }
                                }
                            }
                        }
                        let _ = reply.send(());
                    }
                    None => break,
                },
                event = members.next() => match event {
                    Some(MemberEvent::Leave(member)) | Some(MemberEvent::Failed(member)) => {
                        // Re-evaluate every role whose holder just went away.
                        for role in &eligible_roles {
                            let held_by_gone = handle
                                .current_holder(role)
                                .await
                                .map(|(holder, _)| holder == member.node_id)
                                .unwrap_or(false);
                            if held_by_gone && !in_quiet_period(&recently_released, role) {
                                due_claims.insert(role.clone(), jittered_now());
                            }
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
                event = stores.next() => match event {
                    Some(StoreEvent::Committed { key, value, version }) => {
                        if let Some(role) = key.strip_prefix(LEADER_PREFIX) {
                            let new_holder = holder_from_value(&value);
                            update_holder(&handle, role, new_holder, version).await;
                            if handle.current_holder(role).await.is_none()
                                && eligible_roles.iter().any(|r| r == role)
                                && !in_quiet_period(&recently_released, role)
                            {
                                due_claims.insert(role.to_string(), jittered_now());
                            }
                        }
                    }
                    Some(StoreEvent::LeaderChanged { .. }) => {
                        // Consensus leadership moved; claims that failed
                        // during the window become worth retrying.
                        retry_at = Instant::now();
                    }
                    None => break,
                },
                _ = ticker.next() => {
                    let now = Instant::now();
                    let due: Vec<String> = due_claims
                        .iter()
                        .filter(|(_, at)| now >= **at)
                        .map(|(role, _)| role.clone())
                        .collect();
                    for role in due {
                        due_claims.remove(&role);
                        match try_claim(&store, &membership, &handle, &role).await {
                            Ok(()) | Err(Error::AlreadyHeld) => {}
                            Err(e) => {
                                debug!("claim of {role} failed ({e}); will retry");
                                due_claims.insert(role, Instant::now() + RETRY_PERIOD);
                            }
                        }
                    }
                    if now >= retry_at {
                        retry_at = now + RETRY_PERIOD;
                        for role in &eligible_roles {
                            let vacant_or_dead = match handle.current_holder(role).await {
                                None => true,
                                Some((holder, _)) => !membership.is_alive(&holder).await
                                    && holder != *membership.self_id(),
                            };
                            if vacant_or_dead
                                && !due_claims.contains_key(role)
                                && !in_quiet_period(&recently_released, role)
                            {
                                due_claims.insert(role.clone(), jittered_now());
                            }
                        }
                    }
                }
            }
        }
        debug!("leadership registry stopped");
    }
}

fn in_quiet_period(recently_released: &HashMap<String, Instant>, role: &str) -> bool {
    recently_released
        .get(role)
        .is_some_and(|at| at.elapsed() < RELEASE_QUIET)
}

fn jittered_now() -> Instant {
    let jitter = rand::thread_rng().gen_range(0..CLAIM_JITTER.as_millis()) as u64;
    Instant::now() + Duration::from_millis(jitter)
}

fn holder_from_value(value: &[u8]) -> Option<NodeId> {
    if value.is_empty() {
        return None;
    }
    std::str::from_utf8(value).ok().map(NodeId::from)
}

async fn update_holder(
    handle: &LeaderRegistry,
    role: &str,
    new_holder: Option<NodeId>,
    version: u64,
) {
    let old = {
        let mut holders = handle.holders.write().await;
        let old = holders
            .insert(role.to_string(), (new_holder.clone(), version))
            .and_then(|(h, _)| h);
        old
    };
    if old == new_holder {
        return;
    }
    info!(
        "leader.change role={} from_node_id={} to_node_id={}",
        role,
        old.as_ref().map(|n| n.as_str()).unwrap_or("none"),
        new_holder.as_ref().map(|n| n.as_str()).unwrap_or("none"),
    );
    let event = LeaderEvent {
        role: role.to_string(),
        from: old,
        to: new_holder,
        version,
    };
    handle
        .subscribers
        .write()
        .await
        .retain(|tx| tx.send(event.clone()).is_ok());
}

/// One claim attempt: read the current binding with a strong get, then
/// compare-and-set through the store leader.
async fn try_claim(
    store: &Store,
    membership: &Membership,
    handle: &LeaderRegistry,
    role: &str,
) -> Result<(), Error> {
    let key = leader_key(role);
    let self_id = handle.self_id.clone();
    let current = store
        .get(&key, Consistency::Strong)
        .await
        .map_err(Error::StoreUnavailable)?;

    let attempt = match &current {
        None => store
            .put_if(&key, Expect::Absent, self_id.as_str().as_bytes().to_vec())
            .await,
        Some((value, _)) => {
            match holder_from_value(value) {
                Some(holder) if holder == self_id => return Ok(()),
                Some(holder) if membership.is_alive(&holder).await => {
                    return Err(Error::AlreadyHeld);
                }
                // Vacant (released) or held by a node that is gone.
                _ => {
                    store
                        .put_if(
                            &key,
                            Expect::Value(value.clone()),
                            self_id.as_str().as_bytes().to_vec(),
                        )
                        .await
                }
            }
        }
    };

    match attempt {
        Ok(version) => {
            update_holder(handle, role, Some(self_id), version).await;
            Ok(())
        }
        Err(StoreError::CasFailed { current }) => {
            // Someone else won the race; remember what we learned.
            debug!("lost claim race for {role}");
            if let Some(value) = current {
                if let Some(holder) = holder_from_value(&value) {
                    if membership.is_alive(&holder).await {
                        return Err(Error::AlreadyHeld);
                    }
                }
            }
            Err(Error::AlreadyHeld)
        }
        Err(e) => Err(Error::StoreUnavailable(e)),
    }
}

async fn release_role(
    store: &Store,
    handle: &LeaderRegistry,
    role: &str,
) -> Result<(), Error> {
    let key = leader_key(role);
    let self_id = handle.self_id.clone();
    let result = store
        .put_if(
            &key,
            Expect::Value(self_id.as_str().as_bytes().to_vec()),
            Vec::new(),
        )
        .await;
    match result {
        Ok(version) => {
            update_holder(handle, role, None, version).await;
            Ok(())
        }
        // Not holding it (anymore) is a successful release.
        Err(StoreError::CasFailed { .. }) => Ok(()),
        Err(e) => Err(Error::StoreUnavailable(e)),
    }
}
