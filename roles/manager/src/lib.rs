// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Role lifecycle management.
//!
//! One worker task per configured role owns that role's state machine;
//! transitions are serialized per role and driven by leadership changes,
//! membership changes, health ticks and the slow reconciler. The leader
//! path publishes its shared secret to the replicated store before the
//! service starts; the follower path fetches it to the local filesystem
//! first, so a service never comes up without the state it depends on.

mod adapters;
mod mock;
mod render;
mod spec;
mod state;

pub use adapters::{
    role_spec, CommandRunner, RolePaths, SystemRunner, SystemdService, SECRET_K3S_TOKEN,
    SECRET_MUNGE,
};
pub use mock::MockRoleService;
pub use render::{render_role, RenderInputs};
pub use spec::{anchor_role, RoleService, RoleSpec, SecretSpec};
pub use state::{RoleGoal, RoleState};

use futures::channel::oneshot;
use futures::prelude::*;
use futures::select;
use grove_consensus::{Consistency, Expect, Store};
use grove_identity::NodeId;
use grove_ipam::Subnet;
use grove_leadership::LeaderRegistry;
use grove_membership::{Member, Membership};
use log::{debug, info, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("service adapter failed: {0}")]
    Service(String),
    #[error("role {0} is not known to this build")]
    UnknownRole(String),
    #[error("shared secret {0} was not available in time")]
    SecretUnavailable(String),
    #[error("replicated store unavailable: {0}")]
    StoreUnavailable(grove_consensus::Error),
    #[error("service did not become healthy within its deadline")]
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleManagerConfig {
    pub cluster_name: String,
    pub subnet: Subnet,
    /// Health poll cadence for running roles.
    pub health_interval: Duration,
    /// Slow reconciliation cadence.
    pub reconcile_interval: Duration,
    /// How long an elected role waits for its first claim attempt to
    /// resolve before it settles for following.
    pub initial_claim_window: Duration,
}

impl Default for RoleManagerConfig {
    fn default() -> Self {
        RoleManagerConfig {
            cluster_name: "grove".to_string(),
            subnet: Subnet::parse("10.42.0.0/16").expect("default subnet parses"),
            health_interval: Duration::from_secs(2),
            reconcile_interval: Duration::from_secs(60),
            initial_claim_window: Duration::from_secs(5),
        }
    }
}

enum WorkerMsg {
    SetGoal(RoleGoal),
    MembershipChanged,
    Tick,
    Shutdown { reply: oneshot::Sender<()> },
}

enum ManagerCommand {
    Shutdown { reply: oneshot::Sender<()> },
}

type StateMap = Arc<async_std::sync::RwLock<HashMap<String, RoleState>>>;

/// Cloneable handle onto the role manager.
#[derive(Clone)]
pub struct RoleManager {
    states: StateMap,
    command_tx: flume::Sender<ManagerCommand>,
}

impl RoleManager {
    pub async fn states(&self) -> HashMap<String, RoleState> {
        self.states.read().await.clone()
    }

    pub async fn state(&self, role: &str) -> Option<RoleState> {
        self.states.read().await.get(role).copied()
    }

    /// Stop every role gracefully, bounded by each role's stop timeout.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .command_tx
            .send(ManagerCommand::Shutdown { reply })
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }
}

pub struct RoleManagerService {
    config: RoleManagerConfig,
    membership: Membership,
    registry: LeaderRegistry,
    workers: HashMap<String, flume::Sender<WorkerMsg>>,
    elected: HashMap<String, bool>,
    states: StateMap,
    command_tx: flume::Sender<ManagerCommand>,
    command_rx: flume::Receiver<ManagerCommand>,
    member_events: flume::Receiver<grove_membership::MemberEvent>,
    leader_events: flume::Receiver<grove_leadership::LeaderEvent>,
}

impl RoleManagerService {
    pub async fn new(
        config: RoleManagerConfig,
        specs: Vec<RoleSpec>,
        membership: Membership,
        registry: LeaderRegistry,
        store: Store,
    ) -> Self {
        let states: StateMap = Arc::new(async_std::sync::RwLock::new(HashMap::new()));
        let member_events = membership.subscribe().await;
        let leader_events = registry.subscribe().await;
        let (command_tx, command_rx) = flume::unbounded();

        let mut workers = HashMap::new();
        let mut elected = HashMap::new();
        for spec in specs {
            let (tx, rx) = flume::unbounded();
            states
                .write()
                .await
                .insert(spec.name.clone(), RoleState::Disabled);
            elected.insert(spec.name.clone(), spec.elected);
            let worker = RoleWorker {
                spec: spec.clone(),
                self_id: membership.self_id().clone(),
                membership: membership.clone(),
                registry: registry.clone(),
                store: store.clone(),
                config: config.clone(),
                states: Arc::clone(&states),
                state: RoleState::Disabled,
                goal: RoleGoal::Disabled,
                last_prepared: None,
                failures: 0,
                next_retry: None,
                rx,
            };
            async_std::task::spawn(worker.run());
            // Follower-only roles start right away. Elected roles wait for
            // their first claim attempt to resolve, so a winner never does
            // a pointless follower lap first.
            if !spec.elected {
                let _ = tx.send(WorkerMsg::SetGoal(RoleGoal::Follower));
            } else if registry.holds(&spec.name).await {
                let _ = tx.send(WorkerMsg::SetGoal(RoleGoal::Leader));
            }
            workers.insert(spec.name.clone(), tx);
        }

        RoleManagerService {
            config,
            membership,
            registry,
            workers,
            elected,
            states,
            command_tx,
            command_rx,
            member_events,
            leader_events,
        }
    }

    pub fn manager(&self) -> RoleManager {
        RoleManager {
            states: Arc::clone(&self.states),
            command_tx: self.command_tx.clone(),
        }
    }

    pub async fn run(self) {
        let RoleManagerService {
            config,
            membership,
            registry: _registry,
            workers,
            elected,
            states: _states,
            command_tx: _command_tx,
            command_rx,
            member_events,
            leader_events,
        } = self;
        let self_id = membership.self_id().clone();

        // Elected roles still waiting for their first claim attempt.
        let claim_deadline = Instant::now() + config.initial_claim_window;
        let mut awaiting_claim: Vec<String> = elected
            .iter()
            .filter(|(_, e)| **e)
            .map(|(name, _)| name.clone())
            .collect();

        let mut members = member_events.stream().fuse();
        let mut leaders = leader_events.stream().fuse();
        let mut commands = command_rx.stream().fuse();
        let mut health_tick = async_std::stream::interval(config.health_interval).fuse();
        let mut reconcile_tick = async_std::stream::interval(config.reconcile_interval).fuse();

        loop {
            select! {
                event = leaders.next() => match event {
                    Some(event) => {
                        awaiting_claim.retain(|r| *r != event.role);
                        on_leader_event(&workers, &elected, &self_id, &event);
                    }
                    None => break,
                },
                event = members.next() => match event {
                    Some(_) => broadcast(&workers, || WorkerMsg::MembershipChanged),
                    None => break,
                },
                command = commands.next() => match command {
                    Some(ManagerCommand::Shutdown { reply }) => {
                        shutdown_workers(&workers).await;
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
                _ = health_tick.next() => {
                    if !awaiting_claim.is_empty() && Instant::now() >= claim_deadline {
                        // No claim resolved in time; follow whatever holder
                        // eventually appears.
                        for role in awaiting_claim.drain(..) {
                            if let Some(tx) = workers.get(&role) {
                                let _ = tx.send(WorkerMsg::SetGoal(RoleGoal::Follower));
                            }
                        }
                    }
                    broadcast(&workers, || WorkerMsg::Tick);
                }
                _ = reconcile_tick.next() => broadcast(&workers, || WorkerMsg::MembershipChanged),
            }
        }
        debug!("role manager stopped");
    }
}

fn on_leader_event(
    workers: &HashMap<String, flume::Sender<WorkerMsg>>,
    elected: &HashMap<String, bool>,
    self_id: &NodeId,
    event: &grove_leadership::LeaderEvent,
) {
    if let Some(tx) = workers.get(&event.role) {
        if elected.get(&event.role).copied().unwrap_or(false) {
            let goal = if event.to.as_ref() == Some(self_id) {
                RoleGoal::Leader
            } else {
                RoleGoal::Follower
            };
            let _ = tx.send(WorkerMsg::SetGoal(goal));
        }
    }
    // Roles anchored on the changed role re-render (workers point at the
    // new controller/server).
    for (name, tx) in workers {
        if name != &event.role && anchor_role(name) == event.role {
            let _ = tx.send(WorkerMsg::MembershipChanged);
        }
    }
}

fn broadcast(workers: &HashMap<String, flume::Sender<WorkerMsg>>, msg: impl Fn() -> WorkerMsg) {
    for tx in workers.values() {
        let _ = tx.send(msg());
    }
}

async fn shutdown_workers(workers: &HashMap<String, flume::Sender<WorkerMsg>>) {
    let mut replies = Vec::new();
    for tx in workers.values() {
        let (reply, rx) = oneshot::channel();
        if tx.send(WorkerMsg::Shutdown { reply }).is_ok() {
            replies.push(rx);
        }
    }
    for rx in replies {
        let _ = rx.await;
    }
}

struct RoleWorker {
    spec: RoleSpec,
    self_id: NodeId,
    membership: Membership,
    registry: LeaderRegistry,
    store: Store,
    config: RoleManagerConfig,
    states: StateMap,
    state: RoleState,
    goal: RoleGoal,
    last_prepared: Option<String>,
    failures: u32,
    next_retry: Option<Instant>,
    rx: flume::Receiver<WorkerMsg>,
}

impl RoleWorker {
    async fn run(mut self) {
        let rx = self.rx.clone();
        while let Ok(msg) = rx.recv_async().await {
            match msg {
                WorkerMsg::SetGoal(goal) => {
                    if goal != self.goal {
                        self.goal = goal;
                        self.drive().await;
                    }
                }
                WorkerMsg::MembershipChanged => self.on_membership_change().await,
                WorkerMsg::Tick => self.on_tick().await,
                WorkerMsg::Shutdown { reply } => {
                    self.goal = RoleGoal::Disabled;
                    self.drive().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    async fn set_state(&mut self, state: RoleState) {
        if self.state != state {
            info!("role {} {} -> {}", self.spec.name, self.state, state);
            self.state = state;
            self.states
                .write()
                .await
                .insert(self.spec.name.clone(), state);
        }
    }

    /// Make transitions until state and goal agree or the role is waiting
    /// on a retry.
    async fn drive(&mut self) {
        loop {
            match (self.state, self.goal) {
                (RoleState::Disabled, RoleGoal::Follower) => self.start_as(false).await,
                (RoleState::Disabled, RoleGoal::Leader) => self.start_as(true).await,
                (RoleState::Follower, RoleGoal::Leader)
                | (RoleState::Leader, RoleGoal::Follower) => {
                    self.stop_service().await;
                    self.set_state(RoleState::Disabled).await;
                }
                (RoleState::Follower | RoleState::Leader, RoleGoal::Disabled) => {
                    self.stop_service().await;
                    self.set_state(RoleState::Disabled).await;
                }
                (RoleState::Failed, RoleGoal::Disabled) => {
                    self.stop_service().await;
                    self.set_state(RoleState::Disabled).await;
                }
                (RoleState::StartingLeader, RoleGoal::Follower | RoleGoal::Disabled) => {
                    // Never managed to start; nothing to stop.
                    self.set_state(RoleState::Disabled).await;
                }
                // Failed and starting-leader wait for their retry tick;
                // matching state/goal pairs have nothing to do.
                _ => break,
            }
        }
    }

    async fn start_as(&mut self, leader: bool) {
        self.set_state(if leader {
            RoleState::StartingLeader
        } else {
            RoleState::StartingFollower
        })
        .await;
        let result = if leader {
            self.bring_up_leader().await
        } else {
            self.bring_up_follower().await
        };
        match result {
            Ok(()) => {
                self.failures = 0;
                self.next_retry = None;
                self.set_state(if leader {
                    RoleState::Leader
                } else {
                    RoleState::Follower
                })
                .await;
            }
            Err(Error::StoreUnavailable(e)) if leader && e.is_retryable() => {
                // Quorum is gone; the leader-to-be blocks in
                // starting-leader and retries.
                debug!(
                    "role {} waiting for quorum to publish its secret",
                    self.spec.name
                );
                self.next_retry = Some(Instant::now() + Duration::from_millis(500));
            }
            Err(e) => {
                warn!("role {} failed to start: {e}", self.spec.name);
                self.fail().await;
            }
        }
    }

    async fn bring_up_follower(&mut self) -> Result<(), Error> {
        if let Some(secret) = self.spec.fetches.clone() {
            let value = self.fetch_secret(&secret).await?;
            write_secret_file(&secret, &value)?;
        }
        self.prepare_current().await?;
        self.spec.service.start()?;
        self.wait_healthy().await
    }

    async fn bring_up_leader(&mut self) -> Result<(), Error> {
        if let Some(secret) = self.spec.publishes.clone() {
            let value = self.ensure_secret_published(&secret).await?;
            write_secret_file(&secret, &value)?;
        }
        self.prepare_current().await?;
        self.spec.service.start()?;
        self.wait_healthy().await
    }

    /// Fetch a shared secret from the store, retrying until the role's
    /// health deadline.
    async fn fetch_secret(&self, secret: &SecretSpec) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + self.spec.health_deadline;
        loop {
            match self.store.get(&secret.store_key, Consistency::Strong).await {
                Ok(Some((value, _))) if !value.is_empty() => return Ok(value),
                Ok(_) => {}
                Err(e) => {
                    debug!("fetch of {} pending: {e}", secret.store_key);
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::SecretUnavailable(secret.store_key.clone()));
            }
            async_std::task::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Publish the secret if absent. The generated value only wins the
    /// compare-and-set once; racing leaders converge on whichever value
    /// committed first.
    async fn ensure_secret_published(&self, secret: &SecretSpec) -> Result<Vec<u8>, Error> {
        match self.store.get(&secret.store_key, Consistency::Strong).await {
            Ok(Some((value, _))) if !value.is_empty() => return Ok(value),
            Ok(_) => {}
            Err(e) => return Err(Error::StoreUnavailable(e)),
        }
        let fresh = generate_secret(secret);
        match self
            .store
            .put_if(&secret.store_key, Expect::Absent, fresh.clone())
            .await
        {
            Ok(_) => {
                info!("published {} to the cluster", secret.store_key);
                Ok(fresh)
            }
            Err(grove_consensus::Error::CasFailed {
                current: Some(value),
            }) if !value.is_empty() => Ok(value),
            Err(e) => Err(Error::StoreUnavailable(e)),
        }
    }

    async fn prepare_current(&mut self) -> Result<(), Error> {
        let config = self.render().await;
        if self.last_prepared.as_deref() != Some(config.as_str()) {
            self.spec.service.prepare(&config)?;
            self.last_prepared = Some(config);
        }
        Ok(())
    }

    async fn render(&self) -> String {
        let members = self.membership.members().await;
        let anchor = anchor_role(&self.spec.name).to_string();
        let holder_id = match self.registry.current_holder(&anchor).await {
            Some((holder, _)) if self.membership.is_alive(&holder).await => Some(holder),
            // A binding naming a dead node does not anchor anything.
            _ if anchor == self.spec.name && self.goal == RoleGoal::Leader => {
                Some(self.self_id.clone())
            }
            _ => None,
        };
        let holder: Option<&Member> = holder_id
            .as_ref()
            .and_then(|id| members.iter().find(|m| m.node_id == *id));
        let inputs = RenderInputs {
            cluster_name: &self.config.cluster_name,
            self_id: &self.self_id,
            members: &members,
            subnet: &self.config.subnet,
            holder,
        };
        render_role(&self.spec.name, &inputs)
    }

    async fn wait_healthy(&self) -> Result<(), Error> {
        let deadline = Instant::now() + self.spec.health_deadline;
        loop {
            match self.spec.service.health() {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => debug!("health probe of {} errored: {e}", self.spec.name),
            }
            if Instant::now() >= deadline {
                return Err(Error::Unhealthy);
            }
            async_std::task::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn stop_service(&mut self) {
        self.set_state(RoleState::Stopping).await;
        let service = Arc::clone(&self.spec.service);
        let stop = async_std::task::spawn_blocking(move || service.stop());
        match async_std::future::timeout(self.spec.stop_timeout, stop).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("stop of {} failed: {e}", self.spec.name),
            Err(_) => warn!(
                "stop of {} exceeded its {}s timeout",
                self.spec.name,
                self.spec.stop_timeout.as_secs()
            ),
        }
    }

    async fn fail(&mut self) {
        let service = Arc::clone(&self.spec.service);
        let _ = async_std::task::spawn_blocking(move || service.stop()).await;
        self.failures += 1;
        let backoff = Duration::from_millis(500)
            .saturating_mul(1u32 << self.failures.min(6))
            .min(Duration::from_secs(30));
        self.next_retry = Some(Instant::now() + backoff);
        self.set_state(RoleState::Failed).await;
    }

    async fn on_membership_change(&mut self) {
        if !self.state.is_running() {
            return;
        }
        let config = self.render().await;
        if self.last_prepared.as_deref() == Some(config.as_str()) {
            return;
        }
        debug!("role {} configuration changed", self.spec.name);
        let result = (|| {
            self.spec.service.prepare(&config)?;
            if self.spec.restart_on_change {
                self.spec.service.stop()?;
                self.spec.service.start()?;
            } else {
                self.spec.service.reload()?;
            }
            Ok::<_, Error>(())
        })();
        match result {
            Ok(()) => self.last_prepared = Some(config),
            Err(e) => {
                warn!("role {} failed to apply new config: {e}", self.spec.name);
                self.fail().await;
            }
        }
    }

    async fn on_tick(&mut self) {
        match self.state {
            RoleState::Failed => {
                if self.retry_due() {
                    self.set_state(RoleState::Disabled).await;
                    self.drive().await;
                }
            }
            RoleState::StartingLeader => {
                if self.goal == RoleGoal::Leader && self.retry_due() {
                    self.start_as(true).await;
                }
            }
            RoleState::Follower | RoleState::Leader => {
                match self.spec.service.health() {
                    Ok(true) => {}
                    Ok(false) | Err(_) => {
                        warn!("role {} is unhealthy", self.spec.name);
                        self.fail().await;
                    }
                }
            }
            _ => {}
        }
    }

    fn retry_due(&self) -> bool {
        self.next_retry
            .map(|at| Instant::now() >= at)
            .unwrap_or(false)
    }
}

fn generate_secret(secret: &SecretSpec) -> Vec<u8> {
    let mut bytes = vec![0u8; secret.generate_len];
    rand::thread_rng().fill_bytes(&mut bytes);
    if secret.store_key.ends_with("token") {
        // Token-shaped secrets are text; key material stays raw.
        hex::encode(&bytes).into_bytes()
    } else {
        bytes
    }
}

fn write_secret_file(secret: &SecretSpec, value: &[u8]) -> Result<(), Error> {
    let dir = secret
        .path
        .parent()
        .ok_or_else(|| Error::Service("secret path has no parent".to_string()))?;
    let name = secret
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Service("secret path has no file name".to_string()))?;
    let written = grove_utils::write_to_file(value, dir, name)
        .map_err(|e| Error::Service(e.to_string()))?;
    grove_utils::set_user_perm(&written).map_err(|e| Error::Service(e.to_string()))?;
    Ok(())
}
