// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! The replicated register service.
//!
//! A compact leader-based consensus core in the Raft family: randomized
//! election timeouts, term-checked votes, log replication with quorum
//! commit, and voter-set changes carried through the log itself. The store
//! holds a handful of small keys, which keeps every structure here tiny;
//! the protocol still provides the full linearizable contract the rest of
//! the agent depends on.

use crate::errors::Error;
use crate::storage::{DurableLog, HardState};
use crate::rpc::{Envelope, ForwardError, Message, RaftTransport};
use crate::types::{
    Command, Consistency, Expect, LogEntry, Role, StoreEvent, Versioned, VoterConfig,
};
use futures::channel::oneshot;
use futures::prelude::*;
use futures::select;
use grove_identity::NodeId;
use log::{debug, info, trace, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub data_dir: PathBuf,
    pub bind_addr: String,
    pub bind_port: u16,
    /// Only true for the very first node of a brand-new cluster.
    pub bootstrap: bool,
    pub tick_interval: Duration,
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    /// Deadline for client operations (put, strong get, voter changes).
    pub op_timeout: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("consensus"),
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 7373,
            bootstrap: false,
            tick_interval: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(200),
            election_timeout_min: Duration::from_millis(600),
            election_timeout_max: Duration::from_millis(1200),
            op_timeout: Duration::from_secs(3),
        }
    }
}

/// Snapshot answered by status queries. Both leadership answers may be
/// transiently stale during an election.
#[derive(Debug, Clone)]
pub struct Status {
    pub role: Role,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub voters: VoterConfig,
}

enum ClientCommand {
    Put {
        key: String,
        expect: Option<Expect>,
        value: Vec<u8>,
        reply: oneshot::Sender<Result<u64, Error>>,
    },
    Get {
        key: String,
        consistency: Consistency,
        reply: oneshot::Sender<Result<Option<(Vec<u8>, u64)>, Error>>,
    },
    AddVoter {
        node_id: NodeId,
        addr: String,
        reply: Option<oneshot::Sender<Result<(), Error>>>,
    },
    RemoveVoter {
        node_id: NodeId,
        reply: Option<oneshot::Sender<Result<(), Error>>>,
    },
    Status {
        reply: oneshot::Sender<Status>,
    },
    Subscribe {
        reply: oneshot::Sender<flume::Receiver<StoreEvent>>,
    },
    Shutdown,
}

/// Cloneable client handle onto the replicated store.
#[derive(Clone)]
pub struct Store {
    self_id: NodeId,
    tx: flume::Sender<ClientCommand>,
}

impl Store {
    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, Error> {
        self.write(key, None, value).await
    }

    /// Conditional write; the precondition is evaluated on the leader's
    /// applied state under the log lock, so concurrent claimers serialize.
    pub async fn put_if(&self, key: &str, expect: Expect, value: Vec<u8>) -> Result<u64, Error> {
        self.write(key, Some(expect), value).await
    }

    async fn write(
        &self,
        key: &str,
        expect: Option<Expect>,
        value: Vec<u8>,
    ) -> Result<u64, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ClientCommand::Put {
                key: key.to_string(),
                expect,
                value,
                reply,
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn get(
        &self,
        key: &str,
        consistency: Consistency,
    ) -> Result<Option<(Vec<u8>, u64)>, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ClientCommand::Get {
                key: key.to_string(),
                consistency,
                reply,
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn add_voter(&self, node_id: NodeId, addr: String) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ClientCommand::AddVoter {
                node_id,
                addr,
                reply: Some(reply),
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn remove_voter(&self, node_id: NodeId) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ClientCommand::RemoveVoter {
                node_id,
                reply: Some(reply),
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Fire-and-forget voter tracking for membership-driven callers; a
    /// non-leader silently ignores these, as the change is the leader's to
    /// make.
    pub fn add_voter_nowait(&self, node_id: NodeId, addr: String) {
        let _ = self.tx.send(ClientCommand::AddVoter {
            node_id,
            addr,
            reply: None,
        });
    }

    pub fn remove_voter_nowait(&self, node_id: NodeId) {
        let _ = self.tx.send(ClientCommand::RemoveVoter {
            node_id,
            reply: None,
        });
    }

    pub async fn status(&self) -> Result<Status, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ClientCommand::Status { reply })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    pub async fn is_leader(&self) -> bool {
        self.status()
            .await
            .map(|s| s.role == Role::Leader)
            .unwrap_or(false)
    }

    pub async fn leader_node_id(&self) -> Option<NodeId> {
        self.status().await.ok().and_then(|s| s.leader)
    }

    pub async fn voters(&self) -> VoterConfig {
        self.status().await.map(|s| s.voters).unwrap_or_default()
    }

    /// Subscribe to leadership transitions and committed writes.
    pub async fn subscribe(&self) -> Result<flume::Receiver<StoreEvent>, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ClientCommand::Subscribe { reply })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ClientCommand::Shutdown);
    }
}

enum PendingKind {
    Write(oneshot::Sender<Result<u64, Error>>),
    Read {
        key: String,
        reply: oneshot::Sender<Result<Option<(Vec<u8>, u64)>, Error>>,
    },
    Config(Option<oneshot::Sender<Result<(), Error>>>),
    ForwardedWrite {
        origin_addr: String,
        request_id: u64,
    },
    ForwardedRead {
        origin_addr: String,
        request_id: u64,
        key: String,
    },
}

struct Pending {
    term: u64,
    deadline: Instant,
    kind: PendingKind,
}

enum ForwardReply {
    Write(oneshot::Sender<Result<u64, Error>>),
    Read(oneshot::Sender<Result<Option<(Vec<u8>, u64)>, Error>>),
}

struct PendingForward {
    deadline: Instant,
    reply: ForwardReply,
}

/// The consensus service task. Owns the log, the applied state and all
/// protocol bookkeeping; everything else talks to it over channels.
pub struct StoreService {
    id: NodeId,
    addr: String,
    config: ConsensusConfig,
    log: DurableLog,
    transport: Arc<dyn RaftTransport>,
    incoming: flume::Receiver<Envelope>,
    command_tx: flume::Sender<ClientCommand>,
    command_rx: flume::Receiver<ClientCommand>,

    role: Role,
    term: u64,
    voted_for: Option<NodeId>,
    entries: Vec<LogEntry>,
    commit_index: u64,
    last_applied: u64,
    voters: VoterConfig,
    leader_hint: Option<NodeId>,
    leader_addr: Option<String>,
    votes: HashSet<NodeId>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    election_deadline: Instant,
    last_heartbeat_sent: Instant,

    kv: BTreeMap<String, Versioned>,
    pending: HashMap<u64, Pending>,
    forward_seq: u64,
    pending_forwards: HashMap<u64, PendingForward>,
    subscribers: Vec<flume::Sender<StoreEvent>>,
    announced_leader: (Option<NodeId>, bool),
}

impl StoreService {
    /// Open the durable log (bootstrapping the singleton voter set when
    /// configured and no prior state exists) and build the service.
    pub fn new(
        id: NodeId,
        advertised_addr: String,
        config: ConsensusConfig,
        transport: Arc<dyn RaftTransport>,
        incoming: flume::Receiver<Envelope>,
    ) -> Result<Self, Error> {
        let log = DurableLog::open(&config.data_dir)?;
        let hard_state = log.load_hard_state()?;
        let mut entries = log.load_entries()?;
        let mut commit_index = 0;

        if config.bootstrap && entries.is_empty() {
            info!("bootstrapping consensus with singleton voter {id}");
            entries.push(LogEntry {
                term: 0,
                index: 1,
                command: Command::AddVoter {
                    node_id: id.clone(),
                    addr: advertised_addr.clone(),
                },
            });
            log.save_entries(&entries)?;
            commit_index = 1;
        }

        let voters = voters_from(&entries);
        let (command_tx, command_rx) = flume::unbounded();
        let now = Instant::now();
        let mut service = StoreService {
            id,
            addr: advertised_addr,
            log,
            transport,
            incoming,
            command_tx,
            command_rx,
            role: Role::Follower,
            term: hard_state.term,
            voted_for: hard_state.voted_for,
            entries,
            commit_index: 0,
            last_applied: 0,
            voters,
            leader_hint: None,
            leader_addr: None,
            votes: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_deadline: now + config.election_timeout_max,
            last_heartbeat_sent: now,
            kv: BTreeMap::new(),
            pending: HashMap::new(),
            forward_seq: 0,
            pending_forwards: HashMap::new(),
            subscribers: Vec::new(),
            announced_leader: (None, false),
            config,
        };
        service.advance_commit_to(commit_index);
        service.reset_election_deadline();
        Ok(service)
    }

    pub fn store(&self) -> Store {
        Store {
            self_id: self.id.clone(),
            tx: self.command_tx.clone(),
        }
    }

    pub async fn run(mut self) {
        let mut ticker = async_std::stream::interval(self.config.tick_interval).fuse();
        let incoming = self.incoming.clone();
        let commands = self.command_rx.clone();
        let mut incoming_stream = incoming.stream().fuse();
        let mut command_stream = commands.stream().fuse();
        info!("consensus service running at {}", self.addr);
        loop {
            select! {
                envelope = incoming_stream.next() => match envelope {
                    Some(envelope) => self.on_envelope(envelope),
                    None => break,
                },
                command = command_stream.next() => match command {
                    Some(ClientCommand::Shutdown) | None => break,
                    Some(command) => self.on_client(command),
                },
                _ = ticker.next() => self.on_tick(),
            }
        }
        info!("consensus service stopped");
    }

    // ---- timers ----

    fn on_tick(&mut self) {
        let now = Instant::now();
        if self.role == Role::Leader {
            if now.duration_since(self.last_heartbeat_sent) >= self.config.heartbeat_interval {
                self.replicate_all();
            }
        } else if self.voters.contains_key(&self.id) && now >= self.election_deadline {
            self.start_election();
        }
        self.expire_pending(now);
    }

    fn reset_election_deadline(&mut self) {
        let min = self.config.election_timeout_min;
        let max = self.config.election_timeout_max;
        let jitter = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
        self.election_deadline = Instant::now() + Duration::from_millis(jitter as u64);
    }

    fn expire_pending(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(i, _)| *i)
            .collect();
        for index in expired {
            if let Some(p) = self.pending.remove(&index) {
                self.fail_pending(p, Error::NoQuorum);
            }
        }
        let expired: Vec<u64> = self
            .pending_forwards
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(i, _)| *i)
            .collect();
        for id in expired {
            if let Some(p) = self.pending_forwards.remove(&id) {
                match p.reply {
                    ForwardReply::Write(tx) => {
                        let _ = tx.send(Err(Error::NoQuorum));
                    }
                    ForwardReply::Read(tx) => {
                        let _ = tx.send(Err(Error::NoQuorum));
                    }
                }
            }
        }
    }

    fn fail_pending(&mut self, pending: Pending, error: Error) {
        match pending.kind {
            PendingKind::Write(tx) => {
                let _ = tx.send(Err(error));
            }
            PendingKind::Read { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            PendingKind::Config(Some(tx)) => {
                let _ = tx.send(Err(error));
            }
            PendingKind::Config(None) => {}
            PendingKind::ForwardedWrite {
                origin_addr,
                request_id,
            } => {
                self.send_to_addr(
                    &origin_addr,
                    Message::ForwardPutReply {
                        request_id,
                        result: Err(forward_error(&error)),
                    },
                );
            }
            PendingKind::ForwardedRead {
                origin_addr,
                request_id,
                ..
            } => {
                self.send_to_addr(
                    &origin_addr,
                    Message::ForwardGetReply {
                        request_id,
                        result: Err(forward_error(&error)),
                    },
                );
            }
        }
    }

    // ---- elections ----

    fn start_election(&mut self) {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.id.clone());
        self.persist_hard_state();
        self.votes = [self.id.clone()].into_iter().collect();
        self.leader_hint = None;
        self.leader_addr = None;
        self.reset_election_deadline();
        debug!("starting election for term {}", self.term);
        if self.votes.len() >= self.quorum() {
            self.become_leader();
            return;
        }
        let msg = Message::RequestVote {
            term: self.term,
            last_log_index: self.last_index(),
            last_log_term: self.last_term(),
        };
        self.broadcast_to_voters(msg);
    }

    fn become_leader(&mut self) {
        info!("won consensus election for term {}", self.term);
        self.role = Role::Leader;
        self.leader_hint = Some(self.id.clone());
        self.leader_addr = Some(self.addr.clone());
        let next = self.last_index() + 1;
        self.next_index = self
            .voters
            .keys()
            .map(|id| (id.clone(), next))
            .collect();
        self.match_index = self
            .voters
            .keys()
            .map(|id| (id.clone(), 0))
            .collect();
        // A no-op from the new term settles the commit index of entries
        // inherited from earlier terms.
        self.append_local(Command::Noop, None);
        self.announce_leadership();
    }

    fn step_down(&mut self, term: u64) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.persist_hard_state();
        }
        if self.role == Role::Leader {
            // Outstanding client operations can no longer be resolved by
            // this node.
            let pending: Vec<u64> = self.pending.keys().copied().collect();
            for index in pending {
                if let Some(p) = self.pending.remove(&index) {
                    self.fail_pending(p, Error::NotLeader { leader: None });
                }
            }
            self.leader_hint = None;
            self.leader_addr = None;
        }
        self.role = Role::Follower;
        self.votes.clear();
        self.reset_election_deadline();
        self.announce_leadership();
    }

    // ---- message handling ----

    fn on_envelope(&mut self, envelope: Envelope) {
        let Envelope { from, from_addr, msg } = envelope;
        match msg {
            Message::RequestVote {
                term,
                last_log_index,
                last_log_term,
            } => {
                if term > self.term {
                    self.step_down(term);
                }
                let up_to_date = (last_log_term, last_log_index)
                    >= (self.last_term(), self.last_index());
                let granted = term == self.term
                    && up_to_date
                    && self
                        .voted_for
                        .as_ref()
                        .map(|v| *v == from)
                        .unwrap_or(true);
                if granted {
                    self.voted_for = Some(from.clone());
                    self.persist_hard_state();
                    self.reset_election_deadline();
                }
                self.send_to_addr(
                    &from_addr,
                    Message::Vote {
                        term: self.term,
                        granted,
                    },
                );
            }
            Message::Vote { term, granted } => {
                if term > self.term {
                    self.step_down(term);
                    return;
                }
                if self.role == Role::Candidate && term == self.term && granted {
                    self.votes.insert(from);
                    if self.votes.len() >= self.quorum() {
                        self.become_leader();
                    }
                }
            }
            Message::AppendEntries {
                term,
                prev_index,
                prev_term,
                entries,
                commit,
            } => {
                self.on_append_entries(from, from_addr, term, prev_index, prev_term, entries, commit);
            }
            Message::AppendAck {
                term,
                success,
                match_index,
            } => {
                self.on_append_ack(from, term, success, match_index);
            }
            Message::ForwardPut {
                request_id,
                key,
                expect,
                value,
            } => {
                if self.role != Role::Leader {
                    self.send_to_addr(
                        &from_addr,
                        Message::ForwardPutReply {
                            request_id,
                            result: Err(ForwardError::NotLeader),
                        },
                    );
                    return;
                }
                let command = match expect {
                    Some(expect) => Command::PutIf { key, expect, value },
                    None => Command::Put { key, value },
                };
                self.append_local(
                    command,
                    Some(PendingKind::ForwardedWrite {
                        origin_addr: from_addr,
                        request_id,
                    }),
                );
            }
            Message::ForwardPutReply { request_id, result } => {
                if let Some(p) = self.pending_forwards.remove(&request_id) {
                    if let ForwardReply::Write(tx) = p.reply {
                        let _ = tx.send(result.map_err(client_error));
                    }
                }
            }
            Message::ForwardGet { request_id, key } => {
                if self.role != Role::Leader {
                    self.send_to_addr(
                        &from_addr,
                        Message::ForwardGetReply {
                            request_id,
                            result: Err(ForwardError::NotLeader),
                        },
                    );
                    return;
                }
                self.append_local(
                    Command::Noop,
                    Some(PendingKind::ForwardedRead {
                        origin_addr: from_addr,
                        request_id,
                        key,
                    }),
                );
            }
            Message::ForwardGetReply { request_id, result } => {
                if let Some(p) = self.pending_forwards.remove(&request_id) {
                    if let ForwardReply::Read(tx) = p.reply {
                        let _ = tx.send(result.map_err(client_error));
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_append_entries(
        &mut self,
        from: NodeId,
        from_addr: String,
        term: u64,
        prev_index: u64,
        prev_term: u64,
        new_entries: Vec<LogEntry>,
        commit: u64,
    ) {
        if term < self.term {
            self.send_to_addr(
                &from_addr,
                Message::AppendAck {
                    term: self.term,
                    success: false,
                    match_index: 0,
                },
            );
            return;
        }
        if term > self.term || self.role != Role::Follower {
            self.step_down(term);
        }
        self.reset_election_deadline();
        if self.leader_hint.as_ref() != Some(&from) {
            self.leader_hint = Some(from.clone());
            self.leader_addr = Some(from_addr.clone());
            self.announce_leadership();
        } else {
            self.leader_addr = Some(from_addr.clone());
        }

        // Consistency check at the previous entry.
        let prev_matches = prev_index == 0
            || self
                .entry_at(prev_index)
                .map(|e| e.term == prev_term)
                .unwrap_or(false);
        if !prev_matches {
            self.send_to_addr(
                &from_addr,
                Message::AppendAck {
                    term: self.term,
                    success: false,
                    match_index: self.commit_index,
                },
            );
            return;
        }

        let mut changed = false;
        for entry in new_entries {
            match self.entry_at(entry.index) {
                Some(existing) if existing.term == entry.term => continue,
                Some(_) => {
                    // Conflict: truncate the suffix and take the leader's
                    // entries.
                    self.entries.truncate((entry.index - 1) as usize);
                    self.entries.push(entry);
                    changed = true;
                }
                None => {
                    self.entries.push(entry);
                    changed = true;
                }
            }
        }
        if changed {
            self.persist_entries();
            self.voters = voters_from(&self.entries);
        }
        let match_index = self.last_index();
        if commit > self.commit_index {
            self.advance_commit_to(commit.min(match_index));
        }
        self.send_to_addr(
            &from_addr,
            Message::AppendAck {
                term: self.term,
                success: true,
                match_index,
            },
        );
    }

    fn on_append_ack(&mut self, from: NodeId, term: u64, success: bool, match_index: u64) {
        if term > self.term {
            self.step_down(term);
            return;
        }
        if self.role != Role::Leader || term < self.term {
            return;
        }
        if success {
            let entry = self.match_index.entry(from.clone()).or_insert(0);
            *entry = (*entry).max(match_index);
            self.next_index.insert(from, match_index + 1);
            self.advance_commit_from_matches();
        } else {
            let next = self.next_index.entry(from.clone()).or_insert(1);
            *next = (*next).saturating_sub(1).max(1);
            if match_index > 0 {
                *next = (match_index + 1).min(*next);
            }
            self.replicate_to(&from);
        }
    }

    // ---- client handling ----

    fn on_client(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Put {
                key,
                expect,
                value,
                reply,
            } => {
                if self.role == Role::Leader {
                    let command = match expect {
                        Some(expect) => Command::PutIf { key, expect, value },
                        None => Command::Put { key, value },
                    };
                    self.append_local(command, Some(PendingKind::Write(reply)));
                } else if let Some(leader_addr) = self.leader_addr.clone() {
                    let request_id = self.next_forward_id();
                    self.pending_forwards.insert(
                        request_id,
                        PendingForward {
                            deadline: Instant::now() + self.config.op_timeout,
                            reply: ForwardReply::Write(reply),
                        },
                    );
                    self.send_to_addr(
                        &leader_addr,
                        Message::ForwardPut {
                            request_id,
                            key,
                            expect,
                            value,
                        },
                    );
                } else {
                    let _ = reply.send(Err(Error::NoQuorum));
                }
            }
            ClientCommand::Get {
                key,
                consistency,
                reply,
            } => match consistency {
                Consistency::Local => {
                    let value = self.kv.get(&key).map(|v| (v.value.clone(), v.version));
                    let _ = reply.send(Ok(value));
                }
                Consistency::Strong => {
                    if self.role == Role::Leader {
                        self.append_local(
                            Command::Noop,
                            Some(PendingKind::Read { key, reply }),
                        );
                    } else if let Some(leader_addr) = self.leader_addr.clone() {
                        let request_id = self.next_forward_id();
                        self.pending_forwards.insert(
                            request_id,
                            PendingForward {
                                deadline: Instant::now() + self.config.op_timeout,
                                reply: ForwardReply::Read(reply),
                            },
                        );
                        self.send_to_addr(&leader_addr, Message::ForwardGet { request_id, key });
                    } else {
                        let _ = reply.send(Err(Error::NoQuorum));
                    }
                }
            },
            ClientCommand::AddVoter {
                node_id,
                addr,
                reply,
            } => {
                if self.role != Role::Leader {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(Error::NotLeader {
                            leader: self.leader_hint.clone(),
                        }));
                    }
                    return;
                }
                if self.voters.get(&node_id).map(String::as_str) == Some(addr.as_str()) {
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                    return;
                }
                info!("adding consensus voter {node_id} at {addr}");
                self.append_local(
                    Command::AddVoter { node_id, addr },
                    Some(PendingKind::Config(reply)),
                );
            }
            ClientCommand::RemoveVoter { node_id, reply } => {
                if self.role != Role::Leader {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(Error::NotLeader {
                            leader: self.leader_hint.clone(),
                        }));
                    }
                    return;
                }
                if !self.voters.contains_key(&node_id) {
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                    return;
                }
                info!("removing consensus voter {node_id}");
                self.append_local(
                    Command::RemoveVoter { node_id },
                    Some(PendingKind::Config(reply)),
                );
            }
            ClientCommand::Status { reply } => {
                let _ = reply.send(Status {
                    role: self.role,
                    term: self.term,
                    leader: self.leader_hint.clone(),
                    voters: self.voters.clone(),
                });
            }
            ClientCommand::Subscribe { reply } => {
                let (tx, rx) = flume::unbounded();
                self.subscribers.push(tx);
                let _ = reply.send(rx);
            }
            ClientCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    // ---- log machinery ----

    fn append_local(&mut self, command: Command, pending: Option<PendingKind>) {
        let index = self.last_index() + 1;
        let entry = LogEntry {
            term: self.term,
            index,
            command,
        };
        self.entries.push(entry);
        self.persist_entries();
        self.voters = voters_from(&self.entries);
        if let Some(kind) = pending {
            self.pending.insert(
                index,
                Pending {
                    term: self.term,
                    deadline: Instant::now() + self.config.op_timeout,
                    kind,
                },
            );
        }
        self.match_index.insert(self.id.clone(), index);
        self.advance_commit_from_matches();
        self.replicate_all();
    }

    fn replicate_all(&mut self) {
        self.last_heartbeat_sent = Instant::now();
        let peers: Vec<NodeId> = self
            .voters
            .keys()
            .filter(|id| **id != self.id)
            .cloned()
            .collect();
        for peer in peers {
            self.replicate_to(&peer);
        }
    }

    fn replicate_to(&mut self, peer: &NodeId) {
        let Some(addr) = self.voters.get(peer).cloned() else {
            return;
        };
        let next = *self.next_index.get(peer).unwrap_or(&(self.last_index() + 1));
        let next = next.max(1);
        let prev_index = next - 1;
        let prev_term = if prev_index == 0 {
            0
        } else {
            self.entry_at(prev_index).map(|e| e.term).unwrap_or(0)
        };
        let entries: Vec<LogEntry> = self
            .entries
            .iter()
            .filter(|e| e.index >= next)
            .cloned()
            .collect();
        self.send_to_addr(
            &addr,
            Message::AppendEntries {
                term: self.term,
                prev_index,
                prev_term,
                entries,
                commit: self.commit_index,
            },
        );
    }

    fn advance_commit_from_matches(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let mut candidate = self.commit_index;
        for index in (self.commit_index + 1)..=self.last_index() {
            let replicated = self
                .voters
                .keys()
                .filter(|id| self.match_index.get(*id).copied().unwrap_or(0) >= index)
                .count();
            let entry_term = self.entry_at(index).map(|e| e.term).unwrap_or(0);
            // Only entries from the current term commit by counting; older
            // ones ride along.
            if replicated >= self.quorum() && entry_term == self.term {
                candidate = index;
            }
        }
        if candidate > self.commit_index {
            self.advance_commit_to(candidate);
            // Followers learn the new commit index with the next append.
            self.replicate_all();
        }
    }

    fn advance_commit_to(&mut self, commit: u64) {
        self.commit_index = commit;
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.entry_at(index).cloned() else {
                warn!("commit index {index} beyond log end");
                break;
            };
            self.apply(entry);
            self.last_applied = index;
        }
    }

    fn apply(&mut self, entry: LogEntry) {
        let pending = self.pending.remove(&entry.index);
        let stale = pending
            .as_ref()
            .map(|p| p.term != entry.term)
            .unwrap_or(false);
        let pending_kind = if stale {
            // The slot was taken by a different leader's entry; the
            // original operation was lost.
            if let Some(p) = pending {
                self.fail_pending(p, Error::NotLeader { leader: self.leader_hint.clone() });
            }
            None
        } else {
            pending.map(|p| p.kind)
        };

        match entry.command {
            Command::Noop => {
                match pending_kind {
                    Some(PendingKind::Read { key, reply }) => {
                        let value = self.kv.get(&key).map(|v| (v.value.clone(), v.version));
                        let _ = reply.send(Ok(value));
                    }
                    Some(PendingKind::ForwardedRead {
                        origin_addr,
                        request_id,
                        key,
                    }) => {
                        let value = self.kv.get(&key).map(|v| (v.value.clone(), v.version));
                        self.send_to_addr(
                            &origin_addr,
                            Message::ForwardGetReply {
                                request_id,
                                result: Ok(value),
                            },
                        );
                    }
                    _ => {}
                }
            }
            Command::Put { key, value } => {
                let version = self.apply_write(&key, value);
                self.resolve_write(pending_kind, Ok(version));
            }
            Command::PutIf { key, expect, value } => {
                let current = self.kv.get(&key);
                let passes = match (&expect, current) {
                    (Expect::Absent, None) => true,
                    (Expect::Value(v), Some(cur)) => cur.value == *v,
                    _ => false,
                };
                if passes {
                    let version = self.apply_write(&key, value);
                    self.resolve_write(pending_kind, Ok(version));
                } else {
                    let current = self.kv.get(&key).map(|v| v.value.clone());
                    self.resolve_write(pending_kind, Err(Error::CasFailed { current }));
                }
            }
            Command::AddVoter { .. } | Command::RemoveVoter { .. } => {
                if let Some(PendingKind::Config(Some(tx))) = pending_kind {
                    let _ = tx.send(Ok(()));
                }
            }
        }
    }

    fn apply_write(&mut self, key: &str, value: Vec<u8>) -> u64 {
        let version = self.kv.get(key).map(|v| v.version + 1).unwrap_or(1);
        self.kv.insert(
            key.to_string(),
            Versioned {
                value: value.clone(),
                version,
            },
        );
        trace!("applied {key} at version {version}");
        self.emit(StoreEvent::Committed {
            key: key.to_string(),
            value,
            version,
        });
        version
    }

    fn resolve_write(&mut self, pending: Option<PendingKind>, result: Result<u64, Error>) {
        match pending {
            Some(PendingKind::Write(tx)) => {
                let _ = tx.send(result);
            }
            Some(PendingKind::ForwardedWrite {
                origin_addr,
                request_id,
            }) => {
                let wire = match result {
                    Ok(version) => Ok(version),
                    Err(e) => Err(forward_error(&e)),
                };
                self.send_to_addr(
                    &origin_addr,
                    Message::ForwardPutReply {
                        request_id,
                        result: wire,
                    },
                );
            }
            _ => {}
        }
    }

    // ---- helpers ----

    fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    fn next_forward_id(&mut self) -> u64 {
        self.forward_seq += 1;
        self.forward_seq
    }

    fn persist_hard_state(&mut self) {
        let state = HardState {
            term: self.term,
            voted_for: self.voted_for.clone(),
        };
        if let Err(e) = self.log.save_hard_state(&state) {
            warn!("failed to persist consensus hard state: {e}");
        }
    }

    fn persist_entries(&mut self) {
        if let Err(e) = self.log.save_entries(&self.entries) {
            warn!("failed to persist consensus log: {e}");
        }
    }

    fn broadcast_to_voters(&mut self, msg: Message) {
        let targets: Vec<String> = self
            .voters
            .iter()
            .filter(|(id, _)| **id != self.id)
            .map(|(_, addr)| addr.clone())
            .collect();
        for addr in targets {
            self.send_to_addr(&addr, msg.clone());
        }
    }

    fn send_to_addr(&self, addr: &str, msg: Message) {
        self.transport.send(
            addr,
            Envelope {
                from: self.id.clone(),
                from_addr: self.addr.clone(),
                msg,
            },
        );
    }

    fn announce_leadership(&mut self) {
        let current = (self.leader_hint.clone(), self.role == Role::Leader);
        if current != self.announced_leader {
            self.announced_leader = current.clone();
            self.emit(StoreEvent::LeaderChanged {
                is_self: current.1,
                leader: current.0,
            });
        }
    }

    fn emit(&mut self, event: StoreEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn voters_from(entries: &[LogEntry]) -> VoterConfig {
    let mut voters = VoterConfig::new();
    for entry in entries {
        match &entry.command {
            Command::AddVoter { node_id, addr } => {
                voters.insert(node_id.clone(), addr.clone());
            }
            Command::RemoveVoter { node_id } => {
                voters.remove(node_id);
            }
            _ => {}
        }
    }
    voters
}

fn forward_error(error: &Error) -> ForwardError {
    match error {
        Error::CasFailed { current } => ForwardError::CasFailed {
            current: current.clone(),
        },
        Error::NotLeader { .. } => ForwardError::NotLeader,
        _ => ForwardError::NoQuorum,
    }
}

fn client_error(error: ForwardError) -> Error {
    match error {
        ForwardError::NotLeader => Error::NotLeader { leader: None },
        ForwardError::NoQuorum => Error::NoQuorum,
        ForwardError::CasFailed { current } => Error::CasFailed { current },
    }
}
