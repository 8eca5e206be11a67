// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-memory consensus transport for tests, with partition support.

use crate::rpc::{Envelope, RaftTransport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct LoopbackRaftNet {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    endpoints: HashMap<String, Endpoint>,
}

struct Endpoint {
    tx: flume::Sender<Envelope>,
    group: usize,
}

struct LoopbackSender {
    from_addr: String,
    inner: Arc<Mutex<Inner>>,
}

impl LoopbackRaftNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint; returns the transport handle and the incoming
    /// stream, mirroring `TcpTransport::bind`.
    pub fn endpoint(&self, addr: &str) -> (Arc<dyn RaftTransport>, flume::Receiver<Envelope>) {
        let (tx, rx) = flume::unbounded();
        self.inner
            .lock()
            .expect("loopback lock")
            .endpoints
            .insert(addr.to_string(), Endpoint { tx, group: 0 });
        let sender = LoopbackSender {
            from_addr: addr.to_string(),
            inner: Arc::clone(&self.inner),
        };
        (Arc::new(sender), rx)
    }

    /// Drop all traffic to and from an endpoint, as a crashed process
    /// would.
    pub fn kill(&self, addr: &str) {
        self.inner
            .lock()
            .expect("loopback lock")
            .endpoints
            .remove(addr);
    }

    /// Assign endpoints to isolated groups; traffic only flows within a
    /// group until [`heal`](Self::heal).
    pub fn partition(&self, groups: &[&[&str]]) {
        let mut inner = self.inner.lock().expect("loopback lock");
        for (index, group) in groups.iter().enumerate() {
            for addr in group.iter() {
                if let Some(endpoint) = inner.endpoints.get_mut(*addr) {
                    endpoint.group = index;
                }
            }
        }
    }

    pub fn heal(&self) {
        let mut inner = self.inner.lock().expect("loopback lock");
        for endpoint in inner.endpoints.values_mut() {
            endpoint.group = 0;
        }
    }
}

impl RaftTransport for LoopbackSender {
    fn send(&self, to_addr: &str, envelope: Envelope) {
        let inner = self.inner.lock().expect("loopback lock");
        let from_group = match inner.endpoints.get(&self.from_addr) {
            Some(e) => e.group,
            None => return,
        };
        if let Some(target) = inner.endpoints.get(to_addr) {
            if target.group == from_group {
                let _ = target.tx.send(envelope);
            }
        }
    }
}
