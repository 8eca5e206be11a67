// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Consensus wire messages and the transport seam.
//!
//! The service sends fire-and-forget envelopes; replies travel as their own
//! envelopes routed by the sender's address. Production uses
//! length-prefixed JSON frames over TCP; tests use the in-memory
//! [`loopback`](crate::loopback) mesh.

use crate::types::{Expect, LogEntry};
use async_std::io::{ReadExt, WriteExt};
use async_std::net::{TcpListener, TcpStream};
use async_std::stream::StreamExt;
use grove_identity::NodeId;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Upper bound on a single frame; the store only carries small values.
const MAX_FRAME: u32 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    RequestVote {
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    Vote {
        term: u64,
        granted: bool,
    },
    AppendEntries {
        term: u64,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        commit: u64,
    },
    AppendAck {
        term: u64,
        success: bool,
        match_index: u64,
    },
    /// A follower forwarding a client write to the leader.
    ForwardPut {
        request_id: u64,
        key: String,
        expect: Option<Expect>,
        value: Vec<u8>,
    },
    ForwardPutReply {
        request_id: u64,
        result: Result<u64, ForwardError>,
    },
    /// A follower forwarding a strong read to the leader.
    ForwardGet {
        request_id: u64,
        key: String,
    },
    ForwardGetReply {
        request_id: u64,
        result: Result<Option<(Vec<u8>, u64)>, ForwardError>,
    },
}

/// Wire form of the errors a forwarded request can produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ForwardError {
    NotLeader,
    NoQuorum,
    CasFailed { current: Option<Vec<u8>> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    /// Reachable consensus address of the sender, for replies.
    pub from_addr: String,
    pub msg: Message,
}

/// Outbound half of the transport. Sends are best effort; consensus
/// correctness never depends on delivery.
pub trait RaftTransport: Send + Sync + 'static {
    fn send(&self, to_addr: &str, envelope: Envelope);
}

/// TCP transport: one short-lived connection per envelope, length-prefixed
/// JSON frames. With a handful of voters and a heartbeat every few hundred
/// milliseconds, connection churn stays negligible.
pub struct TcpTransport;

impl TcpTransport {
    /// Bind the listener and return the transport plus the incoming
    /// envelope stream.
    pub async fn bind(
        bind_addr: &str,
        bind_port: u16,
    ) -> Result<(Arc<dyn RaftTransport>, flume::Receiver<Envelope>), crate::Error> {
        let listener = TcpListener::bind((bind_addr, bind_port))
            .await
            .map_err(|e| crate::Error::Storage(format!("consensus bind: {e}")))?;
        let (incoming_tx, incoming_rx) = flume::unbounded();

        async_std::task::spawn(async move {
            let mut accepts = listener.incoming();
            while let Some(stream) = accepts.next().await {
                let Ok(stream) = stream else { continue };
                let tx = incoming_tx.clone();
                async_std::task::spawn(async move {
                    if let Err(e) = read_frames(stream, tx).await {
                        trace!("consensus connection closed: {e}");
                    }
                });
            }
        });

        Ok((Arc::new(TcpTransport), incoming_rx))
    }
}

impl RaftTransport for TcpTransport {
    fn send(&self, to_addr: &str, envelope: Envelope) {
        let to_addr = to_addr.to_string();
        async_std::task::spawn(async move {
            match TcpStream::connect(&to_addr).await {
                Ok(mut stream) => {
                    let frame =
                        serde_json::to_vec(&envelope).expect("consensus envelope serializes");
                    let len = (frame.len() as u32).to_be_bytes();
                    if let Err(e) = async {
                        stream.write_all(&len).await?;
                        stream.write_all(&frame).await?;
                        stream.flush().await
                    }
                    .await
                    {
                        debug!("consensus send to {to_addr} failed: {e}");
                    }
                }
                Err(e) => debug!("consensus dial to {to_addr} failed: {e}"),
            }
        });
    }
}

async fn read_frames(
    mut stream: TcpStream,
    tx: flume::Sender<Envelope>,
) -> std::io::Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME {
            warn!("dropping oversized consensus frame ({len} bytes)");
            return Ok(());
        }
        let mut frame = vec![0u8; len as usize];
        stream.read_exact(&mut frame).await?;
        match serde_json::from_slice::<Envelope>(&frame) {
            Ok(envelope) => {
                if tx.send(envelope).is_err() {
                    return Ok(());
                }
            }
            Err(e) => {
                warn!("dropping undecodable consensus frame: {e}");
                return Ok(());
            }
        }
    }
}
