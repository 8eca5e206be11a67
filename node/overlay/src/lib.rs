// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! The encrypted overlay mesh.
//!
//! Renders the current membership snapshot into a point-to-point tunnel
//! configuration and applies it idempotently: bring the interface up when
//! it is down, sync-reload it in place when it is up, do nothing when the
//! render is unchanged. A slow reconciler re-applies unconditionally to
//! recover from drift caused outside the agent.

mod device;
mod render;

pub use device::{MockDevice, TunnelDevice, WgQuickDevice};
pub use render::{member_ip, peers_from_members, render, InterfaceSpec, PeerSpec};

use futures::channel::oneshot;
use futures::prelude::*;
use futures::select;
use grove_identity::NodeId;
use grove_ipam::Subnet;
use grove_membership::{MemberEvent, Membership};
use grove_net::TAG_OVERLAY_IP;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("tunnel device error: {0}")]
    Device(String),
    #[error("overlay config write failed: {0}")]
    Io(String),
    #[error("overlay address allocation failed: {0}")]
    Allocation(#[from] grove_ipam::Error),
    #[error("overlay interface did not come up after {0} attempts")]
    UpFailed(u32),
    #[error("overlay service is closed")]
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub interface: String,
    pub listen_port: u16,
    pub subnet: Subnet,
    pub mtu: Option<u32>,
    /// Directory holding `<interface>.conf`.
    pub config_dir: PathBuf,
    pub reconcile_interval: Duration,
    pub up_retries: u32,
    pub retry_delay: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            interface: "grove0".to_string(),
            listen_port: 51820,
            subnet: Subnet::parse("10.42.0.0/16").expect("default subnet parses"),
            mtu: None,
            config_dir: PathBuf::from("overlay"),
            reconcile_interval: Duration::from_secs(60),
            up_retries: 5,
            retry_delay: Duration::from_millis(500),
        }
    }
}

enum OverlayCommand {
    Reconcile,
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cloneable handle onto the overlay service.
#[derive(Clone)]
pub struct Overlay {
    command_tx: flume::Sender<OverlayCommand>,
    self_ip: Arc<async_std::sync::RwLock<Ipv4Addr>>,
}

impl Overlay {
    /// This node's current overlay IP; changes only through conflict
    /// resolution.
    pub async fn self_ip(&self) -> Ipv4Addr {
        *self.self_ip.read().await
    }

    pub fn reconcile(&self) {
        let _ = self.command_tx.send(OverlayCommand::Reconcile);
    }

    /// Bring the interface down and stop the service.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .command_tx
            .send(OverlayCommand::Shutdown { reply })
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }
}

pub struct OverlayService {
    config: OverlayConfig,
    device: Arc<dyn TunnelDevice>,
    membership: Membership,
    member_events: flume::Receiver<MemberEvent>,
    self_id: NodeId,
    tunnel_private_key: String,
    self_ip: Arc<async_std::sync::RwLock<Ipv4Addr>>,
    command_tx: flume::Sender<OverlayCommand>,
    command_rx: flume::Receiver<OverlayCommand>,
    last_render: Option<String>,
}

impl OverlayService {
    /// `initial_ip` is the allocation made at boot, after the first
    /// membership sync.
    pub async fn new(
        config: OverlayConfig,
        device: Arc<dyn TunnelDevice>,
        membership: Membership,
        tunnel_secret: [u8; 32],
        initial_ip: Ipv4Addr,
    ) -> Self {
        let member_events = membership.subscribe().await;
        let (command_tx, command_rx) = flume::unbounded();
        let self_id = membership.self_id().clone();
        OverlayService {
            config,
            device,
            membership,
            member_events,
            self_id,
            tunnel_private_key: base64::encode(tunnel_secret),
            self_ip: Arc::new(async_std::sync::RwLock::new(initial_ip)),
            command_tx,
            command_rx,
            last_render: None,
        }
    }

    pub fn overlay(&self) -> Overlay {
        Overlay {
            command_tx: self.command_tx.clone(),
            self_ip: Arc::clone(&self.self_ip),
        }
    }

    fn config_path(&self) -> PathBuf {
        self.config
            .config_dir
            .join(format!("{}.conf", self.config.interface))
    }

    pub async fn run(mut self) {
        let member_events = self.member_events.clone();
        let command_rx = self.command_rx.clone();
        let mut members = member_events.stream().fuse();
        let mut commands = command_rx.stream().fuse();
        let mut ticker = async_std::stream::interval(self.config.reconcile_interval).fuse();

        // First render happens immediately; boot does not wait a tick.
        if let Err(e) = self.reconcile(false).await {
            warn!("initial overlay apply failed: {e}");
        }

        loop {
            select! {
                event = members.next() => match event {
                    Some(_) => {
                        if let Err(e) = self.reconcile(false).await {
                            warn!("overlay apply failed: {e}");
                        }
                    }
                    None => break,
                },
                command = commands.next() => match command {
                    Some(OverlayCommand::Reconcile) => {
                        if let Err(e) = self.reconcile(false).await {
                            warn!("overlay apply failed: {e}");
                        }
                    }
                    Some(OverlayCommand::Shutdown { reply }) => {
                        self.teardown();
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
                _ = ticker.next() => {
                    // Unconditional re-apply to converge after any missed
                    // event or external drift.
                    if let Err(e) = self.reconcile(true).await {
                        warn!("overlay reconcile failed: {e}");
                    }
                }
            }
        }
        debug!("overlay service stopped");
    }

    fn teardown(&mut self) {
        match self.device.is_up(&self.config.interface) {
            Ok(true) => {
                if let Err(e) = self.device.down(&self.config.interface, &self.config_path()) {
                    warn!("failed to bring {} down: {e}", self.config.interface);
                }
            }
            Ok(false) => {}
            Err(e) => warn!("could not check {} link state: {e}", self.config.interface),
        }
    }

    /// Render the current membership snapshot and apply it. With `force`,
    /// an unchanged render is still pushed to the device.
    pub async fn reconcile(&mut self, force: bool) -> Result<(), Error> {
        let members = self.membership.alive_members().await;
        self.resolve_conflicts(&members).await?;
        let self_ip = *self.self_ip.read().await;

        let peers = peers_from_members(
            &members,
            &self.self_id,
            &self.config.subnet,
            self.config.listen_port,
        );
        let interface = InterfaceSpec {
            private_key: self.tunnel_private_key.clone(),
            address: self_ip,
            prefix: self.config.subnet.prefix(),
            listen_port: self.config.listen_port,
            mtu: self.config.mtu,
        };
        let text = render(&interface, &peers);

        let unchanged = self.last_render.as_deref() == Some(text.as_str());
        if unchanged && !force {
            info!(
                "overlay.apply peers={} self_ip={} result=noop",
                peers.len(),
                self_ip
            );
            return Ok(());
        }

        let path = grove_utils::write_to_file(
            text.as_bytes(),
            &self.config.config_dir,
            &format!("{}.conf", self.config.interface),
        )
        .map_err(|e| Error::Io(e.to_string()))?;
        grove_utils::set_user_perm(&path).map_err(|e| Error::Io(e.to_string()))?;

        let result = self.apply(&path).await;
        match &result {
            Ok(applied) => {
                self.last_render = Some(text);
                info!(
                    "overlay.apply peers={} self_ip={} result={}",
                    peers.len(),
                    self_ip,
                    applied
                );
            }
            Err(e) => {
                warn!(
                    "overlay.apply peers={} self_ip={} result=error error={e}",
                    peers.len(),
                    self_ip
                );
            }
        }
        result.map(|_| ())
    }

    /// Randomized re-allocation when this node's IP collides with a peer's.
    async fn resolve_conflicts(&mut self, members: &[grove_membership::Member]) -> Result<(), Error> {
        let current = *self.self_ip.read().await;
        let peer_ips: Vec<(NodeId, Ipv4Addr)> = members
            .iter()
            .filter(|m| m.is_alive() && m.node_id != self.self_id)
            .map(|m| (m.node_id.clone(), member_ip(m, &self.config.subnet)))
            .collect();
        let Some((conflicting_peer, _)) = peer_ips.iter().find(|(_, ip)| *ip == current) else {
            return Ok(());
        };

        let avoid: std::collections::HashSet<Ipv4Addr> =
            peer_ips.iter().map(|(_, ip)| *ip).collect();
        let salt = grove_ipam::conflict_salt(&self.self_id);
        let new_ip = grove_ipam::allocate_randomized(&self.config.subnet, &avoid, &salt)?;
        info!(
            "ip.conflict peer_node_id={conflicting_peer} old_ip={current} new_ip={new_ip}"
        );
        *self.self_ip.write().await = new_ip;
        self.advertise_ip(new_ip).await;
        Ok(())
    }

    /// Publish the (re)chosen IP through the member tag bag so every view
    /// converges on it.
    async fn advertise_ip(&self, ip: Ipv4Addr) {
        let Some(me) = self.membership.member(&self.self_id).await else {
            return;
        };
        let mut tags = me.tags.clone();
        tags.insert(TAG_OVERLAY_IP.to_string(), ip.to_string());
        self.membership.update_tags(tags).await;
    }

    async fn apply(&self, path: &std::path::Path) -> Result<&'static str, Error> {
        let up = self.device.is_up(&self.config.interface)?;
        if up {
            self.device.sync(&self.config.interface, path)?;
            return Ok("reloaded");
        }
        let mut delay = self.config.retry_delay;
        for attempt in 1..=self.config.up_retries {
            match self.device.up(&self.config.interface, path) {
                Ok(()) => {
                    // Verify the link actually exists before declaring
                    // victory.
                    if self.device.is_up(&self.config.interface)? {
                        return Ok("up");
                    }
                }
                Err(e) => {
                    debug!(
                        "bring-up attempt {attempt}/{} failed: {e}",
                        self.config.up_retries
                    );
                }
            }
            async_std::task::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
        Err(Error::UpFailed(self.config.up_retries))
    }
}
