// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Service configuration rendered from the membership view.
//!
//! Rendering is deterministic over its inputs; the role workers compare
//! renders and skip re-applying unchanged ones.

use grove_identity::NodeId;
use grove_ipam::Subnet;
use grove_membership::Member;
use grove_net::{TAG_CPU, TAG_GPU, TAG_RAM};
use grove_overlay::member_ip;
use std::fmt::Write;

/// Inputs a role render depends on. Built by the manager from the current
/// membership snapshot and the anchor role's holder.
pub struct RenderInputs<'a> {
    pub cluster_name: &'a str,
    pub self_id: &'a NodeId,
    pub members: &'a [Member],
    pub subnet: &'a Subnet,
    /// Current holder of the role's anchor (controller/server), if any.
    pub holder: Option<&'a Member>,
}

pub fn render_role(role: &str, inputs: &RenderInputs) -> String {
    match role {
        "slurm-controller" | "slurm-worker" => render_slurm(inputs),
        "k3s-server" => render_k3s_server(inputs),
        "k3s-agent" => render_k3s_agent(inputs),
        other => format!("# no configuration for role {other}\n"),
    }
}

/// One slurm.conf shared by controller and workers, listing every member
/// that advertises the worker role.
fn render_slurm(inputs: &RenderInputs) -> String {
    let mut out = String::new();
    writeln!(out, "ClusterName={}", inputs.cluster_name).unwrap();
    if let Some(holder) = inputs.holder {
        writeln!(
            out,
            "SlurmctldHost={}({})",
            holder.name,
            member_ip(holder, inputs.subnet)
        )
        .unwrap();
    }
    writeln!(out, "AuthType=auth/munge").unwrap();
    writeln!(out, "SlurmctldPort=6817").unwrap();
    writeln!(out, "SlurmdPort=6818").unwrap();
    writeln!(out, "StateSaveLocation=/var/spool/slurmctld").unwrap();
    writeln!(out, "ReturnToService=2").unwrap();
    writeln!(out).unwrap();

    let mut workers: Vec<&Member> = inputs
        .members
        .iter()
        .filter(|m| m.is_alive() && m.roles().contains(&"slurm-worker"))
        .collect();
    workers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    for worker in &workers {
        let cpus = worker.tags.get(TAG_CPU).map(String::as_str).unwrap_or("1");
        let ram = worker.tags.get(TAG_RAM).map(String::as_str).unwrap_or("1024");
        let mut line = format!(
            "NodeName={} NodeAddr={} CPUs={cpus} RealMemory={ram}",
            worker.name,
            member_ip(worker, inputs.subnet)
        );
        if let Some(gpus) = worker.tags.get(TAG_GPU).filter(|g| g.as_str() != "0") {
            write!(line, " Gres=gpu:{gpus}").unwrap();
        }
        writeln!(out, "{line}").unwrap();
    }
    if !workers.is_empty() {
        writeln!(out, "PartitionName=main Nodes=ALL Default=YES MaxTime=INFINITE").unwrap();
    }
    out
}

fn self_member<'a>(inputs: &'a RenderInputs) -> Option<&'a Member> {
    inputs
        .members
        .iter()
        .find(|m| m.node_id == *inputs.self_id)
}

fn render_k3s_server(inputs: &RenderInputs) -> String {
    let mut out = String::new();
    if let Some(me) = self_member(inputs) {
        writeln!(out, "node-ip: {}", member_ip(me, inputs.subnet)).unwrap();
    }
    writeln!(out, "flannel-iface: grove0").unwrap();
    writeln!(out, "disable-cloud-controller: true").unwrap();
    out
}

fn render_k3s_agent(inputs: &RenderInputs) -> String {
    let mut out = String::new();
    if let Some(holder) = inputs.holder {
        writeln!(
            out,
            "server: https://{}:6443",
            member_ip(holder, inputs.subnet)
        )
        .unwrap();
    }
    if let Some(me) = self_member(inputs) {
        writeln!(out, "node-ip: {}", member_ip(me, inputs.subnet)).unwrap();
    }
    writeln!(out, "flannel-iface: grove0").unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use grove_membership::MemberStatus;
    use std::collections::BTreeMap;

    fn member(id: &str, roles: &str, cpu: &str) -> Member {
        let mut tags = BTreeMap::new();
        tags.insert("roles".to_string(), roles.to_string());
        tags.insert(TAG_CPU.to_string(), cpu.to_string());
        Member {
            node_id: NodeId::from(id),
            name: id.to_string(),
            addr: format!("{id}.local:7946"),
            status: MemberStatus::Alive,
            tags,
            incarnation: 1,
            last_change: Utc::now(),
            joined_at: Utc::now(),
        }
    }

    #[test]
    fn slurm_conf_lists_workers_and_controller() {
        let subnet = Subnet::parse("10.42.0.0/16").unwrap();
        let controller = member("ctl", "slurm-controller", "8");
        let workers = vec![
            controller.clone(),
            member("w1", "slurm-worker", "16"),
            member("w2", "slurm-worker", "4"),
        ];
        let self_id = NodeId::from("w1");
        let inputs = RenderInputs {
            cluster_name: "grove",
            self_id: &self_id,
            members: &workers,
            subnet: &subnet,
            holder: Some(&controller),
        };
        let conf = render_role("slurm-worker", &inputs);
        assert!(conf.contains("ClusterName=grove"));
        assert!(conf.contains("SlurmctldHost=ctl("));
        assert!(conf.contains("NodeName=w1"));
        assert!(conf.contains("NodeName=w2"));
        assert!(conf.contains("CPUs=16"));
        assert!(conf.contains("PartitionName=main"));
        // Controller is not a worker; it gets no NodeName line.
        assert!(!conf.contains("NodeName=ctl"));
    }

    #[test]
    fn k3s_agent_points_at_the_server_holder() {
        let subnet = Subnet::parse("10.42.0.0/16").unwrap();
        let server = member("srv", "k3s-server", "8");
        let me = member("agent", "k3s-agent", "4");
        let members = vec![server.clone(), me.clone()];
        let inputs = RenderInputs {
            cluster_name: "grove",
            self_id: &me.node_id,
            members: &members,
            subnet: &subnet,
            holder: Some(&server),
        };
        let conf = render_role("k3s-agent", &inputs);
        let server_ip = member_ip(&server, &subnet);
        assert!(conf.contains(&format!("server: https://{server_ip}:6443")));
        assert!(conf.contains("node-ip: "));
    }

    #[test]
    fn render_is_stable_for_equal_inputs() {
        let subnet = Subnet::parse("10.42.0.0/16").unwrap();
        let members = vec![member("a", "slurm-worker", "2")];
        let self_id = NodeId::from("a");
        let inputs = RenderInputs {
            cluster_name: "grove",
            self_id: &self_id,
            members: &members,
            subnet: &subnet,
            holder: None,
        };
        assert_eq!(
            render_role("slurm-worker", &inputs),
            render_role("slurm-worker", &inputs)
        );
    }
}
