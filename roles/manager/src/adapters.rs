// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Service adapters for the workload roles.
//!
//! All four shipped roles are systemd units; one adapter covers them. The
//! command seam exists so tests never touch a real service manager.

use crate::spec::{RoleService, RoleSpec, SecretSpec};
use crate::Error;
use log::debug;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

pub trait CommandRunner: Send + Sync {
    /// Run a command and return its stdout; non-zero exit is an error.
    fn run(&self, program: &str, args: &[&str]) -> Result<String, Error>;
}

pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, Error> {
        debug!("running {program} {}", args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::Service(format!("{program}: {e}")))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Error::Service(format!(
                "{program} {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// A role backed by a systemd unit plus one rendered configuration file.
pub struct SystemdService {
    unit: String,
    config_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl SystemdService {
    pub fn new(unit: &str, config_path: &Path, runner: Arc<dyn CommandRunner>) -> Self {
        SystemdService {
            unit: unit.to_string(),
            config_path: config_path.to_path_buf(),
            runner,
        }
    }
}

impl RoleService for SystemdService {
    fn prepare(&self, config: &str) -> Result<(), Error> {
        let dir = self
            .config_path
            .parent()
            .ok_or_else(|| Error::Service("config path has no parent".to_string()))?;
        let name = self
            .config_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Service("config path has no file name".to_string()))?;
        grove_utils::write_to_file(config.as_bytes(), dir, name)
            .map_err(|e| Error::Service(e.to_string()))?;
        Ok(())
    }

    fn start(&self) -> Result<(), Error> {
        self.runner.run("systemctl", &["start", &self.unit]).map(|_| ())
    }

    fn reload(&self) -> Result<(), Error> {
        self.runner
            .run("systemctl", &["reload-or-restart", &self.unit])
            .map(|_| ())
    }

    fn stop(&self) -> Result<(), Error> {
        self.runner.run("systemctl", &["stop", &self.unit]).map(|_| ())
    }

    fn health(&self) -> Result<bool, Error> {
        match self.runner.run("systemctl", &["is-active", &self.unit]) {
            Ok(out) => Ok(out.trim() == "active"),
            // is-active exits non-zero for every inactive state.
            Err(_) => Ok(false),
        }
    }
}

/// Filesystem locations the shipped roles read their secrets and configs
/// from; all overridable so tests can point them into a temp dir.
#[derive(Debug, Clone)]
pub struct RolePaths {
    pub munge_key: PathBuf,
    pub slurm_conf: PathBuf,
    pub k3s_token: PathBuf,
    pub k3s_server_config: PathBuf,
    pub k3s_agent_config: PathBuf,
}

impl Default for RolePaths {
    fn default() -> Self {
        RolePaths {
            munge_key: PathBuf::from("/etc/munge/munge.key"),
            slurm_conf: PathBuf::from("/etc/slurm/slurm.conf"),
            k3s_token: PathBuf::from("/etc/rancher/k3s/token"),
            k3s_server_config: PathBuf::from("/etc/rancher/k3s/config.yaml"),
            k3s_agent_config: PathBuf::from("/etc/rancher/k3s/agent-config.yaml"),
        }
    }
}

pub const SECRET_MUNGE: &str = "secret/munge";
pub const SECRET_K3S_TOKEN: &str = "secret/k3s-token";

fn munge_secret(paths: &RolePaths) -> SecretSpec {
    SecretSpec {
        store_key: SECRET_MUNGE.to_string(),
        path: paths.munge_key.clone(),
        generate_len: 1024,
    }
}

fn k3s_secret(paths: &RolePaths) -> SecretSpec {
    SecretSpec {
        store_key: SECRET_K3S_TOKEN.to_string(),
        path: paths.k3s_token.clone(),
        generate_len: 32,
    }
}

/// Build the [`RoleSpec`] for one of the shipped role names. Unknown names
/// are a configuration error surfaced at boot.
pub fn role_spec(
    name: &str,
    paths: &RolePaths,
    runner: Arc<dyn CommandRunner>,
) -> Result<RoleSpec, Error> {
    let health_deadline = Duration::from_secs(60);
    let stop_timeout = Duration::from_secs(20);
    let spec = match name {
        "slurm-controller" => RoleSpec {
            name: name.to_string(),
            elected: true,
            publishes: Some(munge_secret(paths)),
            fetches: Some(munge_secret(paths)),
            restart_on_change: false,
            service: Arc::new(SystemdService::new("slurmctld", &paths.slurm_conf, runner)),
            health_deadline,
            stop_timeout,
        },
        "slurm-worker" => RoleSpec {
            name: name.to_string(),
            elected: false,
            publishes: None,
            fetches: Some(munge_secret(paths)),
            restart_on_change: false,
            service: Arc::new(SystemdService::new("slurmd", &paths.slurm_conf, runner)),
            health_deadline,
            stop_timeout,
        },
        "k3s-server" => RoleSpec {
            name: name.to_string(),
            elected: true,
            publishes: Some(k3s_secret(paths)),
            fetches: Some(k3s_secret(paths)),
            restart_on_change: true,
            service: Arc::new(SystemdService::new("k3s", &paths.k3s_server_config, runner)),
            health_deadline,
            stop_timeout,
        },
        "k3s-agent" => RoleSpec {
            name: name.to_string(),
            elected: false,
            publishes: None,
            fetches: Some(k3s_secret(paths)),
            restart_on_change: true,
            service: Arc::new(SystemdService::new(
                "k3s-agent",
                &paths.k3s_agent_config,
                runner,
            )),
            health_deadline,
            stop_timeout,
        },
        other => return Err(Error::UnknownRole(other.to_string())),
    };
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        calls: Mutex<Vec<String>>,
        active: Mutex<bool>,
    }

    impl CommandRunner for Recorder {
        fn run(&self, program: &str, args: &[&str]) -> Result<String, Error> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{program} {}", args.join(" ")));
            if args.first() == Some(&"is-active") {
                return if *self.active.lock().unwrap() {
                    Ok("active\n".to_string())
                } else {
                    Err(Error::Service("inactive".to_string()))
                };
            }
            if args.first() == Some(&"start") {
                *self.active.lock().unwrap() = true;
            }
            if args.first() == Some(&"stop") {
                *self.active.lock().unwrap() = false;
            }
            Ok(String::new())
        }
    }

    #[test]
    fn systemd_adapter_drives_the_unit() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
            active: Mutex::new(false),
        });
        let service = SystemdService::new("slurmd", &dir.path().join("slurm.conf"), runner.clone());

        service.prepare("ClusterName=grove\n").unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("slurm.conf")).unwrap(),
            "ClusterName=grove\n"
        );
        assert!(!service.health().unwrap());
        service.start().unwrap();
        assert!(service.health().unwrap());
        service.stop().unwrap();
        assert!(!service.health().unwrap());

        let calls = runner.calls.lock().unwrap().clone();
        assert!(calls.contains(&"systemctl start slurmd".to_string()));
        assert!(calls.contains(&"systemctl stop slurmd".to_string()));
    }

    #[test]
    fn unknown_role_is_a_configuration_error() {
        let paths = RolePaths::default();
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        assert!(matches!(
            role_spec("mystery-role", &paths, runner),
            Err(Error::UnknownRole(_))
        ));
    }
}
