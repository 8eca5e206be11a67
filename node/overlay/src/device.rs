// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! The kernel-facing seam of the overlay.
//!
//! The mesh logic only knows how to render a configuration blob and ask for
//! the interface to be brought up, synced in place, or torn down. The
//! production device shells out to the wireguard userspace tools; tests use
//! the recording fake.

use crate::Error;
use log::debug;
use std::path::Path;
use std::process::Command;

pub trait TunnelDevice: Send + Sync {
    fn is_up(&self, interface: &str) -> Result<bool, Error>;
    fn up(&self, interface: &str, config_path: &Path) -> Result<(), Error>;
    /// Reload the running interface to match the config in one step:
    /// add new peers, update changed ones, remove absent ones.
    fn sync(&self, interface: &str, config_path: &Path) -> Result<(), Error>;
    fn down(&self, interface: &str, config_path: &Path) -> Result<(), Error>;
}

/// Drives `wg-quick`/`wg`. The config file is named `<interface>.conf`, so
/// wg-quick derives the interface name from the path.
pub struct WgQuickDevice;

impl WgQuickDevice {
    fn run(program: &str, args: &[&str]) -> Result<(), Error> {
        debug!("running {program} {}", args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::Device(format!("{program}: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Device(format!(
                "{program} {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

impl TunnelDevice for WgQuickDevice {
    fn is_up(&self, interface: &str) -> Result<bool, Error> {
        let output = Command::new("ip")
            .args(["link", "show", "dev", interface])
            .output()
            .map_err(|e| Error::Device(format!("ip link: {e}")))?;
        Ok(output.status.success())
    }

    fn up(&self, _interface: &str, config_path: &Path) -> Result<(), Error> {
        Self::run("wg-quick", &["up", &config_path.display().to_string()])
    }

    fn sync(&self, interface: &str, config_path: &Path) -> Result<(), Error> {
        // `wg syncconf` rejects wg-quick-only keys, so strip first.
        let stripped = Command::new("wg-quick")
            .args(["strip", &config_path.display().to_string()])
            .output()
            .map_err(|e| Error::Device(format!("wg-quick strip: {e}")))?;
        if !stripped.status.success() {
            return Err(Error::Device(format!(
                "wg-quick strip failed: {}",
                String::from_utf8_lossy(&stripped.stderr).trim()
            )));
        }
        let dir = config_path
            .parent()
            .ok_or_else(|| Error::Device("config path has no parent".to_string()))?;
        let stripped_path = grove_utils::write_to_file(
            &stripped.stdout,
            dir,
            &format!("{interface}.stripped.conf"),
        )
        .map_err(|e| Error::Device(e.to_string()))?;
        grove_utils::set_user_perm(&stripped_path).map_err(|e| Error::Device(e.to_string()))?;
        let result = Self::run(
            "wg",
            &[
                "syncconf",
                interface,
                &stripped_path.display().to_string(),
            ],
        );
        let _ = std::fs::remove_file(&stripped_path);
        result
    }

    fn down(&self, _interface: &str, config_path: &Path) -> Result<(), Error> {
        Self::run("wg-quick", &["down", &config_path.display().to_string()])
    }
}

/// Recording fake for tests: tracks link state, applied configs, and can be
/// told to fail the next N bring-up attempts.
#[derive(Default)]
pub struct MockDevice {
    state: std::sync::Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    up: bool,
    fail_ups: u32,
    calls: Vec<String>,
    applied_configs: Vec<String>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_ups(&self, count: u32) {
        self.state.lock().unwrap().fail_ups = count;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Configurations applied by `up` and `sync`, in order.
    pub fn applied_configs(&self) -> Vec<String> {
        self.state.lock().unwrap().applied_configs.clone()
    }
}

impl TunnelDevice for MockDevice {
    fn is_up(&self, _interface: &str) -> Result<bool, Error> {
        Ok(self.state.lock().unwrap().up)
    }

    fn up(&self, interface: &str, config_path: &Path) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("up {interface}"));
        if state.fail_ups > 0 {
            state.fail_ups -= 1;
            return Err(Error::Device("mock up failure".to_string()));
        }
        state.up = true;
        state
            .applied_configs
            .push(std::fs::read_to_string(config_path).unwrap_or_default());
        Ok(())
    }

    fn sync(&self, interface: &str, config_path: &Path) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("sync {interface}"));
        state
            .applied_configs
            .push(std::fs::read_to_string(config_path).unwrap_or_default());
        Ok(())
    }

    fn down(&self, interface: &str, _config_path: &Path) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("down {interface}"));
        state.up = false;
        Ok(())
    }
}
