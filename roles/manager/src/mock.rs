// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Recording service fake for role lifecycle tests.

use crate::spec::RoleService;
use crate::Error;
use std::sync::Mutex;

#[derive(Default)]
pub struct MockRoleService {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    running: bool,
    healthy_override: Option<bool>,
    fail_starts: u32,
    calls: Vec<String>,
    configs: Vec<String>,
}

impl MockRoleService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_starts(&self, count: u32) {
        self.state.lock().unwrap().fail_starts = count;
    }

    /// Force health() to a fixed answer regardless of running state.
    pub fn set_healthy(&self, healthy: Option<bool>) {
        self.state.lock().unwrap().healthy_override = healthy;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn configs(&self) -> Vec<String> {
        self.state.lock().unwrap().configs.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }
}

impl RoleService for MockRoleService {
    fn prepare(&self, config: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("prepare".to_string());
        state.configs.push(config.to_string());
        Ok(())
    }

    fn start(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("start".to_string());
        if state.fail_starts > 0 {
            state.fail_starts -= 1;
            return Err(Error::Service("mock start failure".to_string()));
        }
        state.running = true;
        Ok(())
    }

    fn reload(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("reload".to_string());
        Ok(())
    }

    fn stop(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("stop".to_string());
        state.running = false;
        Ok(())
    }

    fn health(&self) -> Result<bool, Error> {
        let state = self.state.lock().unwrap();
        Ok(state.healthy_override.unwrap_or(state.running))
    }
}
