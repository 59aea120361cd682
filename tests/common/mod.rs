// Copyright 2025 vmssh contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared fixtures: an in-memory tunnel launcher plus inventory builders.

#![allow(dead_code)]

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

use vmssh::directory::{JumpHostInfo, JumpHostTier};
use vmssh::node::Vm;
use vmssh::tunnel::{LaunchRequest, PoolConfig, TargetKey, TunnelHandle, TunnelLauncher};

/// In-memory stand-in for the external forwarding binary.
///
/// On a successful launch it binds the requested loopback port itself, so
/// the pool's readiness probe and health checks see a live listener without
/// any real subprocess. Failed launches return a handle that is already
/// dead and carries scripted stderr.
pub struct FakeLauncher {
    /// Launch attempts that fail before successes begin.
    fail_first: Mutex<usize>,
    /// When set, every launch fails from now on.
    always_fail: Mutex<bool>,
    fail_stderr: String,
    launch_delay: Option<Duration>,
    launches: AtomicUsize,
    handles: Mutex<Vec<Arc<Mutex<HandleInner>>>>,
}

struct HandleInner {
    listener: Option<TcpListener>,
    running: bool,
    stderr: String,
}

impl FakeLauncher {
    /// Every launch succeeds and listens on the requested port.
    pub fn listening() -> Self {
        Self::build(0, false, String::new(), None)
    }

    /// Every launch fails with `stderr`.
    pub fn failing(stderr: &str) -> Self {
        Self::build(0, true, stderr.to_string(), None)
    }

    /// The first `n` launches fail with `stderr`, later ones succeed.
    pub fn fail_times(n: usize, stderr: &str) -> Self {
        Self::build(n, false, stderr.to_string(), None)
    }

    /// Every launch succeeds but only after `delay`.
    pub fn delayed(delay: Duration) -> Self {
        Self::build(0, false, String::new(), Some(delay))
    }

    fn build(
        fail_first: usize,
        always_fail: bool,
        fail_stderr: String,
        launch_delay: Option<Duration>,
    ) -> Self {
        Self {
            fail_first: Mutex::new(fail_first),
            always_fail: Mutex::new(always_fail),
            fail_stderr,
            launch_delay,
            launches: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Total launch attempts, successful or not.
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Handles that are still alive.
    pub fn running_handles(&self) -> usize {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.lock().unwrap().running)
            .count()
    }

    /// Simulate a silent crash of every spawned tunnel: the process is gone
    /// and its port stops accepting.
    pub fn kill_all(&self) {
        for handle in self.handles.lock().unwrap().iter() {
            let mut inner = handle.lock().unwrap();
            inner.listener = None;
            inner.running = false;
        }
    }

    /// All launches fail from this point on.
    pub fn fail_from_now(&self) {
        *self.always_fail.lock().unwrap() = true;
    }
}

#[async_trait]
impl TunnelLauncher for FakeLauncher {
    async fn launch(&self, request: &LaunchRequest) -> io::Result<Box<dyn TunnelHandle>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.launch_delay {
            tokio::time::sleep(delay).await;
        }

        let fail = {
            let mut remaining = self.fail_first.lock().unwrap();
            if *self.always_fail.lock().unwrap() {
                true
            } else if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        };

        if fail {
            let inner = Arc::new(Mutex::new(HandleInner {
                listener: None,
                running: false,
                stderr: self.fail_stderr.clone(),
            }));
            return Ok(Box::new(FakeHandle { inner }));
        }

        let listener = TcpListener::bind(("127.0.0.1", request.local_port)).await?;
        let inner = Arc::new(Mutex::new(HandleInner {
            listener: Some(listener),
            running: true,
            stderr: String::new(),
        }));
        self.handles.lock().unwrap().push(Arc::clone(&inner));
        Ok(Box::new(FakeHandle { inner }))
    }
}

struct FakeHandle {
    inner: Arc<Mutex<HandleInner>>,
}

#[async_trait]
impl TunnelHandle for FakeHandle {
    fn is_running(&mut self) -> bool {
        self.inner.lock().unwrap().running
    }

    async fn terminate(&mut self, _grace: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.listener = None;
        inner.running = false;
    }

    fn stderr_tail(&self) -> String {
        self.inner.lock().unwrap().stderr.clone()
    }
}

/// Pool config with short timeouts and a quiet cleanup daemon, so tests
/// control reclamation explicitly via `sweep_now`.
pub fn quiet_pool_config() -> PoolConfig {
    PoolConfig {
        max_tunnels: 8,
        idle_timeout: Duration::from_secs(60),
        sweep_interval: Duration::from_secs(60),
        health_check_ttl: Duration::from_secs(5),
        start_timeout: Duration::from_secs(5),
        start_retries: 0,
        terminate_grace: Duration::from_millis(50),
    }
}

pub fn key(resource_id: &str) -> TargetKey {
    TargetKey::new("bastion-1", resource_id, 22)
}

pub fn jump_host(id: &str, network: &str) -> JumpHostInfo {
    JumpHostInfo {
        id: id.to_string(),
        name: id.to_string(),
        networks: vec![network.to_string()],
        tier: JumpHostTier::Standard,
    }
}

pub fn basic_jump_host(id: &str, network: &str) -> JumpHostInfo {
    JumpHostInfo {
        tier: JumpHostTier::Basic,
        ..jump_host(id, network)
    }
}

pub fn private_vm(name: &str, network: &str) -> Vm {
    Vm {
        name: name.to_string(),
        resource_id: format!("/subs/s1/vms/{name}"),
        network: network.to_string(),
        public_address: None,
        port: 22,
        username: "ops".to_string(),
        key_path: None,
    }
}

pub fn public_vm(name: &str, address: &str, network: &str) -> Vm {
    Vm {
        public_address: Some(address.to_string()),
        ..private_vm(name, network)
    }
}
