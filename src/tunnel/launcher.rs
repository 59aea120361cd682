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

//! Forwarding-subprocess launcher capability.
//!
//! The external tunnel binary is environment-dependent, so spawning it is
//! abstracted behind [`TunnelLauncher`] and injected into the pool rather
//! than called through a global. Production uses [`ProcessLauncher`]; tests
//! inject an in-memory fake that binds the assigned port itself.

use crate::directory::JumpHostInfo;
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, trace, warn};

/// Everything the external forwarding binary needs on its command line.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub jump_host: JumpHostInfo,
    pub resource_id: String,
    pub target_port: u16,
    pub local_port: u16,
}

/// Handle to one spawned forwarding process.
///
/// Exclusively owned by the pool entry it belongs to; liveness polling and
/// termination go through this handle only.
#[async_trait]
pub trait TunnelHandle: Send {
    /// Whether the subprocess is still alive.
    fn is_running(&mut self) -> bool;

    /// Graceful terminate, then force kill once `grace` elapses. Idempotent.
    async fn terminate(&mut self, grace: Duration);

    /// Tail of the captured stderr, the primary diagnostic on startup
    /// failure.
    fn stderr_tail(&self) -> String;
}

/// Capability that spawns the external forwarding subprocess.
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> io::Result<Box<dyn TunnelHandle>>;
}

/// Bounded capture buffer for subprocess stderr. Keeps only the tail so a
/// chatty subprocess cannot grow memory without bound.
#[derive(Debug)]
pub(crate) struct StderrBuffer {
    max_bytes: usize,
    data: Vec<u8>,
}

impl StderrBuffer {
    pub(crate) fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            data: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
        if self.data.len() > self.max_bytes {
            let excess = self.data.len() - self.max_bytes;
            self.data.drain(..excess);
        }
    }

    pub(crate) fn tail(&self) -> String {
        String::from_utf8_lossy(&self.data).trim().to_string()
    }
}

/// Production launcher: spawns the configured tunnel binary.
///
/// The child is spawned with `kill_on_drop` so a checkout cancelled mid-open
/// (batch deadline) can never leak a subprocess.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

#[async_trait]
impl TunnelLauncher for ProcessLauncher {
    async fn launch(&self, request: &LaunchRequest) -> io::Result<Box<dyn TunnelHandle>> {
        let mut child = Command::new(&self.program)
            .arg("tunnel")
            .arg("--jump-host")
            .arg(&request.jump_host.id)
            .arg("--target")
            .arg(&request.resource_id)
            .arg("--target-port")
            .arg(request.target_port.to_string())
            .arg("--local-port")
            .arg(request.local_port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        debug!(
            program = %self.program.display(),
            jump_host = %request.jump_host.id,
            local_port = request.local_port,
            pid = child.id(),
            "Spawned forwarding subprocess"
        );

        let buffer = Arc::new(Mutex::new(StderrBuffer::new(8 * 1024)));
        if let Some(mut stderr) = child.stderr.take() {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut chunk = [0u8; 1024];
                loop {
                    match stderr.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Ok(mut buf) = buffer.lock() {
                                buf.push(&chunk[..n]);
                            }
                        }
                    }
                }
            });
        }

        Ok(Box::new(ProcessHandle { child, buffer }))
    }
}

struct ProcessHandle {
    child: Child,
    buffer: Arc<Mutex<StderrBuffer>>,
}

#[async_trait]
impl TunnelHandle for ProcessHandle {
    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self, grace: Duration) {
        if !self.is_running() {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                trace!(pid, "SIGTERM failed: {e}");
            }
            if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
                return;
            }
        }
        #[cfg(not(unix))]
        let _ = grace;

        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill forwarding subprocess: {e}");
        }
    }

    fn stderr_tail(&self) -> String {
        self.buffer
            .lock()
            .map(|buf| buf.tail())
            .unwrap_or_default()
    }
}
