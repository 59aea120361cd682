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

//! One pooled tunnel: open, probe, health-check, close.

use crate::directory::JumpHostInfo;
use crate::error::{Result, RoutingError};
use crate::security::AuthorizedScope;
use crate::tunnel::launcher::{LaunchRequest, TunnelHandle, TunnelLauncher};
use crate::tunnel::pool::PoolConfig;
use crate::tunnel::{TargetKey, TunnelState};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Timeout for a single TCP connect probe.
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Initial probe backoff; doubles per attempt up to [`PROBE_BACKOFF_CAP`].
const PROBE_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const PROBE_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// A live tunnel owned by the connection pool.
///
/// Owns the forwarding subprocess exclusively. The reference count is only
/// ever mutated by the pool while it holds the per-key lock.
pub struct PooledTunnel {
    pub id: Uuid,
    pub key: TargetKey,
    pub local_port: u16,
    handle: Box<dyn TunnelHandle>,
    state: TunnelState,
    pub(crate) refcount: u32,
    pub(crate) created_at: Instant,
    pub(crate) last_used_at: Instant,
    last_probe_ok: Instant,
}

impl std::fmt::Debug for PooledTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledTunnel")
            .field("id", &self.id)
            .field("key", &self.key.to_string())
            .field("local_port", &self.local_port)
            .field("state", &self.state)
            .field("refcount", &self.refcount)
            .finish()
    }
}

impl PooledTunnel {
    /// Open a new tunnel to `key` through `jump_host`.
    ///
    /// The authorized-scope check runs before any OS resource is touched;
    /// on a scope failure the launcher is never invoked. The local port is
    /// requested from the OS (`127.0.0.1:0`) rather than scanned from a
    /// fixed range, so the pool never collides with itself.
    pub(crate) async fn open(
        launcher: &dyn TunnelLauncher,
        scope: &AuthorizedScope,
        jump_host: &JumpHostInfo,
        key: &TargetKey,
        config: &PoolConfig,
    ) -> Result<PooledTunnel> {
        scope.authorize(&key.resource_id)?;

        let local_port = allocate_local_port().await?;
        let request = LaunchRequest {
            jump_host: jump_host.clone(),
            resource_id: key.resource_id.clone(),
            target_port: key.port,
            local_port,
        };

        debug!(key = %key, local_port, "Starting tunnel subprocess");
        let mut handle =
            launcher
                .launch(&request)
                .await
                .map_err(|e| RoutingError::TunnelStart {
                    key: key.clone(),
                    reason: format!("failed to spawn forwarding subprocess: {e}"),
                    stderr_tail: String::new(),
                })?;

        // Starting state: poll the local port until it accepts, the
        // subprocess dies, or the overall start timeout elapses.
        let deadline = Instant::now() + config.start_timeout;
        let mut backoff = PROBE_BACKOFF_INITIAL;
        loop {
            if !handle.is_running() {
                let stderr_tail = handle.stderr_tail();
                handle.terminate(config.terminate_grace).await;
                return Err(RoutingError::TunnelStart {
                    key: key.clone(),
                    reason: "subprocess exited before the local port accepted connections"
                        .to_string(),
                    stderr_tail,
                });
            }

            if probe_port(local_port).await {
                let now = Instant::now();
                debug!(key = %key, local_port, "Tunnel ready");
                return Ok(PooledTunnel {
                    id: Uuid::new_v4(),
                    key: key.clone(),
                    local_port,
                    handle,
                    state: TunnelState::Ready,
                    refcount: 0,
                    created_at: now,
                    last_used_at: now,
                    last_probe_ok: now,
                });
            }

            if Instant::now() + backoff >= deadline {
                let stderr_tail = handle.stderr_tail();
                handle.terminate(config.terminate_grace).await;
                return Err(RoutingError::TunnelStart {
                    key: key.clone(),
                    reason: format!(
                        "local port {local_port} did not accept connections within {:?}",
                        config.start_timeout
                    ),
                    stderr_tail,
                });
            }

            trace!(key = %key, ?backoff, "Tunnel not ready yet, backing off");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(PROBE_BACKOFF_CAP);
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    /// Whether the last successful probe is recent enough to skip a fresh
    /// health check on checkout.
    pub(crate) fn probe_fresh(&self, ttl: Duration) -> bool {
        self.last_probe_ok.elapsed() <= ttl
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    /// Lightweight liveness probe: subprocess still running and local port
    /// still accepting. A silent subprocess crash is only ever discovered
    /// here. Failure transitions Ready → Degraded.
    pub(crate) async fn health_check(&mut self) -> bool {
        if self.state == TunnelState::Closed {
            return false;
        }

        if !self.handle.is_running() {
            warn!(key = %self.key, "Tunnel subprocess is gone");
            self.state = TunnelState::Degraded;
            return false;
        }

        if probe_port(self.local_port).await {
            self.last_probe_ok = Instant::now();
            true
        } else {
            warn!(key = %self.key, local_port = self.local_port, "Tunnel port stopped accepting");
            self.state = TunnelState::Degraded;
            false
        }
    }

    /// Idempotent close: graceful terminate, brief wait, force kill.
    pub(crate) async fn close(&mut self, grace: Duration) {
        if self.state == TunnelState::Closed {
            return;
        }
        debug!(key = %self.key, local_port = self.local_port, "Closing tunnel");
        self.handle.terminate(grace).await;
        self.state = TunnelState::Closed;
    }
}

/// Ask the OS for any free loopback port.
async fn allocate_local_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

async fn probe_port(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}
