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

//! Tunnel subprocess lifecycle and pooling.
//!
//! A tunnel is one external forwarding subprocess bound to one local
//! loopback port; any TCP connection accepted on `127.0.0.1:<local_port>` is
//! relayed end-to-end to the target resource through the jump host. This
//! module owns the full lifecycle:
//!
//! * [`TunnelLauncher`]: injected capability that spawns the external
//!   forwarding binary (real subprocess in production, in-memory fake in
//!   tests)
//! * [`PooledTunnel`]: opens, probes, health-checks and closes exactly one
//!   subprocess
//! * [`ConnectionPool`]: keyed, reference-counted registry with per-key
//!   creation serialization
//! * `cleanup`: background sweeper reclaiming idle and dead tunnels
//!
//! The pool exclusively owns every tunnel's process handle. Callers only
//! ever hold a [`TunnelLease`]; no other component may signal or kill the
//! subprocess, which is what makes the shutdown guarantee sound.

pub mod cleanup;
pub mod launcher;
pub mod pool;
pub mod process;

pub use launcher::{LaunchRequest, ProcessLauncher, TunnelHandle, TunnelLauncher};
pub use pool::{ConnectionPool, PoolConfig, TunnelLease};
pub use process::PooledTunnel;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identity of one forwarding destination.
///
/// Two VMs behind the same jump host always have distinct keys; keying is
/// per target, not per jump host.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetKey {
    pub jump_host_id: String,
    pub resource_id: String,
    pub port: u16,
}

impl TargetKey {
    pub fn new(
        jump_host_id: impl Into<String>,
        resource_id: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            jump_host_id: jump_host_id.into(),
            resource_id: resource_id.into(),
            port,
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.jump_host_id, self.resource_id, self.port)
    }
}

/// Lifecycle state of a pooled tunnel.
///
/// Starting → Ready on first successful probe, or Failed (terminal, never
/// registered). Ready → Degraded on a failed health check, and Degraded or
/// Ready → Closed on reclamation or shutdown. Closed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Starting,
    Ready,
    Degraded,
    Closed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Starting => "starting",
            TunnelState::Ready => "ready",
            TunnelState::Degraded => "degraded",
            TunnelState::Closed => "closed",
        };
        f.write_str(s)
    }
}
