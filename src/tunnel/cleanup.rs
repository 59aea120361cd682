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

//! Background reclamation of idle and dead tunnels.
//!
//! One daemon task per pool, woken on a fixed interval. Each wake closes
//! tunnels that sat at refcount zero past the idle timeout, tunnels whose
//! health check fails, and anything already marked Degraded. Cleanup is
//! fail-open: a lost sweep is logged and the next wake tries again. The
//! periodic sweep alone cannot promise termination before the host process
//! exits, so `shutdown_all` is additionally wired to the process-exit path
//! in `main`.

use crate::tunnel::pool::{close_entry, PoolConfig, Slot};
use crate::tunnel::{TargetKey, TunnelState};
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

pub(crate) struct CleanupDaemon {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl CleanupDaemon {
    pub(crate) fn spawn(
        slots: Arc<RwLock<HashMap<TargetKey, Slot>>>,
        active: Arc<AtomicUsize>,
        config: PoolConfig,
        token: CancellationToken,
    ) -> Self {
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            debug!(interval = ?config.sweep_interval, "Cleanup daemon started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        sweep_once(&slots, &active, &config).await;
                    }
                    _ = loop_token.cancelled() => break,
                }
            }
            debug!("Cleanup daemon stopped");
        });
        Self { token, handle }
    }

    /// Signal the loop and join it.
    pub(crate) async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

/// One reclamation pass over the registry.
///
/// Takes the registry-wide lock only to snapshot the slot list; each slot
/// is then inspected under its own lock so an in-flight checkout for one
/// key never stalls the sweep of another.
pub(crate) async fn sweep_once(
    slots: &RwLock<HashMap<TargetKey, Slot>>,
    active: &AtomicUsize,
    config: &PoolConfig,
) {
    let snapshot: Vec<(TargetKey, Slot)> = {
        let map = slots.read().await;
        map.iter().map(|(k, s)| (k.clone(), Arc::clone(s))).collect()
    };

    let mut reclaimed = 0usize;
    for (key, slot) in snapshot {
        let mut entry = slot.lock().await;
        let Some(tunnel) = entry.as_mut() else {
            continue;
        };

        let reclaim = match tunnel.state() {
            TunnelState::Ready => {
                if tunnel.refcount() == 0 && tunnel.idle_for() >= config.idle_timeout {
                    trace!(key = %key, idle = ?tunnel.idle_for(), "Tunnel idle past timeout");
                    true
                } else if tunnel.probe_fresh(config.health_check_ttl) {
                    // Recently verified; same trust window as checkout.
                    false
                } else {
                    // A silent subprocess crash is only ever discovered by
                    // this probe.
                    !tunnel.health_check().await
                }
            }
            TunnelState::Degraded => true,
            TunnelState::Starting | TunnelState::Closed => false,
        };

        if reclaim {
            close_entry(&mut entry, active, config.terminate_grace).await;
            reclaimed += 1;
        }
    }

    // Drop empty slots so the registry does not accumulate dead keys. A
    // slot whose lock is contended is left for the next sweep.
    {
        let mut map = slots.write().await;
        map.retain(|_, slot| match slot.try_lock() {
            Ok(entry) => entry.is_some(),
            Err(_) => true,
        });
    }

    if reclaimed > 0 {
        info!("Reclaimed {reclaimed} tunnels");
    }
}
