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

//! Keyed, reference-counted tunnel registry.
//!
//! The registry maps each [`TargetKey`] to at most one non-Closed tunnel.
//! Lookups take a short registry-wide lock; all slow work (spawn, probe,
//! kill) runs under the per-key slot lock only, so creation for unrelated
//! targets proceeds concurrently while creation for the *same* key is
//! strictly serialized: concurrent checkouts during creation wait on the
//! single in-flight attempt instead of spawning duplicates.

use crate::directory::JumpHostInfo;
use crate::error::{Result, RoutingError};
use crate::security::AuthorizedScope;
use crate::tunnel::cleanup::CleanupDaemon;
use crate::tunnel::launcher::TunnelLauncher;
use crate::tunnel::process::PooledTunnel;
use crate::tunnel::{TargetKey, TunnelState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Backoff between tunnel start retries; doubles per attempt.
const START_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Tuning knobs for the pool and its cleanup daemon.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrent distinct tunnels before checkout fails with
    /// [`RoutingError::PoolExhausted`].
    pub max_tunnels: usize,
    /// How long a zero-refcount tunnel is retained for reuse.
    pub idle_timeout: Duration,
    /// Cleanup daemon wake interval.
    pub sweep_interval: Duration,
    /// A probe younger than this is trusted on checkout without re-probing.
    pub health_check_ttl: Duration,
    /// Total budget for a tunnel subprocess to reach Ready.
    pub start_timeout: Duration,
    /// Bounded retries on tunnel start failure.
    pub start_retries: u32,
    /// Grace period between SIGTERM and force kill.
    pub terminate_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_tunnels: 32,
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            health_check_ttl: Duration::from_secs(5),
            start_timeout: Duration::from_secs(30),
            start_retries: 2,
            terminate_grace: Duration::from_secs(2),
        }
    }
}

/// One registry slot. The `Option` is the registry membership: `None` means
/// no live tunnel for that key, and a tunnel is closed and removed inside
/// the same slot-lock critical section, so a Closed entry is never
/// observable.
pub(crate) type Slot = Arc<Mutex<Option<PooledTunnel>>>;

/// Checkout handle returned by [`ConnectionPool::checkout`].
///
/// Callers never hold the tunnel or its process, only this lease; it must
/// be returned via [`ConnectionPool::checkin`] when the SSH operation is
/// done.
#[derive(Debug, Clone)]
pub struct TunnelLease {
    pub key: TargetKey,
    pub local_port: u16,
    pub tunnel_id: Uuid,
    slot: Slot,
}

/// Registry of live tunnels with reference-counted checkout.
pub struct ConnectionPool {
    launcher: Arc<dyn TunnelLauncher>,
    scope: AuthorizedScope,
    config: PoolConfig,
    slots: Arc<RwLock<HashMap<TargetKey, Slot>>>,
    /// Count of non-Closed tunnels, for the max_tunnels cap.
    active: Arc<AtomicUsize>,
    /// Cleanup daemon, started lazily on first pool use. The std mutex is
    /// the single initialization lock; it is never held across an await.
    daemon: std::sync::Mutex<Option<CleanupDaemon>>,
    shutdown: CancellationToken,
}

impl ConnectionPool {
    pub fn new(
        launcher: Arc<dyn TunnelLauncher>,
        scope: AuthorizedScope,
        config: PoolConfig,
    ) -> Self {
        Self {
            launcher,
            scope,
            config,
            slots: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(AtomicUsize::new(0)),
            daemon: std::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Check out a tunnel for `key`, reusing a live one when possible.
    ///
    /// A Ready entry with a recent-enough probe is handed out directly; a
    /// stale entry is re-probed first. An entry found dead is closed,
    /// removed and transparently recreated once; the failure is only
    /// surfaced (as [`RoutingError::TunnelHealth`]) if the recreation also
    /// fails. A miss creates the tunnel with bounded start retries.
    pub async fn checkout(&self, key: &TargetKey, jump_host: &JumpHostInfo) -> Result<TunnelLease> {
        self.ensure_daemon();

        let slot = {
            let mut slots = self.slots.write().await;
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        // Per-key serialization point: concurrent checkouts for the same
        // key queue here while one creation attempt is in flight.
        let mut entry = slot.lock().await;

        if let Some(tunnel) = entry.as_mut() {
            if tunnel.state() == TunnelState::Ready {
                let healthy = tunnel.probe_fresh(self.config.health_check_ttl)
                    || tunnel.health_check().await;
                if healthy {
                    tunnel.refcount += 1;
                    tunnel.last_used_at = Instant::now();
                    debug!(key = %key, refcount = tunnel.refcount, "Reusing pooled tunnel");
                    return Ok(TunnelLease {
                        key: key.clone(),
                        local_port: tunnel.local_port,
                        tunnel_id: tunnel.id,
                        slot: Arc::clone(&slot),
                    });
                }
                // Ready entry found dead right here: close, remove and
                // recreate once.
                warn!(key = %key, "Pooled tunnel found dead on checkout, recreating");
                close_entry(&mut entry, &self.active, self.config.terminate_grace).await;
                return self
                    .create_locked(key, jump_host, &mut entry, &slot)
                    .await
                    .map_err(|e| wrap_recreation_error(key, e));
            }
            // Degraded or otherwise unusable: drop it and fall through to
            // plain creation.
            close_entry(&mut entry, &self.active, self.config.terminate_grace).await;
        }

        self.create_locked(key, jump_host, &mut entry, &slot).await
    }

    /// Create a tunnel for `key` while holding its slot lock.
    async fn create_locked(
        &self,
        key: &TargetKey,
        jump_host: &JumpHostInfo,
        entry: &mut Option<PooledTunnel>,
        slot: &Slot,
    ) -> Result<TunnelLease> {
        // Reserve a registry place before the slow open so concurrent
        // creations for different keys cannot overshoot the cap together.
        // The guard also releases the reservation if the checkout future is
        // dropped mid-open by a batch deadline.
        let reserved = self.active.fetch_add(1, Ordering::SeqCst);
        let mut reservation = Reservation {
            active: &self.active,
            committed: false,
        };
        if reserved >= self.config.max_tunnels {
            return Err(RoutingError::PoolExhausted {
                active: reserved,
                max: self.config.max_tunnels,
            });
        }

        let mut attempt: u32 = 0;
        loop {
            match PooledTunnel::open(
                self.launcher.as_ref(),
                &self.scope,
                jump_host,
                key,
                &self.config,
            )
            .await
            {
                Ok(mut tunnel) => {
                    tunnel.refcount = 1;
                    let lease = TunnelLease {
                        key: key.clone(),
                        local_port: tunnel.local_port,
                        tunnel_id: tunnel.id,
                        slot: Arc::clone(slot),
                    };
                    *entry = Some(tunnel);
                    reservation.committed = true;
                    return Ok(lease);
                }
                // A scope failure is final; retrying cannot make the target
                // authorized.
                Err(e @ RoutingError::Security { .. }) => return Err(e),
                Err(e @ RoutingError::TunnelStart { .. })
                    if attempt < self.config.start_retries =>
                {
                    attempt += 1;
                    let backoff = START_RETRY_BACKOFF * 2u32.saturating_pow(attempt - 1);
                    warn!(key = %key, attempt, "Tunnel start failed, retrying: {e}");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Return a lease. At refcount zero the tunnel is kept open and its
    /// idle clock starts; fast back-to-back reuse must not pay startup cost
    /// again.
    pub async fn checkin(&self, lease: TunnelLease) {
        let mut entry = lease.slot.lock().await;
        let Some(tunnel) = entry.as_mut() else {
            return; // already reclaimed
        };
        if tunnel.id != lease.tunnel_id {
            return; // lease outlived its tunnel; a newer instance owns the key
        }
        if tunnel.refcount == 0 {
            warn!(key = %lease.key, "Unbalanced checkin ignored");
            return;
        }
        tunnel.refcount -= 1;
        if tunnel.refcount == 0 {
            tunnel.last_used_at = Instant::now();
            debug!(key = %lease.key, "Tunnel idle, retained for reuse");
        }
    }

    /// Force-close the tunnel for `key`, if any, regardless of refcount.
    pub async fn close(&self, key: &TargetKey) {
        let slot = {
            let slots = self.slots.read().await;
            slots.get(key).cloned()
        };
        if let Some(slot) = slot {
            let mut entry = slot.lock().await;
            close_entry(&mut entry, &self.active, self.config.terminate_grace).await;
        }
    }

    /// Run one cleanup sweep immediately, outside the daemon's schedule.
    pub async fn sweep_now(&self) {
        crate::tunnel::cleanup::sweep_once(&self.slots, &self.active, &self.config).await;
    }

    /// Force-close every tunnel regardless of refcount and stop the
    /// cleanup daemon. Used once at process termination.
    pub async fn shutdown_all(&self) {
        self.shutdown.cancel();

        let daemon = match self.daemon.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(daemon) = daemon {
            daemon.stop().await;
        }

        let slots: Vec<Slot> = {
            let mut map = self.slots.write().await;
            map.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            let mut entry = slot.lock().await;
            close_entry(&mut entry, &self.active, self.config.terminate_grace).await;
        }
        debug!("Connection pool drained");
    }

    /// Number of non-Closed tunnels currently registered.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Refcount of the live tunnel for `key`, if one exists.
    pub async fn refcount(&self, key: &TargetKey) -> Option<u32> {
        let slot = {
            let slots = self.slots.read().await;
            slots.get(key).cloned()
        }?;
        let entry = slot.lock().await;
        entry.as_ref().map(|t| t.refcount())
    }

    /// Whether a live (non-Closed) tunnel exists for `key`.
    pub async fn contains(&self, key: &TargetKey) -> bool {
        self.refcount(key).await.is_some()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Start the cleanup daemon on first use; exactly once per pool.
    fn ensure_daemon(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if let Ok(mut guard) = self.daemon.lock() {
            if guard.is_none() {
                *guard = Some(CleanupDaemon::spawn(
                    Arc::clone(&self.slots),
                    Arc::clone(&self.active),
                    self.config.clone(),
                    self.shutdown.child_token(),
                ));
            }
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        // Best-effort: stops the daemon; subprocesses are covered by
        // kill_on_drop on their handles.
        self.shutdown.cancel();
    }
}

/// Classify a recreation failure. Start failures become
/// [`RoutingError::TunnelHealth`] so the caller sees that an existing
/// tunnel died; loud errors keep their own variant because their handling
/// (never downgraded to unreachable) must not depend on which checkout path
/// hit them.
fn wrap_recreation_error(key: &TargetKey, e: RoutingError) -> RoutingError {
    match e {
        e @ (RoutingError::Security { .. } | RoutingError::PoolExhausted { .. }) => e,
        e => RoutingError::TunnelHealth {
            key: key.clone(),
            source: Box::new(e),
        },
    }
}

/// Holds one place in the active-tunnel count until committed to a
/// registered tunnel. Dropping an uncommitted reservation gives the place
/// back, including when the owning future is cancelled.
struct Reservation<'a> {
    active: &'a AtomicUsize,
    committed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Close the tunnel held in `entry` and remove it from the registry, all
/// within the caller's slot-lock critical section.
pub(crate) async fn close_entry(
    entry: &mut Option<PooledTunnel>,
    active: &AtomicUsize,
    grace: Duration,
) {
    if let Some(mut tunnel) = entry.take() {
        tunnel.close(grace).await;
        active.fetch_sub(1, Ordering::SeqCst);
    }
}
