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

//! Idle and dead tunnel reclamation.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use vmssh::security::AuthorizedScope;
use vmssh::tunnel::{ConnectionPool, PoolConfig};

fn pool_with(launcher: Arc<FakeLauncher>, config: PoolConfig) -> ConnectionPool {
    ConnectionPool::new(launcher, AuthorizedScope::unrestricted(), config)
}

#[tokio::test]
async fn test_idle_tunnel_is_reclaimed_only_after_timeout() {
    let launcher = Arc::new(FakeLauncher::listening());
    let config = PoolConfig {
        idle_timeout: Duration::from_millis(300),
        ..quiet_pool_config()
    };
    let pool = pool_with(Arc::clone(&launcher), config);
    let jh = jump_host("bastion-1", "vnet-prod");
    let k = key("/subs/s1/vms/web-0");

    let lease = pool.checkout(&k, &jh).await.unwrap();
    pool.checkin(lease).await;

    // Well inside the idle window the tunnel survives a sweep.
    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.sweep_now().await;
    assert!(pool.contains(&k).await);

    // Past the window it is closed and removed.
    tokio::time::sleep(Duration::from_millis(400)).await;
    pool.sweep_now().await;
    assert!(!pool.contains(&k).await);
    assert_eq!(pool.active_count(), 0);
    assert_eq!(launcher.running_handles(), 0);
    pool.shutdown_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_eligibility_flips_exactly_at_the_timeout() {
    let launcher = Arc::new(FakeLauncher::listening());
    let config = PoolConfig {
        idle_timeout: Duration::from_millis(300),
        // Trust the startup probe for the whole test; the sweeps below
        // decide purely on idle time.
        health_check_ttl: Duration::from_secs(3600),
        ..quiet_pool_config()
    };
    let pool = pool_with(Arc::clone(&launcher), config);
    let jh = jump_host("bastion-1", "vnet-prod");
    let k = key("/subs/s1/vms/web-0");

    let lease = pool.checkout(&k, &jh).await.unwrap();
    pool.checkin(lease).await;

    // One tick short of the idle timeout: not eligible.
    tokio::time::advance(Duration::from_millis(299)).await;
    pool.sweep_now().await;
    assert!(pool.contains(&k).await, "idle 299ms of 300ms must survive");

    // Exactly at the idle timeout: eligible.
    tokio::time::advance(Duration::from_millis(1)).await;
    pool.sweep_now().await;
    assert!(!pool.contains(&k).await, "idle exactly 300ms must be reclaimed");
    assert_eq!(pool.active_count(), 0);
    assert_eq!(launcher.running_handles(), 0);
    pool.shutdown_all().await;
}

#[tokio::test]
async fn test_checked_out_tunnel_is_never_idle_reclaimed() {
    let launcher = Arc::new(FakeLauncher::listening());
    let config = PoolConfig {
        idle_timeout: Duration::from_millis(100),
        ..quiet_pool_config()
    };
    let pool = pool_with(launcher, config);
    let jh = jump_host("bastion-1", "vnet-prod");
    let k = key("/subs/s1/vms/web-0");

    let lease = pool.checkout(&k, &jh).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    pool.sweep_now().await;

    // Held lease: the idle clock has not started.
    assert!(pool.contains(&k).await);
    assert_eq!(pool.refcount(&k).await, Some(1));

    pool.checkin(lease).await;
    pool.shutdown_all().await;
}

#[tokio::test]
async fn test_dead_tunnel_is_reclaimed_even_while_checked_out() {
    let launcher = Arc::new(FakeLauncher::listening());
    let config = PoolConfig {
        // Make the sweep probe rather than trust the startup probe.
        health_check_ttl: Duration::ZERO,
        ..quiet_pool_config()
    };
    let pool = pool_with(Arc::clone(&launcher), config);
    let jh = jump_host("bastion-1", "vnet-prod");
    let k = key("/subs/s1/vms/web-0");

    let lease = pool.checkout(&k, &jh).await.unwrap();
    launcher.kill_all();

    pool.sweep_now().await;
    assert!(!pool.contains(&k).await);
    assert_eq!(pool.active_count(), 0);

    // The orphaned lease is returned harmlessly.
    pool.checkin(lease).await;
    pool.shutdown_all().await;
}

#[tokio::test]
async fn test_daemon_sweeps_without_manual_triggering() {
    let launcher = Arc::new(FakeLauncher::listening());
    let config = PoolConfig {
        idle_timeout: Duration::from_millis(100),
        sweep_interval: Duration::from_millis(50),
        ..quiet_pool_config()
    };
    let pool = pool_with(Arc::clone(&launcher), config);
    let jh = jump_host("bastion-1", "vnet-prod");
    let k = key("/subs/s1/vms/web-0");

    let lease = pool.checkout(&k, &jh).await.unwrap();
    pool.checkin(lease).await;
    assert!(pool.contains(&k).await);

    // The daemon started by the first checkout reclaims on its own.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!pool.contains(&k).await);
    assert_eq!(launcher.running_handles(), 0);
    pool.shutdown_all().await;
}
