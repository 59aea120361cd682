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

//! Batch route resolution.

use crate::error::RoutingError;
use crate::node::{SshEndpoint, Vm};
use crate::routing::detector::{RouteDecision, RouteDetector};
use crate::tunnel::{ConnectionPool, TunnelLease};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error};

/// Options for one resolve batch.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Bounded worker concurrency across the batch.
    pub max_parallel: usize,
    /// Overall deadline; in-flight detection and probes abort early and
    /// surface as unreachable rather than blocking the batch.
    pub deadline: Option<Duration>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            max_parallel: 16,
            deadline: None,
        }
    }
}

/// How a reachable endpoint was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteVia {
    Direct,
    Bastion { jump_host_id: String },
}

/// A ready-to-use route for one VM.
///
/// The endpoint is structurally identical for both variants of [`RouteVia`];
/// downstream SSH execution never learns whether it is tunneled. A bastion
/// route additionally carries the lease that must be returned via
/// [`ConnectionPool::checkin`] when the operation is done.
#[derive(Debug)]
pub struct ResolvedRoute {
    pub endpoint: SshEndpoint,
    pub via: RouteVia,
    pub lease: Option<TunnelLease>,
}

/// Result for one VM in a batch.
#[derive(Debug)]
pub enum RouteResult {
    Reachable(ResolvedRoute),
    /// No route; reported one line per VM, never raised.
    Unreachable { reason: String },
    /// A loud checkout failure (security, pool exhaustion). Never silently
    /// downgraded to unreachable.
    Failed(RoutingError),
}

/// One outcome per input VM, in input order.
#[derive(Debug)]
pub struct RouteOutcome {
    pub vm: Vm,
    pub result: RouteResult,
}

/// Top-level entry point: detection plus tunnel checkout for a batch.
pub struct RoutingResolver {
    detector: Arc<RouteDetector>,
    pool: Arc<ConnectionPool>,
}

impl RoutingResolver {
    pub fn new(detector: RouteDetector, pool: Arc<ConnectionPool>) -> Self {
        Self {
            detector: Arc::new(detector),
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Resolve a batch of VMs, order preserved.
    ///
    /// Every VM gets an independent outcome; a per-VM failure never aborts
    /// the batch.
    pub async fn resolve(&self, vms: &[Vm], options: &ResolveOptions) -> Vec<RouteOutcome> {
        let semaphore = Arc::new(Semaphore::new(options.max_parallel.max(1)));
        let deadline_at = options.deadline.map(|d| Instant::now() + d);

        let tasks: Vec<_> = vms
            .iter()
            .cloned()
            .map(|vm| {
                let detector = Arc::clone(&self.detector);
                let pool = Arc::clone(&self.pool);
                let semaphore = Arc::clone(&semaphore);

                tokio::spawn(async move {
                    let work = async {
                        let _permit = match semaphore.acquire().await {
                            Ok(permit) => permit,
                            Err(e) => {
                                return RouteResult::Unreachable {
                                    reason: format!("worker pool closed: {e}"),
                                };
                            }
                        };
                        resolve_one(&detector, &pool, &vm).await
                    };

                    let result = match deadline_at {
                        Some(at) => match tokio::time::timeout_at(at, work).await {
                            Ok(result) => result,
                            Err(_) => RouteResult::Unreachable {
                                reason: "deadline exceeded while resolving route".to_string(),
                            },
                        },
                        None => work.await,
                    };

                    RouteOutcome { vm, result }
                })
            })
            .collect();

        let joined = join_all(tasks).await;

        // Preserve input order and keep one outcome per VM even if a task
        // panicked.
        let mut outcomes = Vec::with_capacity(vms.len());
        for (i, joined_result) in joined.into_iter().enumerate() {
            match joined_result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(vm = %vms[i].name, "Resolve task failed: {e}");
                    outcomes.push(RouteOutcome {
                        vm: vms[i].clone(),
                        result: RouteResult::Unreachable {
                            reason: format!("resolve task failed: {e}"),
                        },
                    });
                }
            }
        }
        outcomes
    }
}

async fn resolve_one(
    detector: &RouteDetector,
    pool: &ConnectionPool,
    vm: &Vm,
) -> RouteResult {
    match detector.classify(vm).await {
        RouteDecision::Direct(endpoint) => RouteResult::Reachable(ResolvedRoute {
            endpoint,
            via: RouteVia::Direct,
            lease: None,
        }),
        RouteDecision::Unreachable { reason } => RouteResult::Unreachable { reason },
        RouteDecision::Bastion { jump_host, key } => {
            match pool.checkout(&key, &jump_host).await {
                Ok(lease) => {
                    debug!(vm = %vm.name, local_port = lease.local_port, "Tunnel checked out");
                    let endpoint = SshEndpoint::loopback(
                        lease.local_port,
                        vm.username.clone(),
                        vm.key_path.clone(),
                    );
                    RouteResult::Reachable(ResolvedRoute {
                        endpoint,
                        via: RouteVia::Bastion {
                            jump_host_id: jump_host.id,
                        },
                        lease: Some(lease),
                    })
                }
                Err(e) if e.is_loud() => RouteResult::Failed(e),
                Err(e) => RouteResult::Unreachable {
                    reason: e.to_string(),
                },
            }
        }
    }
}
