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

//! Per-VM connectivity classification.

use crate::directory::{CloudDirectory, JumpHostInfo};
use crate::node::{SshEndpoint, Vm};
use crate::tunnel::TargetKey;
use async_trait::async_trait;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Outcome of classifying one VM. Produced fresh per resolution call and
/// never cached across calls; freshness is the caller's concern.
#[derive(Debug, Clone)]
pub enum RouteDecision {
    /// The VM is directly reachable at this endpoint.
    Direct(SshEndpoint),
    /// Reachable only through a jump-host tunnel.
    Bastion {
        jump_host: JumpHostInfo,
        key: TargetKey,
    },
    /// No usable route; the reason is reported per VM, never raised.
    Unreachable { reason: String },
}

/// Collaborator that asks the operator to pick among multiple candidate
/// jump hosts. Only consulted under [`DisambiguationPolicy::Interactive`].
#[async_trait]
pub trait JumpHostPrompt: Send + Sync {
    /// Index into `candidates`, or `None` if the operator declined.
    async fn choose(
        &self,
        vm: &Vm,
        candidates: &[JumpHostInfo],
    ) -> anyhow::Result<Option<usize>>;
}

/// What to do when a network has more than one tunneling-capable jump host.
#[derive(Clone)]
pub enum DisambiguationPolicy {
    /// Fail the VM as unreachable. The default, and the only safe choice
    /// in non-interactive batches.
    AutoFail,
    /// Reuse the jump host most recently selected by an earlier decision,
    /// when it is among the candidates.
    PreferMostRecentlyUsed,
    /// Ask the operator.
    Interactive(Arc<dyn JumpHostPrompt>),
}

impl fmt::Debug for DisambiguationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisambiguationPolicy::AutoFail => "AutoFail",
            DisambiguationPolicy::PreferMostRecentlyUsed => "PreferMostRecentlyUsed",
            DisambiguationPolicy::Interactive(_) => "Interactive",
        };
        f.write_str(name)
    }
}

/// Read-only route classification against the cloud directory.
///
/// Directory failures are converted into unreachable outcomes so one VM's
/// detection failure never aborts a batch.
pub struct RouteDetector {
    directory: Arc<dyn CloudDirectory>,
    policy: DisambiguationPolicy,
    /// Most recently selected jump host id, for the MRU policy.
    last_selected: Mutex<Option<String>>,
}

impl RouteDetector {
    pub fn new(directory: Arc<dyn CloudDirectory>, policy: DisambiguationPolicy) -> Self {
        Self {
            directory,
            policy,
            last_selected: Mutex::new(None),
        }
    }

    /// Classify one VM as Direct, Bastion or Unreachable.
    pub async fn classify(&self, vm: &Vm) -> RouteDecision {
        if vm.has_public_address() {
            let host = vm.public_address.clone().unwrap_or_default();
            debug!(vm = %vm.name, %host, "Direct route");
            return RouteDecision::Direct(SshEndpoint {
                host,
                port: vm.port,
                username: vm.username.clone(),
                key_path: vm.key_path.clone(),
            });
        }

        let hosts = match self.directory.list_jump_hosts(&vm.network).await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(vm = %vm.name, "Jump host query failed: {e:#}");
                return RouteDecision::Unreachable {
                    reason: format!("detection failed: {e:#}"),
                };
            }
        };

        let total = hosts.len();
        let mut candidates: Vec<JumpHostInfo> = hosts
            .into_iter()
            .filter(|j| j.supports_tunneling())
            .collect();

        match candidates.len() {
            0 => {
                let reason = if total > 0 {
                    format!(
                        "no route: no public address and none of the {total} jump hosts in \
                         network '{}' support tunneling",
                        vm.network
                    )
                } else {
                    format!(
                        "no route: no public address and no jump host in network '{}'",
                        vm.network
                    )
                };
                RouteDecision::Unreachable { reason }
            }
            1 => self.bastion(vm, candidates.remove(0)),
            n => self.disambiguate(vm, candidates, n).await,
        }
    }

    async fn disambiguate(
        &self,
        vm: &Vm,
        candidates: Vec<JumpHostInfo>,
        count: usize,
    ) -> RouteDecision {
        let ambiguous = || RouteDecision::Unreachable {
            reason: format!(
                "ambiguous route: {count} jump hosts available in network '{}'",
                vm.network
            ),
        };

        match &self.policy {
            DisambiguationPolicy::AutoFail => ambiguous(),
            DisambiguationPolicy::PreferMostRecentlyUsed => {
                let last = self
                    .last_selected
                    .lock()
                    .ok()
                    .and_then(|guard| guard.clone());
                match last.and_then(|id| candidates.iter().position(|j| j.id == id)) {
                    Some(i) => {
                        let mut candidates = candidates;
                        self.bastion(vm, candidates.remove(i))
                    }
                    None => ambiguous(),
                }
            }
            DisambiguationPolicy::Interactive(prompt) => {
                match prompt.choose(vm, &candidates).await {
                    Ok(Some(i)) if i < candidates.len() => {
                        let mut candidates = candidates;
                        self.bastion(vm, candidates.remove(i))
                    }
                    Ok(_) => RouteDecision::Unreachable {
                        reason: format!(
                            "ambiguous route: {count} jump hosts available and no selection made"
                        ),
                    },
                    Err(e) => RouteDecision::Unreachable {
                        reason: format!("detection failed: jump host selection: {e:#}"),
                    },
                }
            }
        }
    }

    fn bastion(&self, vm: &Vm, jump_host: JumpHostInfo) -> RouteDecision {
        if let Ok(mut guard) = self.last_selected.lock() {
            *guard = Some(jump_host.id.clone());
        }
        let key = TargetKey::new(jump_host.id.clone(), vm.resource_id.clone(), vm.port);
        debug!(vm = %vm.name, jump_host = %jump_host.id, "Bastion route");
        RouteDecision::Bastion { jump_host, key }
    }
}

/// Interactive prompt on the controlling terminal.
pub struct TerminalPrompt;

#[async_trait]
impl JumpHostPrompt for TerminalPrompt {
    async fn choose(
        &self,
        vm: &Vm,
        candidates: &[JumpHostInfo],
    ) -> anyhow::Result<Option<usize>> {
        let vm_name = vm.name.clone();
        let names: Vec<String> = candidates
            .iter()
            .map(|j| format!("{} ({})", j.name, j.id))
            .collect();

        // Terminal I/O is blocking; keep it off the runtime threads.
        let choice = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<usize>> {
            let mut stderr = std::io::stderr();
            writeln!(stderr, "Multiple jump hosts can reach '{vm_name}':")?;
            for (i, name) in names.iter().enumerate() {
                writeln!(stderr, "  {}. {name}", i + 1)?;
            }
            write!(stderr, "Select jump host [1-{}, empty to skip]: ", names.len())?;
            stderr.flush()?;

            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            let line = line.trim();
            if line.is_empty() {
                return Ok(None);
            }
            let n: usize = line.parse()?;
            if n == 0 || n > names.len() {
                anyhow::bail!("selection {n} is out of range");
            }
            Ok(Some(n - 1))
        })
        .await??;

        Ok(choice)
    }
}
