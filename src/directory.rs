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

//! Read-only view of the cloud control plane.
//!
//! The router only ever asks one question of the control plane: which jump
//! hosts can reach a given network. [`CloudDirectory`] is the seam where a
//! real SDK-backed client plugs in; [`StaticDirectory`] serves the same
//! answers from the config-file inventory and is what the CLI uses.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Capability tier of a managed jump host.
///
/// Only the `Standard` tier supports process-based tunneling; `Basic` hosts
/// are filtered out of route candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JumpHostTier {
    Basic,
    #[default]
    Standard,
}

/// Identity and reach of a managed jump-host resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JumpHostInfo {
    /// Cloud resource identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// VM networks this jump host can reach.
    pub networks: Vec<String>,
    #[serde(default)]
    pub tier: JumpHostTier,
}

impl JumpHostInfo {
    pub fn supports_tunneling(&self) -> bool {
        self.tier == JumpHostTier::Standard
    }

    pub fn reaches(&self, network: &str) -> bool {
        self.networks.iter().any(|n| n == network)
    }
}

/// Read-only control-plane queries the route detector depends on.
#[async_trait]
pub trait CloudDirectory: Send + Sync {
    /// Jump hosts scoped to `network`, regardless of capability tier.
    async fn list_jump_hosts(&self, network: &str) -> Result<Vec<JumpHostInfo>>;
}

/// Directory backed by a fixed inventory, typically the config file.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    jump_hosts: Vec<JumpHostInfo>,
}

impl StaticDirectory {
    pub fn new(jump_hosts: Vec<JumpHostInfo>) -> Self {
        Self { jump_hosts }
    }

    pub fn jump_hosts(&self) -> &[JumpHostInfo] {
        &self.jump_hosts
    }
}

#[async_trait]
impl CloudDirectory for StaticDirectory {
    async fn list_jump_hosts(&self, network: &str) -> Result<Vec<JumpHostInfo>> {
        Ok(self
            .jump_hosts
            .iter()
            .filter(|j| j.reaches(network))
            .cloned()
            .collect())
    }
}
