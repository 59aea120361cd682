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

//! YAML configuration: inventory, pool tuning, scope and policy.
//!
//! The config file doubles as the static cloud directory: it lists the VMs
//! and jump hosts the tool may route to. A real control-plane client would
//! plug in behind [`CloudDirectory`](crate::directory::CloudDirectory)
//! instead.

use crate::directory::JumpHostInfo;
use crate::node::Vm;
use crate::routing::{DisambiguationPolicy, TerminalPrompt};
use crate::tunnel::PoolConfig;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default name of the external forwarding binary, resolved via PATH.
const DEFAULT_TUNNEL_PROGRAM: &str = "bastion-tunnel";

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,

    #[serde(default)]
    pub vms: Vec<VmEntry>,

    #[serde(default)]
    pub jump_hosts: Vec<JumpHostInfo>,

    #[serde(default)]
    pub pool: PoolSettings,

    /// Resource-id prefixes tunnels may target. Empty means unrestricted.
    #[serde(default)]
    pub scope: Vec<String>,

    #[serde(default)]
    pub disambiguation: DisambiguationMode,

    /// Path to the external forwarding binary.
    #[serde(default)]
    pub tunnel_program: Option<PathBuf>,
}

/// Global default settings applied to VM entries that omit them.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Defaults {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub ssh_key: Option<PathBuf>,
    pub parallel: Option<usize>,
    /// Overall resolve deadline in seconds. 0 or absent means unlimited.
    pub timeout: Option<u64>,
}

/// One VM in the inventory.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VmEntry {
    pub name: String,
    pub resource_id: String,
    pub network: String,
    #[serde(default)]
    pub public_address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,
}

/// Pool tuning, all optional; unset fields keep the built-in defaults.
/// Durations are in seconds.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct PoolSettings {
    pub max_tunnels: Option<usize>,
    pub idle_timeout: Option<u64>,
    pub sweep_interval: Option<u64>,
    pub health_check_ttl: Option<u64>,
    pub start_timeout: Option<u64>,
    pub start_retries: Option<u32>,
    pub terminate_grace: Option<u64>,
}

/// Serde-facing counterpart of [`DisambiguationPolicy`].
#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DisambiguationMode {
    #[default]
    AutoFail,
    PreferMostRecentlyUsed,
    Interactive,
}

impl Config {
    /// Load from `path`, or from the default location when `path` is None.
    /// A missing default file yields an empty config; a missing explicit
    /// path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::default_path(), false),
        };

        if !path.exists() {
            if explicit {
                bail!("Configuration file not found: {}", path.display());
            }
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse YAML configuration file at {}",
                path.display()
            )
        })?;
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.config_dir().join("vmssh").join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml"))
    }

    /// Materialize the inventory, applying defaults.
    pub fn inventory(&self) -> Vec<Vm> {
        self.vms.iter().map(|entry| self.to_vm(entry)).collect()
    }

    /// Select VMs by name; an empty selection means the whole inventory.
    pub fn select_vms(&self, names: &[String]) -> Result<Vec<Vm>> {
        if names.is_empty() {
            return Ok(self.inventory());
        }
        names
            .iter()
            .map(|name| {
                self.vms
                    .iter()
                    .find(|entry| &entry.name == name)
                    .map(|entry| self.to_vm(entry))
                    .with_context(|| format!("VM '{name}' is not in the inventory"))
            })
            .collect()
    }

    fn to_vm(&self, entry: &VmEntry) -> Vm {
        Vm {
            name: entry.name.clone(),
            resource_id: entry.resource_id.clone(),
            network: entry.network.clone(),
            public_address: entry.public_address.clone(),
            port: entry.port.or(self.defaults.port).unwrap_or(22),
            username: entry
                .user
                .clone()
                .or_else(|| self.defaults.user.clone())
                .unwrap_or_else(|| std::env::var("USER").unwrap_or_else(|_| "root".to_string())),
            key_path: entry.ssh_key.clone().or_else(|| self.defaults.ssh_key.clone()),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::default();
        let p = &self.pool;
        if let Some(v) = p.max_tunnels {
            config.max_tunnels = v;
        }
        if let Some(v) = p.idle_timeout {
            config.idle_timeout = Duration::from_secs(v);
        }
        if let Some(v) = p.sweep_interval {
            config.sweep_interval = Duration::from_secs(v);
        }
        if let Some(v) = p.health_check_ttl {
            config.health_check_ttl = Duration::from_secs(v);
        }
        if let Some(v) = p.start_timeout {
            config.start_timeout = Duration::from_secs(v);
        }
        if let Some(v) = p.start_retries {
            config.start_retries = v;
        }
        if let Some(v) = p.terminate_grace {
            config.terminate_grace = Duration::from_secs(v);
        }
        config
    }

    pub fn disambiguation_policy(&self) -> DisambiguationPolicy {
        match self.disambiguation {
            DisambiguationMode::AutoFail => DisambiguationPolicy::AutoFail,
            DisambiguationMode::PreferMostRecentlyUsed => {
                DisambiguationPolicy::PreferMostRecentlyUsed
            }
            DisambiguationMode::Interactive => {
                DisambiguationPolicy::Interactive(Arc::new(TerminalPrompt))
            }
        }
    }

    pub fn tunnel_program(&self) -> PathBuf {
        self.tunnel_program
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TUNNEL_PROGRAM))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::JumpHostTier;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
defaults:
  user: ops
  parallel: 8

vms:
  - name: web-0
    resource_id: /subs/s1/vms/web-0
    network: vnet-prod
    public_address: 203.0.113.7
  - name: db-0
    resource_id: /subs/s1/vms/db-0
    network: vnet-prod
    port: 2222
    user: dba

jump_hosts:
  - id: bastion-1
    name: prod bastion
    networks: [vnet-prod]
    tier: standard
  - id: bastion-2
    name: legacy bastion
    networks: [vnet-prod]
    tier: basic

pool:
  idle_timeout: 120
  max_tunnels: 4

scope:
  - /subs/s1/

disambiguation: prefer-most-recently-used
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        let vms = config.inventory();
        assert_eq!(vms.len(), 2);
        assert_eq!(vms[0].username, "ops");
        assert_eq!(vms[0].port, 22);
        assert_eq!(vms[1].username, "dba");
        assert_eq!(vms[1].port, 2222);

        assert_eq!(config.jump_hosts.len(), 2);
        assert_eq!(config.jump_hosts[0].tier, JumpHostTier::Standard);
        assert_eq!(config.jump_hosts[1].tier, JumpHostTier::Basic);

        let pool = config.pool_config();
        assert_eq!(pool.idle_timeout, Duration::from_secs(120));
        assert_eq!(pool.max_tunnels, 4);
        // Unset fields keep defaults.
        assert_eq!(pool.sweep_interval, Duration::from_secs(10));

        assert_eq!(
            config.disambiguation,
            DisambiguationMode::PreferMostRecentlyUsed
        );
    }

    #[test]
    fn test_empty_config_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert!(config.vms.is_empty());
        assert!(config.scope.is_empty());
        assert_eq!(config.disambiguation, DisambiguationMode::AutoFail);
        assert_eq!(
            config.tunnel_program(),
            PathBuf::from(DEFAULT_TUNNEL_PROGRAM)
        );
    }

    #[test]
    fn test_select_vms_unknown_name() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        let err = config.select_vms(&["ghost".to_string()]).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
