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

use std::fmt;
use std::path::PathBuf;

/// A cloud VM as seen by the routing layer.
///
/// Only the fields the router needs: identity, network membership and the
/// addresses that decide direct reachability. VM lifecycle is out of scope.
#[derive(Debug, Clone)]
pub struct Vm {
    /// Display name, unique within the inventory.
    pub name: String,
    /// Cloud resource identifier, the unit of tunnel targeting and of the
    /// authorized-scope check.
    pub resource_id: String,
    /// Virtual network the VM lives in.
    pub network: String,
    /// Public address, if the VM has one.
    pub public_address: Option<String>,
    pub port: u16,
    pub username: String,
    pub key_path: Option<PathBuf>,
}

impl Vm {
    pub fn has_public_address(&self) -> bool {
        self.public_address
            .as_deref()
            .is_some_and(|a| !a.is_empty())
    }
}

impl fmt::Display for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.resource_id)
    }
}

/// A ready-to-use SSH endpoint.
///
/// Bit-identical in shape whether the route was direct or through a bastion
/// tunnel; downstream SSH execution has zero awareness of tunneling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_path: Option<PathBuf>,
}

impl SshEndpoint {
    /// Endpoint on the loopback forwarding port of a pooled tunnel.
    pub fn loopback(local_port: u16, username: String, key_path: Option<PathBuf>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: local_port,
            username,
            key_path,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}
