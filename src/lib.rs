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

//! Batch SSH routing for cloud VMs with pooled bastion tunnels.
//!
//! Given an inventory of VMs, the crate classifies each one as directly
//! reachable or bastion-only, checks out a pooled forwarding tunnel where
//! needed and hands back uniform [`SshEndpoint`]s, one outcome per VM.

pub mod cli;
pub mod config;
pub mod directory;
pub mod error;
pub mod node;
pub mod routing;
pub mod security;
pub mod tunnel;
pub mod utils;

pub use cli::Cli;
pub use config::Config;
pub use error::RoutingError;
pub use node::{SshEndpoint, Vm};
pub use routing::{RouteOutcome, RoutingResolver};
pub use tunnel::ConnectionPool;
