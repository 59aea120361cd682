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

//! Error taxonomy for routing and tunnel pooling.
//!
//! Per-VM errors are captured into that VM's [`RouteOutcome`](crate::routing::RouteOutcome)
//! and never abort a batch. [`RoutingError::Security`] and
//! [`RoutingError::PoolExhausted`] abort only the specific checkout and are
//! surfaced loudly rather than being folded into "unreachable".

use crate::tunnel::TargetKey;
use thiserror::Error;

/// Errors produced by route detection, tunnel startup and pool checkout.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// Control-plane query failed. Non-fatal: converted to an unreachable
    /// outcome by the detector, never propagated out of a batch.
    #[error("detection failed: {0}")]
    Detection(String),

    /// Multiple jump-host candidates and no disambiguation configured.
    #[error("ambiguous route: {count} jump hosts available in network '{network}'")]
    AmbiguousRoute { network: String, count: usize },

    /// Target is outside the caller's authorized scope. Never retried, and
    /// no subprocess is ever spawned for it.
    #[error("security: target '{resource_id}' is outside the authorized scope")]
    Security { resource_id: String },

    /// The forwarding subprocess failed to reach Ready within the timeout.
    /// The stderr tail is the primary diagnostic surface; missing
    /// permissions or an unsupported jump-host tier show up only there.
    #[error("tunnel for {key} failed to start: {reason}\nstderr: {stderr_tail}")]
    TunnelStart {
        key: TargetKey,
        reason: String,
        stderr_tail: String,
    },

    /// A Ready tunnel was found dead by a health check and recreating it
    /// also failed. Only surfaced after one transparent recreation attempt.
    #[error("tunnel for {key} died and could not be recreated")]
    TunnelHealth {
        key: TargetKey,
        #[source]
        source: Box<RoutingError>,
    },

    /// The configured maximum number of concurrent distinct tunnels was
    /// exceeded. The caller can shrink the batch or raise the limit.
    #[error("connection pool exhausted: {active} tunnels active (max {max})")]
    PoolExhausted { active: usize, max: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RoutingError {
    /// Whether this error must be reported as a hard failure rather than
    /// an unreachable-with-reason line in batch output.
    pub fn is_loud(&self) -> bool {
        matches!(
            self,
            RoutingError::Security { .. } | RoutingError::PoolExhausted { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RoutingError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TargetKey {
        TargetKey::new("bastion-1", "/subs/s1/vms/web-0", 22)
    }

    #[test]
    fn test_tunnel_start_carries_stderr() {
        let err = RoutingError::TunnelStart {
            key: key(),
            reason: "subprocess exited early".to_string(),
            stderr_tail: "permission denied on bastion".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("permission denied on bastion"));
        assert!(text.contains("/subs/s1/vms/web-0"));
    }

    #[test]
    fn test_loud_errors() {
        assert!(RoutingError::Security {
            resource_id: "x".into()
        }
        .is_loud());
        assert!(RoutingError::PoolExhausted { active: 8, max: 8 }.is_loud());
        assert!(!RoutingError::Detection("boom".into()).is_loud());
    }
}
