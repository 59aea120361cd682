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

//! Target authorization scope.
//!
//! Every tunnel target is validated against the configured scope before any
//! OS resource is touched; a failed check is a [`RoutingError::Security`]
//! and the forwarding subprocess is never spawned.

use crate::error::{Result, RoutingError};

/// Set of resource-id prefixes the operator is allowed to tunnel to.
///
/// An empty scope is unrestricted: the config simply did not constrain
/// targets. A non-empty scope permits only resource ids that start with one
/// of the listed prefixes (typically a subscription or resource-group path).
#[derive(Debug, Clone, Default)]
pub struct AuthorizedScope {
    prefixes: Vec<String>,
}

impl AuthorizedScope {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }

    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn permits(&self, resource_id: &str) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| resource_id.starts_with(p))
    }

    /// Check `resource_id` against the scope, failing with a security error.
    pub fn authorize(&self, resource_id: &str) -> Result<()> {
        if self.permits(resource_id) {
            Ok(())
        } else {
            Err(RoutingError::Security {
                resource_id: resource_id.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_scope_is_unrestricted() {
        let scope = AuthorizedScope::unrestricted();
        assert!(scope.permits("/subs/anything/vms/x"));
        assert!(scope.authorize("/subs/anything/vms/x").is_ok());
    }

    #[test]
    fn test_prefix_match() {
        let scope = AuthorizedScope::new(vec!["/subs/s1/".to_string()]);
        assert!(scope.permits("/subs/s1/vms/web-0"));
        assert!(!scope.permits("/subs/s2/vms/web-0"));
    }

    #[test]
    fn test_denied_is_security_error() {
        let scope = AuthorizedScope::new(vec!["/subs/s1/".to_string()]);
        let err = scope.authorize("/subs/s2/vms/web-0").unwrap_err();
        assert!(matches!(err, RoutingError::Security { .. }));
    }
}
