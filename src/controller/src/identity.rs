// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Deterministic replica identity.
//!
//! Every replica slot in a set maps to exactly one identity: its name,
//! its DNS label under the set's governing service, and the name of its
//! volume claim. The mapping is a pure function of the set's constants
//! and the ordinal, so repeated calls with the same inputs, at any time,
//! in any process, return byte-identical output.

use once_cell::sync::Lazy;
use regex::Regex;

use phalanx_orchestrator::ReplicaIdentity;

use crate::ReplicaSetSpec;

/// Allocates identities for one replica set.
#[derive(Debug, Clone)]
pub struct IdentityAllocator {
    set: String,
    service: String,
    claim_template: Option<String>,
}

impl IdentityAllocator {
    /// Creates an allocator from the set constants in `spec`.
    pub fn new(spec: &ReplicaSetSpec) -> IdentityAllocator {
        IdentityAllocator {
            set: spec.name.clone(),
            service: spec.service_name.clone(),
            claim_template: spec.volume_claim.as_ref().map(|claim| claim.name.clone()),
        }
    }

    /// Returns the identity of the replica slot at `ordinal`.
    pub fn identity_for(&self, ordinal: u64) -> ReplicaIdentity {
        let name = format!("{}-{}", self.set, ordinal);
        ReplicaIdentity {
            set: self.set.clone(),
            ordinal,
            dns_name: format!("{}.{}", name, self.service),
            claim_name: self
                .claim_template
                .as_ref()
                .map(|template| format!("{template}-{name}")),
            name,
        }
    }
}

/// Parses a name generated by [`IdentityAllocator::identity_for`] back into
/// its set name and ordinal.
pub fn parse_replica_name(name: &str) -> Option<(&str, u64)> {
    static REPLICA_NAME_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?-u)^([a-z0-9][-a-z0-9]*)-(\d+)$").expect("valid regex"));

    let caps = REPLICA_NAME_RE.captures(name)?;
    let set = caps.get(1).expect("group 1 matched").as_str();
    let ordinal = caps.get(2).expect("group 2 matched").as_str().parse().ok()?;
    Some((set, ordinal))
}

#[cfg(test)]
mod tests {
    use phalanx_orchestrator::ReplicaTemplate;

    use super::*;

    fn spec(claim: bool) -> ReplicaSetSpec {
        let mut spec = ReplicaSetSpec::new(
            "trainer",
            "trainer-peers",
            3,
            ReplicaTemplate(serde_json::json!({})),
        );
        if claim {
            spec.volume_claim = Some(phalanx_orchestrator::VolumeClaimTemplate {
                name: "ckpt".into(),
                size: bytesize_gib(1),
                storage_class: None,
            });
        }
        spec
    }

    fn bytesize_gib(n: u64) -> bytesize::ByteSize {
        bytesize::ByteSize::gib(n)
    }

    #[test]
    fn test_identity_is_pure() {
        let allocator = IdentityAllocator::new(&spec(true));
        let first = allocator.identity_for(2);
        let second = allocator.identity_for(2);
        assert_eq!(first, second);
        assert_eq!(first.name, "trainer-2");
        assert_eq!(first.dns_name, "trainer-2.trainer-peers");
        assert_eq!(first.claim_name.as_deref(), Some("ckpt-trainer-2"));
    }

    #[test]
    fn test_identity_without_claim_template() {
        let allocator = IdentityAllocator::new(&spec(false));
        assert_eq!(allocator.identity_for(0).claim_name, None);
    }

    #[test]
    fn test_parse_replica_name() {
        let allocator = IdentityAllocator::new(&spec(false));
        for ordinal in [0, 1, 7, 40] {
            let identity = allocator.identity_for(ordinal);
            assert_eq!(
                parse_replica_name(&identity.name),
                Some(("trainer", ordinal))
            );
        }
        // Set names may themselves contain dashes and digits; the ordinal
        // is always the suffix after the last dash.
        assert_eq!(parse_replica_name("web-cache-12"), Some(("web-cache", 12)));
        assert_eq!(parse_replica_name("noordinal"), None);
        assert_eq!(parse_replica_name("-3"), None);
    }
}
