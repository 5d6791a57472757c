// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Volume claim binding.
//!
//! One claim per ordinal, created before the ordinal's replica first
//! starts, surviving replica deletion and recreation at the same ordinal.
//! Claims are only ever deleted through [`StorageBinder::release_claim`],
//! which the reconciler invokes on explicit scale-down or set teardown
//! when the retention policy says so. Existing claims are never recreated
//! or resized: whatever data they hold must survive.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use phalanx_orchestrator::{
    ClaimEvent, ClaimHandle, ClaimPhase, ReplicaIdentity, StorageProvisioner, VolumeClaimTemplate,
};

/// A claim the binder is tracking.
#[derive(Debug, Clone)]
pub struct ClaimState {
    /// The claim's name, `{template}-{replica}`.
    pub name: String,
    /// The provisioner's handle for the claim.
    pub handle: ClaimHandle,
    /// The claim's last observed phase.
    pub phase: ClaimPhase,
    /// When creation was requested.
    pub requested_at: DateTime<Utc>,
}

/// Tracks the volume claims owned by one replica set.
#[derive(Debug)]
pub struct StorageBinder {
    provisioner: Arc<dyn StorageProvisioner>,
    template: Option<VolumeClaimTemplate>,
    claims: BTreeMap<String, ClaimState>,
}

impl StorageBinder {
    /// Creates a binder for a set with the given claim template, if any.
    pub fn new(
        provisioner: Arc<dyn StorageProvisioner>,
        template: Option<VolumeClaimTemplate>,
    ) -> StorageBinder {
        StorageBinder {
            provisioner,
            template,
            claims: BTreeMap::new(),
        }
    }

    /// Ensures a claim exists for `identity`. Idempotent: an existing
    /// claim is returned unmodified, with no second provisioner call.
    /// Returns `None` when the set configures no claim template.
    pub async fn ensure_claim(
        &mut self,
        identity: &ReplicaIdentity,
    ) -> Result<Option<&ClaimState>, anyhow::Error> {
        let (Some(name), Some(template)) = (&identity.claim_name, &self.template) else {
            return Ok(None);
        };
        if !self.claims.contains_key(name) {
            let handle = self.provisioner.create_claim(name, template).await?;
            self.claims.insert(
                name.clone(),
                ClaimState {
                    name: name.clone(),
                    handle,
                    phase: ClaimPhase::Pending,
                    requested_at: Utc::now(),
                },
            );
        }
        Ok(self.claims.get(name))
    }

    /// Returns the tracked claim for `identity`, if one exists.
    pub fn claim_for(&self, identity: &ReplicaIdentity) -> Option<&ClaimState> {
        let name = identity.claim_name.as_ref()?;
        self.claims.get(name)
    }

    /// Whether `identity`'s replica may start: true when the set needs no
    /// claims, or when the identity's claim is bound.
    pub fn is_bound(&self, identity: &ReplicaIdentity) -> bool {
        match &identity.claim_name {
            None => true,
            Some(name) => self
                .claims
                .get(name)
                .is_some_and(|claim| claim.phase == ClaimPhase::Bound),
        }
    }

    /// Applies a phase notification from the provisioner. Events for
    /// claims the binder does not own are ignored.
    pub fn observe(&mut self, event: &ClaimEvent) {
        if let Some(claim) = self.claims.get_mut(&event.claim) {
            claim.phase = event.phase;
        }
    }

    /// Deletes `identity`'s claim and its data. Only the reconciler calls
    /// this, on explicit scale-down or set teardown under a Delete
    /// retention policy.
    pub async fn release_claim(&mut self, identity: &ReplicaIdentity) -> Result<(), anyhow::Error> {
        let Some(name) = &identity.claim_name else {
            return Ok(());
        };
        if let Some(claim) = self.claims.remove(name) {
            self.provisioner.delete_claim(&claim.handle).await?;
        }
        Ok(())
    }

    /// Deletes every claim the binder tracks. Only the reconciler calls
    /// this, on set teardown under a Delete retention policy.
    pub async fn release_all(&mut self) -> Result<(), anyhow::Error> {
        let claims = std::mem::take(&mut self.claims);
        for (_, claim) in claims {
            self.provisioner.delete_claim(&claim.handle).await?;
        }
        Ok(())
    }

    /// The names of all claims the binder currently tracks.
    pub fn claim_names(&self) -> impl Iterator<Item = &str> {
        self.claims.keys().map(String::as_str)
    }
}
