// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Rolling update coordination.
//!
//! Updates roll in descending ordinal order, one replica at a time,
//! regardless of the set's management policy: update ordering is a
//! separate, always-ordered guarantee. An update is realized as
//! delete-then-recreate at the same ordinal; the claim-retention guarantee
//! in [`crate::storage`] means the recreated replica reattaches its
//! volume claim.
//!
//! The `partition` of [`UpdateStrategy::RollingUpdate`] is a canary
//! cutoff: only ordinals at or above it are rolled, so a partition of 2 on
//! a 3-replica set touches ordinal 2 alone. Under
//! [`UpdateStrategy::OnDelete`] the coordinator takes no autonomous
//! action; replicas pick up the current revision whenever something else
//! deletes them.

use std::collections::BTreeMap;

use phalanx_orchestrator::Revision;

use crate::replica::ReplicaPhase;
use crate::UpdateStrategy;

/// Returns the ordinal to roll next, if any.
///
/// Pure over the observed `(phase, revision)` per ordinal. A roll is only
/// planned while the set is otherwise quiescent: every in-range ordinal
/// present and `Ready`. That both serializes the rollout (the previously
/// rolled ordinal must come back `Ready` before the next one goes) and
/// keeps updates subordinate to scale actions.
pub fn next_update(
    strategy: &UpdateStrategy,
    desired_replicas: u64,
    observed: &BTreeMap<u64, (ReplicaPhase, Revision)>,
    update_revision: &Revision,
) -> Option<u64> {
    let UpdateStrategy::RollingUpdate { partition } = strategy else {
        return None;
    };
    for ordinal in 0..desired_replicas {
        match observed.get(&ordinal) {
            Some((ReplicaPhase::Ready, _)) => {}
            _ => return None,
        }
    }
    observed
        .range(*partition..desired_replicas)
        .rev()
        .find(|(_, (_, revision))| revision != update_revision)
        .map(|(&ordinal, _)| ordinal)
}
