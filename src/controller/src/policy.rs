// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The ordering policy: which ordinal-level action comes next.
//!
//! [`plan`] is a pure function over the desired count and the observed
//! per-ordinal phases. It performs no I/O and holds no state, which keeps
//! every ordering guarantee testable without a running collaborator.

use std::collections::BTreeMap;

use crate::replica::ReplicaPhase;
use crate::ManagementPolicy;

/// An ordinal-level action the reconciler may dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Create the replica at this ordinal.
    Create(u64),
    /// Delete the replica at this ordinal.
    Delete(u64),
    /// Replace the replica at this ordinal with one built from the
    /// current template revision. Realized as delete-then-recreate; the
    /// replica's identity and claim are untouched.
    Update(u64),
}

/// Returns the actions the reconciler may dispatch right now, given the
/// observed phases. An empty plan means "wait": something must change (a
/// readiness signal, a termination completing, a spec update) before any
/// further action is allowed.
///
/// Ordinals missing from `observed` are absent. Callers pass only scale
/// actions through this function; rolling updates are planned separately
/// (see [`crate::update`]) and only when this plan is empty.
pub fn plan(
    policy: ManagementPolicy,
    desired_replicas: u64,
    observed: &BTreeMap<u64, ReplicaPhase>,
) -> Vec<Action> {
    match policy {
        ManagementPolicy::OrderedReady => plan_ordered(desired_replicas, observed),
        ManagementPolicy::Parallel => plan_parallel(desired_replicas, observed),
    }
}

/// Strictly sequential: at most one action in flight per set, creation in
/// ascending ordinal order gated on predecessor readiness, deletion in
/// descending order gated on successor absence. Deletion of out-of-range
/// ordinals takes priority over creation of new ones.
fn plan_ordered(desired_replicas: u64, observed: &BTreeMap<u64, ReplicaPhase>) -> Vec<Action> {
    // Scale down from the top. Deleting the highest existing ordinal first
    // guarantees ordinal k is never deleted while k+1 still exists. An
    // out-of-range ordinal whose own creation is still in flight is
    // deleted rather than waited for: the stale action is superseded, not
    // completed.
    if let Some((&highest, &phase)) = observed.iter().next_back() {
        if highest >= desired_replicas {
            let others_transitional = observed
                .iter()
                .any(|(&ordinal, p)| ordinal != highest && p.is_transitional());
            if phase == ReplicaPhase::Terminating || others_transitional {
                return Vec::new();
            }
            return vec![Action::Delete(highest)];
        }
    }

    // A transitional replica *is* the in-flight action; everything else
    // waits for it.
    if observed.values().any(|phase| phase.is_transitional()) {
        return Vec::new();
    }

    // Scale up from the bottom. Ordinal k is created only once every lower
    // ordinal is Ready; a stuck predecessor halts progress rather than
    // being skipped.
    for ordinal in 0..desired_replicas {
        match observed.get(&ordinal) {
            None => return vec![Action::Create(ordinal)],
            Some(ReplicaPhase::Ready) => {}
            Some(_) => return Vec::new(),
        }
    }

    Vec::new()
}

/// No ordering guarantees: every missing in-range ordinal is created and
/// every out-of-range ordinal deleted, concurrently.
fn plan_parallel(desired_replicas: u64, observed: &BTreeMap<u64, ReplicaPhase>) -> Vec<Action> {
    let mut actions = Vec::new();
    for (&ordinal, &phase) in observed.range(desired_replicas..) {
        if phase != ReplicaPhase::Terminating {
            actions.push(Action::Delete(ordinal));
        }
    }
    for ordinal in 0..desired_replicas {
        if !observed.contains_key(&ordinal) {
            actions.push(Action::Create(ordinal));
        }
    }
    actions
}
