// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Per-ordinal replica lifecycle.
//!
//! Each ordinal moves through `Absent -> Pending -> Creating -> Running ->
//! Ready -> Terminating -> Absent`, with `Failed` reachable from `Creating`
//! and `Running`. `Absent` is represented by the ordinal having no entry in
//! the set's replica map; every other phase lives in a [`ReplicaState`].
//!
//! Readiness is debounced: a replica only counts as `Ready` once its probe
//! has answered continuously for the configured dwell, which guards the
//! ordering policy against flapping probes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use phalanx_orchestrator::{ReplicaHandle, Revision};

use crate::retry::{Backoff, BackoffConfig};

/// The lifecycle phase of one replica slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicaPhase {
    /// No replica exists at this ordinal.
    Absent,
    /// The slot is claimed: storage is being ensured, or submission is
    /// being retried.
    Pending,
    /// The replica was submitted to the scheduler and has not yet started.
    Creating,
    /// The replica is running but not yet (stably) ready.
    Running,
    /// The replica has been ready for at least the configured dwell.
    Ready,
    /// The replica is being torn down.
    Terminating,
    /// The replica failed; a retry is pending backoff.
    Failed,
}

impl ReplicaPhase {
    /// Whether an ordinal-level action is in flight for a replica in this
    /// phase. Under `OrderedReady` a transitional replica blocks every
    /// other action on the set.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            ReplicaPhase::Pending | ReplicaPhase::Creating | ReplicaPhase::Terminating
        )
    }
}

/// Everything the reconciler tracks about one ordinal.
#[derive(Debug, Clone)]
pub struct ReplicaState {
    /// The current phase.
    pub phase: ReplicaPhase,
    /// The handle returned by the scheduler, once submitted.
    pub handle: Option<ReplicaHandle>,
    /// The template revision this replica was (or will be) created from.
    pub revision: Revision,
    /// When the current phase was entered.
    pub phase_since: DateTime<Utc>,
    /// When readiness was most recently first observed, if the probe is
    /// currently answering.
    pub ready_observed_at: Option<DateTime<Utc>>,
    /// When the replica became `Ready`, if it is.
    pub ready_since: Option<DateTime<Utc>>,
    /// Backoff for submit/terminate retries and failure recovery.
    pub backoff: Backoff,
    /// The earliest instant at which the next retryable side effect may be
    /// attempted, if one is due.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl ReplicaState {
    /// Creates the state for a slot that was just claimed (`Absent ->
    /// Pending`).
    pub fn pending(revision: Revision, backoff: BackoffConfig, now: DateTime<Utc>) -> ReplicaState {
        ReplicaState {
            phase: ReplicaPhase::Pending,
            handle: None,
            revision,
            phase_since: now,
            ready_observed_at: None,
            ready_since: None,
            backoff: Backoff::new(backoff),
            next_attempt_at: None,
        }
    }

    fn set_phase(&mut self, phase: ReplicaPhase, now: DateTime<Utc>) {
        if self.phase != phase {
            self.phase = phase;
            self.phase_since = now;
        }
    }

    /// `Pending -> Creating`: the replica was accepted by the scheduler.
    pub fn note_submitted(&mut self, handle: ReplicaHandle, now: DateTime<Utc>) {
        self.handle = Some(handle);
        self.next_attempt_at = None;
        self.backoff.reset();
        self.set_phase(ReplicaPhase::Creating, now);
    }

    /// `Creating -> Running`: the scheduler reported a start.
    pub fn note_running(&mut self, now: DateTime<Utc>) {
        if matches!(self.phase, ReplicaPhase::Pending | ReplicaPhase::Creating) {
            self.set_phase(ReplicaPhase::Running, now);
        }
    }

    /// `Creating/Running/Ready -> Failed`. Returns the backoff delay after
    /// which the slot may be retried.
    pub fn note_failed(&mut self, now: DateTime<Utc>) -> Duration {
        self.handle = None;
        self.ready_observed_at = None;
        self.ready_since = None;
        self.set_phase(ReplicaPhase::Failed, now);
        let delay = self.backoff.next_delay();
        self.next_attempt_at =
            Some(now + chrono::Duration::from_std(delay).expect("delay in range"));
        delay
    }

    /// `Failed -> Pending`: the backoff elapsed and the slot is being
    /// retried.
    pub fn note_retrying(&mut self, now: DateTime<Utc>) {
        self.next_attempt_at = None;
        self.set_phase(ReplicaPhase::Pending, now);
    }

    /// `* -> Terminating`: teardown was requested.
    pub fn note_terminating(&mut self, now: DateTime<Utc>) {
        self.ready_observed_at = None;
        self.ready_since = None;
        self.next_attempt_at = None;
        self.set_phase(ReplicaPhase::Terminating, now);
    }

    /// Records a retryable side-effect failure (submit or terminate) and
    /// schedules the next attempt.
    pub fn note_attempt_failed(&mut self, now: DateTime<Utc>) -> Duration {
        let delay = self.backoff.next_delay();
        self.next_attempt_at =
            Some(now + chrono::Duration::from_std(delay).expect("delay in range"));
        delay
    }

    /// Whether the next retryable side effect is due at `now`.
    pub fn attempt_due(&self, now: DateTime<Utc>) -> bool {
        match self.next_attempt_at {
            None => true,
            Some(at) => now >= at,
        }
    }

    /// Applies a readiness observation. `Running -> Ready` happens only
    /// once readiness has held for `dwell`; a not-ready observation drops
    /// a `Ready` replica back to `Running`. Returns true if the phase
    /// changed.
    ///
    /// A probe may answer before the scheduler's start notification
    /// arrives (the two travel on independent channels); such an
    /// observation starts the dwell but the phase stays `Creating` until
    /// the start is confirmed.
    pub fn note_readiness(&mut self, ready: bool, dwell: Duration, now: DateTime<Utc>) -> bool {
        let before = self.phase;
        match (self.phase, ready) {
            (ReplicaPhase::Running, true) => {
                let first = *self.ready_observed_at.get_or_insert(now);
                if now - first >= chrono::Duration::from_std(dwell).expect("dwell in range") {
                    self.ready_since = Some(first);
                    self.set_phase(ReplicaPhase::Ready, now);
                }
            }
            (ReplicaPhase::Ready, true) => {}
            (ReplicaPhase::Running | ReplicaPhase::Ready, false) => {
                self.ready_observed_at = None;
                self.ready_since = None;
                self.set_phase(ReplicaPhase::Running, now);
            }
            (ReplicaPhase::Creating, true) => {
                self.ready_observed_at.get_or_insert(now);
            }
            (ReplicaPhase::Creating, false) => {
                self.ready_observed_at = None;
            }
            // Readiness observed for a replica we are not watching
            // (pending, failed, or already tearing down).
            _ => {}
        }
        self.phase != before
    }

    /// The instant at which the pending readiness dwell completes, if one
    /// is in progress.
    pub fn dwell_deadline(&self, dwell: Duration) -> Option<DateTime<Utc>> {
        match (self.phase, self.ready_observed_at) {
            (ReplicaPhase::Running, Some(first)) => {
                Some(first + chrono::Duration::from_std(dwell).expect("dwell in range"))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use phalanx_orchestrator::ReplicaTemplate;

    use super::*;

    fn revision() -> Revision {
        Revision::of(&ReplicaTemplate(serde_json::json!({"cmd": "run"})))
    }

    fn state(now: DateTime<Utc>) -> ReplicaState {
        ReplicaState::pending(revision(), BackoffConfig::default(), now)
    }

    fn handle() -> ReplicaHandle {
        ReplicaHandle {
            id: "p1".into(),
            address: "127.0.0.1:4100".into(),
        }
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let t0 = Utc::now();
        let mut replica = state(t0);
        assert_eq!(replica.phase, ReplicaPhase::Pending);

        replica.note_submitted(handle(), t0);
        assert_eq!(replica.phase, ReplicaPhase::Creating);

        replica.note_running(t0);
        assert_eq!(replica.phase, ReplicaPhase::Running);

        // Zero dwell: ready on the first observation.
        assert!(replica.note_readiness(true, Duration::ZERO, t0));
        assert_eq!(replica.phase, ReplicaPhase::Ready);
        assert_eq!(replica.ready_since, Some(t0));

        replica.note_terminating(t0);
        assert_eq!(replica.phase, ReplicaPhase::Terminating);
        assert!(replica.phase.is_transitional());
    }

    #[test]
    fn test_readiness_dwell_debounces() {
        let t0 = Utc::now();
        let dwell = Duration::from_secs(5);
        let mut replica = state(t0);
        replica.note_submitted(handle(), t0);
        replica.note_running(t0);

        // First observation starts the dwell but does not promote.
        assert!(!replica.note_readiness(true, dwell, t0));
        assert_eq!(replica.phase, ReplicaPhase::Running);
        assert_eq!(replica.dwell_deadline(dwell), Some(t0 + chrono::Duration::seconds(5)));

        // A flap resets the dwell.
        replica.note_readiness(false, dwell, t0 + chrono::Duration::seconds(3));
        assert_eq!(replica.dwell_deadline(dwell), None);
        replica.note_readiness(true, dwell, t0 + chrono::Duration::seconds(4));
        assert!(!replica.note_readiness(true, dwell, t0 + chrono::Duration::seconds(8)));

        // Held long enough.
        assert!(replica.note_readiness(true, dwell, t0 + chrono::Duration::seconds(9)));
        assert_eq!(replica.phase, ReplicaPhase::Ready);

        // Ready replicas regress on a failed probe.
        assert!(replica.note_readiness(false, dwell, t0 + chrono::Duration::seconds(10)));
        assert_eq!(replica.phase, ReplicaPhase::Running);
        assert_eq!(replica.ready_since, None);
    }

    #[test]
    fn test_readiness_before_start_confirmation() {
        let t0 = Utc::now();
        let mut replica = state(t0);
        replica.note_submitted(handle(), t0);

        // The probe answers before the scheduler reports the start.
        assert!(!replica.note_readiness(true, Duration::ZERO, t0));
        assert_eq!(replica.phase, ReplicaPhase::Creating);

        // The earlier observation still counts toward the dwell.
        replica.note_running(t0);
        assert!(replica.note_readiness(true, Duration::ZERO, t0));
        assert_eq!(replica.phase, ReplicaPhase::Ready);
    }

    #[test]
    fn test_failure_backoff_schedule() {
        let t0 = Utc::now();
        let mut replica = ReplicaState::pending(
            revision(),
            BackoffConfig {
                initial: Duration::from_secs(2),
                factor: 2.0,
                cap: Duration::from_secs(60),
                jitter: 0.0,
            },
            t0,
        );
        replica.note_submitted(handle(), t0);
        replica.note_running(t0);

        let delay = replica.note_failed(t0);
        assert_eq!(replica.phase, ReplicaPhase::Failed);
        assert_eq!(delay, Duration::from_secs(2));
        assert!(!replica.attempt_due(t0));
        assert!(replica.attempt_due(t0 + chrono::Duration::seconds(2)));

        replica.note_retrying(t0 + chrono::Duration::seconds(2));
        assert_eq!(replica.phase, ReplicaPhase::Pending);

        // The next failure backs off further; submission success resets.
        replica.note_failed(t0 + chrono::Duration::seconds(2));
        assert_eq!(replica.backoff.attempts(), 2);
        replica.note_retrying(t0 + chrono::Duration::seconds(6));
        replica.note_submitted(handle(), t0 + chrono::Duration::seconds(7));
        assert_eq!(replica.backoff.attempts(), 0);
    }
}
