// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-set reconciliation task.
//!
//! Each replica set is reconciled by exactly one task, which exclusively
//! owns all mutable state for the set. Collaborator notifications
//! (scheduler transitions, readiness observations, claim binds) re-trigger
//! reconciliation immediately; a periodic resync against
//! [`Scheduler::list`] covers missed notifications. Each pass is
//! idempotent: against unchanged observed and desired state it dispatches
//! nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use phalanx_orchestrator::{
    ClaimPhase, NameRegistry, ReadinessEvent, ReadinessProbe, ReplicaTemplate, Revision, Scheduler,
    ScheduledStatus, SchedulerEvent, StorageProvisioner,
};

use crate::identity::{parse_replica_name, IdentityAllocator};
use crate::policy::{self, Action};
use crate::replica::{ReplicaPhase, ReplicaState};
use crate::storage::StorageBinder;
use crate::update;
use crate::{
    Blocked, ClaimRetention, Clients, ControllerConfig, ReplicaSetSpec, SetEvent, SetPhase,
    SetStatus,
};

/// A command from the controller front end to a set's task.
#[derive(Debug)]
pub(crate) enum Command {
    /// Reconcile toward a new spec.
    Apply(ReplicaSetSpec),
    /// Tear the set down and exit.
    Delete,
}

pub(crate) struct SetTask {
    spec: ReplicaSetSpec,
    config: ControllerConfig,
    clients: Clients,
    identities: IdentityAllocator,
    update_revision: Revision,
    replicas: BTreeMap<u64, ReplicaState>,
    binder: StorageBinder,
    status_tx: watch::Sender<SetStatus>,
    events_tx: broadcast::Sender<SetEvent>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    deleting: bool,
}

impl SetTask {
    pub(crate) fn new(
        spec: ReplicaSetSpec,
        config: ControllerConfig,
        clients: Clients,
        status_tx: watch::Sender<SetStatus>,
        events_tx: broadcast::Sender<SetEvent>,
        commands_rx: mpsc::UnboundedReceiver<Command>,
    ) -> SetTask {
        let identities = IdentityAllocator::new(&spec);
        let update_revision = spec.template.revision();
        let binder = StorageBinder::new(Arc::clone(&clients.storage), spec.volume_claim.clone());
        SetTask {
            spec,
            config,
            clients,
            identities,
            update_revision,
            replicas: BTreeMap::new(),
            binder,
            status_tx,
            events_tx,
            commands_rx,
            deleting: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut scheduler_events = self.clients.scheduler.watch().fuse();
        let mut readiness_events = self.clients.probe.watch().fuse();
        let mut claim_events = self.clients.storage.watch().fuse();
        let (mut scheduler_done, mut readiness_done, mut claims_done) = (false, false, false);
        let mut commands_done = false;
        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(set = %self.spec.name, "reconciling replica set");

        loop {
            self.reconcile().await;

            if self.deleting && self.replicas.is_empty() {
                self.finish_delete().await;
                return;
            }

            let wakeup = self.next_wakeup();
            tokio::select! {
                command = self.commands_rx.recv(), if !commands_done => match command {
                    Some(Command::Apply(spec)) => self.apply_spec(spec),
                    // A closed channel means the controller is gone; tear
                    // down as if deleted.
                    Some(Command::Delete) | None => {
                        if command.is_none() {
                            commands_done = true;
                        }
                        if !self.deleting {
                            info!(set = %self.spec.name, "deleting replica set");
                            self.deleting = true;
                        }
                    }
                },
                event = scheduler_events.next(), if !scheduler_done => match event {
                    Some(Ok(event)) => self.observe_scheduler(event).await,
                    Some(Err(error)) => warn!("scheduler watch error: {error}"),
                    None => scheduler_done = true,
                },
                event = readiness_events.next(), if !readiness_done => match event {
                    Some(Ok(event)) => self.observe_readiness(event),
                    Some(Err(error)) => warn!("readiness watch error: {error}"),
                    None => readiness_done = true,
                },
                event = claim_events.next(), if !claims_done => match event {
                    Some(Ok(event)) => self.binder.observe(&event),
                    Some(Err(error)) => warn!("claim watch error: {error}"),
                    None => claims_done = true,
                },
                _ = resync.tick() => self.resync().await,
                _ = tokio::time::sleep(wakeup.unwrap_or(Duration::from_secs(3600))),
                    if wakeup.is_some() => {}
            }
        }
    }

    /// One reconciliation pass: promote dwelled replicas, retry failures
    /// whose backoff elapsed, dispatch at most what the ordering policy
    /// allows, then publish status.
    async fn reconcile(&mut self) {
        let now = Utc::now();

        self.promote_dwelled(now);
        if !self.deleting {
            self.maybe_retry_failed(now);
        }

        let desired = if self.deleting {
            0
        } else {
            self.spec.desired_replicas
        };
        let phases: BTreeMap<u64, ReplicaPhase> = self
            .replicas
            .iter()
            .map(|(&ordinal, replica)| (ordinal, replica.phase))
            .collect();
        let mut actions = policy::plan(self.spec.management_policy, desired, &phases);

        if actions.is_empty() && !self.deleting {
            let view: BTreeMap<u64, (ReplicaPhase, Revision)> = self
                .replicas
                .iter()
                .map(|(&ordinal, replica)| (ordinal, (replica.phase, replica.revision.clone())))
                .collect();
            if let Some(ordinal) = update::next_update(
                &self.spec.update_strategy,
                desired,
                &view,
                &self.update_revision,
            ) {
                info!(
                    set = %self.spec.name,
                    ordinal,
                    revision = self.update_revision.short(),
                    "rolling replica to new revision"
                );
                actions.push(Action::Update(ordinal));
            }
        }

        for action in actions {
            self.dispatch(action, now).await;
        }

        self.pump_pending(now).await;
        self.pump_terminating(now).await;
        self.publish_status(now);
    }

    async fn dispatch(&mut self, action: Action, now: DateTime<Utc>) {
        match action {
            Action::Create(ordinal) => {
                let identity = self.identities.identity_for(ordinal);
                // Absent -> Pending is gated on the claim request being
                // accepted; submission waits further for the bind.
                match self.binder.ensure_claim(&identity).await {
                    Ok(_) => {
                        let replica = ReplicaState::pending(
                            self.update_revision.clone(),
                            self.config.backoff.clone(),
                            now,
                        );
                        self.replicas.insert(ordinal, replica);
                        self.emit(ordinal, ReplicaPhase::Pending, now);
                    }
                    Err(error) => {
                        warn!(
                            set = %self.spec.name,
                            ordinal, "claim request failed: {error:#}"
                        );
                    }
                }
            }
            Action::Delete(ordinal) | Action::Update(ordinal) => {
                self.terminate_replica(ordinal, now).await;
            }
        }
    }

    async fn terminate_replica(&mut self, ordinal: u64, now: DateTime<Utc>) {
        let identity = self.identities.identity_for(ordinal);
        let Some(replica) = self.replicas.get_mut(&ordinal) else {
            return;
        };
        let had_process = replica.handle.is_some();
        replica.note_terminating(now);
        self.emit(ordinal, ReplicaPhase::Terminating, now);
        match self.clients.scheduler.terminate(&identity).await {
            // Nothing was ever scheduled, so no Stopped event will come:
            // the slot is immediately absent.
            Ok(()) if !had_process => self.remove_replica(ordinal, now).await,
            Ok(()) => {}
            Err(error) => {
                warn!(
                    set = %self.spec.name,
                    ordinal, "terminate failed, will retry: {error:#}"
                );
                if let Some(replica) = self.replicas.get_mut(&ordinal) {
                    replica.note_attempt_failed(now);
                }
            }
        }
    }

    /// Submits any pending replicas whose claims are bound and whose retry
    /// backoff (if any) has elapsed.
    async fn pump_pending(&mut self, now: DateTime<Utc>) {
        let pending: Vec<u64> = self
            .replicas
            .iter()
            .filter(|(_, replica)| replica.phase == ReplicaPhase::Pending)
            .map(|(&ordinal, _)| ordinal)
            .collect();
        let template = self.spec.template.clone();
        for ordinal in pending {
            let identity = self.identities.identity_for(ordinal);
            if !self.binder.is_bound(&identity) {
                continue;
            }
            let Some(replica) = self.replicas.get(&ordinal) else {
                continue;
            };
            if !replica.attempt_due(now) {
                continue;
            }
            self.submit_replica(ordinal, &template, now).await;
        }
    }

    async fn submit_replica(&mut self, ordinal: u64, template: &ReplicaTemplate, now: DateTime<Utc>) {
        let identity = self.identities.identity_for(ordinal);
        match self.clients.scheduler.submit(&identity, template).await {
            Ok(handle) => {
                debug!(
                    set = %self.spec.name,
                    ordinal,
                    address = %handle.address,
                    "replica submitted"
                );
                if let Err(error) = self
                    .clients
                    .names
                    .publish(&identity.dns_name, &handle.address)
                    .await
                {
                    warn!(
                        set = %self.spec.name,
                        ordinal, "failed to publish name: {error:#}"
                    );
                }
                if let Err(error) = self.clients.probe.observe(&identity, &handle).await {
                    warn!(
                        set = %self.spec.name,
                        ordinal, "failed to start readiness probe: {error:#}"
                    );
                }
                if let Some(replica) = self.replicas.get_mut(&ordinal) {
                    replica.note_submitted(handle, now);
                }
                self.emit(ordinal, ReplicaPhase::Creating, now);
            }
            Err(error) => {
                warn!(
                    set = %self.spec.name,
                    ordinal, "transient scheduling error: {error:#}"
                );
                if let Some(replica) = self.replicas.get_mut(&ordinal) {
                    let delay = replica.note_attempt_failed(now);
                    debug!(set = %self.spec.name, ordinal, "retrying submit in {delay:?}");
                }
            }
        }
    }

    /// Retries termination for replicas whose previous terminate call
    /// failed.
    async fn pump_terminating(&mut self, now: DateTime<Utc>) {
        let due: Vec<u64> = self
            .replicas
            .iter()
            .filter(|(_, replica)| {
                replica.phase == ReplicaPhase::Terminating
                    && replica.next_attempt_at.is_some()
                    && replica.attempt_due(now)
            })
            .map(|(&ordinal, _)| ordinal)
            .collect();
        for ordinal in due {
            let identity = self.identities.identity_for(ordinal);
            match self.clients.scheduler.terminate(&identity).await {
                Ok(()) => {
                    let had_process = self
                        .replicas
                        .get(&ordinal)
                        .is_some_and(|replica| replica.handle.is_some());
                    if let Some(replica) = self.replicas.get_mut(&ordinal) {
                        replica.next_attempt_at = None;
                    }
                    if !had_process {
                        self.remove_replica(ordinal, now).await;
                    }
                }
                Err(error) => {
                    warn!(
                        set = %self.spec.name,
                        ordinal, "terminate failed, will retry: {error:#}"
                    );
                    if let Some(replica) = self.replicas.get_mut(&ordinal) {
                        replica.note_attempt_failed(now);
                    }
                }
            }
        }
    }

    /// Promotes `Running` replicas whose readiness has now held for the
    /// full dwell. Readiness events start the dwell; this finishes it even
    /// if no further event arrives.
    fn promote_dwelled(&mut self, now: DateTime<Utc>) {
        let dwell = self.config.ready_dwell;
        let mut promoted = Vec::new();
        for (&ordinal, replica) in self.replicas.iter_mut() {
            if replica.phase == ReplicaPhase::Running
                && replica.ready_observed_at.is_some()
                && replica.note_readiness(true, dwell, now)
            {
                promoted.push(ordinal);
            }
        }
        for ordinal in promoted {
            self.emit(ordinal, ReplicaPhase::Ready, now);
        }
    }

    /// Moves `Failed` replicas whose backoff elapsed back to `Pending`.
    /// Under `OrderedReady` this respects the single-action invariant: a
    /// retry is itself the in-flight action.
    fn maybe_retry_failed(&mut self, now: DateTime<Utc>) {
        let ordered = self.spec.management_policy == crate::ManagementPolicy::OrderedReady;
        let any_transitional = self
            .replicas
            .values()
            .any(|replica| replica.phase.is_transitional());
        if ordered && any_transitional {
            return;
        }
        let retry_budget = self.config.retry_budget;
        let desired = self.spec.desired_replicas;
        let mut retried = Vec::new();
        for (&ordinal, replica) in self.replicas.iter_mut() {
            if replica.phase != ReplicaPhase::Failed || ordinal >= desired {
                continue;
            }
            if retry_budget.is_some_and(|budget| replica.backoff.attempts() >= budget) {
                continue;
            }
            if !replica.attempt_due(now) {
                continue;
            }
            replica.note_retrying(now);
            retried.push(ordinal);
            if ordered {
                break;
            }
        }
        for ordinal in retried {
            self.emit(ordinal, ReplicaPhase::Pending, now);
        }
    }

    async fn observe_scheduler(&mut self, event: SchedulerEvent) {
        let Some((set, ordinal)) = parse_replica_name(&event.replica) else {
            return;
        };
        if set != self.spec.name {
            return;
        }
        let now = event.time;
        let Some(replica) = self.replicas.get_mut(&ordinal) else {
            return;
        };
        match event.status {
            ScheduledStatus::Starting => {}
            ScheduledStatus::Running => {
                if replica.phase != ReplicaPhase::Running {
                    replica.note_running(now);
                    if replica.phase == ReplicaPhase::Running {
                        self.emit(ordinal, ReplicaPhase::Running, now);
                    }
                }
            }
            ScheduledStatus::Failed { reason } => {
                if replica.phase == ReplicaPhase::Terminating {
                    // A terminated replica may surface as a failed exit;
                    // either way it is gone.
                    self.remove_replica(ordinal, now).await;
                } else {
                    warn!(
                        set = %self.spec.name,
                        ordinal,
                        reason = reason.as_deref().unwrap_or("unknown"),
                        "replica failed"
                    );
                    let delay = replica.note_failed(now);
                    debug!(set = %self.spec.name, ordinal, "retrying replica in {delay:?}");
                    self.emit(ordinal, ReplicaPhase::Failed, now);
                }
            }
            ScheduledStatus::Stopped => {
                // Confirmed removal: either the termination we requested,
                // or an external deletion the next pass will repair.
                self.remove_replica(ordinal, now).await;
            }
        }
    }

    fn observe_readiness(&mut self, event: ReadinessEvent) {
        let Some((set, ordinal)) = parse_replica_name(&event.replica) else {
            return;
        };
        if set != self.spec.name {
            return;
        }
        let dwell = self.config.ready_dwell;
        if let Some(replica) = self.replicas.get_mut(&ordinal) {
            if replica.note_readiness(event.ready, dwell, event.time) {
                let phase = replica.phase;
                self.emit(ordinal, phase, event.time);
            }
        }
    }

    /// Reconciles tracked replicas against [`Scheduler::list`]: the
    /// fallback for missed watch notifications. Tracked replicas the
    /// scheduler no longer knows are treated as stopped; scheduled
    /// replicas of this set that nothing tracks are orphans from an
    /// earlier incarnation and are terminated.
    async fn resync(&mut self) {
        let now = Utc::now();
        let known = match self.clients.scheduler.list().await {
            Ok(names) => names.into_iter().collect::<BTreeSet<_>>(),
            Err(error) => {
                warn!(set = %self.spec.name, "resync list failed: {error:#}");
                return;
            }
        };

        let submitted: Vec<u64> = self
            .replicas
            .iter()
            .filter(|(_, replica)| replica.handle.is_some())
            .map(|(&ordinal, _)| ordinal)
            .collect();
        for ordinal in submitted {
            let identity = self.identities.identity_for(ordinal);
            if !known.contains(&identity.name) {
                debug!(
                    set = %self.spec.name,
                    ordinal, "replica vanished; observed as absent"
                );
                self.remove_replica(ordinal, now).await;
            }
        }

        for name in known {
            let Some((set, ordinal)) = parse_replica_name(&name) else {
                continue;
            };
            if set != self.spec.name || self.replicas.contains_key(&ordinal) {
                continue;
            }
            warn!(
                set = %self.spec.name,
                ordinal, "terminating orphaned replica {name}"
            );
            let identity = self.identities.identity_for(ordinal);
            if let Err(error) = self.clients.scheduler.terminate(&identity).await {
                warn!(
                    set = %self.spec.name,
                    ordinal, "failed to terminate orphan: {error:#}"
                );
            }
        }
    }

    /// Drops the tracked state for an ordinal: the slot is now `Absent`.
    /// The identity itself is never reassigned; a future replica at this
    /// ordinal reuses the same name, DNS label, and claim.
    async fn remove_replica(&mut self, ordinal: u64, now: DateTime<Utc>) {
        if self.replicas.remove(&ordinal).is_none() {
            return;
        }
        let identity = self.identities.identity_for(ordinal);
        if let Err(error) = self.clients.probe.forget(&identity).await {
            warn!(
                set = %self.spec.name,
                ordinal, "failed to stop readiness probe: {error:#}"
            );
        }
        if let Err(error) = self.clients.names.unpublish(&identity.dns_name).await {
            warn!(
                set = %self.spec.name,
                ordinal, "failed to unpublish name: {error:#}"
            );
        }
        if !self.deleting
            && ordinal >= self.spec.desired_replicas
            && self.spec.claim_retention.when_scaled == ClaimRetention::Delete
        {
            if let Err(error) = self.binder.release_claim(&identity).await {
                warn!(
                    set = %self.spec.name,
                    ordinal, "failed to release claim: {error:#}"
                );
            }
        }
        self.emit(ordinal, ReplicaPhase::Absent, now);
    }

    fn apply_spec(&mut self, spec: ReplicaSetSpec) {
        // Identity-anchoring fields were validated immutable by the front
        // end; a changed template re-fingerprints the set.
        self.update_revision = spec.template.revision();
        debug!(
            set = %spec.name,
            replicas = spec.desired_replicas,
            revision = self.update_revision.short(),
            "applied spec"
        );
        self.spec = spec;
    }

    async fn finish_delete(&mut self) {
        if self.spec.claim_retention.when_deleted == ClaimRetention::Delete {
            if let Err(error) = self.binder.release_all().await {
                warn!(set = %self.spec.name, "failed to release claims: {error:#}");
            }
        }
        self.publish_status(Utc::now());
        info!(set = %self.spec.name, "replica set deleted");
    }

    fn compute_blocked(&self, now: DateTime<Utc>) -> Option<Blocked> {
        let timeout =
            chrono::Duration::from_std(self.config.readiness_timeout).expect("timeout in range");
        for (&ordinal, replica) in &self.replicas {
            if ordinal >= self.spec.desired_replicas {
                continue;
            }
            match replica.phase {
                ReplicaPhase::Pending => {
                    let identity = self.identities.identity_for(ordinal);
                    if let Some(claim) = self.binder.claim_for(&identity) {
                        let lost = claim.phase == ClaimPhase::Lost;
                        if lost || (claim.phase == ClaimPhase::Pending
                            && now - claim.requested_at > timeout)
                        {
                            return Some(Blocked::ClaimUnbound {
                                claim: claim.name.clone(),
                                ordinal,
                                since: claim.requested_at,
                            });
                        }
                    }
                }
                ReplicaPhase::Creating | ReplicaPhase::Running => {
                    if now - replica.phase_since > timeout {
                        return Some(Blocked::ReadinessTimeout {
                            ordinal,
                            since: replica.phase_since,
                        });
                    }
                }
                ReplicaPhase::Failed => {
                    if self
                        .config
                        .retry_budget
                        .is_some_and(|budget| replica.backoff.attempts() >= budget)
                    {
                        return Some(Blocked::RetriesExhausted { ordinal });
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn publish_status(&self, now: DateTime<Utc>) {
        let desired = self.spec.desired_replicas;
        let replicas = u64::try_from(self.replicas.len()).expect("replica count fits");
        let ready_replicas = u64::try_from(
            self.replicas
                .values()
                .filter(|replica| replica.phase == ReplicaPhase::Ready)
                .count(),
        )
        .expect("replica count fits");
        let updated_replicas = u64::try_from(
            self.replicas
                .values()
                .filter(|replica| replica.revision == self.update_revision)
                .count(),
        )
        .expect("replica count fits");
        // The current revision is whatever the oldest surviving replica
        // runs; it converges on the update revision as the rollout
        // completes.
        let current_revision = self
            .replicas
            .values()
            .next()
            .map(|replica| replica.revision.clone())
            .unwrap_or_else(|| self.update_revision.clone());
        let blocked = if self.deleting {
            None
        } else {
            self.compute_blocked(now)
        };
        let phase = if self.deleting {
            SetPhase::Deleting
        } else if blocked.is_some() {
            SetPhase::Blocked
        } else if replicas == desired && ready_replicas == desired && updated_replicas == desired {
            SetPhase::Stable
        } else {
            SetPhase::Progressing
        };
        let status = SetStatus {
            replicas,
            ready_replicas,
            updated_replicas,
            current_revision,
            update_revision: self.update_revision.clone(),
            phase,
            blocked,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn emit(&self, ordinal: u64, phase: ReplicaPhase, time: DateTime<Utc>) {
        debug!(set = %self.spec.name, ordinal, ?phase, "replica transition");
        let _ = self.events_tx.send(SetEvent {
            set: self.spec.name.clone(),
            ordinal,
            phase,
            time,
        });
    }

    /// The earliest pending deadline: a submit/terminate retry, a failure
    /// backoff expiring, or a readiness dwell completing. Deadlines that
    /// already passed are excluded: the pass that just ran either consumed
    /// them or declined them, and declined work is unblocked by events or
    /// the periodic resync, not by spinning.
    fn next_wakeup(&self) -> Option<Duration> {
        let now = Utc::now();
        let mut earliest: Option<DateTime<Utc>> = None;
        for replica in self.replicas.values() {
            for deadline in [
                replica.next_attempt_at,
                replica.dwell_deadline(self.config.ready_dwell),
            ]
            .into_iter()
            .flatten()
            {
                if deadline <= now {
                    continue;
                }
                earliest = Some(match earliest {
                    None => deadline,
                    Some(current) => current.min(deadline),
                });
            }
        }
        earliest.map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }
}
