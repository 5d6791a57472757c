// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Integration tests driving a full [`Controller`] against scripted
//! in-memory collaborators.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use phalanx_controller::retry::BackoffConfig;
use phalanx_controller::{
    Blocked, ClaimRetention, Clients, Controller, ControllerConfig, ControllerError,
    ManagementPolicy, ReplicaSetSpec, SetPhase, UpdateStrategy,
};
use phalanx_orchestrator::{
    ClaimEvent, ClaimHandle, ClaimPhase, NameRegistry, ReadinessEvent, ReadinessProbe,
    ReplicaHandle, ReplicaIdentity, ReplicaTemplate, Revision, Scheduler, ScheduledStatus,
    SchedulerEvent, StorageProvisioner, VolumeClaimTemplate,
};

/// A scripted stand-in for all four collaborators. Submissions and
/// terminations are only logged; tests drive the asynchronous outcomes
/// (starts, readiness, stops) explicitly.
#[derive(Debug)]
struct Fake {
    state: Mutex<FakeState>,
    scheduler_tx: tokio::sync::broadcast::Sender<SchedulerEvent>,
    readiness_tx: tokio::sync::broadcast::Sender<ReadinessEvent>,
    claim_tx: tokio::sync::broadcast::Sender<ClaimEvent>,
}

#[derive(Debug, Default)]
struct FakeState {
    submitted: Vec<(String, Revision)>,
    terminated: Vec<String>,
    scheduled: BTreeSet<String>,
    claims_created: Vec<String>,
    claims_deleted: Vec<String>,
    records: BTreeMap<String, String>,
}

impl Fake {
    fn new() -> Arc<Fake> {
        let (scheduler_tx, _) = tokio::sync::broadcast::channel(256);
        let (readiness_tx, _) = tokio::sync::broadcast::channel(256);
        let (claim_tx, _) = tokio::sync::broadcast::channel(256);
        Arc::new(Fake {
            state: Mutex::new(FakeState::default()),
            scheduler_tx,
            readiness_tx,
            claim_tx,
        })
    }

    fn clients(self: &Arc<Fake>) -> Clients {
        let scheduler_src: Arc<Fake> = Arc::clone(self);
        let scheduler: Arc<dyn Scheduler> = scheduler_src;
        let probe_src: Arc<Fake> = Arc::clone(self);
        let probe: Arc<dyn ReadinessProbe> = probe_src;
        let storage_src: Arc<Fake> = Arc::clone(self);
        let storage: Arc<dyn StorageProvisioner> = storage_src;
        let names_src: Arc<Fake> = Arc::clone(self);
        let names: Arc<dyn NameRegistry> = names_src;
        Clients {
            scheduler,
            probe,
            storage,
            names,
        }
    }

    fn mark_running(&self, replica: &str) {
        let _ = self.scheduler_tx.send(SchedulerEvent {
            replica: replica.into(),
            status: ScheduledStatus::Running,
            time: Utc::now(),
        });
    }

    fn mark_ready(&self, replica: &str) {
        let _ = self.readiness_tx.send(ReadinessEvent {
            replica: replica.into(),
            ready: true,
            time: Utc::now(),
        });
    }

    /// Reports the replica gone, as both an explicit termination and an
    /// external deletion look.
    fn mark_stopped(&self, replica: &str) {
        self.state
            .lock()
            .expect("lock poisoned")
            .scheduled
            .remove(replica);
        let _ = self.scheduler_tx.send(SchedulerEvent {
            replica: replica.into(),
            status: ScheduledStatus::Stopped,
            time: Utc::now(),
        });
    }

    fn submitted(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("lock poisoned")
            .submitted
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn submitted_revisions(&self) -> Vec<(String, Revision)> {
        self.state.lock().expect("lock poisoned").submitted.clone()
    }

    fn terminated(&self) -> Vec<String> {
        self.state.lock().expect("lock poisoned").terminated.clone()
    }

    fn claims_created(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("lock poisoned")
            .claims_created
            .clone()
    }

    fn claims_deleted(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("lock poisoned")
            .claims_deleted
            .clone()
    }

    fn records(&self) -> BTreeMap<String, String> {
        self.state.lock().expect("lock poisoned").records.clone()
    }
}

#[async_trait]
impl Scheduler for Fake {
    async fn submit(
        &self,
        identity: &ReplicaIdentity,
        template: &ReplicaTemplate,
    ) -> Result<ReplicaHandle, anyhow::Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        state
            .submitted
            .push((identity.name.clone(), template.revision()));
        state.scheduled.insert(identity.name.clone());
        Ok(ReplicaHandle {
            id: identity.name.clone(),
            address: format!("127.0.0.1:{}", 4100 + identity.ordinal),
        })
    }

    async fn terminate(&self, identity: &ReplicaIdentity) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.scheduled.contains(&identity.name) {
            state.terminated.push(identity.name.clone());
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, anyhow::Error> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state.scheduled.iter().cloned().collect())
    }

    fn watch(&self) -> BoxStream<'static, Result<SchedulerEvent, anyhow::Error>> {
        Box::pin(
            BroadcastStream::new(self.scheduler_tx.subscribe())
                .filter_map(|event| async move { event.ok().map(Ok) }),
        )
    }
}

#[async_trait]
impl ReadinessProbe for Fake {
    async fn observe(
        &self,
        _identity: &ReplicaIdentity,
        _handle: &ReplicaHandle,
    ) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn forget(&self, _identity: &ReplicaIdentity) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, Result<ReadinessEvent, anyhow::Error>> {
        Box::pin(
            BroadcastStream::new(self.readiness_tx.subscribe())
                .filter_map(|event| async move { event.ok().map(Ok) }),
        )
    }
}

#[async_trait]
impl StorageProvisioner for Fake {
    async fn create_claim(
        &self,
        name: &str,
        _template: &VolumeClaimTemplate,
    ) -> Result<ClaimHandle, anyhow::Error> {
        self.state
            .lock()
            .expect("lock poisoned")
            .claims_created
            .push(name.into());
        // Bind immediately; the controller still sees it as an
        // asynchronous notification.
        let _ = self.claim_tx.send(ClaimEvent {
            claim: name.into(),
            phase: ClaimPhase::Bound,
            time: Utc::now(),
        });
        Ok(ClaimHandle {
            id: format!("vol/{name}"),
        })
    }

    async fn delete_claim(&self, handle: &ClaimHandle) -> Result<(), anyhow::Error> {
        self.state
            .lock()
            .expect("lock poisoned")
            .claims_deleted
            .push(handle.id.clone());
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, Result<ClaimEvent, anyhow::Error>> {
        Box::pin(
            BroadcastStream::new(self.claim_tx.subscribe())
                .filter_map(|event| async move { event.ok().map(Ok) }),
        )
    }
}

#[async_trait]
impl NameRegistry for Fake {
    async fn publish(&self, dns_name: &str, address: &str) -> Result<(), anyhow::Error> {
        self.state
            .lock()
            .expect("lock poisoned")
            .records
            .insert(dns_name.into(), address.into());
        Ok(())
    }

    async fn unpublish(&self, dns_name: &str) -> Result<(), anyhow::Error> {
        self.state
            .lock()
            .expect("lock poisoned")
            .records
            .remove(dns_name);
        Ok(())
    }

    async fn records(&self) -> Result<BTreeMap<String, String>, anyhow::Error> {
        Ok(self.state.lock().expect("lock poisoned").records.clone())
    }
}

fn test_config() -> ControllerConfig {
    ControllerConfig {
        resync_interval: Duration::from_millis(100),
        ready_dwell: Duration::ZERO,
        readiness_timeout: Duration::from_secs(60),
        backoff: BackoffConfig {
            initial: Duration::from_millis(5),
            factor: 2.0,
            cap: Duration::from_millis(50),
            jitter: 0.0,
        },
        retry_budget: None,
    }
}

fn template(tag: &str) -> ReplicaTemplate {
    ReplicaTemplate(serde_json::json!({ "command": ["serve"], "tag": tag }))
}

fn trainer_spec(replicas: u64) -> ReplicaSetSpec {
    let mut spec = ReplicaSetSpec::new("trainer", "trainer", replicas, template("v1"));
    spec.volume_claim = Some(VolumeClaimTemplate {
        name: "ckpt".into(),
        size: bytesize::ByteSize::gib(1),
        storage_class: None,
    });
    spec
}

/// Polls until `condition` holds, panicking after a generous timeout.
async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Drives the replica with the given name to `Ready`.
async fn bring_up(fake: &Arc<Fake>, replica: &str) {
    fake.mark_running(replica);
    fake.mark_ready(replica);
}

/// Waits until the set reports the given phase.
async fn await_phase(controller: &Controller, set: &str, phase: SetPhase) {
    let status = controller.status(set).expect("set exists");
    eventually(&format!("{set} to reach {phase:?}"), || {
        status.borrow().phase == phase
    })
    .await;
}

#[tokio::test]
async fn test_ordered_startup_one_ordinal_at_a_time() {
    let fake = Fake::new();
    let controller = Controller::new(test_config(), fake.clients());
    controller.apply(trainer_spec(3)).expect("spec applies");

    // Exactly create(0) first, and its claim before it.
    eventually("trainer-0 submitted", || {
        fake.submitted() == vec!["trainer-0"]
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fake.submitted(), vec!["trainer-0"]);
    assert_eq!(fake.claims_created(), vec!["ckpt-trainer-0"]);

    // Ordinal 1 only once ordinal 0 is ready.
    bring_up(&fake, "trainer-0").await;
    eventually("trainer-1 submitted", || {
        fake.submitted() == vec!["trainer-0", "trainer-1"]
    })
    .await;

    bring_up(&fake, "trainer-1").await;
    eventually("trainer-2 submitted", || {
        fake.submitted() == vec!["trainer-0", "trainer-1", "trainer-2"]
    })
    .await;

    bring_up(&fake, "trainer-2").await;
    await_phase(&controller, "trainer", SetPhase::Stable).await;

    let status = controller.status("trainer").expect("set exists");
    let snapshot = status.borrow().clone();
    assert_eq!(snapshot.replicas, 3);
    assert_eq!(snapshot.ready_replicas, 3);
    assert_eq!(snapshot.updated_replicas, 3);

    // Stable names were published for every replica.
    let records = fake.records();
    for ordinal in 0..3 {
        assert!(records.contains_key(&format!("trainer-{ordinal}.trainer")));
    }
}

#[tokio::test]
async fn test_reconcile_is_idempotent_when_stable() {
    let fake = Fake::new();
    let controller = Controller::new(test_config(), fake.clients());
    controller.apply(trainer_spec(2)).expect("spec applies");

    eventually("trainer-0 submitted", || !fake.submitted().is_empty()).await;
    bring_up(&fake, "trainer-0").await;
    eventually("trainer-1 submitted", || fake.submitted().len() == 2).await;
    bring_up(&fake, "trainer-1").await;
    await_phase(&controller, "trainer", SetPhase::Stable).await;

    // Several resync intervals of a stable set: zero further actions.
    let submitted = fake.submitted().len();
    let claims = fake.claims_created().len();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fake.submitted().len(), submitted);
    assert_eq!(fake.claims_created().len(), claims);
    assert_eq!(fake.terminated(), Vec::<String>::new());
}

#[tokio::test]
async fn test_ordered_scale_down_descends_and_retains_claims() {
    let fake = Fake::new();
    let controller = Controller::new(test_config(), fake.clients());
    controller.apply(trainer_spec(3)).expect("spec applies");

    for ordinal in 0..3 {
        eventually("replica submitted", || {
            fake.submitted().len() == ordinal + 1
        })
        .await;
        bring_up(&fake, &format!("trainer-{ordinal}")).await;
    }
    await_phase(&controller, "trainer", SetPhase::Stable).await;

    // Scale 3 -> 1: exactly delete(2), wait, delete(1).
    controller.apply(trainer_spec(1)).expect("spec applies");
    eventually("trainer-2 terminated", || {
        fake.terminated() == vec!["trainer-2"]
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fake.terminated(), vec!["trainer-2"]);

    fake.mark_stopped("trainer-2");
    eventually("trainer-1 terminated", || {
        fake.terminated() == vec!["trainer-2", "trainer-1"]
    })
    .await;
    fake.mark_stopped("trainer-1");
    await_phase(&controller, "trainer", SetPhase::Stable).await;

    // Ordinal 0 and every claim are untouched.
    assert_eq!(fake.terminated(), vec!["trainer-2", "trainer-1"]);
    assert_eq!(fake.claims_deleted(), Vec::<String>::new());
}

#[tokio::test]
async fn test_scale_down_releases_claims_under_delete_retention() {
    let fake = Fake::new();
    let controller = Controller::new(test_config(), fake.clients());
    let mut spec = trainer_spec(2);
    spec.claim_retention.when_scaled = ClaimRetention::Delete;
    controller.apply(spec.clone()).expect("spec applies");

    eventually("trainer-0 submitted", || !fake.submitted().is_empty()).await;
    bring_up(&fake, "trainer-0").await;
    eventually("trainer-1 submitted", || fake.submitted().len() == 2).await;
    bring_up(&fake, "trainer-1").await;
    await_phase(&controller, "trainer", SetPhase::Stable).await;

    spec.desired_replicas = 1;
    controller.apply(spec).expect("spec applies");
    eventually("trainer-1 terminated", || {
        fake.terminated() == vec!["trainer-1"]
    })
    .await;
    fake.mark_stopped("trainer-1");
    eventually("claim released", || {
        fake.claims_deleted() == vec!["vol/ckpt-trainer-1"]
    })
    .await;
}

#[tokio::test]
async fn test_externally_deleted_replica_reattaches_claim() {
    let fake = Fake::new();
    let controller = Controller::new(test_config(), fake.clients());
    controller.apply(trainer_spec(2)).expect("spec applies");

    eventually("trainer-0 submitted", || !fake.submitted().is_empty()).await;
    bring_up(&fake, "trainer-0").await;
    eventually("trainer-1 submitted", || fake.submitted().len() == 2).await;
    bring_up(&fake, "trainer-1").await;
    await_phase(&controller, "trainer", SetPhase::Stable).await;

    // Something outside the controller kills trainer-1.
    fake.mark_stopped("trainer-1");

    // The reconciler observes the absence and recreates the replica at
    // the same ordinal, finding the existing claim rather than
    // provisioning a new one.
    eventually("trainer-1 recreated", || {
        fake.submitted() == vec!["trainer-0", "trainer-1", "trainer-1"]
    })
    .await;
    assert_eq!(
        fake.claims_created(),
        vec!["ckpt-trainer-0", "ckpt-trainer-1"]
    );
}

#[tokio::test]
async fn test_rolling_update_respects_partition() {
    let fake = Fake::new();
    let controller = Controller::new(test_config(), fake.clients());
    controller.apply(trainer_spec(3)).expect("spec applies");

    for ordinal in 0..3 {
        eventually("replica submitted", || {
            fake.submitted().len() == ordinal + 1
        })
        .await;
        bring_up(&fake, &format!("trainer-{ordinal}")).await;
    }
    await_phase(&controller, "trainer", SetPhase::Stable).await;

    // Canary: only ordinals >= 2 roll.
    let mut spec = trainer_spec(3);
    spec.template = template("v2");
    spec.update_strategy = UpdateStrategy::RollingUpdate { partition: 2 };
    let new_revision = spec.template.revision();
    controller.apply(spec).expect("spec applies");

    eventually("trainer-2 rolled", || {
        fake.terminated() == vec!["trainer-2"]
    })
    .await;
    fake.mark_stopped("trainer-2");
    eventually("trainer-2 recreated", || fake.submitted().len() == 4).await;
    bring_up(&fake, "trainer-2").await;

    // The recreated replica runs the new revision; nothing below the
    // partition was touched.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fake.terminated(), vec!["trainer-2"]);
    let submissions = fake.submitted_revisions();
    assert_eq!(submissions[3].0, "trainer-2");
    assert_eq!(submissions[3].1, new_revision);

    let status = controller.status("trainer").expect("set exists");
    let snapshot = status.borrow().clone();
    assert_eq!(snapshot.updated_replicas, 1);
    assert_eq!(snapshot.phase, SetPhase::Progressing);
}

#[tokio::test]
async fn test_on_delete_updates_only_on_deletion() {
    let fake = Fake::new();
    let controller = Controller::new(test_config(), fake.clients());
    let mut spec = trainer_spec(1);
    spec.update_strategy = UpdateStrategy::OnDelete;
    controller.apply(spec.clone()).expect("spec applies");

    eventually("trainer-0 submitted", || !fake.submitted().is_empty()).await;
    bring_up(&fake, "trainer-0").await;
    await_phase(&controller, "trainer", SetPhase::Stable).await;

    // A template change provokes no autonomous action.
    spec.template = template("v2");
    let new_revision = spec.template.revision();
    controller.apply(spec).expect("spec applies");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fake.terminated(), Vec::<String>::new());

    // An external deletion recreates on the current revision.
    fake.mark_stopped("trainer-0");
    eventually("trainer-0 recreated", || fake.submitted().len() == 2).await;
    assert_eq!(fake.submitted_revisions()[1].1, new_revision);
}

#[tokio::test]
async fn test_parallel_policy_fans_out() {
    let fake = Fake::new();
    let controller = Controller::new(test_config(), fake.clients());
    let mut spec = trainer_spec(3);
    spec.management_policy = ManagementPolicy::Parallel;
    controller.apply(spec).expect("spec applies");

    // All three replicas are submitted without any readiness signals.
    eventually("all replicas submitted", || fake.submitted().len() == 3).await;
}

#[tokio::test]
async fn test_set_deletion_tears_down_in_order() {
    let fake = Fake::new();
    let controller = Controller::new(test_config(), fake.clients());
    let mut spec = trainer_spec(2);
    spec.claim_retention.when_deleted = ClaimRetention::Delete;
    controller.apply(spec).expect("spec applies");

    eventually("trainer-0 submitted", || !fake.submitted().is_empty()).await;
    bring_up(&fake, "trainer-0").await;
    eventually("trainer-1 submitted", || fake.submitted().len() == 2).await;
    bring_up(&fake, "trainer-1").await;
    await_phase(&controller, "trainer", SetPhase::Stable).await;

    controller.delete("trainer").expect("delete accepted");
    eventually("trainer-1 terminated", || {
        fake.terminated() == vec!["trainer-1"]
    })
    .await;
    fake.mark_stopped("trainer-1");
    eventually("trainer-0 terminated", || {
        fake.terminated() == vec!["trainer-1", "trainer-0"]
    })
    .await;
    fake.mark_stopped("trainer-0");

    eventually("claims released", || fake.claims_deleted().len() == 2).await;
    eventually("set forgotten", || controller.list().is_empty()).await;
    assert!(fake.records().is_empty());
}

#[tokio::test]
async fn test_readiness_timeout_reports_blocked() {
    let fake = Fake::new();
    let mut config = test_config();
    config.readiness_timeout = Duration::from_millis(50);
    let controller = Controller::new(config, fake.clients());
    controller.apply(trainer_spec(2)).expect("spec applies");

    eventually("trainer-0 submitted", || !fake.submitted().is_empty()).await;
    fake.mark_running("trainer-0");
    // Never ready: the set reports itself blocked on ordinal 0 and makes
    // no further progress.
    let status = controller.status("trainer").expect("set exists");
    eventually("blocked status", || {
        matches!(
            status.borrow().blocked,
            Some(Blocked::ReadinessTimeout { ordinal: 0, .. })
        )
    })
    .await;
    assert_eq!(status.borrow().phase, SetPhase::Blocked);
    assert_eq!(fake.submitted(), vec!["trainer-0"]);
}

#[tokio::test]
async fn test_apply_rejects_invalid_and_immutable_specs() {
    let fake = Fake::new();
    let controller = Controller::new(test_config(), fake.clients());

    let bad = ReplicaSetSpec::new("Not-A-Label", "peers", 1, template("v1"));
    assert!(matches!(
        controller.apply(bad),
        Err(ControllerError::InvalidName { .. })
    ));

    controller.apply(trainer_spec(1)).expect("spec applies");
    let mut changed = trainer_spec(1);
    changed.service_name = "elsewhere".into();
    assert!(matches!(
        controller.apply(changed),
        Err(ControllerError::ImmutableField {
            field: "service_name",
            ..
        })
    ));

    assert!(matches!(
        controller.delete("nonexistent"),
        Err(ControllerError::UnknownSet(_))
    ));
}
