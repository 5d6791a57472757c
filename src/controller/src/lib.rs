// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Ordered-identity replica set reconciliation.
//!
//! A replica set is a named group of replicas in which every replica holds
//! a stable ordinal identity: `{set}-{ordinal}` as its name, a DNS label
//! under the set's governing service, and (optionally) a volume claim
//! that survives the replica being deleted and recreated at the same
//! ordinal. The [`Controller`] reconciles the observed state of each set
//! toward its declared [`ReplicaSetSpec`], one ordinal-level action at a
//! time under the default [`ManagementPolicy::OrderedReady`].
//!
//! The controller performs no scheduling, probing, storage provisioning,
//! or name resolution of its own; those arrive as the collaborator traits
//! in [`phalanx_orchestrator`], bundled into [`Clients`]. Reconciliation
//! for different sets is fully independent: each set is owned by one
//! task, and no state is shared across sets.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use phalanx_orchestrator::{
    NameRegistry, ReadinessProbe, ReplicaTemplate, Revision, Scheduler, StorageProvisioner,
    VolumeClaimTemplate,
};

pub mod identity;
pub mod policy;
pub mod replica;
pub mod retry;
pub mod storage;
pub mod update;

mod error;
mod reconcile;

pub use error::ControllerError;

use crate::reconcile::{Command, SetTask};
use crate::replica::ReplicaPhase;
use crate::retry::BackoffConfig;

/// How replicas within a set are created and deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagementPolicy {
    /// Strictly sequential: ordinal k+1 is not created until ordinal k is
    /// ready, and ordinal k is not deleted until ordinal k+1 is gone. At
    /// most one ordinal-level action is in flight per set.
    #[default]
    OrderedReady,
    /// Replicas are created and deleted concurrently, with no ordering
    /// guarantee beyond the desired count eventually matching.
    Parallel,
}

/// How template changes are rolled out to existing replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStrategy {
    /// Replace replicas in descending ordinal order, one at a time,
    /// skipping ordinals below `partition`.
    RollingUpdate {
        /// Ordinals below this cutoff are excluded from the rollout,
        /// enabling staged (canary) updates.
        partition: u64,
    },
    /// Take no autonomous action; replicas pick up the current revision
    /// whenever something else deletes them.
    OnDelete,
}

impl Default for UpdateStrategy {
    fn default() -> UpdateStrategy {
        UpdateStrategy::RollingUpdate { partition: 0 }
    }
}

/// Whether a claim outlives the event named by the field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimRetention {
    /// Keep the claim and its data.
    #[default]
    Retain,
    /// Delete the claim and its data.
    Delete,
}

/// Governs when per-ordinal claims are released. The default retains
/// claims in both cases: data survives unless the spec explicitly opts
/// into deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRetentionPolicy {
    /// Applied to an ordinal's claim when the set scales down below it.
    pub when_scaled: ClaimRetention,
    /// Applied to all claims when the set is deleted.
    pub when_deleted: ClaimRetention,
}

/// The desired state of one replica set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetSpec {
    /// The set's name. Must be a DNS label; prefixes every replica name.
    pub name: String,
    /// The governing service name anchoring each replica's DNS identity.
    pub service_name: String,
    /// How many replicas the set should run.
    pub desired_replicas: u64,
    /// What each replica runs. Opaque to the controller.
    pub template: ReplicaTemplate,
    /// The volume claim each replica owns, if any.
    #[serde(default)]
    pub volume_claim: Option<VolumeClaimTemplate>,
    /// How replicas are created and deleted.
    #[serde(default)]
    pub management_policy: ManagementPolicy,
    /// How template changes are rolled out.
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
    /// When claims are released.
    #[serde(default)]
    pub claim_retention: ClaimRetentionPolicy,
}

/// Replica names must stay valid DNS labels (63 bytes) after the ordinal
/// suffix is appended; six digits of ordinal headroom is plenty.
const ORDINAL_HEADROOM: usize = "-999999".len();

static DNS_LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?-u)^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));

impl ReplicaSetSpec {
    /// Creates a spec with the given required fields and defaults for the
    /// rest.
    pub fn new(
        name: impl Into<String>,
        service_name: impl Into<String>,
        desired_replicas: u64,
        template: ReplicaTemplate,
    ) -> ReplicaSetSpec {
        ReplicaSetSpec {
            name: name.into(),
            service_name: service_name.into(),
            desired_replicas,
            template,
            volume_claim: None,
            management_policy: ManagementPolicy::default(),
            update_strategy: UpdateStrategy::default(),
            claim_retention: ClaimRetentionPolicy::default(),
        }
    }

    /// Validates the fields that derive replica identities.
    pub fn validate(&self) -> Result<(), ControllerError> {
        validate_label(&self.name, 63 - ORDINAL_HEADROOM)?;
        validate_label(&self.service_name, 63)?;
        if let Some(claim) = &self.volume_claim {
            if !DNS_LABEL_RE.is_match(&claim.name) {
                return Err(ControllerError::InvalidClaimTemplate {
                    name: claim.name.clone(),
                    reason: "not a DNS label",
                });
            }
            // Claim names are `{template}-{set}-{ordinal}` and must fit a
            // DNS label too.
            if claim.name.len() + 1 + self.name.len() + ORDINAL_HEADROOM > 63 {
                return Err(ControllerError::InvalidClaimTemplate {
                    name: claim.name.clone(),
                    reason: "name leaves no room for replica suffixes",
                });
            }
            if claim.size.as_u64() == 0 {
                return Err(ControllerError::InvalidClaimTemplate {
                    name: claim.name.clone(),
                    reason: "zero-size claim",
                });
            }
        }
        Ok(())
    }
}

fn validate_label(name: &str, max_len: usize) -> Result<(), ControllerError> {
    if name.is_empty() {
        return Err(ControllerError::InvalidName {
            name: name.into(),
            reason: "empty",
        });
    }
    if name.len() > max_len {
        return Err(ControllerError::InvalidName {
            name: name.into(),
            reason: "too long",
        });
    }
    if !DNS_LABEL_RE.is_match(name) {
        return Err(ControllerError::InvalidName {
            name: name.into(),
            reason: "not a DNS label",
        });
    }
    Ok(())
}

/// The full complement of collaborators a [`Controller`] drives.
#[derive(Debug, Clone)]
pub struct Clients {
    /// Schedules and terminates replicas.
    pub scheduler: Arc<dyn Scheduler>,
    /// Probes scheduled replicas for readiness.
    pub probe: Arc<dyn ReadinessProbe>,
    /// Provisions volume claims.
    pub storage: Arc<dyn StorageProvisioner>,
    /// Publishes replica names.
    pub names: Arc<dyn NameRegistry>,
}

/// Tunables for the reconcile loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// How often to resync against [`Scheduler::list`] as a fallback for
    /// missed notifications.
    pub resync_interval: Duration,
    /// How long readiness must hold before a replica counts as ready.
    pub ready_dwell: Duration,
    /// How long a replica may stay unready (or a claim unbound) before
    /// the set reports itself blocked.
    pub readiness_timeout: Duration,
    /// Backoff for failure recovery and collaborator retries.
    pub backoff: BackoffConfig,
    /// Per-ordinal failure retries before giving up. `None` retries
    /// forever: replica failure must not silently abandon desired state.
    pub retry_budget: Option<u32>,
}

impl Default for ControllerConfig {
    fn default() -> ControllerConfig {
        ControllerConfig {
            resync_interval: Duration::from_secs(30),
            ready_dwell: Duration::from_secs(1),
            readiness_timeout: Duration::from_secs(300),
            backoff: BackoffConfig::default(),
            retry_budget: None,
        }
    }
}

/// The coarse state of a replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SetPhase {
    /// Observed state does not yet match desired state.
    Progressing,
    /// All replicas present, ready, and on the current revision.
    Stable,
    /// Forward progress is halted on a condition in [`SetStatus::blocked`].
    Blocked,
    /// The set is being torn down.
    Deleting,
}

/// A condition halting a set's ordered progress. Never skipped past;
/// surfaced here until resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Blocked {
    /// A replica has not become ready within the configured window.
    ReadinessTimeout {
        /// The stuck ordinal.
        ordinal: u64,
        /// When the replica entered its current phase.
        since: DateTime<Utc>,
    },
    /// A claim has not bound (or its storage was lost), so the dependent
    /// replica cannot start.
    ClaimUnbound {
        /// The claim's name.
        claim: String,
        /// The dependent ordinal.
        ordinal: u64,
        /// When the claim was requested.
        since: DateTime<Utc>,
    },
    /// The retry budget for a failed replica is exhausted.
    RetriesExhausted {
        /// The failed ordinal.
        ordinal: u64,
    },
}

/// The observed status of a replica set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetStatus {
    /// Replicas that exist in any phase.
    pub replicas: u64,
    /// Replicas in the `Ready` phase.
    pub ready_replicas: u64,
    /// Replicas created from the current update revision.
    pub updated_replicas: u64,
    /// The revision of the oldest surviving replica.
    pub current_revision: Revision,
    /// The revision of the currently applied template.
    pub update_revision: Revision,
    /// The coarse set state.
    pub phase: SetPhase,
    /// The blocking condition, if any.
    pub blocked: Option<Blocked>,
}

impl SetStatus {
    fn initial(spec: &ReplicaSetSpec) -> SetStatus {
        let revision = spec.template.revision();
        SetStatus {
            replicas: 0,
            ready_replicas: 0,
            updated_replicas: 0,
            current_revision: revision.clone(),
            update_revision: revision,
            phase: SetPhase::Progressing,
            blocked: None,
        }
    }
}

/// An event describing a change in phase of one replica.
#[derive(Debug, Clone, Serialize)]
pub struct SetEvent {
    /// The owning set.
    pub set: String,
    /// The replica's ordinal.
    pub ordinal: u64,
    /// The phase entered; [`ReplicaPhase::Absent`] when the replica was
    /// removed.
    pub phase: ReplicaPhase,
    /// When the transition happened.
    pub time: DateTime<Utc>,
}

struct SetEntry {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SetStatus>,
    service_name: String,
    volume_claim: Option<VolumeClaimTemplate>,
    management_policy: ManagementPolicy,
    task: JoinHandle<()>,
}

impl Drop for SetEntry {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Reconciles replica sets against their declared specs.
///
/// Must be constructed and used within a tokio runtime: every applied set
/// spawns a reconcile task. Dropping the controller abandons all
/// reconciliation.
#[derive(Debug)]
pub struct Controller {
    config: ControllerConfig,
    clients: Clients,
    events_tx: broadcast::Sender<SetEvent>,
    sets: Mutex<BTreeMap<String, SetEntry>>,
}

impl std::fmt::Debug for SetEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SetEntry")
            .field("service_name", &self.service_name)
            .finish()
    }
}

impl Controller {
    /// Creates a controller that drives the given collaborators.
    pub fn new(config: ControllerConfig, clients: Clients) -> Controller {
        let (events_tx, _) = broadcast::channel(1024);
        Controller {
            config,
            clients,
            events_tx,
            sets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Applies a spec: begins reconciling a new set, or updates the
    /// desired state of an existing one.
    ///
    /// The fields that anchor replica identity (`service_name`,
    /// `volume_claim`) and the management policy cannot change once the
    /// set exists.
    pub fn apply(&self, spec: ReplicaSetSpec) -> Result<(), ControllerError> {
        spec.validate()?;
        let mut sets = self.sets.lock().expect("lock poisoned");
        sets.retain(|_, entry| !entry.task.is_finished());
        match sets.get(&spec.name) {
            Some(entry) => {
                let immutable = [
                    ("service_name", entry.service_name != spec.service_name),
                    ("volume_claim", entry.volume_claim != spec.volume_claim),
                    (
                        "management_policy",
                        entry.management_policy != spec.management_policy,
                    ),
                ];
                for (field, changed) in immutable {
                    if changed {
                        return Err(ControllerError::ImmutableField {
                            set: spec.name.clone(),
                            field,
                        });
                    }
                }
                let name = spec.name.clone();
                entry
                    .commands
                    .send(Command::Apply(spec))
                    .map_err(|_| ControllerError::SetClosed(name))
            }
            None => {
                let (commands_tx, commands_rx) = mpsc::unbounded_channel();
                let (status_tx, status_rx) = watch::channel(SetStatus::initial(&spec));
                let entry = SetEntry {
                    commands: commands_tx,
                    status: status_rx,
                    service_name: spec.service_name.clone(),
                    volume_claim: spec.volume_claim.clone(),
                    management_policy: spec.management_policy,
                    task: tokio::spawn(
                        SetTask::new(
                            spec.clone(),
                            self.config.clone(),
                            self.clients.clone(),
                            status_tx,
                            self.events_tx.clone(),
                            commands_rx,
                        )
                        .run(),
                    ),
                };
                sets.insert(spec.name, entry);
                Ok(())
            }
        }
    }

    /// Tears the named set down: ordered (or parallel) deletion of every
    /// replica, then claim release per the set's retention policy.
    pub fn delete(&self, name: &str) -> Result<(), ControllerError> {
        let sets = self.sets.lock().expect("lock poisoned");
        match sets.get(name) {
            Some(entry) => entry
                .commands
                .send(Command::Delete)
                .map_err(|_| ControllerError::SetClosed(name.into())),
            None => Err(ControllerError::UnknownSet(name.into())),
        }
    }

    /// Returns a watch on the named set's status.
    pub fn status(&self, name: &str) -> Result<watch::Receiver<SetStatus>, ControllerError> {
        let sets = self.sets.lock().expect("lock poisoned");
        sets.get(name)
            .map(|entry| entry.status.clone())
            .ok_or_else(|| ControllerError::UnknownSet(name.into()))
    }

    /// Lists the names of all sets under reconciliation.
    pub fn list(&self) -> Vec<String> {
        let mut sets = self.sets.lock().expect("lock poisoned");
        sets.retain(|_, entry| !entry.task.is_finished());
        sets.keys().cloned().collect()
    }

    /// Streams replica phase transitions across all sets.
    pub fn events(&self) -> BoxStream<'static, SetEvent> {
        let stream =
            BroadcastStream::new(self.events_tx.subscribe()).filter_map(|event| async move {
                match event {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!("event stream lagged by {skipped} events");
                        None
                    }
                }
            });
        Box::pin(stream)
    }
}
