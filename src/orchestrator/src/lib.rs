// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Collaborator traits and shared types for replica orchestration.
//!
//! The controller in `phalanx-controller` decides *what* should happen to a
//! replica set and in *which order*; everything that touches the outside
//! world happens through the traits in this crate. The intent is that you
//! can implement [`Scheduler`] with pods in a cluster, containers in
//! Docker, or processes on your local machine, and the controller never
//! knows the difference.
//!
//! All four traits report observations asynchronously, as event streams.
//! The controller treats a missing or stale observation as "not ready",
//! never as "ready by default".

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The stable identity of one replica slot within a named set.
///
/// An identity is a pure function of the set's constants and the ordinal.
/// Once a replica exists at an ordinal, the identity for that ordinal is
/// never reassigned; only the replica behind it comes and goes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaIdentity {
    /// The name of the owning replica set.
    pub set: String,
    /// The replica's slot within the set.
    pub ordinal: u64,
    /// The replica's name, `{set}-{ordinal}`.
    pub name: String,
    /// The replica's DNS label under the set's governing service,
    /// `{name}.{service_name}`.
    pub dns_name: String,
    /// The name of the replica's volume claim, `{claim_template}-{name}`,
    /// if the set configures one.
    pub claim_name: Option<String>,
}

/// An opaque description of what each replica in a set should run.
///
/// The controller never interprets the contents; it only fingerprints them
/// (see [`Revision`]) and hands them to the [`Scheduler`]. Scheduler
/// implementations define the schema they accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaTemplate(pub serde_json::Value);

impl ReplicaTemplate {
    /// Returns the revision fingerprint of this template.
    pub fn revision(&self) -> Revision {
        Revision::of(self)
    }
}

/// A fingerprint of a [`ReplicaTemplate`].
///
/// Two templates have the same revision iff their canonical JSON encodings
/// are identical. Replicas record the revision they were created from, and
/// the update coordinator compares those records against the set's current
/// revision to decide what still needs to roll.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision(String);

impl Revision {
    /// Computes the revision of the given template.
    pub fn of(template: &ReplicaTemplate) -> Revision {
        let json = serde_json::to_string(&template.0).expect("JSON values serialize");
        let mut hasher = Sha256::new();
        hasher.update(json);
        Revision(format!("{:x}", hasher.finalize()))
    }

    /// Returns the full hex form of the revision.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns an abbreviated form suitable for logs.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Describes the volume claim each replica in a set should own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeClaimTemplate {
    /// The claim name prefix; the full claim name is `{name}-{replica}`.
    pub name: String,
    /// The requested capacity.
    pub size: ByteSize,
    /// The storage class to provision from, if the provisioner
    /// distinguishes classes.
    #[serde(default)]
    pub storage_class: Option<String>,
}

/// Handle to a replica the scheduling collaborator is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaHandle {
    /// Scheduler-scoped identifier for the running replica.
    pub id: String,
    /// The address on which the replica serves its peers.
    pub address: String,
}

/// Handle to a provisioned volume claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimHandle {
    /// Provisioner-scoped identifier for the claim.
    pub id: String,
}

/// The phase of a volume claim, as reported by the provisioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimPhase {
    /// Creation was requested but the claim is not yet bound to backing
    /// storage.
    Pending,
    /// The claim is bound and usable.
    Bound,
    /// The claim's backing storage is gone.
    Lost,
}

/// The status of a scheduled replica, as reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduledStatus {
    /// The replica was accepted but has not started.
    Starting,
    /// The replica is running.
    Running,
    /// The replica exited or could not be started.
    Failed {
        /// Scheduler-specific failure detail, if any.
        reason: Option<String>,
    },
    /// The replica terminated and no longer exists.
    Stopped,
}

/// An event describing a change in status of a scheduled replica.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerEvent {
    /// The replica's name.
    pub replica: String,
    /// The new status.
    pub status: ScheduledStatus,
    /// When the transition was observed.
    pub time: DateTime<Utc>,
}

/// A readiness observation for a scheduled replica.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessEvent {
    /// The replica's name.
    pub replica: String,
    /// Whether the replica answered its probe.
    pub ready: bool,
    /// When the probe completed.
    pub time: DateTime<Utc>,
}

/// An event describing a change in phase of a volume claim.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimEvent {
    /// The claim's name.
    pub claim: String,
    /// The new phase.
    pub phase: ClaimPhase,
    /// When the transition was observed.
    pub time: DateTime<Utc>,
}

/// Schedules replicas onto whatever substrate the implementation manages.
///
/// Implementations must be idempotent: submitting an identity that is
/// already running returns the existing handle, and terminating an absent
/// identity is a no-op.
#[async_trait]
pub trait Scheduler: fmt::Debug + Send + Sync {
    /// Submits a replica for execution.
    async fn submit(
        &self,
        identity: &ReplicaIdentity,
        template: &ReplicaTemplate,
    ) -> Result<ReplicaHandle, anyhow::Error>;

    /// Terminates the identified replica, if it exists.
    async fn terminate(&self, identity: &ReplicaIdentity) -> Result<(), anyhow::Error>;

    /// Lists the names of all replicas the scheduler currently knows.
    ///
    /// Used as the resync fallback for missed [`Scheduler::watch`]
    /// notifications.
    async fn list(&self) -> Result<Vec<String>, anyhow::Error>;

    /// Watches status transitions for all submitted replicas.
    fn watch(&self) -> BoxStream<'static, Result<SchedulerEvent, anyhow::Error>>;
}

/// Periodically probes scheduled replicas for readiness.
#[async_trait]
pub trait ReadinessProbe: fmt::Debug + Send + Sync {
    /// Starts probing the given replica.
    async fn observe(
        &self,
        identity: &ReplicaIdentity,
        handle: &ReplicaHandle,
    ) -> Result<(), anyhow::Error>;

    /// Stops probing the given replica.
    async fn forget(&self, identity: &ReplicaIdentity) -> Result<(), anyhow::Error>;

    /// Watches readiness observations for all probed replicas.
    fn watch(&self) -> BoxStream<'static, Result<ReadinessEvent, anyhow::Error>>;
}

/// Provisions persistent volume claims.
///
/// Binding is asynchronous: `create_claim` returns as soon as the request
/// is accepted, and the claim becomes usable only once a [`ClaimEvent`]
/// reports it [`ClaimPhase::Bound`].
#[async_trait]
pub trait StorageProvisioner: fmt::Debug + Send + Sync {
    /// Requests creation of a claim with the given name.
    ///
    /// Requesting a name that already exists returns the existing claim's
    /// handle; existing data is never replaced.
    async fn create_claim(
        &self,
        name: &str,
        template: &VolumeClaimTemplate,
    ) -> Result<ClaimHandle, anyhow::Error>;

    /// Deletes the identified claim and its data.
    async fn delete_claim(&self, handle: &ClaimHandle) -> Result<(), anyhow::Error>;

    /// Watches phase transitions for all requested claims.
    fn watch(&self) -> BoxStream<'static, Result<ClaimEvent, anyhow::Error>>;
}

/// Publishes stable replica names.
///
/// The controller only ever supplies the deterministic names derived from
/// [`ReplicaIdentity`]; it never resolves them itself.
#[async_trait]
pub trait NameRegistry: fmt::Debug + Send + Sync {
    /// Publishes or replaces the record `dns_name -> address`.
    async fn publish(&self, dns_name: &str, address: &str) -> Result<(), anyhow::Error>;

    /// Removes the record for `dns_name`, if present.
    async fn unpublish(&self, dns_name: &str) -> Result<(), anyhow::Error>;

    /// Returns all currently published records.
    async fn records(&self) -> Result<BTreeMap<String, String>, anyhow::Error>;
}
