// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Process-based orchestration collaborators.
//!
//! [`ProcessOrchestrator`] implements all four collaborator traits from
//! [`phalanx_orchestrator`] against the local machine: replicas run as
//! child processes, volume claims are directories under the data
//! directory, readiness is a TCP connect probe, and published names land
//! in a JSON records file. This is intended for local deployments and
//! tests, not production.
//!
//! The template schema accepted by [`Scheduler::submit`] is
//! [`ProcessTemplate`]: an argv (with `{port}`, `{name}`, `{ordinal}`,
//! and `{master}` placeholders), extra environment variables, and a
//! readiness mode. Every replica additionally receives `PHALANX_SET`,
//! `PHALANX_REPLICA`, `PHALANX_ORDINAL`, `PHALANX_PORT`, and
//! `PHALANX_MASTER_ADDR` (the published address of ordinal 0) in its
//! environment, so ranked workloads can find their coordinator without
//! resolving names themselves.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::{broadcast, oneshot};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use phalanx_orchestrator::{
    ClaimEvent, ClaimHandle, ClaimPhase, NameRegistry, ReadinessEvent, ReadinessProbe,
    ReplicaHandle, ReplicaIdentity, ReplicaTemplate, Scheduler, ScheduledStatus, SchedulerEvent,
    StorageProvisioner, VolumeClaimTemplate,
};

mod records;

pub use records::RecordsFile;

/// Configures a [`ProcessOrchestrator`].
#[derive(Debug, Clone)]
pub struct ProcessOrchestratorConfig {
    /// Where claims and the records file live.
    pub data_directory: PathBuf,
    /// The host replicas listen on.
    pub listen_host: String,
    /// How often scheduled replicas are probed for readiness.
    pub probe_interval: Duration,
}

impl ProcessOrchestratorConfig {
    /// A configuration rooted at the given data directory, with defaults
    /// for everything else.
    pub fn new(data_directory: impl Into<PathBuf>) -> ProcessOrchestratorConfig {
        ProcessOrchestratorConfig {
            data_directory: data_directory.into(),
            listen_host: "127.0.0.1".into(),
            probe_interval: Duration::from_secs(1),
        }
    }
}

/// The template schema this orchestrator understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTemplate {
    /// The argv to run. The placeholders `{port}`, `{name}`, `{ordinal}`,
    /// and `{master}` are substituted in every element.
    pub command: Vec<String>,
    /// Extra environment variables for the process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// How readiness is determined.
    #[serde(default)]
    pub readiness: ProcessReadiness,
}

/// How a process's readiness is determined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessReadiness {
    /// Ready when the replica accepts TCP connections on its port.
    #[default]
    Tcp,
    /// Ready as soon as the process is running.
    None,
}

struct ProcessEntry {
    handle: ReplicaHandle,
    readiness: ProcessReadiness,
    kill_tx: Option<oneshot::Sender<()>>,
}

struct Inner {
    config: ProcessOrchestratorConfig,
    processes: Mutex<BTreeMap<String, ProcessEntry>>,
    probed: Mutex<BTreeSet<String>>,
    records: Mutex<BTreeMap<String, String>>,
    records_file: RecordsFile,
    scheduler_tx: broadcast::Sender<SchedulerEvent>,
    readiness_tx: broadcast::Sender<ReadinessEvent>,
    claim_tx: broadcast::Sender<ClaimEvent>,
}

impl Inner {
    fn claims_dir(&self) -> PathBuf {
        self.config.data_directory.join("claims")
    }
}

/// An orchestrator backed by processes on the local machine.
pub struct ProcessOrchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for ProcessOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProcessOrchestrator")
            .field("data_directory", &self.inner.config.data_directory)
            .finish()
    }
}

impl ProcessOrchestrator {
    /// Creates a new process orchestrator rooted at the configured data
    /// directory.
    pub async fn new(
        config: ProcessOrchestratorConfig,
    ) -> Result<ProcessOrchestrator, anyhow::Error> {
        tokio::fs::create_dir_all(config.data_directory.join("claims"))
            .await
            .context("failed to create claims directory")?;
        let records_file =
            RecordsFile::create(config.data_directory.join("records.json"), &BTreeMap::new())
                .context("failed to create records file")?;
        let (scheduler_tx, _) = broadcast::channel(1024);
        let (readiness_tx, _) = broadcast::channel(1024);
        let (claim_tx, _) = broadcast::channel(1024);
        Ok(ProcessOrchestrator {
            inner: Arc::new(Inner {
                config,
                processes: Mutex::new(BTreeMap::new()),
                probed: Mutex::new(BTreeSet::new()),
                records: Mutex::new(BTreeMap::new()),
                records_file,
                scheduler_tx,
                readiness_tx,
                claim_tx,
            }),
        })
    }

    /// The address of the set's ordinal 0, from the replica's own
    /// perspective: itself if it is ordinal 0, otherwise whatever the
    /// registry has published for `{set}-0`.
    fn master_address(&self, identity: &ReplicaIdentity, own_address: &str) -> Option<String> {
        if identity.ordinal == 0 {
            return Some(own_address.into());
        }
        let (_, service) = identity.dns_name.split_once('.')?;
        let master_dns = format!("{}-0.{}", identity.set, service);
        self.inner
            .records
            .lock()
            .expect("lock poisoned")
            .get(&master_dns)
            .cloned()
    }
}

async fn supervise(
    inner: Arc<Inner>,
    replica: String,
    mut child: tokio::process::Child,
    kill_rx: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        _ = kill_rx => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            ScheduledStatus::Stopped
        }
        status = child.wait() => match status {
            Ok(status) if status.success() => ScheduledStatus::Stopped,
            Ok(status) => ScheduledStatus::Failed {
                reason: Some(status.to_string()),
            },
            Err(error) => ScheduledStatus::Failed {
                reason: Some(error.to_string()),
            },
        },
    };
    debug!(replica = %replica, ?status, "process exited");
    inner
        .processes
        .lock()
        .expect("lock poisoned")
        .remove(&replica);
    let _ = inner.scheduler_tx.send(SchedulerEvent {
        replica,
        status,
        time: Utc::now(),
    });
}

async fn probe(inner: Arc<Inner>, replica: String, address: String) {
    let mut ticker = tokio::time::interval(inner.config.probe_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !inner
            .probed
            .lock()
            .expect("lock poisoned")
            .contains(&replica)
        {
            return;
        }
        let readiness = {
            let processes = inner.processes.lock().expect("lock poisoned");
            match processes.get(&replica) {
                Some(entry) => entry.readiness,
                // Process gone; the probe goes with it.
                None => return,
            }
        };
        let ready = match readiness {
            ProcessReadiness::None => true,
            ProcessReadiness::Tcp => {
                let connect = tokio::net::TcpStream::connect(&address);
                tokio::time::timeout(Duration::from_millis(500), connect)
                    .await
                    .map(|result| result.is_ok())
                    .unwrap_or(false)
            }
        };
        let _ = inner.readiness_tx.send(ReadinessEvent {
            replica: replica.clone(),
            ready,
            time: Utc::now(),
        });
    }
}

fn watch_broadcast<T: Clone + Send + 'static>(
    receiver: broadcast::Receiver<T>,
) -> BoxStream<'static, Result<T, anyhow::Error>> {
    Box::pin(
        BroadcastStream::new(receiver).filter_map(|event| async move {
            match event {
                Ok(event) => Some(Ok(event)),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("watch stream lagged by {skipped} events");
                    None
                }
            }
        }),
    )
}

#[async_trait]
impl Scheduler for ProcessOrchestrator {
    async fn submit(
        &self,
        identity: &ReplicaIdentity,
        template: &ReplicaTemplate,
    ) -> Result<ReplicaHandle, anyhow::Error> {
        let template: ProcessTemplate = serde_json::from_value(template.0.clone())
            .context("replica template does not describe a runnable process")?;
        if template.command.is_empty() {
            bail!("replica template has an empty command");
        }

        if let Some(entry) = self
            .inner
            .processes
            .lock()
            .expect("lock poisoned")
            .get(&identity.name)
        {
            return Ok(entry.handle.clone());
        }

        // Reserve a port for the replica to listen on. The listener is
        // dropped before the process starts; collisions in the window
        // between are possible but harmless, as a crashed replica is
        // resubmitted with a fresh port.
        let port = TcpListener::bind((self.inner.config.listen_host.as_str(), 0))
            .and_then(|listener| listener.local_addr())
            .context("failed to reserve a port")?
            .port();
        let address = format!("{}:{}", self.inner.config.listen_host, port);
        let master = self.master_address(identity, &address);

        let substitute = |arg: &String| {
            let arg = arg
                .replace("{port}", &port.to_string())
                .replace("{name}", &identity.name)
                .replace("{ordinal}", &identity.ordinal.to_string());
            match &master {
                Some(master) => arg.replace("{master}", master),
                None => arg,
            }
        };
        let argv: Vec<String> = template.command.iter().map(substitute).collect();

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .envs(&template.env)
            .env("PHALANX_SET", &identity.set)
            .env("PHALANX_REPLICA", &identity.name)
            .env("PHALANX_ORDINAL", identity.ordinal.to_string())
            .env("PHALANX_PORT", port.to_string())
            .kill_on_drop(true);
        if let Some(master) = &master {
            command.env("PHALANX_MASTER_ADDR", master);
        }

        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", argv[0]))?;
        let handle = ReplicaHandle {
            id: child
                .id()
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| identity.name.clone()),
            address,
        };
        debug!(
            replica = %identity.name,
            pid = %handle.id,
            address = %handle.address,
            "spawned replica process"
        );

        let (kill_tx, kill_rx) = oneshot::channel();
        self.inner.processes.lock().expect("lock poisoned").insert(
            identity.name.clone(),
            ProcessEntry {
                handle: handle.clone(),
                readiness: template.readiness,
                kill_tx: Some(kill_tx),
            },
        );
        for status in [ScheduledStatus::Starting, ScheduledStatus::Running] {
            let _ = self.inner.scheduler_tx.send(SchedulerEvent {
                replica: identity.name.clone(),
                status,
                time: Utc::now(),
            });
        }
        tokio::spawn(supervise(
            Arc::clone(&self.inner),
            identity.name.clone(),
            child,
            kill_rx,
        ));

        Ok(handle)
    }

    async fn terminate(&self, identity: &ReplicaIdentity) -> Result<(), anyhow::Error> {
        let kill_tx = self
            .inner
            .processes
            .lock()
            .expect("lock poisoned")
            .get_mut(&identity.name)
            .and_then(|entry| entry.kill_tx.take());
        // An absent replica (or one already being killed) is a no-op.
        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, anyhow::Error> {
        let processes = self.inner.processes.lock().expect("lock poisoned");
        Ok(processes.keys().cloned().collect())
    }

    fn watch(&self) -> BoxStream<'static, Result<SchedulerEvent, anyhow::Error>> {
        watch_broadcast(self.inner.scheduler_tx.subscribe())
    }
}

#[async_trait]
impl ReadinessProbe for ProcessOrchestrator {
    async fn observe(
        &self,
        identity: &ReplicaIdentity,
        handle: &ReplicaHandle,
    ) -> Result<(), anyhow::Error> {
        let started = self
            .inner
            .probed
            .lock()
            .expect("lock poisoned")
            .insert(identity.name.clone());
        if started {
            tokio::spawn(probe(
                Arc::clone(&self.inner),
                identity.name.clone(),
                handle.address.clone(),
            ));
        }
        Ok(())
    }

    async fn forget(&self, identity: &ReplicaIdentity) -> Result<(), anyhow::Error> {
        self.inner
            .probed
            .lock()
            .expect("lock poisoned")
            .remove(&identity.name);
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, Result<ReadinessEvent, anyhow::Error>> {
        watch_broadcast(self.inner.readiness_tx.subscribe())
    }
}

#[async_trait]
impl StorageProvisioner for ProcessOrchestrator {
    async fn create_claim(
        &self,
        name: &str,
        template: &VolumeClaimTemplate,
    ) -> Result<ClaimHandle, anyhow::Error> {
        let path = self.inner.claims_dir().join(name);
        if tokio::fs::metadata(&path).await.is_err() {
            tokio::fs::create_dir_all(&path)
                .await
                .with_context(|| format!("failed to create claim directory for {name}"))?;
            let manifest =
                serde_json::to_vec_pretty(template).expect("claim template serializes");
            tokio::fs::write(path.join("claim.json"), manifest)
                .await
                .context("failed to write claim manifest")?;
            debug!(claim = name, "provisioned claim directory");
        }
        // A local directory binds as soon as it exists; the notification
        // still arrives asynchronously, like a real provisioner's would.
        let _ = self.inner.claim_tx.send(ClaimEvent {
            claim: name.into(),
            phase: ClaimPhase::Bound,
            time: Utc::now(),
        });
        Ok(ClaimHandle { id: name.into() })
    }

    async fn delete_claim(&self, handle: &ClaimHandle) -> Result<(), anyhow::Error> {
        let path = self.inner.claims_dir().join(&handle.id);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => {
                Err(error).with_context(|| format!("failed to delete claim {}", handle.id))
            }
        }
    }

    fn watch(&self) -> BoxStream<'static, Result<ClaimEvent, anyhow::Error>> {
        watch_broadcast(self.inner.claim_tx.subscribe())
    }
}

#[async_trait]
impl NameRegistry for ProcessOrchestrator {
    async fn publish(&self, dns_name: &str, address: &str) -> Result<(), anyhow::Error> {
        let mut records = self.inner.records.lock().expect("lock poisoned");
        records.insert(dns_name.into(), address.into());
        self.inner
            .records_file
            .store(&records)
            .context("failed to persist records")
    }

    async fn unpublish(&self, dns_name: &str) -> Result<(), anyhow::Error> {
        let mut records = self.inner.records.lock().expect("lock poisoned");
        if records.remove(dns_name).is_some() {
            self.inner
                .records_file
                .store(&records)
                .context("failed to persist records")?;
        }
        Ok(())
    }

    async fn records(&self) -> Result<BTreeMap<String, String>, anyhow::Error> {
        Ok(self.inner.records.lock().expect("lock poisoned").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(ordinal: u64) -> ReplicaIdentity {
        ReplicaIdentity {
            set: "web".into(),
            ordinal,
            name: format!("web-{ordinal}"),
            dns_name: format!("web-{ordinal}.web"),
            claim_name: Some(format!("data-web-{ordinal}")),
        }
    }

    fn template(argv: &[&str]) -> ReplicaTemplate {
        ReplicaTemplate(serde_json::json!({
            "command": argv,
            "readiness": "none",
        }))
    }

    async fn orchestrator() -> (tempfile::TempDir, ProcessOrchestrator) {
        let dir = tempfile::tempdir().expect("tempdir");
        let orchestrator = ProcessOrchestrator::new(ProcessOrchestratorConfig::new(dir.path()))
            .await
            .expect("orchestrator initializes");
        (dir, orchestrator)
    }

    async fn next_status(
        events: &mut BoxStream<'static, Result<SchedulerEvent, anyhow::Error>>,
        replica: &str,
    ) -> ScheduledStatus {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.next())
                .await
                .expect("event before timeout")
                .expect("stream open")
                .expect("event ok");
            if event.replica == replica {
                return event.status;
            }
        }
    }

    #[tokio::test]
    async fn test_submit_terminate_lifecycle() {
        let (_dir, orchestrator) = orchestrator().await;
        let mut events = Scheduler::watch(&orchestrator);

        let identity = identity(0);
        let handle = orchestrator
            .submit(&identity, &template(&["sleep", "30"]))
            .await
            .expect("submit succeeds");
        assert_eq!(
            next_status(&mut events, "web-0").await,
            ScheduledStatus::Starting
        );
        assert_eq!(
            next_status(&mut events, "web-0").await,
            ScheduledStatus::Running
        );
        assert_eq!(orchestrator.list().await.expect("list succeeds"), ["web-0"]);

        // Resubmitting is idempotent: same handle, no second process.
        let second = orchestrator
            .submit(&identity, &template(&["sleep", "30"]))
            .await
            .expect("submit succeeds");
        assert_eq!(second, handle);

        orchestrator
            .terminate(&identity)
            .await
            .expect("terminate succeeds");
        assert_eq!(
            next_status(&mut events, "web-0").await,
            ScheduledStatus::Stopped
        );
        assert!(orchestrator.list().await.expect("list succeeds").is_empty());
    }

    #[tokio::test]
    async fn test_failed_process_reports_reason() {
        let (_dir, orchestrator) = orchestrator().await;
        let mut events = Scheduler::watch(&orchestrator);

        orchestrator
            .submit(&identity(1), &template(&["sh", "-c", "exit 3"]))
            .await
            .expect("submit succeeds");
        loop {
            match next_status(&mut events, "web-1").await {
                ScheduledStatus::Starting | ScheduledStatus::Running => continue,
                ScheduledStatus::Failed { reason } => {
                    assert!(reason.expect("reason set").contains("3"));
                    break;
                }
                status => panic!("unexpected status {status:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_claim_directories() {
        let (dir, orchestrator) = orchestrator().await;
        let claim_template = VolumeClaimTemplate {
            name: "data".into(),
            size: bytesize::ByteSize::mib(64),
            storage_class: None,
        };

        let handle = orchestrator
            .create_claim("data-web-0", &claim_template)
            .await
            .expect("create succeeds");
        let claim_dir = dir.path().join("claims").join("data-web-0");
        assert!(claim_dir.join("claim.json").exists());

        // Existing data survives a second create.
        std::fs::write(claim_dir.join("checkpoint"), b"weights").expect("write succeeds");
        orchestrator
            .create_claim("data-web-0", &claim_template)
            .await
            .expect("create succeeds");
        assert_eq!(
            std::fs::read(claim_dir.join("checkpoint")).expect("read succeeds"),
            b"weights"
        );

        orchestrator
            .delete_claim(&handle)
            .await
            .expect("delete succeeds");
        assert!(!claim_dir.exists());
    }

    #[tokio::test]
    async fn test_records_round_trip() {
        let (dir, orchestrator) = orchestrator().await;
        orchestrator
            .publish("web-0.web", "127.0.0.1:4100")
            .await
            .expect("publish succeeds");
        let records = NameRegistry::records(&orchestrator)
            .await
            .expect("records succeed");
        assert_eq!(records["web-0.web"], "127.0.0.1:4100");
        assert_eq!(
            RecordsFile::load(dir.path().join("records.json")).expect("load succeeds"),
            records
        );

        orchestrator
            .unpublish("web-0.web")
            .await
            .expect("unpublish succeeds");
        assert!(NameRegistry::records(&orchestrator)
            .await
            .expect("records succeed")
            .is_empty());
    }
}
