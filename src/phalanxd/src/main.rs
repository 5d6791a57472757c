// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The phalanx daemon.
//!
//! Reconciles the replica sets declared in a JSON spec file against the
//! local process orchestrator. Edit the file and phalanxd converges on the
//! new desired state; remove a set from the file and it is torn down.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use futures::StreamExt;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use phalanx_controller::{Clients, Controller, ControllerConfig, ReplicaSetSpec};
use phalanx_orchestrator::{NameRegistry, ReadinessProbe, Scheduler, StorageProvisioner};
use phalanx_orchestrator_process::{ProcessOrchestrator, ProcessOrchestratorConfig};

/// Ordered-identity workload reconciler daemon.
#[derive(Parser)]
#[clap(name = "phalanxd", version)]
struct Args {
    /// Where claims, published records, and runtime state live.
    #[clap(
        long,
        env = "PHALANXD_DATA_DIRECTORY",
        value_name = "PATH",
        default_value = "phalanxd-data"
    )]
    data_directory: PathBuf,

    /// A JSON file holding the list of replica set specs to reconcile.
    #[clap(long, env = "PHALANXD_SPEC_FILE", value_name = "PATH")]
    spec_file: PathBuf,

    /// How often to re-read the spec file.
    #[clap(
        long,
        env = "PHALANXD_SPEC_POLL_INTERVAL",
        value_name = "DURATION",
        default_value = "2s",
        value_parser = humantime::parse_duration,
    )]
    spec_poll_interval: Duration,

    /// How often each set resyncs against the scheduler, as a fallback
    /// for missed notifications.
    #[clap(
        long,
        env = "PHALANXD_RESYNC_INTERVAL",
        value_name = "DURATION",
        default_value = "30s",
        value_parser = humantime::parse_duration,
    )]
    resync_interval: Duration,

    /// How long readiness must hold before a replica counts as ready.
    #[clap(
        long,
        env = "PHALANXD_READY_DWELL",
        value_name = "DURATION",
        default_value = "1s",
        value_parser = humantime::parse_duration,
    )]
    ready_dwell: Duration,

    /// How long a replica may stay unready before its set reports itself
    /// blocked.
    #[clap(
        long,
        env = "PHALANXD_READINESS_TIMEOUT",
        value_name = "DURATION",
        default_value = "5m",
        value_parser = humantime::parse_duration,
    )]
    readiness_timeout: Duration,

    /// Which tracing events to emit to stderr.
    #[clap(
        long,
        env = "PHALANXD_LOG_FILTER",
        value_name = "FILTER",
        default_value = "info"
    )]
    log_filter: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(error) = run(args).await {
        eprintln!("phalanxd: {error:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_filter).context("invalid log filter")?)
        .with_writer(std::io::stderr)
        .init();

    let orchestrator = Arc::new(
        ProcessOrchestrator::new(ProcessOrchestratorConfig::new(&args.data_directory)).await?,
    );
    let scheduler_src: Arc<ProcessOrchestrator> = Arc::clone(&orchestrator);
    let scheduler: Arc<dyn Scheduler> = scheduler_src;
    let probe_src: Arc<ProcessOrchestrator> = Arc::clone(&orchestrator);
    let probe: Arc<dyn ReadinessProbe> = probe_src;
    let storage_src: Arc<ProcessOrchestrator> = Arc::clone(&orchestrator);
    let storage: Arc<dyn StorageProvisioner> = storage_src;
    let names_src: Arc<ProcessOrchestrator> = Arc::clone(&orchestrator);
    let names: Arc<dyn NameRegistry> = names_src;
    let controller = Controller::new(
        ControllerConfig {
            resync_interval: args.resync_interval,
            ready_dwell: args.ready_dwell,
            readiness_timeout: args.readiness_timeout,
            ..Default::default()
        },
        Clients {
            scheduler,
            probe,
            storage,
            names,
        },
    );

    let mut events = controller.events();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            info!(
                set = %event.set,
                ordinal = event.ordinal,
                phase = ?event.phase,
                "replica transition"
            );
        }
    });

    info!(
        spec_file = %args.spec_file.display(),
        data_directory = %args.data_directory.display(),
        "phalanxd starting"
    );

    let mut last_contents = String::new();
    let mut poll = tokio::time::interval(args.spec_poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = poll.tick() => {
                match tokio::fs::read_to_string(&args.spec_file).await {
                    Ok(contents) => {
                        if contents == last_contents {
                            continue;
                        }
                        if let Err(error) = apply_specs(&controller, &contents) {
                            warn!("failed to apply spec file: {error:#}");
                        }
                        // Remember the contents either way so a bad file
                        // logs once per edit, not once per poll.
                        last_contents = contents;
                    }
                    Err(error) => warn!(
                        spec_file = %args.spec_file.display(),
                        "failed to read spec file: {error}"
                    ),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

/// Applies every spec in `contents` and deletes sets that no longer
/// appear in it.
fn apply_specs(controller: &Controller, contents: &str) -> Result<(), anyhow::Error> {
    let specs: Vec<ReplicaSetSpec> =
        serde_json::from_str(contents).context("spec file is not a JSON list of replica sets")?;

    let names: BTreeSet<&str> = specs.iter().map(|spec| spec.name.as_str()).collect();
    if names.len() != specs.len() {
        bail!("duplicate replica set names in spec file");
    }

    for name in controller.list() {
        if !names.contains(name.as_str()) {
            info!(set = %name, "spec removed, deleting replica set");
            if let Err(error) = controller.delete(&name) {
                warn!(set = %name, "failed to delete replica set: {error}");
            }
        }
    }

    for spec in specs {
        let name = spec.name.clone();
        if let Err(error) = controller.apply(spec) {
            warn!(set = %name, "failed to apply spec: {error}");
        }
    }
    Ok(())
}
