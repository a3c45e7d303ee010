// dcm is an open source tool for distributed refinement of graph clusterings.
// Copyright (C) 2024 the dcm authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};

use crate::{
    cluster::{ClusterId, ClusterInfo},
    config::CoordinatorConfig,
    coordinator::{checkpoint::Checkpoint, Coordinator, Settings, BYPASS_SHARD_NAME},
    distributed::channel::Listener,
    partition::{self, PartitionOptions},
    shard::ShardWriter,
};

pub async fn run(config: CoordinatorConfig) -> Result<()> {
    super::prepare_work_dir(&config)?;

    let checkpoint_path = config.work_dir().join("checkpoint");
    let coordinator = Arc::new(init(&config)?);

    install_signal_handlers(checkpoint_path.clone(), Arc::clone(&coordinator))?;

    let listener = Listener::bind(config.host).await?;
    tracing::info!(host = %config.host, workers = config.num_workers, "coordinator listening");
    let accept = spawn_accept_loop(listener, Arc::clone(&coordinator));

    drain(&coordinator, Duration::from_secs(config.stall_warn_secs)).await;
    accept.abort();

    coordinator.finalize(
        config.work_dir().join("output"),
        PathBuf::from(&config.output_file),
    )?;

    // the run completed; a stale checkpoint must not hijack the next one
    std::fs::remove_file(&checkpoint_path).ok();

    let stats = coordinator.stats();
    tracing::info!(
        completed = stats.completed,
        bypassed = stats.bypassed,
        dropped = stats.dropped,
        "run complete"
    );
    for (rank, report) in coordinator.worker_reports() {
        tracing::info!(rank, ?report, "final worker report");
    }

    Ok(())
}

/// Restore from a checkpoint when one exists, otherwise run the partitioner
/// (or load a pre-partitioned directory).
pub(crate) fn init(config: &CoordinatorConfig) -> Result<Coordinator> {
    let settings = Settings {
        min_batch_cost: config.min_batch_cost,
        cost_alpha: config.cost_alpha,
        max_retries: config.max_retries,
        num_workers: config.num_workers,
    };

    let checkpoint_path = config.work_dir().join("checkpoint");
    if let Some(checkpoint) = Checkpoint::load(&checkpoint_path)? {
        tracing::info!(
            queued = checkpoint.queue.len(),
            completed = checkpoint.completed.len(),
            "resuming from checkpoint"
        );
        return Ok(Coordinator::from_checkpoint(checkpoint, settings));
    }

    let (clusters, bypassed, dropped) = load_or_partition(config)?;
    Ok(Coordinator::new(clusters, bypassed, dropped, settings))
}

pub(crate) fn load_or_partition(
    config: &CoordinatorConfig,
) -> Result<(Vec<ClusterInfo>, Vec<ClusterId>, Vec<ClusterId>)> {
    if let Some(dir) = &config.partitioned_clusters_dir {
        let dir = Path::new(dir);
        if dir_is_nonempty(dir) {
            let clusters = partition::load_partitioned(dir)?;
            return Ok((clusters, Vec::new(), Vec::new()));
        }
        tracing::warn!(
            dir = %dir.display(),
            "pre-partitioned directory missing or empty; partitioning from scratch"
        );
    }

    let bypass_path = config.work_dir().join("output").join(BYPASS_SHARD_NAME);
    std::fs::remove_file(&bypass_path).ok();
    let mut bypass_shard = ShardWriter::open(&bypass_path)?;

    let outcome = partition::partition(
        Path::new(&config.edgelist),
        Path::new(&config.existing_clustering),
        &config.clusters_dir(),
        &mut bypass_shard,
        &PartitionOptions {
            drop_cluster_under: config.drop_cluster_under,
            bypass_clique: config.bypass_clique,
        },
    )?;

    Ok((outcome.queued, outcome.bypassed, outcome.dropped))
}

fn dir_is_nonempty(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Slurm sends SIGTERM before it SIGKILLs a job; SIGABRT covers internal
/// errors. Either way: write the checkpoint and exit cleanly. The signal is
/// delivered through tokio's driver, so the heavy work runs on a normal
/// task rather than inside a signal handler.
pub(crate) fn install_signal_handlers(
    checkpoint_path: PathBuf,
    coordinator: Arc<Coordinator>,
) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigabrt = signal(SignalKind::from_raw(libc::SIGABRT))?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigabrt.recv() => {},
        }

        tracing::info!("shutdown signal received; writing checkpoint");
        match coordinator.save_checkpoint(&checkpoint_path) {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                tracing::error!(error = %e, "failed to write checkpoint");
                std::process::exit(1);
            }
        }
    });

    Ok(())
}

pub(crate) fn spawn_accept_loop(
    listener: Listener,
    coordinator: Arc<Coordinator>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok(mut conversation) => {
                    let coordinator = Arc::clone(&coordinator);
                    tokio::spawn(async move {
                        match conversation.receive().await {
                            Ok(request) => {
                                let reply = coordinator.handle(request);
                                if let Err(e) = conversation.reply(&reply).await {
                                    tracing::error!(error = %e, "failed to reply to worker");
                                }
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "failed to read request");
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to accept connection");
                }
            }
        }
    })
}

/// Block until every worker has acknowledged the terminal sentinel.
/// Periodically surfaces in-flight entries that look stalled; there is no
/// automatic reassignment since the owning worker may still be computing.
pub(crate) async fn drain(coordinator: &Coordinator, stall_warn: Duration) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut ticks: u64 = 0;

    loop {
        interval.tick().await;

        if coordinator.all_workers_done() {
            return;
        }

        ticks += 1;
        if ticks % 60 == 0 {
            for (cluster_id, rank, elapsed) in coordinator.stalled_in_flight(stall_warn) {
                tracing::warn!(
                    cluster_id,
                    rank,
                    elapsed_secs = elapsed.as_secs(),
                    "cluster has been in flight for a long time"
                );
            }
        }
    }
}
