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

//! The long-running loop on each worker rank.
//!
//! A worker requests a batch of cluster ids, runs the external refinement
//! subprocess on each cluster serially, appends successful results to its
//! shard and reports the others as aborted. Classifying why a child died is
//! the worker's job alone; the coordinator only ever sees the reason code.

use std::{
    fs::File,
    net::SocketAddr,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::Result;
use tokio::process::{Child, Command};

use crate::{
    cluster::ClusterId,
    config::RefinerConfig,
    distributed::{
        backoff::Backoff, channel::CoordinatorClient, AbortReason, Rank, Reply, Request,
        WorkerReport, NO_MORE_JOBS,
    },
    partition::sniff_delimiter,
    shard::{ShardRecord, ShardWriter},
};

/// How long a child gets between SIGTERM and SIGKILL after its time limit.
const KILL_GRACE: Duration = Duration::from_secs(5);

enum Outcome {
    Success,
    Aborted(AbortReason),
}

pub struct Worker {
    rank: Rank,
    coordinator: CoordinatorClient,
    clusters_dir: PathBuf,
    pending_dir: PathBuf,
    cluster_logs_dir: PathBuf,
    shard: ShardWriter,
    refiner: RefinerConfig,
    time_limit: Option<Duration>,
    report_every: Option<u64>,
    report: WorkerReport,
    requests_sent: u64,
}

impl Worker {
    pub fn new(
        rank: Rank,
        coordinator: SocketAddr,
        work_dir: &Path,
        clusters_dir: PathBuf,
        refiner: RefinerConfig,
        time_limit: Option<Duration>,
        report_every: Option<u64>,
    ) -> Result<Self> {
        let pending_dir = work_dir.join("pending");
        let cluster_logs_dir = work_dir.join("logs").join("clusters");
        std::fs::create_dir_all(&pending_dir)?;
        std::fs::create_dir_all(&cluster_logs_dir)?;

        let shard = ShardWriter::open(work_dir.join("output").join(format!("worker_{rank}")))?;

        Ok(Self {
            rank,
            coordinator: CoordinatorClient::new(coordinator, rank as u64),
            clusters_dir,
            pending_dir,
            cluster_logs_dir,
            shard,
            refiner,
            time_limit,
            report_every,
            report: WorkerReport::default(),
            requests_sent: 0,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(rank = self.rank, "worker started");

        let mut backoff = Backoff::salted(
            Duration::from_millis(500),
            Duration::from_secs(10),
            self.rank as u64,
        );

        loop {
            let batch = self.request_work().await?;

            if batch.is_empty() {
                // queue is empty but work is still in flight elsewhere
                tokio::time::sleep(backoff.delay()).await;
                continue;
            }
            backoff.reset();

            for cluster_id in batch {
                if cluster_id == NO_MORE_JOBS {
                    return self.finalize().await;
                }

                self.process_cluster(cluster_id as ClusterId).await?;
            }
        }
    }

    async fn request_work(&mut self) -> Result<Vec<i64>> {
        let reply = self.send(&Request::WorkRequest { rank: self.rank }).await?;
        self.requests_sent += 1;

        if let Some(every) = self.report_every {
            if self.requests_sent % every == 0 {
                // best-effort; losing a report is not a correctness event
                let report = Request::WorkerReport {
                    rank: self.rank,
                    report: self.report,
                };
                if let Err(e) = self.send(&report).await {
                    tracing::warn!(rank = self.rank, error = %e, "report delivery failed");
                }
            }
        }

        match reply {
            Reply::Batch(batch) => Ok(batch),
            Reply::Ack => Err(crate::Error::UnexpectedReply.into()),
        }
    }

    async fn process_cluster(&mut self, cluster_id: ClusterId) -> Result<()> {
        tracing::info!(rank = self.rank, cluster_id, "processing cluster");

        let pending = self.pending_dir.join(cluster_id.to_string());

        let outcome = match self.run_refiner(cluster_id, &pending).await? {
            Outcome::Success => match parse_result_file(&pending, cluster_id) {
                Ok(entries) => {
                    self.shard.push(&ShardRecord {
                        cluster_id,
                        entries,
                    })?;
                    self.shard.flush()?;
                    std::fs::remove_file(&pending).ok();
                    Outcome::Success
                }
                Err(e) => {
                    tracing::error!(cluster_id, error = %e, "refiner output unusable");
                    Outcome::Aborted(AbortReason::Failed)
                }
            },
            aborted => {
                std::fs::remove_file(&pending).ok();
                aborted
            }
        };

        match outcome {
            Outcome::Success => {
                self.send(&Request::WorkDone {
                    rank: self.rank,
                    cluster_id,
                })
                .await?;
            }
            Outcome::Aborted(reason) => {
                self.send(&Request::WorkAborted {
                    rank: self.rank,
                    cluster_id,
                    reason,
                })
                .await?;
            }
        }

        Ok(())
    }

    /// Spawn the refinement subprocess and classify how it ended. Child
    /// stdout/stderr go to `logs/clusters/<id>.log`.
    async fn run_refiner(&mut self, cluster_id: ClusterId, pending: &Path) -> Result<Outcome> {
        let input = self.clusters_dir.join(cluster_id.to_string());
        let log = File::create(self.cluster_logs_dir.join(format!("{cluster_id}.log")))?;

        let mut command = self.refiner_command(cluster_id, &input, pending);
        command
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    cluster_id,
                    program = %self.refiner.program,
                    error = %e,
                    "failed to spawn refiner"
                );
                return Ok(Outcome::Aborted(AbortReason::Failed));
            }
        };

        let status = match self.time_limit {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    tracing::warn!(
                        cluster_id,
                        limit_secs = limit.as_secs(),
                        "time limit exceeded; killing child"
                    );
                    kill_gracefully(&mut child).await?;
                    self.report.timeout_count += 1;
                    self.update_peak_memory();
                    return Ok(Outcome::Aborted(AbortReason::Timeout));
                }
            },
            None => child.wait().await?,
        };

        self.update_peak_memory();

        if status.success() {
            return Ok(Outcome::Success);
        }

        if let Some(signal) = status.signal() {
            // a signal this worker did not send; most likely the OOM killer
            tracing::warn!(cluster_id, signal, "child killed by signal");
            self.report.oom_count += 1;
            return Ok(Outcome::Aborted(AbortReason::SignalKilled));
        }

        tracing::warn!(cluster_id, code = status.code(), "child failed");
        Ok(Outcome::Aborted(AbortReason::Failed))
    }

    fn refiner_command(&self, cluster_id: ClusterId, input: &Path, output: &Path) -> Command {
        let refiner = &self.refiner;

        let mut command = Command::new(&refiner.program);
        command
            .arg("--cluster-id")
            .arg(cluster_id.to_string())
            .arg("--edgelist")
            .arg(input)
            .arg("--output-file")
            .arg(output)
            .arg("--method")
            .arg(refiner.method.as_str())
            .arg("--connectedness-criterion")
            .arg(&refiner.connectedness_criterion)
            .arg("--mincut-type")
            .arg(refiner.mincut_type.as_str());

        if let Some(algorithm) = refiner.algorithm {
            command
                .arg("--algorithm")
                .arg(algorithm.as_str())
                .arg("--clustering-parameter")
                .arg(refiner.clustering_parameter.to_string());
        }

        if refiner.prune {
            command.arg("--prune");
        }

        command.kill_on_drop(true);
        command
    }

    fn update_peak_memory(&mut self) {
        let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
        if unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, usage.as_mut_ptr()) } == 0 {
            let usage = unsafe { usage.assume_init() };
            // ru_maxrss is in KB on linux
            let peak_mb = (usage.ru_maxrss as u64) / 1024;
            self.report.peak_memory_mb = self.report.peak_memory_mb.max(peak_mb);
        }
    }

    async fn send(&self, request: &Request) -> Result<Reply> {
        Ok(self.coordinator.call(request).await?)
    }

    async fn finalize(mut self) -> Result<()> {
        self.shard.flush()?;
        self.send(&Request::AggregateDone { rank: self.rank })
            .await?;

        tracing::info!(rank = self.rank, report = ?self.report, "worker done");
        Ok(())
    }
}

/// SIGTERM first so the child can clean up, SIGKILL after the grace period.
async fn kill_gracefully(child: &mut Child) -> Result<()> {
    if let Some(pid) = child.id() {
        unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    }

    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        child.kill().await?;
    }

    Ok(())
}

/// Parse a per-cluster result file into final (node, label) pairs. The
/// child's labels are local to the cluster, so they are namespaced with the
/// cluster id.
fn parse_result_file(
    path: &Path,
    cluster_id: ClusterId,
) -> Result<Vec<(u64, String)>, crate::Error> {
    use std::io::{BufRead, BufReader};

    if std::fs::metadata(path)?.len() == 0 {
        // every node of the cluster was pruned
        return Ok(Vec::new());
    }

    let delimiter = sniff_delimiter(path)?;
    let reader = BufReader::new(File::open(path)?);

    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let (node, label) = line
            .split_once(delimiter)
            .map(|(a, b)| (a.trim(), b.trim()))
            .ok_or_else(|| crate::Error::Parse {
                file: path.to_path_buf(),
                msg: format!("expected two columns in line '{line}'"),
            })?;
        let node: u64 = node.parse().map_err(|_| crate::Error::Parse {
            file: path.to_path_buf(),
            msg: format!("invalid node id '{node}'"),
        })?;

        entries.push((node, format!("{cluster_id}.{label}")));
    }

    Ok(entries)
}
