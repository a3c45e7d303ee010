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

//! The coordinator owns the unprocessed queue, the in-flight table and the
//! per-worker report table.
//!
//! Every cluster id lives in exactly one of: queue, in-flight table,
//! completed set, bypassed set, dropped set. Message handlers move ids
//! between them under a single lock; nothing else touches the state.
//!
//! Batches are drawn from the queue front (descending cost, so stragglers
//! start early) until the batch cost reaches `min_batch_cost` or the queue
//! empties. The terminal sentinel is only handed out once both the queue and
//! the in-flight table are empty; an empty batch tells the worker to ask
//! again later.

pub mod checkpoint;

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::Mutex,
    time::{Duration, Instant},
};

use anyhow::Result;

use crate::{
    cluster::{sort_into_queue_order, ClusterId, ClusterInfo, QueuedCluster},
    distributed::{AbortReason, Rank, Reply, Request, WorkerReport, NO_MORE_JOBS},
    shard::ShardReader,
};

use self::checkpoint::Checkpoint;

pub const BYPASS_SHARD_NAME: &str = "bypass";

#[derive(Debug, Clone)]
pub struct Settings {
    pub min_batch_cost: f64,
    pub cost_alpha: f64,
    pub max_retries: u32,
    pub num_workers: u32,
}

#[derive(Debug)]
struct InFlight {
    info: ClusterInfo,
    worker: Rank,
    assigned_at: Instant,
    retries: u32,
}

#[derive(Default)]
struct State {
    queue: VecDeque<QueuedCluster>,
    in_flight: HashMap<ClusterId, InFlight>,
    completed: HashSet<ClusterId>,
    bypassed: HashSet<ClusterId>,
    dropped: HashSet<ClusterId>,
    worker_reports: HashMap<Rank, WorkerReport>,
    // ranks that have received the terminal sentinel
    finished_workers: HashSet<Rank>,
    // ranks that have acknowledged with AGGREGATE_DONE
    aggregated_workers: HashSet<Rank>,
}

pub struct Coordinator {
    settings: Settings,
    state: Mutex<State>,
}

impl Coordinator {
    pub fn new(
        mut clusters: Vec<ClusterInfo>,
        bypassed: Vec<ClusterId>,
        dropped: Vec<ClusterId>,
        settings: Settings,
    ) -> Self {
        sort_into_queue_order(&mut clusters, settings.cost_alpha);

        let state = State {
            queue: clusters.into_iter().map(QueuedCluster::new).collect(),
            bypassed: bypassed.into_iter().collect(),
            dropped: dropped.into_iter().collect(),
            ..Default::default()
        };

        Self {
            settings,
            state: Mutex::new(state),
        }
    }

    /// Restore from a checkpoint; queue order is kept exactly as saved so
    /// the run continues where it left off.
    pub fn from_checkpoint(checkpoint: Checkpoint, settings: Settings) -> Self {
        let state = State {
            queue: checkpoint.queue.into_iter().collect(),
            completed: checkpoint.completed.into_iter().collect(),
            bypassed: checkpoint.bypassed.into_iter().collect(),
            dropped: checkpoint.dropped.into_iter().collect(),
            ..Default::default()
        };

        Self {
            settings,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn handle(&self, request: Request) -> Reply {
        match request {
            Request::WorkRequest { rank } => Reply::Batch(self.next_batch(rank)),
            Request::WorkerReport { rank, report } => {
                self.record_report(rank, report);
                Reply::Ack
            }
            Request::WorkDone { rank, cluster_id } => {
                self.work_done(rank, cluster_id);
                Reply::Ack
            }
            Request::WorkAborted {
                rank,
                cluster_id,
                reason,
            } => {
                self.work_aborted(rank, cluster_id, reason);
                Reply::Ack
            }
            Request::AggregateDone { rank } => {
                self.aggregate_done(rank);
                Reply::Ack
            }
        }
    }

    fn next_batch(&self, rank: Rank) -> Vec<i64> {
        let mut state = self.lock();

        if state.queue.is_empty() {
            if state.in_flight.is_empty() {
                if state.finished_workers.insert(rank) {
                    tracing::info!(rank, "no more jobs; sending terminal sentinel");
                }
                return vec![NO_MORE_JOBS];
            }

            // unfinished work might still come back; tell the worker to wait
            return Vec::new();
        }

        let mut batch = Vec::new();
        let mut batch_cost = 0.0;

        while batch_cost < self.settings.min_batch_cost {
            let Some(job) = state.queue.pop_front() else {
                break;
            };

            batch_cost += job.info.cost(self.settings.cost_alpha);
            batch.push(job.info.cluster_id as i64);
            state.in_flight.insert(
                job.info.cluster_id,
                InFlight {
                    info: job.info,
                    worker: rank,
                    assigned_at: Instant::now(),
                    retries: job.retries,
                },
            );
        }

        tracing::debug!(
            rank,
            batch_size = batch.len(),
            batch_cost,
            remaining = state.queue.len(),
            "distributing work"
        );

        batch
    }

    fn record_report(&self, rank: Rank, report: WorkerReport) {
        let mut state = self.lock();
        tracing::debug!(rank, ?report, "worker report");
        state.worker_reports.insert(rank, report);
    }

    fn work_done(&self, rank: Rank, cluster_id: ClusterId) {
        let mut state = self.lock();

        match state.in_flight.remove(&cluster_id) {
            Some(entry) => {
                if entry.worker != rank {
                    tracing::warn!(
                        cluster_id,
                        owner = entry.worker,
                        rank,
                        "completion from a rank that does not own the cluster"
                    );
                }
                state.completed.insert(cluster_id);
            }
            None => {
                tracing::warn!(rank, cluster_id, "completion for a cluster not in flight");
            }
        }
    }

    fn work_aborted(&self, rank: Rank, cluster_id: ClusterId, reason: AbortReason) {
        let mut state = self.lock();

        let Some(entry) = state.in_flight.remove(&cluster_id) else {
            tracing::warn!(rank, cluster_id, "abort for a cluster not in flight");
            return;
        };

        if reason.is_retryable() && entry.retries < self.settings.max_retries {
            tracing::info!(
                cluster_id,
                rank,
                reason = reason.code(),
                retries = entry.retries + 1,
                "requeueing aborted cluster"
            );
            state.queue.push_front(QueuedCluster {
                info: entry.info,
                retries: entry.retries + 1,
            });
        } else {
            tracing::warn!(
                cluster_id,
                rank,
                reason = reason.code(),
                retries = entry.retries,
                "dropping cluster"
            );
            state.dropped.insert(cluster_id);
        }
    }

    fn aggregate_done(&self, rank: Rank) {
        let mut state = self.lock();
        tracing::info!(rank, "worker finalized its shard");
        state.aggregated_workers.insert(rank);
    }

    /// All worker ranks have received the sentinel and finalized their
    /// shards. Implies the queue and the in-flight table are empty.
    pub fn all_workers_done(&self) -> bool {
        self.lock().aggregated_workers.len() as u32 >= self.settings.num_workers
    }

    /// In-flight entries assigned longer ago than `older_than`. There is no
    /// automatic reassignment (the owning worker may still be computing);
    /// this exists so the drain loop can surface stalled ranks.
    pub fn stalled_in_flight(&self, older_than: Duration) -> Vec<(ClusterId, Rank, Duration)> {
        self.lock()
            .in_flight
            .values()
            .filter(|entry| entry.assigned_at.elapsed() > older_than)
            .map(|entry| (entry.info.cluster_id, entry.worker, entry.assigned_at.elapsed()))
            .collect()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        let state = self.lock();

        // in-flight means unfinished; fold the entries back in at the queue
        // front, ordered by id so the snapshot is reproducible
        let mut in_flight: Vec<QueuedCluster> = state
            .in_flight
            .values()
            .map(|entry| QueuedCluster {
                info: entry.info,
                retries: entry.retries,
            })
            .collect();
        in_flight.sort_by_key(|job| job.info.cluster_id);

        let mut completed: Vec<ClusterId> = state.completed.iter().copied().collect();
        completed.sort_unstable();
        let mut bypassed: Vec<ClusterId> = state.bypassed.iter().copied().collect();
        bypassed.sort_unstable();
        let mut dropped: Vec<ClusterId> = state.dropped.iter().copied().collect();
        dropped.sort_unstable();

        Checkpoint {
            queue: in_flight
                .into_iter()
                .chain(state.queue.iter().copied())
                .collect(),
            completed,
            bypassed,
            dropped,
        }
    }

    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let checkpoint = self.checkpoint();
        checkpoint.save(path.as_ref())?;

        tracing::info!(
            path = %path.as_ref().display(),
            queued = checkpoint.queue.len(),
            completed = checkpoint.completed.len(),
            "checkpoint written"
        );

        Ok(())
    }

    /// Concatenate the bypass shard and the worker shards (in rank order)
    /// into the final output file.
    ///
    /// Only records whose cluster id is in the bypassed resp. completed set
    /// are copied, first record per id wins. Shards may hold more than that
    /// after a checkpoint restore: a record written by an attempt whose
    /// completion never reached the coordinator is superseded by the
    /// re-execution.
    pub fn finalize(
        &self,
        output_dir: impl AsRef<Path>,
        output_file: impl AsRef<Path>,
    ) -> Result<()> {
        let state = self.lock();
        let output_dir = output_dir.as_ref();

        let mut out = BufWriter::new(File::create(output_file.as_ref())?);
        let mut seen = HashSet::new();

        let bypass = output_dir.join(BYPASS_SHARD_NAME);
        if bypass.exists() {
            copy_records(
                &mut out,
                ShardReader::open(&bypass)?,
                &state.bypassed,
                &mut seen,
            )?;
        }

        let mut worker_shards = Vec::new();
        for entry in std::fs::read_dir(output_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(rank) = name
                .to_str()
                .and_then(|name| name.strip_prefix("worker_"))
                .and_then(|rank| rank.parse::<Rank>().ok())
            else {
                continue;
            };
            worker_shards.push((rank, entry.path()));
        }
        worker_shards.sort_by_key(|(rank, _)| *rank);

        for (_, path) in worker_shards {
            copy_records(
                &mut out,
                ShardReader::open(&path)?,
                &state.completed,
                &mut seen,
            )?;
        }

        out.flush()?;

        tracing::info!(
            clusters = seen.len(),
            output = %output_file.as_ref().display(),
            "final clustering written"
        );

        Ok(())
    }

    pub fn stats(&self) -> Stats {
        let state = self.lock();
        Stats {
            queued: state.queue.len(),
            in_flight: state.in_flight.len(),
            completed: state.completed.len(),
            bypassed: state.bypassed.len(),
            dropped: state.dropped.len(),
        }
    }

    pub fn worker_reports(&self) -> HashMap<Rank, WorkerReport> {
        self.lock().worker_reports.clone()
    }
}

fn copy_records<W: Write>(
    out: &mut W,
    mut reader: ShardReader,
    allowed: &HashSet<ClusterId>,
    seen: &mut HashSet<ClusterId>,
) -> Result<()> {
    while let Some(record) = reader.next()? {
        if !allowed.contains(&record.cluster_id) {
            continue;
        }
        if !seen.insert(record.cluster_id) {
            continue;
        }

        for (node, label) in &record.entries {
            writeln!(out, "{node}\t{label}")?;
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub queued: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub bypassed: usize,
    pub dropped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{ShardRecord, ShardWriter};

    fn info(cluster_id: ClusterId, node_count: u64, edge_count: u64) -> ClusterInfo {
        ClusterInfo {
            cluster_id,
            node_count,
            edge_count,
        }
    }

    fn settings(min_batch_cost: f64, num_workers: u32) -> Settings {
        Settings {
            min_batch_cost,
            cost_alpha: 1.0,
            max_retries: 2,
            num_workers,
        }
    }

    fn batch(coordinator: &Coordinator, rank: Rank) -> Vec<i64> {
        match coordinator.handle(Request::WorkRequest { rank }) {
            Reply::Batch(batch) => batch,
            Reply::Ack => panic!("work request must be answered with a batch"),
        }
    }

    #[test]
    fn batches_meet_min_cost_and_preserve_order() {
        // four clusters of cost 4 each; min batch cost 8 => two per batch
        let clusters = (0..4).map(|id| info(id, 2, 2)).collect();
        let coordinator = Coordinator::new(clusters, vec![], vec![], settings(8.0, 2));

        assert_eq!(batch(&coordinator, 1), vec![0, 1]);
        assert_eq!(batch(&coordinator, 2), vec![2, 3]);
    }

    #[test]
    fn queue_is_drawn_in_descending_cost_order() {
        let clusters = vec![info(0, 1, 1), info(1, 10, 20), info(2, 5, 5)];
        let coordinator = Coordinator::new(clusters, vec![], vec![], settings(1.0, 1));

        assert_eq!(batch(&coordinator, 1), vec![1]);
        assert_eq!(batch(&coordinator, 1), vec![2]);
        assert_eq!(batch(&coordinator, 1), vec![0]);
    }

    #[test]
    fn a_single_batch_can_empty_the_queue() {
        let clusters = vec![info(0, 1, 0), info(1, 1, 0)];
        let coordinator = Coordinator::new(clusters, vec![], vec![], settings(100.0, 1));

        assert_eq!(batch(&coordinator, 1), vec![0, 1]);
    }

    #[test]
    fn sentinel_only_after_in_flight_drains() {
        let coordinator = Coordinator::new(vec![info(0, 2, 1)], vec![], vec![], settings(1.0, 2));

        assert_eq!(batch(&coordinator, 1), vec![0]);

        // rank 2 asks while cluster 0 is still in flight: wait, not sentinel
        assert_eq!(batch(&coordinator, 2), Vec::<i64>::new());

        coordinator.handle(Request::WorkDone {
            rank: 1,
            cluster_id: 0,
        });

        assert_eq!(batch(&coordinator, 2), vec![NO_MORE_JOBS]);
        assert_eq!(batch(&coordinator, 1), vec![NO_MORE_JOBS]);
    }

    #[test]
    fn empty_queue_yields_sentinel_immediately() {
        let coordinator = Coordinator::new(vec![], vec![], vec![], settings(1.0, 2));

        assert_eq!(batch(&coordinator, 1), vec![NO_MORE_JOBS]);
        assert_eq!(batch(&coordinator, 2), vec![NO_MORE_JOBS]);
    }

    #[test]
    fn retryable_abort_requeues_at_the_front() {
        let clusters = vec![info(0, 10, 10), info(1, 1, 1)];
        let coordinator = Coordinator::new(clusters, vec![], vec![], settings(1.0, 1));

        assert_eq!(batch(&coordinator, 1), vec![0]);
        coordinator.handle(Request::WorkAborted {
            rank: 1,
            cluster_id: 0,
            reason: AbortReason::Timeout,
        });

        // the aborted cluster comes back before the untouched one
        assert_eq!(batch(&coordinator, 1), vec![0]);
    }

    #[test]
    fn retry_budget_exhaustion_drops_the_cluster() {
        let coordinator = Coordinator::new(vec![info(0, 2, 1)], vec![], vec![], settings(1.0, 1));

        for _ in 0..3 {
            assert_eq!(batch(&coordinator, 1), vec![0]);
            coordinator.handle(Request::WorkAborted {
                rank: 1,
                cluster_id: 0,
                reason: AbortReason::SignalKilled,
            });
        }

        // initial attempt + max_retries retries used up
        assert_eq!(batch(&coordinator, 1), vec![NO_MORE_JOBS]);
        assert_eq!(coordinator.stats().dropped, 1);
    }

    #[test]
    fn deterministic_failure_is_never_retried() {
        let coordinator = Coordinator::new(vec![info(0, 2, 1)], vec![], vec![], settings(1.0, 1));

        assert_eq!(batch(&coordinator, 1), vec![0]);
        coordinator.handle(Request::WorkAborted {
            rank: 1,
            cluster_id: 0,
            reason: AbortReason::Failed,
        });

        assert_eq!(batch(&coordinator, 1), vec![NO_MORE_JOBS]);
        assert_eq!(coordinator.stats().dropped, 1);
    }

    #[test]
    fn ids_partition_across_states() {
        let clusters = vec![info(0, 4, 4), info(1, 3, 3), info(2, 2, 2)];
        let coordinator = Coordinator::new(clusters, vec![3], vec![4], settings(1.0, 1));

        assert_eq!(batch(&coordinator, 1), vec![0]);
        coordinator.handle(Request::WorkDone {
            rank: 1,
            cluster_id: 0,
        });

        let stats = coordinator.stats();
        assert_eq!(
            (
                stats.queued,
                stats.in_flight,
                stats.completed,
                stats.bypassed,
                stats.dropped
            ),
            (2, 0, 1, 1, 1)
        );
    }

    #[test]
    fn all_workers_done_requires_every_rank() {
        let coordinator = Coordinator::new(vec![], vec![], vec![], settings(1.0, 2));

        assert_eq!(batch(&coordinator, 1), vec![NO_MORE_JOBS]);
        coordinator.handle(Request::AggregateDone { rank: 1 });
        assert!(!coordinator.all_workers_done());

        assert_eq!(batch(&coordinator, 2), vec![NO_MORE_JOBS]);
        coordinator.handle(Request::AggregateDone { rank: 2 });
        assert!(coordinator.all_workers_done());
    }

    #[test]
    fn reports_replace_previous_ones() {
        let coordinator = Coordinator::new(vec![], vec![], vec![], settings(1.0, 1));

        coordinator.handle(Request::WorkerReport {
            rank: 1,
            report: WorkerReport {
                oom_count: 1,
                timeout_count: 0,
                peak_memory_mb: 100,
            },
        });
        coordinator.handle(Request::WorkerReport {
            rank: 1,
            report: WorkerReport {
                oom_count: 2,
                timeout_count: 1,
                peak_memory_mb: 250,
            },
        });

        let reports = coordinator.worker_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[&1].peak_memory_mb, 250);
    }

    #[test]
    fn checkpoint_folds_in_flight_into_queue_front() {
        let clusters = vec![info(0, 10, 10), info(1, 5, 5), info(2, 1, 1)];
        let coordinator = Coordinator::new(clusters, vec![], vec![], settings(1.0, 1));

        assert_eq!(batch(&coordinator, 1), vec![0]);
        assert_eq!(batch(&coordinator, 1), vec![1]);
        coordinator.handle(Request::WorkDone {
            rank: 1,
            cluster_id: 0,
        });

        let checkpoint = coordinator.checkpoint();
        let ids: Vec<ClusterId> = checkpoint
            .queue
            .iter()
            .map(|job| job.info.cluster_id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(checkpoint.completed, vec![0]);

        // restoring continues exactly there
        let restored = Coordinator::from_checkpoint(checkpoint, settings(1.0, 1));
        assert_eq!(batch(&restored, 1), vec![1]);
        assert_eq!(batch(&restored, 1), vec![2]);
    }

    #[test]
    fn finalize_concatenates_bypass_first_and_dedups() {
        let dir = crate::gen_temp_path();
        let output_dir = dir.join("output");
        std::fs::create_dir_all(&output_dir).unwrap();

        let mut bypass = ShardWriter::open(output_dir.join(BYPASS_SHARD_NAME)).unwrap();
        bypass
            .push(&ShardRecord {
                cluster_id: 9,
                entries: vec![(100, "9".to_string())],
            })
            .unwrap();
        bypass.flush().unwrap();

        let mut shard = ShardWriter::open(output_dir.join("worker_1")).unwrap();
        // two records for cluster 0: a restored run re-executed it
        shard
            .push(&ShardRecord {
                cluster_id: 0,
                entries: vec![(1, "0.0".to_string()), (2, "0.1".to_string())],
            })
            .unwrap();
        shard
            .push(&ShardRecord {
                cluster_id: 0,
                entries: vec![(1, "0.0".to_string()), (2, "0.1".to_string())],
            })
            .unwrap();
        // record for a cluster that is not in the completed set
        shard
            .push(&ShardRecord {
                cluster_id: 5,
                entries: vec![(7, "5.0".to_string())],
            })
            .unwrap();
        shard.flush().unwrap();

        let coordinator = Coordinator::new(vec![info(0, 2, 1)], vec![9], vec![], settings(1.0, 1));
        assert_eq!(batch(&coordinator, 1), vec![0]);
        coordinator.handle(Request::WorkDone {
            rank: 1,
            cluster_id: 0,
        });

        let output_file = dir.join("clustering");
        coordinator.finalize(&output_dir, &output_file).unwrap();

        let contents = std::fs::read_to_string(&output_file).unwrap();
        assert_eq!(contents, "100\t9\n1\t0.0\n2\t0.1\n");
    }
}
