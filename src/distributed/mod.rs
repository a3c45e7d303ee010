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

//! The rank-addressed message protocol between workers and the coordinator.
//!
//! The transport is a length-framed TCP exchange (see [`channel`]). The
//! coordinator listens; workers dial in per request and identify themselves
//! by rank, so the coordinator never needs to address a worker directly. A
//! worker issues its requests sequentially on one task, which gives the
//! in-order delivery the protocol relies on.

pub mod backoff;
pub mod channel;

pub type Rank = u32;

use crate::cluster::ClusterId;

/// Sentinel cluster id: the batch `[NO_MORE_JOBS]` tells a worker to
/// finalize its shard and exit.
pub const NO_MORE_JOBS: i64 = -1;

/// Why a worker gave a cluster back instead of completing it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub enum AbortReason {
    /// The wall-clock limit expired and the worker killed the child.
    Timeout,
    /// The child was killed by a signal the worker did not send. On the
    /// clusters this tool is pointed at, that is almost always the kernel
    /// OOM killer.
    SignalKilled,
    /// The child exited cleanly with a non-zero status. Deterministic, so
    /// never retried.
    Failed,
}

impl AbortReason {
    pub fn is_retryable(&self) -> bool {
        match self {
            AbortReason::Timeout | AbortReason::SignalKilled => true,
            AbortReason::Failed => false,
        }
    }

    /// Wire code, kept in logs for grep-ability: 1=timeout, 2=signal/oom,
    /// 3=deterministic-fail.
    pub fn code(&self) -> u8 {
        match self {
            AbortReason::Timeout => 1,
            AbortReason::SignalKilled => 2,
            AbortReason::Failed => 3,
        }
    }
}

/// Cumulative per-worker counters, sent to the coordinator as a follow-up
/// to every `report_interval`-th work request. Convenience stats only;
/// delivery is best-effort and loss is not a correctness event.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct WorkerReport {
    pub oom_count: u64,
    pub timeout_count: u64,
    pub peak_memory_mb: u64,
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub enum Request {
    /// Ask for a batch of cluster ids to process.
    WorkRequest { rank: Rank },
    /// Cumulative telemetry, sent immediately after a `WorkRequest`.
    WorkerReport { rank: Rank, report: WorkerReport },
    /// The cluster was refined and its result is in the worker's shard.
    WorkDone { rank: Rank, cluster_id: ClusterId },
    /// The cluster was given back.
    WorkAborted {
        rank: Rank,
        cluster_id: ClusterId,
        reason: AbortReason,
    },
    /// The worker received the sentinel and flushed its shard.
    AggregateDone { rank: Rank },
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub enum Reply {
    /// The batch for a `WorkRequest`: cluster ids to process in order.
    /// Empty means "nothing to hand out right now, ask again";
    /// `[NO_MORE_JOBS]` is the terminal sentinel.
    Batch(Vec<i64>),
    /// Acknowledgement for everything else.
    Ack,
}
