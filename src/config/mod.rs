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

pub mod defaults;

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::distributed::Rank;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CoordinatorConfig {
    /// Network edge-list file.
    pub edgelist: String,

    /// Existing clustering file to refine.
    pub existing_clustering: String,

    /// Final clustering file.
    pub output_file: String,

    /// Directory for intermediate results. Also what makes restoring
    /// progress across restarts possible.
    #[serde(default = "defaults::Coordinator::work_dir")]
    pub work_dir: String,

    /// Pre-partitioned clusters directory; skips partitioning if set.
    pub partitioned_clusters_dir: Option<String>,

    /// Address to serve the work-distribution protocol on.
    pub host: SocketAddr,

    #[serde(default = "defaults::Coordinator::num_workers")]
    pub num_workers: u32,

    /// Minimum total estimated cost per batch handed to a worker.
    #[serde(default = "defaults::Coordinator::min_batch_cost")]
    pub min_batch_cost: f64,

    /// Weight of edges against nodes in the cost estimate.
    #[serde(default = "defaults::Coordinator::cost_alpha")]
    pub cost_alpha: f64,

    /// How often a cluster aborted by timeout or signal is handed out again
    /// before it is dropped.
    #[serde(default = "defaults::Coordinator::max_retries")]
    pub max_retries: u32,

    /// Drop clusters with strictly fewer nodes than this.
    pub drop_cluster_under: Option<u64>,

    /// Write cliques straight to the output instead of refining them.
    #[serde(default)]
    pub bypass_clique: bool,

    /// Warn about in-flight clusters older than this while draining.
    #[serde(default = "defaults::Coordinator::stall_warn_secs")]
    pub stall_warn_secs: u64,
}

impl CoordinatorConfig {
    pub fn work_dir(&self) -> PathBuf {
        PathBuf::from(&self.work_dir)
    }

    pub fn clusters_dir(&self) -> PathBuf {
        match &self.partitioned_clusters_dir {
            Some(dir) => PathBuf::from(dir),
            None => self.work_dir().join("clusters"),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct WorkerConfig {
    /// Address of the coordinator.
    pub coordinator: SocketAddr,

    /// This worker's rank. Unique per worker; rank 0 is the coordinator's.
    pub rank: Rank,

    #[serde(default = "defaults::Worker::work_dir")]
    pub work_dir: String,

    /// Pre-partitioned clusters directory, when the coordinator was pointed
    /// at one.
    pub partitioned_clusters_dir: Option<String>,

    pub refiner: RefinerConfig,

    /// Seconds per cluster; non-positive means no limit.
    #[serde(default = "defaults::Worker::time_limit_per_cluster")]
    pub time_limit_per_cluster: i64,

    /// Send a cumulative report every N work requests; non-positive
    /// disables reports.
    #[serde(default = "defaults::Worker::report_interval")]
    pub report_interval: i64,
}

impl WorkerConfig {
    pub fn work_dir(&self) -> PathBuf {
        PathBuf::from(&self.work_dir)
    }

    pub fn clusters_dir(&self) -> PathBuf {
        match &self.partitioned_clusters_dir {
            Some(dir) => PathBuf::from(dir),
            None => self.work_dir().join("clusters"),
        }
    }

    pub fn time_limit(&self) -> Option<Duration> {
        (self.time_limit_per_cluster > 0)
            .then(|| Duration::from_secs(self.time_limit_per_cluster as u64))
    }

    pub fn report_every(&self) -> Option<u64> {
        (self.report_interval > 0).then_some(self.report_interval as u64)
    }
}

/// World size 1: coordinator and worker cohabit one process.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LocalConfig {
    pub coordinator: CoordinatorConfig,
    pub worker: LocalWorkerConfig,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct LocalWorkerConfig {
    pub refiner: RefinerConfig,

    #[serde(default = "defaults::Worker::time_limit_per_cluster")]
    pub time_limit_per_cluster: i64,

    #[serde(default = "defaults::Worker::report_interval")]
    pub report_interval: i64,
}

impl LocalWorkerConfig {
    pub fn time_limit(&self) -> Option<Duration> {
        (self.time_limit_per_cluster > 0)
            .then(|| Duration::from_secs(self.time_limit_per_cluster as u64))
    }

    pub fn report_every(&self) -> Option<u64> {
        (self.report_interval > 0).then_some(self.report_interval as u64)
    }
}

/// Everything the external refinement subprocess needs to know. The CM and
/// WCC pipelines differ only in these parameters, so one command builder
/// serves both.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RefinerConfig {
    /// Path to the external per-cluster refinement program.
    pub program: String,

    pub method: Method,

    /// Clustering algorithm; CM only.
    pub algorithm: Option<Algorithm>,

    /// e.g. 0.01 for Leiden-CPM.
    #[serde(default = "defaults::Refiner::clustering_parameter")]
    pub clustering_parameter: f64,

    /// String in the form of Clog_x(n) or Cn^x for well-connectedness.
    #[serde(default = "defaults::Refiner::connectedness_criterion")]
    pub connectedness_criterion: String,

    #[serde(default)]
    pub mincut_type: MincutType,

    /// Whether to prune nodes using mincuts.
    #[serde(default)]
    pub prune: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Cm,
    Wcc,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Cm => "cm",
            Method::Wcc => "wcc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    LeidenCpm,
    LeidenMod,
    Louvain,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::LeidenCpm => "leiden-cpm",
            Algorithm::LeidenMod => "leiden-mod",
            Algorithm::Louvain => "louvain",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MincutType {
    #[default]
    Cactus,
    Noi,
}

impl MincutType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MincutType::Cactus => "cactus",
            MincutType::Noi => "noi",
        }
    }
}
