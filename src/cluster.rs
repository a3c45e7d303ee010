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

//! Descriptors for the units of work.
//!
//! Input cluster labels are strings; the partitioner assigns each label a
//! dense [`ClusterId`] on first sight and everything downstream speaks ids.

pub type ClusterId = u32;

/// Immutable descriptor of one cluster, created by the partitioner.
///
/// `edge_count` counts only the edges of the induced subgraph;
/// `node_count` is the union of endpoints seen on those edges.
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
pub struct ClusterInfo {
    pub cluster_id: ClusterId,
    pub node_count: u64,
    pub edge_count: u64,
}

impl ClusterInfo {
    /// Estimated processing cost. `alpha` weighs edges against nodes.
    pub fn cost(&self, alpha: f64) -> f64 {
        self.node_count as f64 + alpha * self.edge_count as f64
    }

    /// The induced subgraph is complete.
    pub fn is_clique(&self) -> bool {
        self.edge_count == self.node_count * self.node_count.saturating_sub(1) / 2
    }
}

/// A queue entry. Couples the immutable descriptor with the number of times
/// the cluster has been handed back after a non-deterministic abort, so a
/// requeued cluster keeps its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct QueuedCluster {
    pub info: ClusterInfo,
    pub retries: u32,
}

impl QueuedCluster {
    pub fn new(info: ClusterInfo) -> Self {
        Self { info, retries: 0 }
    }
}

/// Sort clusters into queue order: descending cost so stragglers start
/// early, ties broken by ascending id so the order is reproducible across
/// restarts.
pub fn sort_into_queue_order(clusters: &mut [ClusterInfo], alpha: f64) {
    clusters.sort_by(|a, b| {
        b.cost(alpha)
            .total_cmp(&a.cost(alpha))
            .then(a.cluster_id.cmp(&b.cluster_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(cluster_id: ClusterId, node_count: u64, edge_count: u64) -> ClusterInfo {
        ClusterInfo {
            cluster_id,
            node_count,
            edge_count,
        }
    }

    #[test]
    fn cost_weighs_edges_by_alpha() {
        let c = info(0, 10, 20);
        assert_eq!(c.cost(1.0), 30.0);
        assert_eq!(c.cost(0.5), 20.0);
    }

    #[test]
    fn clique_detection() {
        assert!(info(0, 3, 3).is_clique());
        assert!(info(0, 2, 1).is_clique());
        assert!(!info(0, 3, 2).is_clique());
        assert!(!info(0, 4, 5).is_clique());
    }

    #[test]
    fn queue_order_is_descending_cost_then_id() {
        let mut clusters = vec![info(3, 2, 1), info(1, 3, 2), info(2, 2, 1), info(0, 5, 9)];
        sort_into_queue_order(&mut clusters, 1.0);

        let ids: Vec<_> = clusters.iter().map(|c| c.cluster_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }
}
