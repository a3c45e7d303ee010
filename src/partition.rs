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

//! Splits the input clustering into one edge-list file per cluster.
//!
//! Runs once on the coordinator before any worker is served. An edge is
//! emitted to a cluster's file iff both endpoints carry that cluster's
//! label; edges crossing clusters are discarded. Clusters falling under the
//! size filter are dropped, cliques are written straight to the bypass shard
//! when `bypass_clique` is set, and everything else becomes a job.

use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

use anyhow::{Context, Result};

use crate::{
    cluster::{ClusterId, ClusterInfo},
    shard::{ShardRecord, ShardWriter},
};

/// Detect the column delimiter from the first line of a file.
/// Precedence: comma, tab, space.
pub fn sniff_delimiter(path: &Path) -> Result<char, crate::Error> {
    let file = File::open(path)?;
    let mut first_line = String::new();
    BufReader::new(file).read_line(&mut first_line)?;

    if first_line.contains(',') {
        Ok(',')
    } else if first_line.contains('\t') {
        Ok('\t')
    } else if first_line.contains(' ') {
        Ok(' ')
    } else {
        Err(crate::Error::UnknownDelimiter(path.to_path_buf()))
    }
}

fn split_pair<'a>(
    line: &'a str,
    delimiter: char,
    path: &Path,
) -> Result<(&'a str, &'a str), crate::Error> {
    line.split_once(delimiter)
        .map(|(a, b)| (a.trim(), b.trim()))
        .ok_or_else(|| crate::Error::Parse {
            file: path.to_path_buf(),
            msg: format!("expected two columns in line '{line}'"),
        })
}

fn parse_node(field: &str, path: &Path) -> Result<u64, crate::Error> {
    field.parse().map_err(|_| crate::Error::Parse {
        file: path.to_path_buf(),
        msg: format!("invalid node id '{field}'"),
    })
}

#[derive(Debug, Clone)]
pub struct PartitionOptions {
    /// Drop clusters with strictly fewer nodes than this.
    pub drop_cluster_under: Option<u64>,
    /// Write cliques straight to the bypass shard instead of refining them.
    pub bypass_clique: bool,
}

#[derive(Debug, Default)]
pub struct PartitionOutcome {
    /// Clusters that become jobs. Unsorted; the coordinator owns queue order.
    pub queued: Vec<ClusterInfo>,
    pub bypassed: Vec<ClusterId>,
    pub dropped: Vec<ClusterId>,
}

/// Split `edgelist` according to `clustering` into one file per cluster
/// under `clusters_dir`, named by dense cluster id.
///
/// Partial output of a failed run is discarded: the directory is cleared on
/// entry and removed again if the pass fails.
pub fn partition(
    edgelist: &Path,
    clustering: &Path,
    clusters_dir: &Path,
    bypass_shard: &mut ShardWriter,
    options: &PartitionOptions,
) -> Result<PartitionOutcome> {
    if clusters_dir.exists() {
        std::fs::remove_dir_all(clusters_dir)?;
    }
    std::fs::create_dir_all(clusters_dir)?;

    match partition_pass(edgelist, clustering, clusters_dir, bypass_shard, options) {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            std::fs::remove_dir_all(clusters_dir).ok();
            Err(e)
        }
    }
}

fn partition_pass(
    edgelist: &Path,
    clustering: &Path,
    clusters_dir: &Path,
    bypass_shard: &mut ShardWriter,
    options: &PartitionOptions,
) -> Result<PartitionOutcome> {
    let node_to_cluster = load_clustering(clustering)?;
    let num_clusters = node_to_cluster
        .values()
        .copied()
        .max()
        .map(|id| id + 1)
        .unwrap_or(0);

    tracing::info!(
        nodes = node_to_cluster.len(),
        clusters = num_clusters,
        "clustering loaded"
    );

    let delimiter = sniff_delimiter(edgelist)?;
    let reader = BufReader::new(
        File::open(edgelist).with_context(|| format!("failed to open '{}'", edgelist.display()))?,
    );

    let mut writers: HashMap<ClusterId, BufWriter<File>> = HashMap::new();
    let mut nodes: HashMap<ClusterId, HashSet<u64>> = HashMap::new();
    let mut edge_counts: HashMap<ClusterId, u64> = HashMap::new();
    let mut crossing_edges: u64 = 0;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let (a, b) = split_pair(&line, delimiter, edgelist)?;
        let u = parse_node(a, edgelist)?;
        let v = parse_node(b, edgelist)?;

        let (Some(&cu), Some(&cv)) = (node_to_cluster.get(&u), node_to_cluster.get(&v)) else {
            crossing_edges += 1;
            continue;
        };

        if cu != cv {
            crossing_edges += 1;
            continue;
        }

        let writer = match writers.entry(cu) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let file = File::create(clusters_dir.join(cu.to_string()))?;
                e.insert(BufWriter::new(file))
            }
        };
        writeln!(writer, "{u}\t{v}")?;

        let cluster_nodes = nodes.entry(cu).or_default();
        cluster_nodes.insert(u);
        cluster_nodes.insert(v);
        *edge_counts.entry(cu).or_default() += 1;
    }

    for (_, mut writer) in writers {
        writer.flush()?;
    }

    tracing::info!(crossing_edges, "edge scan finished");

    let mut outcome = PartitionOutcome::default();

    for cluster_id in 0..num_clusters {
        let Some(cluster_nodes) = nodes.get(&cluster_id) else {
            // no intra-cluster edge ever seen; nothing to refine
            outcome.dropped.push(cluster_id);
            continue;
        };

        let info = ClusterInfo {
            cluster_id,
            node_count: cluster_nodes.len() as u64,
            edge_count: edge_counts[&cluster_id],
        };

        if let Some(min_nodes) = options.drop_cluster_under {
            if info.node_count < min_nodes {
                outcome.dropped.push(cluster_id);
                continue;
            }
        }

        if options.bypass_clique && info.is_clique() {
            let mut entries: Vec<u64> = cluster_nodes.iter().copied().collect();
            entries.sort_unstable();
            bypass_shard.push(&ShardRecord {
                cluster_id,
                entries: entries
                    .into_iter()
                    .map(|node| (node, cluster_id.to_string()))
                    .collect(),
            })?;
            outcome.bypassed.push(cluster_id);
            continue;
        }

        outcome.queued.push(info);
    }

    bypass_shard.flush()?;

    tracing::info!(
        queued = outcome.queued.len(),
        bypassed = outcome.bypassed.len(),
        dropped = outcome.dropped.len(),
        "partitioning finished"
    );

    Ok(outcome)
}

fn load_clustering(clustering: &Path) -> Result<HashMap<u64, ClusterId>> {
    let delimiter = sniff_delimiter(clustering)?;
    let reader = BufReader::new(
        File::open(clustering)
            .with_context(|| format!("failed to open '{}'", clustering.display()))?,
    );

    let mut label_ids: HashMap<String, ClusterId> = HashMap::new();
    let mut node_to_cluster = HashMap::new();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let (node, label) = split_pair(&line, delimiter, clustering)?;
        let node = parse_node(node, clustering)?;

        let next_id = label_ids.len() as ClusterId;
        let cluster_id = *label_ids.entry(label.to_string()).or_insert(next_id);

        node_to_cluster.insert(node, cluster_id);
    }

    Ok(node_to_cluster)
}

/// Construct cluster descriptors from an already-partitioned directory.
/// The caller is trusted: the id is the filename stem and the counts come
/// from the file contents; no filters are applied and no cross-check against
/// the input clustering happens.
pub fn load_partitioned(partitioned_dir: &Path) -> Result<Vec<ClusterInfo>> {
    let mut clusters = Vec::new();

    for entry in std::fs::read_dir(partitioned_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let cluster_id: ClusterId = stem.parse().map_err(|_| crate::Error::Parse {
            file: path.clone(),
            msg: format!("cluster file name '{stem}' is not an id"),
        })?;

        let delimiter = sniff_delimiter(&path)?;
        let reader = BufReader::new(File::open(&path)?);

        let mut nodes = HashSet::new();
        let mut edge_count = 0;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let (a, b) = split_pair(&line, delimiter, &path)?;
            nodes.insert(parse_node(a, &path)?);
            nodes.insert(parse_node(b, &path)?);
            edge_count += 1;
        }

        clusters.push(ClusterInfo {
            cluster_id,
            node_count: nodes.len() as u64,
            edge_count,
        });
    }

    tracing::info!(
        clusters = clusters.len(),
        dir = %partitioned_dir.display(),
        "loaded pre-partitioned clusters"
    );

    Ok(clusters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardReader;
    use std::path::PathBuf;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn setup(edges: &str, clustering: &str) -> (PathBuf, PathBuf, PathBuf, PathBuf) {
        let dir = crate::gen_temp_path();
        std::fs::create_dir_all(&dir).unwrap();
        let edgelist = write_file(&dir, "edges", edges);
        let clusters = write_file(&dir, "clustering", clustering);
        let clusters_dir = dir.join("clusters");
        let bypass = dir.join("bypass");
        (edgelist, clusters, clusters_dir, bypass)
    }

    fn no_filters() -> PartitionOptions {
        PartitionOptions {
            drop_cluster_under: None,
            bypass_clique: false,
        }
    }

    #[test]
    fn delimiter_precedence() {
        let dir = crate::gen_temp_path();
        std::fs::create_dir_all(&dir).unwrap();

        let comma = write_file(&dir, "comma", "1,2\t3 4\n");
        assert_eq!(sniff_delimiter(&comma).unwrap(), ',');

        let tab = write_file(&dir, "tab", "1\t2 3\n");
        assert_eq!(sniff_delimiter(&tab).unwrap(), '\t');

        let space = write_file(&dir, "space", "1 2\n");
        assert_eq!(sniff_delimiter(&space).unwrap(), ' ');

        let none = write_file(&dir, "none", "12\n");
        assert!(matches!(
            sniff_delimiter(&none),
            Err(crate::Error::UnknownDelimiter(_))
        ));
    }

    #[test]
    fn splits_by_cluster_and_discards_crossing_edges() {
        let (edgelist, clustering, clusters_dir, bypass) = setup(
            "1\t2\n2\t3\n4\t5\n1\t4\n",
            "1\tA\n2\tA\n3\tA\n4\tB\n5\tB\n",
        );

        let mut bypass_shard = ShardWriter::open(&bypass).unwrap();
        let outcome = partition(
            &edgelist,
            &clustering,
            &clusters_dir,
            &mut bypass_shard,
            &no_filters(),
        )
        .unwrap();

        assert_eq!(outcome.queued.len(), 2);
        assert!(outcome.bypassed.is_empty());
        assert!(outcome.dropped.is_empty());

        let a = outcome.queued.iter().find(|c| c.cluster_id == 0).unwrap();
        assert_eq!((a.node_count, a.edge_count), (3, 2));
        let b = outcome.queued.iter().find(|c| c.cluster_id == 1).unwrap();
        assert_eq!((b.node_count, b.edge_count), (2, 1));

        let a_file = std::fs::read_to_string(clusters_dir.join("0")).unwrap();
        assert_eq!(a_file, "1\t2\n2\t3\n");
        let b_file = std::fs::read_to_string(clusters_dir.join("1")).unwrap();
        assert_eq!(b_file, "4\t5\n");
    }

    #[test]
    fn drop_cluster_under_filters_small_clusters() {
        let (edgelist, clustering, clusters_dir, bypass) =
            setup("1\t2\n2\t3\n4\t5\n", "1\tA\n2\tA\n3\tA\n4\tB\n5\tB\n");

        let mut bypass_shard = ShardWriter::open(&bypass).unwrap();
        let outcome = partition(
            &edgelist,
            &clustering,
            &clusters_dir,
            &mut bypass_shard,
            &PartitionOptions {
                drop_cluster_under: Some(3),
                bypass_clique: false,
            },
        )
        .unwrap();

        assert_eq!(outcome.queued.len(), 1);
        assert_eq!(outcome.queued[0].cluster_id, 0);
        assert_eq!(outcome.dropped, vec![1]);
    }

    #[test]
    fn all_clusters_under_the_size_filter_leaves_nothing_queued() {
        let (edgelist, clustering, clusters_dir, bypass) =
            setup("1\t2\n3\t4\n", "1\tA\n2\tA\n3\tB\n4\tB\n");

        let mut bypass_shard = ShardWriter::open(&bypass).unwrap();
        let outcome = partition(
            &edgelist,
            &clustering,
            &clusters_dir,
            &mut bypass_shard,
            &PartitionOptions {
                drop_cluster_under: Some(10),
                bypass_clique: false,
            },
        )
        .unwrap();

        assert!(outcome.queued.is_empty());
        assert_eq!(outcome.dropped, vec![0, 1]);
    }

    #[test]
    fn cliques_are_bypassed() {
        // cluster A is a 3-clique; cluster B is a path on 3 nodes
        let (edgelist, clustering, clusters_dir, bypass) = setup(
            "1\t2\n1\t3\n2\t3\n4\t5\n5\t6\n",
            "1\tA\n2\tA\n3\tA\n4\tB\n5\tB\n6\tB\n",
        );

        let mut bypass_shard = ShardWriter::open(&bypass).unwrap();
        let outcome = partition(
            &edgelist,
            &clustering,
            &clusters_dir,
            &mut bypass_shard,
            &PartitionOptions {
                drop_cluster_under: None,
                bypass_clique: true,
            },
        )
        .unwrap();
        drop(bypass_shard);

        assert_eq!(outcome.bypassed, vec![0]);
        assert_eq!(outcome.queued.len(), 1);
        assert_eq!(outcome.queued[0].cluster_id, 1);

        let mut reader = ShardReader::open(&bypass).unwrap();
        let record = reader.next().unwrap().unwrap();
        assert_eq!(record.cluster_id, 0);
        assert_eq!(
            record.entries,
            vec![
                (1, "0".to_string()),
                (2, "0".to_string()),
                (3, "0".to_string()),
            ]
        );
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn clusters_without_internal_edges_are_dropped() {
        let (edgelist, clustering, clusters_dir, bypass) =
            setup("1\t2\n", "1\tA\n2\tA\n3\tB\n4\tB\n");

        let mut bypass_shard = ShardWriter::open(&bypass).unwrap();
        let outcome = partition(
            &edgelist,
            &clustering,
            &clusters_dir,
            &mut bypass_shard,
            &no_filters(),
        )
        .unwrap();

        assert_eq!(outcome.queued.len(), 1);
        assert_eq!(outcome.dropped, vec![1]);
    }

    #[test]
    fn comma_delimited_input() {
        let (edgelist, clustering, clusters_dir, bypass) =
            setup("1,2\n2,3\n", "1,A\n2,A\n3,A\n");

        let mut bypass_shard = ShardWriter::open(&bypass).unwrap();
        let outcome = partition(
            &edgelist,
            &clustering,
            &clusters_dir,
            &mut bypass_shard,
            &no_filters(),
        )
        .unwrap();

        assert_eq!(outcome.queued.len(), 1);
        assert_eq!(outcome.queued[0].node_count, 3);
    }

    #[test]
    fn pre_partitioned_roundtrip() {
        let (edgelist, clustering, clusters_dir, bypass) =
            setup("1\t2\n2\t3\n4\t5\n", "1\tA\n2\tA\n3\tA\n4\tB\n5\tB\n");

        let mut bypass_shard = ShardWriter::open(&bypass).unwrap();
        let mut outcome = partition(
            &edgelist,
            &clustering,
            &clusters_dir,
            &mut bypass_shard,
            &no_filters(),
        )
        .unwrap();

        let mut loaded = load_partitioned(&clusters_dir).unwrap();

        outcome.queued.sort_by_key(|c| c.cluster_id);
        loaded.sort_by_key(|c| c.cluster_id);
        assert_eq!(outcome.queued, loaded);
    }
}
