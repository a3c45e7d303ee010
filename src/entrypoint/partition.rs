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

//! Partition-only mode: split the input and stop without serving jobs.
//! Useful for preparing a `partitioned_clusters_dir` once and fanning out
//! many runs against it.

use anyhow::Result;

use crate::config::CoordinatorConfig;

pub fn run(config: CoordinatorConfig) -> Result<()> {
    super::prepare_work_dir(&config)?;

    let (clusters, bypassed, dropped) = super::coordinator::load_or_partition(&config)?;

    tracing::info!(
        queued = clusters.len(),
        bypassed = bypassed.len(),
        dropped = dropped.len(),
        clusters_dir = %config.clusters_dir().display(),
        "partition-only mode finished"
    );

    Ok(())
}
