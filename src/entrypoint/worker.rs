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

use anyhow::Result;

use crate::{config::WorkerConfig, worker::Worker};

pub async fn run(config: WorkerConfig) -> Result<()> {
    let worker = Worker::new(
        config.rank,
        config.coordinator,
        &config.work_dir(),
        config.clusters_dir(),
        config.refiner.clone(),
        config.time_limit(),
        config.report_every(),
    )?;

    worker.run().await
}
