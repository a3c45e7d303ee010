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

pub mod coordinator;
pub mod local;
pub mod partition;
pub mod worker;

use anyhow::Result;

use crate::config::CoordinatorConfig;

pub(crate) fn prepare_work_dir(config: &CoordinatorConfig) -> Result<()> {
    let work_dir = config.work_dir();

    std::fs::create_dir_all(work_dir.join("logs").join("clusters"))?;
    std::fs::create_dir_all(work_dir.join("pending"))?;
    std::fs::create_dir_all(work_dir.join("output"))?;

    Ok(())
}
