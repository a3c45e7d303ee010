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

//! Coordinator snapshot written on shutdown signals.
//!
//! In-flight clusters are folded back into the queue front before saving;
//! assigned-but-unfinished means unfinished. A checkpoint found at startup
//! replaces the partitioner output entirely.

use std::path::Path;

use anyhow::Result;

use crate::cluster::{ClusterId, QueuedCluster};

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Checkpoint {
    pub queue: Vec<QueuedCluster>,
    pub completed: Vec<ClusterId>,
    pub bypassed: Vec<ClusterId>,
    pub dropped: Vec<ClusterId>,
}

impl Checkpoint {
    /// Write via temp file + rename so a crash mid-write can never leave a
    /// half-written checkpoint behind.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = bincode::encode_to_vec(self, bincode::config::standard())?;

        let tmp = path.as_ref().with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path.as_ref())?;

        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        if !path.as_ref().exists() {
            return Ok(None);
        }

        let bytes = std::fs::read(path.as_ref())?;
        let (checkpoint, _) = bincode::decode_from_slice(&bytes, bincode::config::standard())?;

        Ok(Some(checkpoint))
    }
}
