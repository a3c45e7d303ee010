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

//! Main library for dcm.
//!
//! A clustering of an input graph is split into one job per cluster, and the
//! jobs are distributed across worker processes that each run an external
//! refinement subprocess on the induced subgraph. A single coordinator owns
//! the job queue, retry policy and checkpointing; workers own their output
//! shards. See the `coordinator` and `worker` modules for the two halves of
//! the protocol.

use std::path::PathBuf;

use thiserror::Error;

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod distributed;
pub mod entrypoint;
pub mod partition;
pub mod shard;
pub mod worker;

#[derive(Error, Debug)]
pub enum Error {
    #[error("could not detect a delimiter in '{0}'")]
    UnknownDelimiter(PathBuf),

    #[error("failed to parse '{file}': {msg}")]
    Parse { file: PathBuf, msg: String },

    #[error("transport error")]
    Channel(#[from] distributed::channel::Error),

    #[error("coordinator sent an unexpected reply")]
    UnexpectedReply,

    #[error("IO error")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

// taken from https://docs.rs/sled/0.34.7/src/sled/config.rs.html#445
pub fn gen_temp_path() -> PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    static SALT_COUNTER: AtomicUsize = AtomicUsize::new(0);

    let seed = SALT_COUNTER.fetch_add(1, Ordering::SeqCst) as u128;

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos()
        << 48;

    let pid = u128::from(std::process::id());

    let salt = (pid << 16) + now + seed;

    std::env::temp_dir().join(format!("dcm.tmp.{salt}"))
}
