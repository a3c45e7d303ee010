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

//! Append-only result shards.
//!
//! Each worker owns one shard file; the coordinator owns the bypass shard.
//! A shard is a sequence of length-framed records, one per cluster, so that
//! a record can be attributed to its cluster id at aggregation time. This is
//! what makes resume after a checkpoint restore idempotent: if a cluster is
//! re-executed because its completion never reached the coordinator, the
//! shard simply holds two records for the same id and aggregation keeps the
//! first.
//!
//! Records survive process death; a torn record at the tail (crash mid
//! append) is detected by the reader and treated as end of shard.

use anyhow::Result;
use memmap2::Mmap;
use postcard::experimental::max_size::MaxSize;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::cluster::ClusterId;

#[derive(Debug, Clone, Copy, MaxSize, serde::Serialize, serde::Deserialize)]
struct Header {
    body_size: usize,
}

/// The refined labels for one cluster. `entries` holds the final
/// (node, label) pairs exactly as they will appear in the output file.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ShardRecord {
    pub cluster_id: ClusterId,
    pub entries: Vec<(u64, String)>,
}

pub struct ShardWriter {
    writer: BufWriter<File>,
}

impl ShardWriter {
    /// Opens the shard for appending, creating it if needed. Existing
    /// records from a previous run are kept.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;

        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn push(&mut self, record: &ShardRecord) -> Result<()> {
        let body = bincode::encode_to_vec(record, bincode::config::standard())?;
        let header = Header {
            body_size: body.len(),
        };

        let mut header_bytes = postcard::to_allocvec(&header).unwrap();

        if header_bytes.len() < Header::POSTCARD_MAX_SIZE {
            header_bytes.resize(Header::POSTCARD_MAX_SIZE, 0);
        }

        self.writer.write_all(&header_bytes)?;
        self.writer.write_all(&body)?;

        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;

        Ok(())
    }
}

pub struct ShardReader {
    // None for a zero-length shard; empty files cannot be mmapped
    file: Option<Mmap>,
    pointer: usize,
    path: PathBuf,
}

impl ShardReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let file = if file.metadata()?.len() == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&file)? })
        };

        Ok(Self {
            file,
            pointer: 0,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn next(&mut self) -> Result<Option<ShardRecord>> {
        let Some(file) = &self.file else {
            return Ok(None);
        };

        let header_size = Header::POSTCARD_MAX_SIZE;

        if self.pointer + header_size > file.len() {
            return Ok(None);
        }

        let header_bytes = &file[self.pointer..self.pointer + header_size];
        let header: Header = postcard::from_bytes(header_bytes).unwrap();

        let body_start = self.pointer + header_size;
        if body_start + header.body_size > file.len() {
            // torn tail from a crash mid-append
            tracing::warn!(path = %self.path.display(), "truncated record at end of shard");
            return Ok(None);
        }

        let body = &file[body_start..body_start + header.body_size];
        let (record, _) = bincode::decode_from_slice(body, bincode::config::standard())?;

        self.pointer = body_start + header.body_size;

        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn read_all(path: &Path) -> Vec<ShardRecord> {
        let mut reader = ShardReader::open(path).unwrap();
        let mut records = Vec::new();
        while let Some(record) = reader.next().unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    fn simple() {
        let path = crate::gen_temp_path();

        let mut writer = ShardWriter::open(&path).unwrap();
        writer
            .push(&ShardRecord {
                cluster_id: 7,
                entries: vec![(1, "7.0".to_string()), (2, "7.1".to_string())],
            })
            .unwrap();
        writer.flush().unwrap();

        let records = read_all(&path);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cluster_id, 7);
        assert_eq!(records[0].entries.len(), 2);
    }

    #[test]
    fn append_across_reopen() {
        let path = crate::gen_temp_path();

        let mut writer = ShardWriter::open(&path).unwrap();
        writer
            .push(&ShardRecord {
                cluster_id: 1,
                entries: vec![(10, "1.0".to_string())],
            })
            .unwrap();
        writer.flush().unwrap();
        drop(writer);

        let mut writer = ShardWriter::open(&path).unwrap();
        writer
            .push(&ShardRecord {
                cluster_id: 2,
                entries: vec![(20, "2.0".to_string())],
            })
            .unwrap();
        writer.flush().unwrap();

        let ids: Vec<_> = read_all(&path).iter().map(|r| r.cluster_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn torn_tail_is_end_of_shard() {
        let path = crate::gen_temp_path();

        let mut writer = ShardWriter::open(&path).unwrap();
        writer
            .push(&ShardRecord {
                cluster_id: 1,
                entries: vec![(10, "1.0".to_string())],
            })
            .unwrap();
        writer.flush().unwrap();
        drop(writer);

        // simulate a crash mid-append: a header promising more bytes than exist
        let mut bytes = std::fs::read(&path).unwrap();
        let fake = postcard::to_allocvec(&Header { body_size: 4096 }).unwrap();
        bytes.extend_from_slice(&fake);
        bytes.resize(bytes.len() + Header::POSTCARD_MAX_SIZE - fake.len(), 0);
        bytes.extend_from_slice(&[1, 2, 3]);
        std::fs::write(&path, bytes).unwrap();

        let records = read_all(&path);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cluster_id, 1);
    }

    proptest! {
        #[test]
        fn roundtrip(records in prop::collection::vec(
            (any::<u32>(), prop::collection::vec((any::<u64>(), "[a-z0-9.]{0,8}"), 0..16)),
            0..32,
        )) {
            let records: Vec<ShardRecord> = records
                .into_iter()
                .map(|(cluster_id, entries)| ShardRecord { cluster_id, entries })
                .collect();

            let path = crate::gen_temp_path();
            let mut writer = ShardWriter::open(&path).unwrap();
            for record in &records {
                writer.push(record).unwrap();
            }
            writer.flush().unwrap();

            prop_assert_eq!(read_all(&path), records);
        }
    }
}
