//! src/shard.rs
//!
//! Shard metadata and the reader abstraction.
//!
//! A source's records live in named shards of known length. Streams never
//! touch storage directly; they ask a [`ShardReader`] for a contiguous slice
//! of one shard, or for one record by absolute position (random access, used
//! for checkpoint replay). [`MemoryShardStore`] is the in-memory reader used
//! throughout the test suites.

use crate::sample::RawRecord;
use anyhow::{anyhow, ensure, Result};
use std::collections::HashMap;

/// ============================================================================
/// Name and length of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub name: String,
    pub count: u64,
}

impl ShardInfo {
    pub fn new(name: impl Into<String>, count: u64) -> Self {
        Self {
            name: name.into(),
            count,
        }
    }
}

/// A contiguous range `[offset, offset + count)` of one shard, the unit of
/// work the sharder hands to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSlice {
    pub name: String,
    pub offset: u64,
    pub count: u64,
}

impl ShardSlice {
    pub fn new(name: impl Into<String>, offset: u64, count: u64) -> Self {
        Self {
            name: name.into(),
            offset,
            count,
        }
    }

    /// One past the last record of the slice.
    pub fn end(&self) -> u64 {
        self.offset + self.count
    }
}

/// One stored record: its key plus named opaque payloads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShardEntry {
    pub key: String,
    pub parts: HashMap<String, Vec<u8>>,
}

impl ShardEntry {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            parts: HashMap::new(),
        }
    }

    pub fn with_part(mut self, name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        self.parts.insert(name.into(), payload.into());
        self
    }

    pub(crate) fn into_record(self) -> RawRecord {
        RawRecord {
            key: self.key,
            parts: self.parts,
            restore_key: Default::default(),
        }
    }
}

/// ============================================================================
/// Sequential and random access to shard contents.
///
/// `read_slice` yields per-record results so one unreadable record fails
/// alone instead of poisoning the whole slice. `read_at` is the random
/// access path behind checkpoint replay.
pub trait ShardReader: Send + Sync {
    fn read_slice(
        &self,
        slice: &ShardSlice,
    ) -> Result<Box<dyn Iterator<Item = Result<ShardEntry>> + Send>>;

    fn read_at(&self, shard: &str, index: u64) -> Result<ShardEntry>;
}

/// ============================================================================
/// An in-memory shard store. `None` positions model records that exist in
/// the shard listing but cannot be read back.
#[derive(Debug, Clone, Default)]
pub struct MemoryShardStore {
    shards: HashMap<String, Vec<Option<ShardEntry>>>,
}

impl MemoryShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, shard: impl Into<String>, entries: Vec<ShardEntry>) {
        self.shards
            .insert(shard.into(), entries.into_iter().map(Some).collect());
    }

    /// Inserts a shard whose `None` positions will fail to read.
    pub fn insert_sparse(&mut self, shard: impl Into<String>, entries: Vec<Option<ShardEntry>>) {
        self.shards.insert(shard.into(), entries);
    }

    /// Shard metadata in name order, so every rank sees the same listing.
    pub fn shard_infos(&self) -> Vec<ShardInfo> {
        let mut infos: Vec<ShardInfo> = self
            .shards
            .iter()
            .map(|(name, entries)| ShardInfo::new(name.clone(), entries.len() as u64))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn info(&self, shard: &str) -> Result<ShardInfo> {
        let entries = self
            .shards
            .get(shard)
            .ok_or_else(|| anyhow!("no shard named '{shard}'"))?;
        Ok(ShardInfo::new(shard, entries.len() as u64))
    }

    fn entries(&self, shard: &str) -> Result<&[Option<ShardEntry>]> {
        self.shards
            .get(shard)
            .map(Vec::as_slice)
            .ok_or_else(|| anyhow!("no shard named '{shard}'"))
    }
}

impl ShardReader for MemoryShardStore {
    fn read_slice(
        &self,
        slice: &ShardSlice,
    ) -> Result<Box<dyn Iterator<Item = Result<ShardEntry>> + Send>> {
        let entries = self.entries(&slice.name)?;
        ensure!(
            slice.end() as usize <= entries.len(),
            "slice {}[{}, {}) exceeds shard length {}",
            slice.name,
            slice.offset,
            slice.end(),
            entries.len()
        );
        let shard = slice.name.clone();
        let offset = slice.offset;
        let rows: Vec<Option<ShardEntry>> =
            entries[slice.offset as usize..slice.end() as usize].to_vec();
        Ok(Box::new(rows.into_iter().enumerate().map(
            move |(i, entry)| {
                entry.ok_or_else(|| {
                    anyhow!("unreadable record at {shard}[{}]", offset + i as u64)
                })
            },
        )))
    }

    fn read_at(&self, shard: &str, index: u64) -> Result<ShardEntry> {
        let entries = self.entries(shard)?;
        let entry = entries
            .get(index as usize)
            .ok_or_else(|| anyhow!("index {index} exceeds shard '{shard}' length {}", entries.len()))?;
        entry
            .clone()
            .ok_or_else(|| anyhow!("unreadable record at {shard}[{index}]"))
    }
}
