//! src/stream/joined.rs
//!
//! Lockstep record streaming over one or more sources.
//!
//! All sources are zipped shard by shard and read position by position: one
//! iteration plan drives parallel slice readers, so every source advances
//! through the same offsets in the same order. Construction rejects source
//! sets that cannot stay in lockstep (differing shard counts, differing
//! shard lengths, differing exclusion lists).
//!
//! Per position, the primary source decides emission: an excluded,
//! filtered-out, or unreadable primary record consumes the position without
//! yielding. Secondary records are optional; an absent one leaves a `None`
//! slot and a sentinel pair in the restore key, so the position stays
//! replayable.

use crate::sample::{Keyed, RawRecord, RestoreKey};
use crate::shard::{ShardEntry, ShardInfo, ShardSlice};
use crate::sharder::{assign_slices, log_worker_ranges, SliceGroup};
use crate::source::{Source, Sources};
use crate::stream::loader::{LoaderMergedState, LoaderState};
use crate::stream::plan::{build_order, PlanPos, RoundPlan};
use crate::stream::{SavableStream, StreamConfig};
use crate::worker::WorkerConfig;
use anyhow::{anyhow, bail, ensure, Context, Result};
use serde_json::json;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// ============================================================================
/// One joined position: a record per source, aligned by offset. Slot 0 (the
/// primary) is always present in emitted tuples.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordTuple {
    pub records: Vec<Option<RawRecord>>,
    pub restore_key: RestoreKey,
}

impl RecordTuple {
    /// The primary record.
    pub fn primary(&self) -> Result<&RawRecord> {
        self.records
            .first()
            .and_then(Option::as_ref)
            .ok_or_else(|| anyhow!("record tuple without a primary record"))
    }

    pub fn into_primary(mut self) -> Result<RawRecord> {
        match self.records.first_mut().and_then(|slot| slot.take()) {
            Some(record) => Ok(record),
            None => bail!("record tuple without a primary record"),
        }
    }
}

impl Keyed for RecordTuple {
    fn restore_key(&self) -> &RestoreKey {
        &self.restore_key
    }

    fn set_restore_key(&mut self, key: RestoreKey) {
        self.restore_key = key;
    }

    fn sample_id(&self) -> Option<&str> {
        self.records
            .first()
            .and_then(Option::as_ref)
            .map(|record| record.key.as_str())
    }
}

/// ============================================================================
/// One open slice: a row iterator plus the absolute shard position of the
/// next row.
struct SliceReader {
    rows: Box<dyn Iterator<Item = Result<ShardEntry>> + Send>,
    shard: String,
    next_index: u64,
}

#[derive(Default)]
struct WorkerCursor {
    round: u64,
    /// Plan positions consumed in the current round, skips included.
    consumed: u64,
    plan: Option<RoundPlan>,
    /// Reader slot id to one open reader per source.
    readers: HashMap<usize, Vec<SliceReader>>,
}

/// ============================================================================
/// The lockstep loading engine behind [`RecordStream`] and
/// [`MergeStream`].
///
/// [`RecordStream`]: crate::stream::loader::RecordStream
/// [`MergeStream`]: crate::stream::merge::MergeStream
pub struct JoinedRecordStream {
    sources: Vec<Source>,
    names: Option<Vec<String>>,
    config: StreamConfig,
    worker_config: WorkerConfig,
    assignments: Vec<Vec<SliceGroup>>,
    workers: Vec<WorkerCursor>,
    total: u64,
}

impl JoinedRecordStream {
    pub fn new(
        sources: impl Into<Sources>,
        config: StreamConfig,
        worker_config: WorkerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (sources, names) = sources.into().into_parts();
        ensure!(!sources.is_empty(), "a stream needs at least one source");

        let shard_groups = Self::zip_shards(&sources)?;
        let assignments =
            assign_slices(&shard_groups, &worker_config, config.max_samples_per_sequence)?;
        log_worker_ranges(sources[0].name(), &worker_config, &assignments);

        let total = assignments
            .iter()
            .flatten()
            .map(|group| group[0].count)
            .sum();
        let workers = (0..worker_config.num_workers())
            .map(|_| WorkerCursor::default())
            .collect();
        Ok(Self {
            sources,
            names,
            config,
            worker_config,
            assignments,
            workers,
            total,
        })
    }

    /// Validates that the sources can iterate in lockstep and zips their
    /// shard listings position by position.
    fn zip_shards(sources: &[Source]) -> Result<Vec<Vec<ShardInfo>>> {
        let primary = &sources[0];
        for source in &sources[1..] {
            ensure!(
                source.shards().len() == primary.shards().len(),
                "source '{}' has {} shards but '{}' has {}; joined sources must align",
                source.name(),
                source.shards().len(),
                primary.name(),
                primary.shards().len()
            );
            ensure!(
                source.excludes() == primary.excludes(),
                "source '{}' excludes different records than '{}'; exclusions must be shared",
                source.name(),
                primary.name()
            );
        }
        let mut groups = Vec::with_capacity(primary.shards().len());
        for (at, lead) in primary.shards().iter().enumerate() {
            let mut group = Vec::with_capacity(sources.len());
            for source in sources {
                let shard = &source.shards()[at];
                ensure!(
                    shard.count == lead.count,
                    "shard {at} mismatch: '{}:{}' has {} records, '{}:{}' has {}",
                    source.name(),
                    shard.name,
                    shard.count,
                    primary.name(),
                    lead.name,
                    lead.count
                );
                group.push(shard.clone());
            }
            groups.push(group);
        }
        Ok(groups)
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn names(&self) -> Option<&[String]> {
        self.names.as_deref()
    }

    pub fn stream_config(&self) -> &StreamConfig {
        &self.config
    }

    fn worker_total(&self, worker: usize) -> u64 {
        self.assignments[worker]
            .iter()
            .map(|group| group[0].count)
            .sum()
    }

    /// Opens one reader per source over the group's slices, starting `start`
    /// records in. Readers are opened lazily so restore never touches slices
    /// before their first remaining record.
    fn open_readers(
        sources: &[Source],
        group: &SliceGroup,
        start: u64,
    ) -> Result<Vec<SliceReader>> {
        debug_assert!(start < group[0].count);
        group
            .iter()
            .zip(sources)
            .map(|(slice, source)| {
                let sub = ShardSlice::new(slice.name.clone(), slice.offset + start, slice.count - start);
                let rows = source.reader().read_slice(&sub).with_context(|| {
                    format!(
                        "opening {}[{}, {}) of source '{}'",
                        sub.name,
                        sub.offset,
                        sub.end(),
                        source.name()
                    )
                })?;
                Ok(SliceReader {
                    rows,
                    shard: slice.name.clone(),
                    next_index: sub.offset,
                })
            })
            .collect()
    }

    /// Reads one position from every source. `Ok(None)` means the position
    /// was consumed without an emission (primary excluded, filtered out, or
    /// dropped by the error handler).
    fn read_position(
        sources: &[Source],
        config: &StreamConfig,
        assignment: &[SliceGroup],
        readers: &mut HashMap<usize, Vec<SliceReader>>,
        pos: PlanPos,
    ) -> Result<Option<RecordTuple>> {
        let slot_readers = match readers.entry(pos.slot) {
            Entry::Occupied(open) => open.into_mut(),
            Entry::Vacant(vacant) => {
                vacant.insert(Self::open_readers(sources, &assignment[pos.group], pos.index)?)
            }
        };

        // Advance every source before deciding anything, so lockstep holds
        // even when the position is skipped.
        let mut records = Vec::with_capacity(sources.len());
        let mut positions = Vec::with_capacity(sources.len());
        for (reader, source) in slot_readers.iter_mut().zip(sources) {
            let absolute = reader.next_index;
            reader.next_index += 1;
            let Some(row) = reader.rows.next() else {
                bail!(
                    "shard '{}' ended at index {absolute} before its listed length; \
                     listing and storage disagree",
                    reader.shard
                );
            };
            positions.push((reader.shard.clone(), absolute));

            let record = match row.with_context(|| {
                format!(
                    "reading {}[{absolute}] of source '{}'",
                    reader.shard,
                    source.name()
                )
            }) {
                Ok(entry) if source.is_excluded(&entry.key) => None,
                Ok(entry) => {
                    let mut record = entry.into_record();
                    if config.part_filter.is_some() {
                        record.parts.retain(|name, _| config.keeps_part(name));
                    }
                    if record.parts.is_empty() {
                        None
                    } else {
                        let mut key = RestoreKey::new();
                        key.push_str(source.name());
                        key.push_str(&reader.shard);
                        key.push_int(absolute as i64);
                        record.set_restore_key(key);
                        Some(record)
                    }
                }
                Err(err) => {
                    let address = format!("{}/{}[{absolute}]", source.name(), reader.shard);
                    (config.handler)(err, Some(address.as_str()))?;
                    None
                }
            };
            records.push(record);
        }
        if pos.last {
            readers.remove(&pos.slot);
        }

        let Some(primary) = records[0].as_ref() else {
            return Ok(None);
        };
        let mut key = primary.restore_key().clone();
        for (record, (shard, absolute)) in records.iter().zip(&positions).skip(1) {
            match record {
                Some(_) => {
                    key.push_str(shard.clone());
                    key.push_int(*absolute as i64);
                }
                None => key.push_sentinel(),
            }
        }
        Ok(Some(RecordTuple {
            records,
            restore_key: key,
        }))
    }

    /// Rebuilds the record at one absolute shard position, applying the same
    /// exclusion and part-filter rules as live iteration. Replay is strict:
    /// a record that can no longer be produced is an error, never a skip.
    fn replay_record(&self, source: &Source, shard: &str, index: i64) -> Result<RawRecord> {
        ensure!(index >= 0, "negative record index {index} in restore key");
        let entry = source
            .reader()
            .read_at(shard, index as u64)
            .with_context(|| format!("replaying {shard}[{index}] of source '{}'", source.name()))?;
        ensure!(
            !source.is_excluded(&entry.key),
            "record '{}' is excluded and could not have been emitted",
            entry.key
        );
        let mut record = entry.into_record();
        if self.config.part_filter.is_some() {
            record.parts.retain(|name, _| self.config.keeps_part(name));
        }
        ensure!(
            !record.parts.is_empty(),
            "record '{}' has no parts left under the current part filter",
            record.key
        );
        let mut key = RestoreKey::new();
        key.push_str(source.name());
        key.push_str(shard);
        key.push_int(index);
        record.set_restore_key(key);
        Ok(record)
    }
}

impl SavableStream for JoinedRecordStream {
    type Item = RecordTuple;
    type State = LoaderState;
    type MergedState = LoaderMergedState;

    fn next_sample(&mut self, worker: usize) -> Option<Result<RecordTuple>> {
        if let Err(err) = self.worker_config.check_worker(worker) {
            return Some(Err(err));
        }
        if self.worker_total(worker) == 0 {
            return None;
        }

        let mut rounds_crossed = 0u32;
        loop {
            if self.workers[worker].plan.is_none() {
                let round = self.workers[worker].round;
                let consumed = self.workers[worker].consumed;
                let seed = self
                    .worker_config
                    .worker_seed(self.config.seed, worker, round);
                let order = build_order(
                    self.assignments[worker].len(),
                    self.config.training,
                    self.config.shuffle_over_epochs,
                    seed,
                );
                let counts = self.assignments[worker]
                    .iter()
                    .map(|group| group[0].count)
                    .collect();
                let mut plan = RoundPlan::new(order, counts, self.config.effective_parallel());
                if consumed > 0 {
                    if let Err(err) = plan.fast_forward(consumed) {
                        return Some(Err(err));
                    }
                }
                self.workers[worker].plan = Some(plan);
            }

            match self.workers[worker].plan.as_mut().and_then(RoundPlan::next) {
                Some(pos) => {
                    // The position counts as consumed even when nothing is
                    // emitted, so saved states line up with the plan cursor.
                    self.workers[worker].consumed += 1;
                    let outcome = Self::read_position(
                        &self.sources,
                        &self.config,
                        &self.assignments[worker],
                        &mut self.workers[worker].readers,
                        pos,
                    );
                    match outcome {
                        Ok(Some(tuple)) => return Some(Ok(tuple)),
                        Ok(None) => continue,
                        Err(err) => return Some(Err(err)),
                    }
                }
                None => {
                    if !self.config.training {
                        return None;
                    }
                    rounds_crossed += 1;
                    if rounds_crossed > 1 {
                        return Some(Err(anyhow!(
                            "worker {worker} emitted nothing in a full round; \
                             all records are excluded or filtered out"
                        )));
                    }
                    self.workers[worker].round += 1;
                    self.workers[worker].consumed = 0;
                    self.workers[worker].plan = None;
                    self.workers[worker].readers.clear();
                }
            }
        }
    }

    fn len(&self) -> u64 {
        self.total
    }

    fn worker_has_samples(&self, worker: usize) -> bool {
        let total = self.worker_total(worker);
        total > 0 && (self.config.training || self.workers[worker].consumed < total)
    }

    fn save_state(&self, worker: usize) -> Result<LoaderState> {
        self.worker_config.check_worker(worker)?;
        Ok(LoaderState {
            round: self.workers[worker].round,
            consumed: self.workers[worker].consumed,
        })
    }

    fn merge_states(&self, states: Vec<Option<LoaderState>>) -> Result<LoaderMergedState> {
        ensure!(
            states.len() == self.worker_config.num_workers(),
            "got {} worker states, stream has {} workers",
            states.len(),
            self.worker_config.num_workers()
        );
        Ok(LoaderMergedState {
            workers: states.into_iter().map(Option::unwrap_or_default).collect(),
        })
    }

    fn restore_state(&mut self, state: Option<LoaderMergedState>) -> Result<()> {
        let states = match state {
            None => vec![LoaderState::default(); self.worker_config.num_workers()],
            Some(merged) => {
                ensure!(
                    merged.workers.len() == self.worker_config.num_workers(),
                    "checkpoint has {} worker states, stream has {} workers",
                    merged.workers.len(),
                    self.worker_config.num_workers()
                );
                merged.workers
            }
        };
        for (cursor, state) in self.workers.iter_mut().zip(states) {
            cursor.round = state.round;
            cursor.consumed = state.consumed;
            cursor.plan = None;
            cursor.readers.clear();
        }
        Ok(())
    }

    fn can_restore_sample(&self) -> bool {
        true
    }

    fn restore_sample(&self, key: &RestoreKey) -> Result<RecordTuple> {
        let expected = 3 + 2 * (self.sources.len() - 1);
        ensure!(
            key.len() == expected,
            "restore key {key} has {} components, this stream expects {expected}",
            key.len()
        );
        let source_name = key.str_at(0)?;
        ensure!(
            source_name == self.sources[0].name(),
            "restore key {key} names source '{source_name}', primary is '{}'",
            self.sources[0].name()
        );

        let mut records = Vec::with_capacity(self.sources.len());
        let primary = self.replay_record(&self.sources[0], key.str_at(1)?, key.int_at(2)?)?;
        records.push(Some(primary));
        for (at, source) in self.sources.iter().enumerate().skip(1) {
            let base = 3 + 2 * (at - 1);
            if key.is_sentinel_at(base) {
                records.push(None);
            } else {
                records.push(Some(self.replay_record(
                    source,
                    key.str_at(base)?,
                    key.int_at(base + 1)?,
                )?));
            }
        }
        Ok(RecordTuple {
            records,
            restore_key: key.clone(),
        })
    }

    fn config(&self) -> serde_json::Value {
        json!({
            "stream": "joined_records",
            "sources": self.sources.iter().map(Source::config_value).collect::<Vec<_>>(),
            "names": self.names,
            "config": self.config.config_value(),
            "workers": self.worker_config.num_workers(),
        })
    }

    fn worker_config(&self) -> &WorkerConfig {
        &self.worker_config
    }
}
