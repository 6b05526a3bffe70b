//! src/stream/loader.rs
//!
//! Single-source record streaming and the loader checkpoint states.
//!
//! A loader position is two integers per worker: the shuffle round and the
//! number of plan positions consumed inside it. Restoring rebuilds the
//! round's deterministic plan and fast-forwards the bookkeeping, then
//! reopens slices at their first remaining record, so resume cost does not
//! depend on how much was already consumed.

use crate::sample::{RawRecord, RestoreKey};
use crate::source::{Source, Sources};
use crate::stream::joined::JoinedRecordStream;
use crate::stream::{SavableStream, StreamConfig};
use crate::worker::WorkerConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// ============================================================================
/// One worker's loader position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoaderState {
    /// Shuffle rounds completed before the current one.
    pub round: u64,
    /// Plan positions consumed in the current round, skips included.
    pub consumed: u64,
}

/// All workers' loader positions, in worker slot order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoaderMergedState {
    pub workers: Vec<LoaderState>,
}

/// ============================================================================
/// A worker-partitioned stream over one source's records.
pub struct RecordStream {
    inner: JoinedRecordStream,
}

impl RecordStream {
    pub fn new(source: Source, config: StreamConfig, worker_config: WorkerConfig) -> Result<Self> {
        let inner =
            JoinedRecordStream::new(Sources::Positional(vec![source]), config, worker_config)?;
        Ok(Self { inner })
    }

    pub fn source(&self) -> &Source {
        &self.inner.sources()[0]
    }
}

impl SavableStream for RecordStream {
    type Item = RawRecord;
    type State = LoaderState;
    type MergedState = LoaderMergedState;

    fn next_sample(&mut self, worker: usize) -> Option<Result<RawRecord>> {
        match self.inner.next_sample(worker)? {
            Ok(tuple) => Some(tuple.into_primary()),
            Err(err) => Some(Err(err)),
        }
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn worker_has_samples(&self, worker: usize) -> bool {
        self.inner.worker_has_samples(worker)
    }

    fn save_state(&self, worker: usize) -> Result<LoaderState> {
        self.inner.save_state(worker)
    }

    fn merge_states(&self, states: Vec<Option<LoaderState>>) -> Result<LoaderMergedState> {
        self.inner.merge_states(states)
    }

    fn restore_state(&mut self, state: Option<LoaderMergedState>) -> Result<()> {
        self.inner.restore_state(state)
    }

    fn can_restore_sample(&self) -> bool {
        self.inner.can_restore_sample()
    }

    fn restore_sample(&self, key: &RestoreKey) -> Result<RawRecord> {
        self.inner
            .restore_sample(key)
            .and_then(|tuple| tuple.into_primary())
            .with_context(|| format!("restoring record {key}"))
    }

    fn config(&self) -> serde_json::Value {
        json!({
            "stream": "records",
            "source": self.source().config_value(),
            "config": self.inner.stream_config().config_value(),
            "workers": self.worker_config().num_workers(),
        })
    }

    fn worker_config(&self) -> &WorkerConfig {
        self.inner.worker_config()
    }
}
