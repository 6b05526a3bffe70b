//! src/stream/mod.rs
//!
//! The savable-stream abstraction and its pipeline stages.
//!
//! A pipeline is a stack of stages, each implementing [`SavableStream`]:
//!
//! ```text
//!   RecordStream          one source, worker-partitioned slices
//!   JoinedRecordStream    N sources zipped position by position
//!   MapStream             transform wrapper with replay counters
//!   MergeStream           join + compose, built on the two above
//!   StreamLoader          threaded front end, round-robin over workers
//! ```
//!
//! Every stage can save its per-worker position, merge the per-worker
//! states into one checkpoint, and restore from it so that iteration
//! resumes exactly where it stopped. Stages that support it can also
//! rebuild one sample from its restore key alone.

pub mod joined;
pub mod loader;
pub mod map;
pub mod merge;
mod plan;
pub mod runner;

use crate::error::{log_and_skip_handler, ErrorHandler};
use crate::sample::RestoreKey;
use crate::worker::WorkerConfig;
use anyhow::{ensure, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;

/// ============================================================================
/// Behavioral knobs shared by every pipeline stage.
///
/// `training` selects endless shuffled iteration; otherwise each worker
/// yields its records once, in order. The error `handler` decides whether a
/// per-sample failure is dropped or re-raised; fatal failures bypass it.
#[derive(Clone)]
pub struct StreamConfig {
    pub training: bool,
    /// Shuffle window in rounds: 1 reshuffles every round, `n` shuffles `n`
    /// rounds worth of slices together, -1 draws slices with replacement.
    pub shuffle_over_epochs: i64,
    /// Slice iterators a worker keeps open at once; defaults to 16 when
    /// training and 1 otherwise.
    pub parallel_slice_iters: Option<usize>,
    /// Upper bound on consecutive records treated as one shuffle unit.
    pub max_samples_per_sequence: Option<u64>,
    pub seed: u64,
    /// Retains only the record parts whose name passes; records left with
    /// no parts are dropped while still consuming their position.
    pub part_filter: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
    pub handler: ErrorHandler,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            training: false,
            shuffle_over_epochs: 1,
            parallel_slice_iters: None,
            max_samples_per_sequence: None,
            seed: 0,
            part_filter: None,
            handler: log_and_skip_handler(),
        }
    }
}

impl fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConfig")
            .field("training", &self.training)
            .field("shuffle_over_epochs", &self.shuffle_over_epochs)
            .field("parallel_slice_iters", &self.parallel_slice_iters)
            .field("max_samples_per_sequence", &self.max_samples_per_sequence)
            .field("seed", &self.seed)
            .field("part_filter", &self.part_filter.is_some())
            .finish()
    }
}

impl StreamConfig {
    pub fn builder() -> StreamConfigBuilder {
        StreamConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.shuffle_over_epochs == -1 || self.shuffle_over_epochs >= 1,
            "shuffle_over_epochs must be -1 (with replacement) or at least 1, got {}",
            self.shuffle_over_epochs
        );
        ensure!(
            self.parallel_slice_iters != Some(0),
            "parallel_slice_iters must be at least 1"
        );
        ensure!(
            self.max_samples_per_sequence != Some(0),
            "max_samples_per_sequence must be at least 1"
        );
        Ok(())
    }

    /// Open slice iterators per worker, applying the mode default.
    pub fn effective_parallel(&self) -> usize {
        self.parallel_slice_iters
            .unwrap_or(if self.training { 16 } else { 1 })
    }

    pub fn keeps_part(&self, name: &str) -> bool {
        self.part_filter.as_ref().map_or(true, |filter| filter(name))
    }

    /// Introspection fragment for [`SavableStream::config`].
    pub fn config_value(&self) -> serde_json::Value {
        json!({
            "training": self.training,
            "shuffle_over_epochs": self.shuffle_over_epochs,
            "parallel_slice_iters": self.parallel_slice_iters,
            "max_samples_per_sequence": self.max_samples_per_sequence,
            "seed": self.seed,
            "part_filter": self.part_filter.is_some(),
        })
    }
}

/// Fluent builder mirroring [`StreamConfig`]; `build` validates.
#[derive(Default)]
pub struct StreamConfigBuilder {
    config: StreamConfig,
}

impl StreamConfigBuilder {
    pub fn training(mut self, training: bool) -> Self {
        self.config.training = training;
        self
    }

    pub fn shuffle_over_epochs(mut self, epochs: i64) -> Self {
        self.config.shuffle_over_epochs = epochs;
        self
    }

    pub fn parallel_slice_iters(mut self, iters: usize) -> Self {
        self.config.parallel_slice_iters = Some(iters);
        self
    }

    pub fn max_samples_per_sequence(mut self, max: u64) -> Self {
        self.config.max_samples_per_sequence = Some(max);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn part_filter(mut self, filter: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.config.part_filter = Some(Arc::new(filter));
        self
    }

    pub fn handler(mut self, handler: ErrorHandler) -> Self {
        self.config.handler = handler;
        self
    }

    pub fn build(self) -> Result<StreamConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// ============================================================================
/// A worker-partitioned sample stream whose position can be checkpointed.
///
/// All per-worker methods take the worker slot explicitly; callers drive one
/// slot per thread and the stream keeps one independent cursor per slot.
///
/// The checkpoint protocol is three-phase: each consumer thread calls
/// `save_state` for its slot, the coordinator calls `merge_states` over the
/// collected per-worker states (in slot order, `None` for slots that never
/// ran), and a fresh instance of the same pipeline resumes via
/// `restore_state`.
pub trait SavableStream: Send {
    type Item: Send;
    /// Per-worker position. Plain data, serializable for checkpoint files.
    type State: Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send;
    /// All workers' positions merged into one rank checkpoint.
    type MergedState: Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send;

    /// Next sample for `worker`. `None` means the slot is exhausted (only in
    /// non-training mode); `Some(Err(..))` is a failure the stage chose to
    /// propagate rather than drop.
    fn next_sample(&mut self, worker: usize) -> Option<Result<Self::Item>>;

    /// Samples per plain pass over this rank's share, across all workers.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `worker` can still yield samples.
    fn worker_has_samples(&self, worker: usize) -> bool;

    fn save_state(&self, worker: usize) -> Result<Self::State>;

    fn merge_states(&self, states: Vec<Option<Self::State>>) -> Result<Self::MergedState>;

    /// Restores a merged checkpoint; `None` resets to the initial position.
    fn restore_state(&mut self, state: Option<Self::MergedState>) -> Result<()>;

    /// Whether `restore_sample` is supported by this stage and everything
    /// below it.
    fn can_restore_sample(&self) -> bool {
        false
    }

    /// Rebuilds the sample identified by `key`, value-equal to the original
    /// emission, key included.
    fn restore_sample(&self, key: &RestoreKey) -> Result<Self::Item>;

    /// Stage configuration as data, for checkpoint metadata and debugging.
    fn config(&self) -> serde_json::Value;

    fn worker_config(&self) -> &WorkerConfig;

    /// Borrowing iterator over one worker slot.
    fn iter_worker(&mut self, worker: usize) -> WorkerIter<'_, Self>
    where
        Self: Sized,
    {
        WorkerIter {
            stream: self,
            worker,
        }
    }
}

/// Iterator adapter driving one worker slot of a stream.
pub struct WorkerIter<'a, S: SavableStream> {
    stream: &'a mut S,
    worker: usize,
}

impl<S: SavableStream> Iterator for WorkerIter<'_, S> {
    type Item = Result<S::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        self.stream.next_sample(self.worker)
    }
}
