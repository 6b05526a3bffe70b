//! src/stream/map.rs
//!
//! The transform wrapper: applies a fallible transform to every upstream
//! sample while keeping the result checkpointable and replayable.
//!
//! Each worker slot carries a sample counter that advances once per
//! upstream pull, whether the transform yields one output, several, or
//! none. Output restore keys are the input key plus the counter value at
//! the pull (and, for expanding transforms, the element's position inside
//! its sequence), so a stateless transform can rebuild any emitted output
//! from its key alone.

use crate::error::{is_fatal, log_and_skip_handler, ErrorHandler, FatalSampleError};
use crate::sample::{Keyed, RestoreKey};
use crate::stream::SavableStream;
use crate::worker::WorkerConfig;
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// ============================================================================
/// What a transform did with one input sample.
pub enum Mapped<T> {
    /// One output.
    One(T),
    /// A sequence of outputs, emitted one per downstream pull. Only legal
    /// for transforms whose [`StreamTransform::expands`] returns true.
    Many(Box<dyn Iterator<Item = Result<T>> + Send>),
    /// No output; the input still consumed its counter position.
    Skip,
}

impl<T> Mapped<T> {
    pub fn many<I>(outputs: I) -> Self
    where
        I: IntoIterator<Item = Result<T>>,
        I::IntoIter: Send + 'static,
    {
        Mapped::Many(Box::new(outputs.into_iter()))
    }
}

/// A per-sample transform step. Runs on worker threads.
pub trait StreamTransform<I, O>: Send + Sync {
    fn transform(&self, input: I) -> Result<Mapped<O>>;

    /// Whether this transform may return [`Mapped::Many`]. Expanding
    /// transforms get an extra element counter in their restore keys;
    /// returning `Many` without declaring expansion is a fatal error.
    fn expands(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// ============================================================================
/// One worker's wrapper position: the upstream position plus the sample
/// counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapState<S> {
    pub inner: S,
    pub sample_index: u64,
}

/// All workers' wrapper positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapMergedState<M> {
    pub inner: M,
    pub sample_indexes: Vec<u64>,
}

/// An expanding transform's sequence, partially emitted.
struct ActiveSequence<O> {
    rest: Box<dyn Iterator<Item = Result<O>> + Send>,
    /// Counter value of the input that produced this sequence.
    base_index: u64,
    /// Elements already emitted.
    emitted: u64,
    input_key: RestoreKey,
    sample_id: Option<String>,
}

/// Tags a fatal error with the identity of the sample that produced it,
/// when known.
fn tag_fatal(err: anyhow::Error, sample_id: Option<&str>) -> anyhow::Error {
    match sample_id {
        Some(id) => err.context(format!("while transforming sample '{id}'")),
        None => err,
    }
}

/// ============================================================================
/// A [`SavableStream`] applying `transform` to every sample of `stream`.
///
/// Failure policy per sample: transform errors go to the handler (drop or
/// re-raise) unless fatal, in which case they propagate immediately.
/// Upstream errors pass through untouched; the upstream already applied its
/// own policy.
pub struct MapStream<S, F, O> {
    stream: S,
    transform: F,
    worker_config: WorkerConfig,
    /// Marks the transform as deterministic and stateless, enabling
    /// replay through [`SavableStream::restore_sample`].
    stateless: bool,
    handler: ErrorHandler,
    sample_indexes: Vec<u64>,
    active: Vec<Option<ActiveSequence<O>>>,
}

impl<S, F, O> MapStream<S, F, O>
where
    S: SavableStream,
    S::Item: Keyed,
    F: StreamTransform<S::Item, O>,
    O: Keyed + Send,
{
    pub fn new(stream: S, transform: F, stateless: bool) -> Self {
        let workers = stream.worker_config().num_workers();
        let worker_config = stream.worker_config().clone();
        Self {
            stream,
            transform,
            worker_config,
            stateless,
            handler: log_and_skip_handler(),
            sample_indexes: vec![0; workers],
            active: (0..workers).map(|_| None).collect(),
        }
    }

    pub fn with_handler(mut self, handler: ErrorHandler) -> Self {
        self.handler = handler;
        self
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn transform(&self) -> &F {
        &self.transform
    }

    fn tag_one(&self, mut output: O, input_key: &RestoreKey, base: u64) -> O {
        let mut key = input_key.clone();
        if self.transform.expands() {
            key.push_int(0);
        }
        key.push_int(base as i64);
        output.set_restore_key(key);
        output
    }

    /// Emits the next element of the worker's active sequence, if any.
    /// Returns `None` once the slot is idle and the caller should pull
    /// upstream.
    fn drain_active(&mut self, worker: usize) -> Option<Result<O>> {
        let active = self.active[worker].as_mut()?;
        match active.rest.next() {
            Some(Ok(mut output)) => {
                let mut key = active.input_key.clone();
                key.push_int(active.emitted as i64);
                key.push_int(active.base_index as i64);
                active.emitted += 1;
                output.set_restore_key(key);
                Some(Ok(output))
            }
            Some(Err(err)) => {
                let sample_id = active.sample_id.clone();
                // A failed sequence is abandoned; remaining elements are
                // unreachable anyway.
                self.active[worker] = None;
                if is_fatal(&err) {
                    return Some(Err(tag_fatal(err, sample_id.as_deref())));
                }
                match (self.handler)(err, sample_id.as_deref()) {
                    Ok(()) => None,
                    Err(err) => Some(Err(err)),
                }
            }
            None => {
                self.active[worker] = None;
                None
            }
        }
    }
}

impl<S, F, O> SavableStream for MapStream<S, F, O>
where
    S: SavableStream,
    S::Item: Keyed,
    F: StreamTransform<S::Item, O>,
    O: Keyed + Send,
{
    type Item = O;
    type State = MapState<S::State>;
    type MergedState = MapMergedState<S::MergedState>;

    fn next_sample(&mut self, worker: usize) -> Option<Result<O>> {
        if let Err(err) = self.worker_config.check_worker(worker) {
            return Some(Err(err));
        }
        loop {
            if let Some(result) = self.drain_active(worker) {
                return Some(result);
            }

            let input = match self.stream.next_sample(worker)? {
                Ok(input) => input,
                Err(err) => return Some(Err(err)),
            };
            // The counter advances on the pull, not on emission, so saved
            // counters always equal the number of inputs consumed.
            let base = self.sample_indexes[worker];
            self.sample_indexes[worker] += 1;
            let input_key = input.restore_key().clone();
            let sample_id = input.sample_id().map(str::to_string);

            match self.transform.transform(input) {
                Ok(Mapped::One(output)) => {
                    return Some(Ok(self.tag_one(output, &input_key, base)));
                }
                Ok(Mapped::Many(rest)) => {
                    if !self.transform.expands() {
                        return Some(Err(FatalSampleError::new(format!(
                            "transform {} returned a sequence without declaring expansion",
                            self.transform.name()
                        ))
                        .into()));
                    }
                    self.active[worker] = Some(ActiveSequence {
                        rest,
                        base_index: base,
                        emitted: 0,
                        input_key,
                        sample_id,
                    });
                }
                Ok(Mapped::Skip) => {}
                Err(err) => {
                    if is_fatal(&err) {
                        return Some(Err(tag_fatal(err, sample_id.as_deref())));
                    }
                    if let Err(err) = (self.handler)(err, sample_id.as_deref()) {
                        return Some(Err(err));
                    }
                }
            }
        }
    }

    /// Nominal length: outputs are counted as one per input, whatever the
    /// transform actually yields.
    fn len(&self) -> u64 {
        self.stream.len()
    }

    fn worker_has_samples(&self, worker: usize) -> bool {
        self.active[worker].is_some() || self.stream.worker_has_samples(worker)
    }

    fn save_state(&self, worker: usize) -> Result<Self::State> {
        self.worker_config.check_worker(worker)?;
        Ok(MapState {
            inner: self.stream.save_state(worker)?,
            sample_index: self.sample_indexes[worker],
        })
    }

    fn merge_states(&self, states: Vec<Option<Self::State>>) -> Result<Self::MergedState> {
        let mut inner_states = Vec::with_capacity(states.len());
        let mut sample_indexes = Vec::with_capacity(states.len());
        for state in states {
            match state {
                Some(MapState {
                    inner,
                    sample_index,
                }) => {
                    inner_states.push(Some(inner));
                    sample_indexes.push(sample_index);
                }
                None => {
                    inner_states.push(None);
                    sample_indexes.push(0);
                }
            }
        }
        Ok(MapMergedState {
            inner: self.stream.merge_states(inner_states)?,
            sample_indexes,
        })
    }

    fn restore_state(&mut self, state: Option<Self::MergedState>) -> Result<()> {
        let workers = self.worker_config.num_workers();
        match state {
            None => {
                self.stream.restore_state(None)?;
                self.sample_indexes = vec![0; workers];
            }
            Some(merged) => {
                ensure!(
                    merged.sample_indexes.len() == workers,
                    "checkpoint has {} sample counters, stream has {} workers",
                    merged.sample_indexes.len(),
                    workers
                );
                self.stream.restore_state(Some(merged.inner))?;
                self.sample_indexes = merged.sample_indexes;
            }
        }
        // A restored stream starts clean; a sequence that was mid-emission
        // at save time is not resumed.
        for active in &mut self.active {
            *active = None;
        }
        Ok(())
    }

    fn can_restore_sample(&self) -> bool {
        self.stateless && self.stream.can_restore_sample()
    }

    fn restore_sample(&self, key: &RestoreKey) -> Result<O> {
        ensure!(
            self.stateless,
            "transform {} is not declared stateless; its outputs cannot be rebuilt",
            self.transform.name()
        );
        ensure!(
            self.stream.can_restore_sample(),
            "the stage below transform {} cannot rebuild samples",
            self.transform.name()
        );
        let tail = if self.transform.expands() { 2 } else { 1 };
        ensure!(
            key.len() > tail,
            "restore key {key} is too short for transform {}",
            self.transform.name()
        );
        let element = if self.transform.expands() {
            let element = key.int_at(key.len() - 2)?;
            ensure!(element >= 0, "negative element index in restore key {key}");
            element as u64
        } else {
            0
        };
        ensure!(
            key.int_at(key.len() - 1)? >= 0,
            "negative sample counter in restore key {key}"
        );

        let input = self.stream.restore_sample(&key.prefix(key.len() - tail)?)?;
        let mapped = self
            .transform
            .transform(input)
            .with_context(|| format!("replaying {key} through transform {}", self.transform.name()))?;
        match mapped {
            Mapped::One(mut output) => {
                ensure!(
                    element == 0,
                    "transform {} yielded one output on replay but key {key} wants element {element}; \
                     it is declared stateless yet behaved differently",
                    self.transform.name()
                );
                output.set_restore_key(key.clone());
                Ok(output)
            }
            Mapped::Many(mut rest) => {
                if !self.transform.expands() {
                    return Err(FatalSampleError::new(format!(
                        "transform {} returned a sequence without declaring expansion",
                        self.transform.name()
                    ))
                    .into());
                }
                let mut at = 0u64;
                loop {
                    match rest.next() {
                        Some(Ok(mut output)) if at == element => {
                            output.set_restore_key(key.clone());
                            return Ok(output);
                        }
                        Some(Ok(_)) => at += 1,
                        Some(Err(err)) => {
                            return Err(err
                                .context(format!("replaying element {at} of {key}")));
                        }
                        None => {
                            return Err(FatalSampleError::new(format!(
                                "transform {} stopped after {at} outputs but key {key} wants \
                                 element {element}; it is declared stateless yet behaved differently",
                                self.transform.name()
                            ))
                            .into());
                        }
                    }
                }
            }
            Mapped::Skip => Err(FatalSampleError::new(format!(
                "transform {} skipped on replay a sample it previously emitted; \
                 it is declared stateless yet behaved differently",
                self.transform.name()
            ))
            .into()),
        }
    }

    fn config(&self) -> serde_json::Value {
        json!({
            "stream": "map",
            "transform": self.transform.name(),
            "expands": self.transform.expands(),
            "stateless": self.stateless,
            "inner": self.stream.config(),
        })
    }

    fn worker_config(&self) -> &WorkerConfig {
        &self.worker_config
    }
}

/// ============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Minimal replayable upstream: worker `w` yields `w * 100 + i` for
    /// `i in 0..limit`, keyed `("num", value)`.
    #[derive(Debug, Clone, PartialEq)]
    struct Num {
        value: u64,
        key: RestoreKey,
    }

    impl Num {
        fn new(value: u64) -> Self {
            Self {
                value,
                key: RestoreKey::new(),
            }
        }
    }

    impl Keyed for Num {
        fn restore_key(&self) -> &RestoreKey {
            &self.key
        }

        fn set_restore_key(&mut self, key: RestoreKey) {
            self.key = key;
        }
    }

    struct Numbers {
        worker_config: WorkerConfig,
        next: Vec<u64>,
        limit: u64,
    }

    impl Numbers {
        fn new(workers: usize, limit: u64) -> Self {
            Self {
                worker_config: WorkerConfig::local(workers).unwrap(),
                next: vec![0; workers],
                limit,
            }
        }

        fn key_for(value: u64) -> RestoreKey {
            let mut key = RestoreKey::new();
            key.push_str("num");
            key.push_int(value as i64);
            key
        }
    }

    impl SavableStream for Numbers {
        type Item = Num;
        type State = u64;
        type MergedState = Vec<u64>;

        fn next_sample(&mut self, worker: usize) -> Option<Result<Num>> {
            if self.next[worker] >= self.limit {
                return None;
            }
            let value = worker as u64 * 100 + self.next[worker];
            self.next[worker] += 1;
            Some(Ok(Num {
                value,
                key: Self::key_for(value),
            }))
        }

        fn len(&self) -> u64 {
            self.limit * self.next.len() as u64
        }

        fn worker_has_samples(&self, worker: usize) -> bool {
            self.next[worker] < self.limit
        }

        fn save_state(&self, worker: usize) -> Result<u64> {
            Ok(self.next[worker])
        }

        fn merge_states(&self, states: Vec<Option<u64>>) -> Result<Vec<u64>> {
            ensure!(states.len() == self.next.len(), "one state per worker");
            Ok(states.into_iter().map(Option::unwrap_or_default).collect())
        }

        fn restore_state(&mut self, state: Option<Vec<u64>>) -> Result<()> {
            self.next = state.unwrap_or_else(|| vec![0; self.next.len()]);
            Ok(())
        }

        fn can_restore_sample(&self) -> bool {
            true
        }

        fn restore_sample(&self, key: &RestoreKey) -> Result<Num> {
            ensure!(
                key.len() == 2 && key.str_at(0)? == "num",
                "not a number key: {key}"
            );
            Ok(Num {
                value: key.int_at(1)? as u64,
                key: key.clone(),
            })
        }

        fn config(&self) -> serde_json::Value {
            json!({ "stream": "numbers", "limit": self.limit })
        }

        fn worker_config(&self) -> &WorkerConfig {
            &self.worker_config
        }
    }

    struct Double;

    impl StreamTransform<Num, Num> for Double {
        fn transform(&self, input: Num) -> Result<Mapped<Num>> {
            Ok(Mapped::One(Num::new(input.value * 2)))
        }
    }

    struct DropOdd;

    impl StreamTransform<Num, Num> for DropOdd {
        fn transform(&self, input: Num) -> Result<Mapped<Num>> {
            if input.value % 2 == 1 {
                Ok(Mapped::Skip)
            } else {
                Ok(Mapped::One(input))
            }
        }
    }

    /// Expands each value `v` into `v * 10 + 0 .. v * 10 + n`.
    struct Fan {
        n: u64,
    }

    impl StreamTransform<Num, Num> for Fan {
        fn transform(&self, input: Num) -> Result<Mapped<Num>> {
            let base = input.value * 10;
            Ok(Mapped::many(
                (0..self.n).map(move |k| Ok(Num::new(base + k))),
            ))
        }

        fn expands(&self) -> bool {
            true
        }
    }

    mod one_to_one_tests {
        use super::*;

        #[test]
        fn outputs_are_tagged_with_the_pull_counter() -> Result<()> {
            let mut stream = MapStream::new(Numbers::new(1, 3), Double, true);
            let outputs: Vec<Num> = stream.iter_worker(0).collect::<Result<_>>()?;
            assert_eq!(
                outputs.iter().map(|n| n.value).collect::<Vec<_>>(),
                vec![0, 2, 4]
            );
            for (at, output) in outputs.iter().enumerate() {
                assert_eq!(output.key.len(), 3);
                assert_eq!(output.key.int_at(2)?, at as i64, "counter tag");
            }
            Ok(())
        }

        #[test]
        fn skips_still_consume_counter_positions() -> Result<()> {
            let mut stream = MapStream::new(Numbers::new(1, 4), DropOdd, true);
            let outputs: Vec<Num> = stream.iter_worker(0).collect::<Result<_>>()?;
            let tags: Vec<i64> = outputs
                .iter()
                .map(|n| n.key.int_at(2))
                .collect::<Result<_>>()?;
            assert_eq!(tags, vec![0, 2], "odd pulls consumed counters 1 and 3");

            let state = stream.save_state(0)?;
            assert_eq!(state.sample_index, 4, "all four inputs were counted");
            Ok(())
        }

        #[test]
        fn replay_rebuilds_value_equal_outputs() -> Result<()> {
            let mut stream = MapStream::new(Numbers::new(2, 3), Double, true);
            let mut outputs: Vec<Num> = stream.iter_worker(0).collect::<Result<_>>()?;
            outputs.extend(stream.iter_worker(1).collect::<Result<Vec<_>>>()?);

            assert!(stream.can_restore_sample());
            for output in &outputs {
                let replayed = stream.restore_sample(&output.key)?;
                assert_eq!(&replayed, output);
            }
            Ok(())
        }

        #[test]
        fn stateful_transforms_refuse_replay() {
            let stream = MapStream::new(Numbers::new(1, 3), Double, false);
            assert!(!stream.can_restore_sample());
            let mut key = Numbers::key_for(0);
            key.push_int(0);
            assert!(stream.restore_sample(&key).is_err());
        }
    }

    mod expanding_tests {
        use super::*;

        #[test]
        fn sequences_emit_one_element_per_pull() -> Result<()> {
            let mut stream = MapStream::new(Numbers::new(1, 2), Fan { n: 3 }, true);
            let outputs: Vec<Num> = stream.iter_worker(0).collect::<Result<_>>()?;
            assert_eq!(
                outputs.iter().map(|n| n.value).collect::<Vec<_>>(),
                vec![0, 1, 2, 10, 11, 12]
            );
            // Keys carry (element, counter) after the input key.
            for (at, output) in outputs.iter().enumerate() {
                assert_eq!(output.key.len(), 4);
                assert_eq!(output.key.int_at(2)?, (at % 3) as i64);
                assert_eq!(output.key.int_at(3)?, (at / 3) as i64);
            }
            Ok(())
        }

        #[test]
        fn sequence_elements_replay_individually() -> Result<()> {
            let mut stream = MapStream::new(Numbers::new(1, 2), Fan { n: 3 }, true);
            let outputs: Vec<Num> = stream.iter_worker(0).collect::<Result<_>>()?;
            for output in &outputs {
                let replayed = stream.restore_sample(&output.key)?;
                assert_eq!(&replayed, output);
            }
            Ok(())
        }

        #[test]
        fn undeclared_sequences_are_fatal() {
            struct UndeclaredFan;
            impl StreamTransform<Num, Num> for UndeclaredFan {
                fn transform(&self, input: Num) -> Result<Mapped<Num>> {
                    let value = input.value;
                    Ok(Mapped::many((0..2).map(move |k| Ok(Num::new(value + k)))))
                }
            }

            let mut stream = MapStream::new(Numbers::new(1, 2), UndeclaredFan, true);
            let err = stream.next_sample(0).unwrap().unwrap_err();
            assert!(is_fatal(&err), "got non-fatal: {err:#}");
        }

        #[test]
        fn replay_shortfall_is_fatal() -> Result<()> {
            /// Yields three elements on the first call, one afterwards.
            struct Shrinking {
                calls: AtomicU64,
            }
            impl StreamTransform<Num, Num> for Shrinking {
                fn transform(&self, input: Num) -> Result<Mapped<Num>> {
                    let n = if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        3
                    } else {
                        1
                    };
                    let value = input.value;
                    Ok(Mapped::many((0..n).map(move |k| Ok(Num::new(value * 10 + k)))))
                }
                fn expands(&self) -> bool {
                    true
                }
            }

            let mut stream = MapStream::new(
                Numbers::new(1, 1),
                Shrinking {
                    calls: AtomicU64::new(0),
                },
                true,
            );
            let outputs: Vec<Num> = stream.iter_worker(0).collect::<Result<_>>()?;
            assert_eq!(outputs.len(), 3);

            let err = stream.restore_sample(&outputs[2].key).unwrap_err();
            assert!(is_fatal(&err), "got non-fatal: {err:#}");
            assert!(format!("{err:#}").contains("stopped after"), "{err:#}");
            Ok(())
        }
    }

    mod failure_tests {
        use super::*;
        use crate::error::reraise_handler;

        struct FailOn {
            value: u64,
        }

        impl StreamTransform<Num, Num> for FailOn {
            fn transform(&self, input: Num) -> Result<Mapped<Num>> {
                if input.value == self.value {
                    bail!("value {} is corrupt", input.value);
                }
                Ok(Mapped::One(input))
            }
        }

        #[test]
        fn recoverable_errors_follow_the_handler() -> Result<()> {
            // Default handler drops the failing sample.
            let mut dropping = MapStream::new(Numbers::new(1, 3), FailOn { value: 1 }, true);
            let values: Vec<u64> = dropping
                .iter_worker(0)
                .map(|n| n.map(|n| n.value))
                .collect::<Result<_>>()?;
            assert_eq!(values, vec![0, 2]);
            assert_eq!(dropping.save_state(0)?.sample_index, 3);

            // A re-raising handler propagates instead.
            let mut raising = MapStream::new(Numbers::new(1, 3), FailOn { value: 1 }, true)
                .with_handler(reraise_handler());
            assert_eq!(raising.next_sample(0).unwrap()?.value, 0);
            assert!(raising.next_sample(0).unwrap().is_err());
            Ok(())
        }

        #[test]
        fn fatal_errors_bypass_the_handler() {
            struct FatalOn {
                value: u64,
            }
            impl StreamTransform<Num, Num> for FatalOn {
                fn transform(&self, input: Num) -> Result<Mapped<Num>> {
                    if input.value == self.value {
                        return Err(FatalSampleError::new("broken state").into());
                    }
                    Ok(Mapped::One(input))
                }
            }

            // The dropping handler never sees the fatal error.
            let mut stream = MapStream::new(Numbers::new(1, 3), FatalOn { value: 1 }, true);
            assert!(stream.next_sample(0).unwrap().is_ok());
            let err = stream.next_sample(0).unwrap().unwrap_err();
            assert!(is_fatal(&err));
        }

        #[test]
        fn failing_sequence_elements_drop_the_rest() -> Result<()> {
            struct Brittle;
            impl StreamTransform<Num, Num> for Brittle {
                fn transform(&self, input: Num) -> Result<Mapped<Num>> {
                    let value = input.value;
                    Ok(Mapped::many((0..4).map(move |k| {
                        if k == 1 {
                            bail!("element {k} is corrupt")
                        }
                        Ok(Num::new(value * 10 + k))
                    })))
                }
                fn expands(&self) -> bool {
                    true
                }
            }

            let mut stream = MapStream::new(Numbers::new(1, 2), Brittle, true);
            let values: Vec<u64> = stream
                .iter_worker(0)
                .map(|n| n.map(|n| n.value))
                .collect::<Result<_>>()?;
            // Element 0 of each sequence emits, element 1 fails and abandons
            // elements 2 and 3.
            assert_eq!(values, vec![0, 10]);
            Ok(())
        }
    }

    mod state_tests {
        use super::*;

        #[test]
        fn counters_survive_the_checkpoint_round_trip() -> Result<()> {
            let mut stream = MapStream::new(Numbers::new(2, 5), Double, true);
            for _ in 0..3 {
                stream.next_sample(0);
            }
            stream.next_sample(1);

            let merged = stream.merge_states(vec![
                Some(stream.save_state(0)?),
                Some(stream.save_state(1)?),
            ])?;
            assert_eq!(merged.sample_indexes, vec![3, 1]);

            let mut resumed = MapStream::new(Numbers::new(2, 5), Double, true);
            resumed.restore_state(Some(merged))?;
            let next = resumed.next_sample(0).unwrap()?;
            assert_eq!(next.key.int_at(2)?, 3, "counter resumes, not restarts");
            Ok(())
        }

        #[test]
        fn absent_worker_states_restart_that_worker() -> Result<()> {
            let mut stream = MapStream::new(Numbers::new(2, 5), Double, true);
            stream.next_sample(0);
            let merged = stream.merge_states(vec![Some(stream.save_state(0)?), None])?;
            assert_eq!(merged.sample_indexes, vec![1, 0]);
            Ok(())
        }

        #[test]
        fn state_length_mismatches_are_rejected() -> Result<()> {
            let mut stream = MapStream::new(Numbers::new(2, 5), Double, true);
            let merged = MapMergedState {
                inner: vec![0u64],
                sample_indexes: vec![0],
            };
            assert!(stream.restore_state(Some(merged)).is_err());
            Ok(())
        }
    }
}
