//! src/stream/merge.rs
//!
//! Multi-source merging: lockstep joining plus typed composition.
//!
//! A [`MergeStream`] reads N sources position by position through
//! [`JoinedRecordStream`], materializes each source's record, and composes
//! the parts into the caller's sample type via [`FromJoined`]. The
//! composition runs inside a stateless [`MapStream`], so merged pipelines
//! inherit the wrapper's counters, checkpointing, and per-key replay
//! unchanged.

use crate::error::FatalSampleError;
use crate::sample::{FromJoined, JoinedParts, Keyed, RestoreKey};
use crate::source::{Materialize, Source, Sources};
use crate::stream::joined::{JoinedRecordStream, RecordTuple};
use crate::stream::loader::{LoaderMergedState, LoaderState};
use crate::stream::map::{MapMergedState, MapState, MapStream, Mapped, StreamTransform};
use crate::stream::{SavableStream, StreamConfig};
use crate::worker::WorkerConfig;
use anyhow::{bail, ensure, Context, Result};
use serde_json::json;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

/// ============================================================================
/// How source records are matched up. Only positional inner matching is
/// supported: every source must hold the same records in the same order,
/// which construction verifies shard by shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinMethod {
    #[default]
    InnerMatch,
}

impl FromStr for JoinMethod {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "inner_match" => Ok(JoinMethod::InnerMatch),
            other => bail!("unknown join method '{other}' (supported: inner_match)"),
        }
    }
}

impl fmt::Display for JoinMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinMethod::InnerMatch => f.write_str("inner_match"),
        }
    }
}

/// ============================================================================
/// The composition step: materializes every present part of a joined
/// position and builds the output sample through [`FromJoined`].
///
/// Materializer and composition failures are recoverable and follow the
/// stream's error handler. A tuple without a primary record cannot occur in
/// a healthy pipeline and is treated as fatal.
pub struct JoinTransform<T> {
    materializers: Vec<Arc<dyn Materialize>>,
    names: Option<Vec<String>>,
    origin: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StreamTransform<RecordTuple, T> for JoinTransform<T>
where
    T: FromJoined + Keyed + Send,
{
    fn transform(&self, tuple: RecordTuple) -> Result<Mapped<T>> {
        let mut parts = Vec::with_capacity(tuple.records.len());
        for (at, record) in tuple.records.into_iter().enumerate() {
            match record {
                Some(record) => {
                    let key = record.key.clone();
                    let sample =
                        self.materializers[at].materialize(record).with_context(|| {
                            format!("materializing part {at} of record '{key}'")
                        })?;
                    parts.push(Some(sample));
                }
                None => parts.push(None),
            }
        }
        if parts.first().map_or(true, Option::is_none) {
            return Err(FatalSampleError::new(
                "joined position without a primary record reached composition",
            )
            .into());
        }

        let mut sample = T::from_joined(JoinedParts::new(parts, self.names.clone()))?;
        sample.set_origin(&self.origin);
        Ok(Mapped::One(sample))
    }

    fn name(&self) -> &'static str {
        "join"
    }
}

/// ============================================================================
/// A named multi-source pipeline yielding composed samples of type `T`.
pub struct MergeStream<T> {
    name: String,
    join_method: JoinMethod,
    inner: MapStream<JoinedRecordStream, JoinTransform<T>, T>,
}

impl<T> MergeStream<T>
where
    T: FromJoined + Keyed + Send,
{
    pub fn new(
        name: impl Into<String>,
        sources: impl Into<Sources>,
        join_method: JoinMethod,
        config: StreamConfig,
        worker_config: WorkerConfig,
    ) -> Result<Self> {
        let name = name.into();
        let sources = sources.into();
        ensure!(
            !sources.is_empty(),
            "merged stream '{name}' needs at least one source"
        );
        let handler = config.handler.clone();
        let joined = JoinedRecordStream::new(sources, config, worker_config)
            .with_context(|| format!("building merged stream '{name}'"))?;

        let transform = JoinTransform {
            materializers: joined
                .sources()
                .iter()
                .map(|source| source.materializer().clone())
                .collect(),
            names: joined.names().map(<[String]>::to_vec),
            origin: name.clone(),
            _marker: PhantomData,
        };
        // Joining is positional, hence stateless: the same key always
        // rebuilds the same composed sample.
        let inner = MapStream::new(joined, transform, true).with_handler(handler);
        Ok(Self {
            name,
            join_method,
            inner,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join_method(&self) -> JoinMethod {
        self.join_method
    }

    pub fn sources(&self) -> &[Source] {
        self.inner.stream().sources()
    }
}

impl<T> SavableStream for MergeStream<T>
where
    T: FromJoined + Keyed + Send,
{
    type Item = T;
    type State = MapState<LoaderState>;
    type MergedState = MapMergedState<LoaderMergedState>;

    fn next_sample(&mut self, worker: usize) -> Option<Result<T>> {
        self.inner.next_sample(worker)
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn worker_has_samples(&self, worker: usize) -> bool {
        self.inner.worker_has_samples(worker)
    }

    fn save_state(&self, worker: usize) -> Result<Self::State> {
        self.inner.save_state(worker)
    }

    fn merge_states(&self, states: Vec<Option<Self::State>>) -> Result<Self::MergedState> {
        self.inner.merge_states(states)
    }

    fn restore_state(&mut self, state: Option<Self::MergedState>) -> Result<()> {
        self.inner.restore_state(state)
    }

    fn can_restore_sample(&self) -> bool {
        self.inner.can_restore_sample()
    }

    fn restore_sample(&self, key: &RestoreKey) -> Result<T> {
        self.inner
            .restore_sample(key)
            .with_context(|| format!("restoring a sample of merged stream '{}'", self.name))
    }

    fn config(&self) -> serde_json::Value {
        let joined = self.inner.stream();
        json!({
            "stream": "merged",
            "name": self.name,
            "join_method": self.join_method.to_string(),
            "sources": joined.sources().iter().map(Source::config_value).collect::<Vec<_>>(),
            "names": joined.names(),
            "config": joined.stream_config().config_value(),
        })
    }

    fn worker_config(&self) -> &WorkerConfig {
        self.inner.worker_config()
    }
}

/// ============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::RecordSample;
    use crate::shard::{MemoryShardStore, ShardEntry};
    use crate::source::Utf8Materializer;

    fn source(name: &str, shards: &[(&str, u64)]) -> Source {
        let mut store = MemoryShardStore::new();
        for (shard, count) in shards {
            store.insert(
                *shard,
                (0..*count)
                    .map(|i| {
                        ShardEntry::new(format!("{shard}/{i:05}"))
                            .with_part("txt", format!("{name}:{shard}:{i}").into_bytes())
                    })
                    .collect(),
            );
        }
        Source::new(name, store.shard_infos(), Arc::new(store))
            .with_materializer(Arc::new(Utf8Materializer))
    }

    #[test]
    fn join_method_parses_and_displays() {
        assert_eq!("inner_match".parse::<JoinMethod>().unwrap(), JoinMethod::InnerMatch);
        assert!("outer".parse::<JoinMethod>().is_err());
        assert_eq!(JoinMethod::InnerMatch.to_string(), "inner_match");
    }

    #[test]
    fn merged_samples_compose_all_sources() -> Result<()> {
        let sources = Sources::from([
            ("speech", source("speech", &[("s_0", 3)])),
            ("caption", source("caption", &[("s_0", 3)])),
        ]);
        let mut stream = MergeStream::<RecordSample>::new(
            "av",
            sources,
            JoinMethod::InnerMatch,
            StreamConfig::default(),
            WorkerConfig::local(1)?,
        )?;
        assert_eq!(stream.len(), 3);

        let samples: Vec<RecordSample> = stream.iter_worker(0).collect::<Result<_>>()?;
        assert_eq!(samples.len(), 3);
        for (at, sample) in samples.iter().enumerate() {
            assert_eq!(sample.id, format!("s_0/{at:05}"));
            assert_eq!(sample.origin(), Some("av"));
            assert_eq!(sample.text("speech.txt")?, format!("speech:s_0:{at}"));
            assert_eq!(sample.text("caption.txt")?, format!("caption:s_0:{at}"));
            // (source, shard, index) + (shard, index) + sample counter.
            assert_eq!(sample.restore_key().len(), 6);
        }
        Ok(())
    }

    #[test]
    fn merged_samples_replay_from_their_keys() -> Result<()> {
        let sources = Sources::from([
            ("speech", source("speech", &[("s_0", 2), ("s_1", 2)])),
            ("caption", source("caption", &[("s_0", 2), ("s_1", 2)])),
        ]);
        let mut stream = MergeStream::<RecordSample>::new(
            "av",
            sources,
            JoinMethod::InnerMatch,
            StreamConfig::default(),
            WorkerConfig::local(1)?,
        )?;
        let samples: Vec<RecordSample> = stream.iter_worker(0).collect::<Result<_>>()?;

        assert!(stream.can_restore_sample());
        for sample in &samples {
            let replayed = stream.restore_sample(sample.restore_key())?;
            assert_eq!(&replayed, sample);
        }
        Ok(())
    }

    #[test]
    fn construction_failures_name_the_stream() {
        let sources = vec![
            source("a", &[("s_0", 3)]),
            source("b", &[("s_0", 2)]),
        ];
        let err = MergeStream::<RecordSample>::new(
            "broken",
            sources,
            JoinMethod::InnerMatch,
            StreamConfig::default(),
            WorkerConfig::local(1).unwrap(),
        )
        .err()
        .map(|e| format!("{e:#}"))
        .unwrap_or_default();
        assert!(err.contains("broken"), "got: {err}");
        assert!(err.contains("mismatch"), "got: {err}");
    }
}
