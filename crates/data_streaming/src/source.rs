//! src/source.rs
//!
//! Source descriptions: where records come from and how they materialize.
//!
//! A [`Source`] bundles a shard listing, a [`ShardReader`], an optional
//! exclusion list, and a [`Materialize`] step that turns raw payloads into
//! typed fields. Merged pipelines take several sources at once, either
//! positional or named (see [`Sources`]).

use crate::sample::{FieldValue, Keyed, RawRecord, RecordSample};
use crate::shard::{ShardInfo, ShardReader};
use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

/// ============================================================================
/// Turns one raw record into a materialized sample. Runs on worker threads,
/// so implementations must be shareable.
pub trait Materialize: Send + Sync {
    fn materialize(&self, record: RawRecord) -> Result<RecordSample>;
}

/// Keeps every payload as opaque bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawMaterializer;

impl Materialize for RawMaterializer {
    fn materialize(&self, record: RawRecord) -> Result<RecordSample> {
        let mut sample = RecordSample::new(record.key);
        for (name, payload) in record.parts {
            sample.fields.insert(name, FieldValue::Bytes(payload));
        }
        sample.set_restore_key(record.restore_key);
        Ok(sample)
    }
}

/// Decodes every payload as UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Materializer;

impl Materialize for Utf8Materializer {
    fn materialize(&self, record: RawRecord) -> Result<RecordSample> {
        let mut sample = RecordSample::new(record.key);
        for (name, payload) in record.parts {
            let text = String::from_utf8(payload)
                .with_context(|| format!("part '{name}' of record '{}' is not UTF-8", sample.id))?;
            sample.fields.insert(name, FieldValue::Text(text));
        }
        sample.set_restore_key(record.restore_key);
        Ok(sample)
    }
}

/// ============================================================================
/// One record source: its shard listing, reader, exclusions, and
/// materializer.
#[derive(Clone)]
pub struct Source {
    name: String,
    shards: Vec<ShardInfo>,
    excludes: HashSet<String>,
    reader: Arc<dyn ShardReader>,
    materializer: Arc<dyn Materialize>,
}

impl Source {
    pub fn new(
        name: impl Into<String>,
        shards: Vec<ShardInfo>,
        reader: Arc<dyn ShardReader>,
    ) -> Self {
        Self {
            name: name.into(),
            shards,
            excludes: HashSet::new(),
            reader,
            materializer: Arc::new(RawMaterializer),
        }
    }

    /// Record keys to drop without yielding. Exclusions still consume their
    /// stream position.
    pub fn with_excludes(mut self, excludes: impl IntoIterator<Item = String>) -> Self {
        self.excludes = excludes.into_iter().collect();
        self
    }

    pub fn with_materializer(mut self, materializer: Arc<dyn Materialize>) -> Self {
        self.materializer = materializer;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shards(&self) -> &[ShardInfo] {
        &self.shards
    }

    pub fn excludes(&self) -> &HashSet<String> {
        &self.excludes
    }

    pub fn reader(&self) -> &Arc<dyn ShardReader> {
        &self.reader
    }

    pub fn materializer(&self) -> &Arc<dyn Materialize> {
        &self.materializer
    }

    pub fn is_excluded(&self, key: &str) -> bool {
        self.excludes.contains(key)
    }

    pub fn total_records(&self) -> u64 {
        self.shards.iter().map(|shard| shard.count).sum()
    }

    /// Introspection fragment for [`crate::SavableStream::config`].
    pub fn config_value(&self) -> serde_json::Value {
        json!({
            "name": self.name,
            "shards": self.shards.len(),
            "records": self.total_records(),
            "excludes": self.excludes.len(),
        })
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.name)
            .field("shards", &self.shards.len())
            .field("records", &self.total_records())
            .field("excludes", &self.excludes.len())
            .finish()
    }
}

/// ============================================================================
/// The sources of a merged pipeline. Register them positionally when order
/// is enough, or by name when downstream composition wants to address parts
/// as `parts.take_named("caption")`.
#[derive(Debug, Clone)]
pub enum Sources {
    Positional(Vec<Source>),
    Named(IndexMap<String, Source>),
}

impl Sources {
    pub fn len(&self) -> usize {
        match self {
            Sources::Positional(sources) => sources.len(),
            Sources::Named(sources) => sources.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits into the ordered source list and, for named registration, the
    /// parallel name list.
    pub fn into_parts(self) -> (Vec<Source>, Option<Vec<String>>) {
        match self {
            Sources::Positional(sources) => (sources, None),
            Sources::Named(sources) => {
                let (names, sources) = sources.into_iter().unzip();
                (sources, Some(names))
            }
        }
    }
}

impl From<Vec<Source>> for Sources {
    fn from(sources: Vec<Source>) -> Self {
        Sources::Positional(sources)
    }
}

impl From<IndexMap<String, Source>> for Sources {
    fn from(sources: IndexMap<String, Source>) -> Self {
        Sources::Named(sources)
    }
}

impl<const N: usize> From<[(&str, Source); N]> for Sources {
    fn from(sources: [(&str, Source); N]) -> Self {
        Sources::Named(
            sources
                .into_iter()
                .map(|(name, source)| (name.to_string(), source))
                .collect(),
        )
    }
}

/// ============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{MemoryShardStore, ShardEntry};

    fn demo_source() -> Source {
        let mut store = MemoryShardStore::new();
        store.insert(
            "shard_0",
            vec![ShardEntry::new("shard_0/00000").with_part("txt", "hello".as_bytes())],
        );
        let shards = store.shard_infos();
        Source::new("demo", shards, Arc::new(store))
    }

    #[test]
    fn utf8_materializer_decodes_and_keeps_keys() -> Result<()> {
        let mut record = RawRecord::new("shard_0/00000");
        record.parts.insert("txt".into(), b"hello".to_vec());
        let mut key = crate::sample::RestoreKey::new();
        key.push_str("demo");
        record.set_restore_key(key.clone());

        let sample = Utf8Materializer.materialize(record)?;
        assert_eq!(sample.text("txt")?, "hello");
        assert_eq!(sample.restore_key(), &key);

        let mut bad = RawRecord::new("shard_0/00001");
        bad.parts.insert("txt".into(), vec![0xff, 0xfe]);
        assert!(Utf8Materializer.materialize(bad).is_err());
        Ok(())
    }

    #[test]
    fn raw_materializer_passes_bytes_through() -> Result<()> {
        let mut record = RawRecord::new("shard_0/00000");
        record.parts.insert("bin".into(), vec![1, 2, 3]);
        let sample = RawMaterializer.materialize(record)?;
        assert_eq!(sample.field("bin")?.as_bytes(), &[1, 2, 3]);
        Ok(())
    }

    #[test]
    fn named_sources_keep_registration_order() {
        let sources = Sources::from([("speech", demo_source()), ("caption", demo_source())]);
        assert_eq!(sources.len(), 2);
        let (list, names) = sources.into_parts();
        assert_eq!(names, Some(vec!["speech".to_string(), "caption".to_string()]));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn exclusions_match_record_keys() {
        let source = demo_source().with_excludes(["shard_0/00000".to_string()]);
        assert!(source.is_excluded("shard_0/00000"));
        assert!(!source.is_excluded("shard_0/00001"));
        assert_eq!(source.total_records(), 1);
    }
}
