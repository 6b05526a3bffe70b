//! src/sample.rs
//!
//! Sample and restore-key types shared by every pipeline stage.
//!
//! A restore key is an ordered, heterogeneous tuple of strings and integers
//! that identifies one emitted sample. Loader stages write an absolute
//! position (`source, shard, index`), joining stages extend it with one
//! `(shard, index)` pair per secondary source, and wrapper stages append
//! their own counters. Replaying the key through an identically configured
//! pipeline must reproduce a value-equal sample, key included.

use anyhow::{anyhow, bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// ============================================================================
/// One component of a [`RestoreKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyPart {
    Str(String),
    Int(i64),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Str(s) => write!(f, "{s:?}"),
            KeyPart::Int(v) => write!(f, "{v}"),
        }
    }
}

/// ============================================================================
/// An ordered tuple of [`KeyPart`]s identifying one emitted sample.
///
/// Accessors are typed and bounds-checked: a key of unexpected shape is a
/// pipeline contract violation and surfaces as an error rather than a panic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RestoreKey(Vec<KeyPart>);

impl RestoreKey {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_parts(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn push_str(&mut self, value: impl Into<String>) {
        self.0.push(KeyPart::Str(value.into()));
    }

    pub fn push_int(&mut self, value: i64) {
        self.0.push(KeyPart::Int(value));
    }

    pub fn push(&mut self, part: KeyPart) {
        self.0.push(part);
    }

    /// Appends the placeholder pair recorded for an absent secondary source.
    pub fn push_sentinel(&mut self) {
        self.push_str("");
        self.push_int(-1);
    }

    /// True if positions `at` and `at + 1` hold the absent-source sentinel.
    pub fn is_sentinel_at(&self, at: usize) -> bool {
        matches!(
            (self.0.get(at), self.0.get(at + 1)),
            (Some(KeyPart::Str(s)), Some(KeyPart::Int(-1))) if s.is_empty()
        )
    }

    pub fn part_at(&self, at: usize) -> Result<&KeyPart> {
        self.0
            .get(at)
            .ok_or_else(|| anyhow!("restore key {self} has no component {at}"))
    }

    pub fn str_at(&self, at: usize) -> Result<&str> {
        match self.part_at(at)? {
            KeyPart::Str(s) => Ok(s),
            KeyPart::Int(v) => bail!("restore key {self}: component {at} is {v}, expected a string"),
        }
    }

    pub fn int_at(&self, at: usize) -> Result<i64> {
        match self.part_at(at)? {
            KeyPart::Int(v) => Ok(*v),
            KeyPart::Str(s) => {
                bail!("restore key {self}: component {at} is {s:?}, expected an integer")
            }
        }
    }

    /// The leading `len` components as a new key.
    pub fn prefix(&self, len: usize) -> Result<RestoreKey> {
        ensure!(
            len <= self.0.len(),
            "restore key {self} has {} components, cannot take a prefix of {len}",
            self.0.len()
        );
        Ok(RestoreKey(self.0[..len].to_vec()))
    }
}

impl fmt::Display for RestoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{part}")?;
        }
        write!(f, ")")
    }
}

/// ============================================================================
/// Restore-key stamping capability.
///
/// Every type flowing through a savable stream carries a restore key so that
/// wrapper stages can tag it and replay can identify it. `sample_id` is the
/// human-readable record identity used in diagnostics and handler callbacks;
/// `origin` names the pipeline that produced the sample.
pub trait Keyed {
    fn restore_key(&self) -> &RestoreKey;

    fn set_restore_key(&mut self, key: RestoreKey);

    fn sample_id(&self) -> Option<&str> {
        None
    }

    fn origin(&self) -> Option<&str> {
        None
    }

    fn set_origin(&mut self, _origin: &str) {}
}

/// ============================================================================
/// One raw record as produced by a loader stream: the record key, its named
/// opaque payloads, and the loader-assigned restore key
/// `(source, shard, index)`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawRecord {
    pub key: String,
    pub parts: HashMap<String, Vec<u8>>,
    pub restore_key: RestoreKey,
}

impl RawRecord {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            parts: HashMap::new(),
            restore_key: RestoreKey::new(),
        }
    }

    pub fn part(&self, name: &str) -> Result<&[u8]> {
        self.parts
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| anyhow!("record '{}' has no part '{name}'", self.key))
    }
}

impl Keyed for RawRecord {
    fn restore_key(&self) -> &RestoreKey {
        &self.restore_key
    }

    fn set_restore_key(&mut self, key: RestoreKey) {
        self.restore_key = key;
    }

    fn sample_id(&self) -> Option<&str> {
        Some(&self.key)
    }
}

/// ============================================================================
/// A decoded field value. Payloads stay opaque bytes unless a materializer
/// chose to decode them.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bytes(Vec<u8>),
    Text(String),
}

impl FieldValue {
    pub fn as_text(&self) -> Result<&str> {
        match self {
            FieldValue::Text(s) => Ok(s),
            FieldValue::Bytes(_) => bail!("field holds raw bytes, expected text"),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FieldValue::Bytes(b) => b,
            FieldValue::Text(s) => s.as_bytes(),
        }
    }
}

/// ============================================================================
/// A materialized sample: named optional fields plus identity and key.
///
/// Serves two roles. A per-source materializer produces one `RecordSample`
/// per raw record, and `RecordSample` is also the default joined output type
/// for pipelines that do not define their own sample struct (see
/// [`FromJoined`]).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordSample {
    pub id: String,
    /// Name of the pipeline that produced this sample; empty until stamped.
    pub origin: String,
    pub fields: HashMap<String, FieldValue>,
    pub restore_key: RestoreKey,
}

impl RecordSample {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            origin: String::new(),
            fields: HashMap::new(),
            restore_key: RestoreKey::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Result<&FieldValue> {
        self.fields
            .get(name)
            .ok_or_else(|| anyhow!("sample '{}' has no field '{name}'", self.id))
    }

    pub fn text(&self, name: &str) -> Result<&str> {
        self.field(name)?
            .as_text()
            .with_context(|| format!("field '{name}' of sample '{}'", self.id))
    }
}

impl Keyed for RecordSample {
    fn restore_key(&self) -> &RestoreKey {
        &self.restore_key
    }

    fn set_restore_key(&mut self, key: RestoreKey) {
        self.restore_key = key;
    }

    fn sample_id(&self) -> Option<&str> {
        Some(&self.id)
    }

    fn origin(&self) -> Option<&str> {
        if self.origin.is_empty() {
            None
        } else {
            Some(&self.origin)
        }
    }

    fn set_origin(&mut self, origin: &str) {
        self.origin = origin.to_string();
    }
}

/// ============================================================================
/// The per-source parts of one joined position, handed to
/// [`FromJoined::from_joined`].
///
/// Parts are addressed positionally; when the sources were registered under
/// names, they can also be taken by name. `None` slots are positions where a
/// secondary source had no usable record.
pub struct JoinedParts {
    parts: Vec<Option<RecordSample>>,
    names: Option<Vec<String>>,
}

impl JoinedParts {
    pub fn new(parts: Vec<Option<RecordSample>>, names: Option<Vec<String>>) -> Self {
        debug_assert!(names.as_ref().map_or(true, |n| n.len() == parts.len()));
        Self { parts, names }
    }

    /// Number of source slots (present or not).
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn names(&self) -> Option<&[String]> {
        self.names.as_deref()
    }

    pub fn get(&self, index: usize) -> Option<&RecordSample> {
        self.parts.get(index).and_then(Option::as_ref)
    }

    /// Takes the part at `index`, failing if the slot is empty.
    pub fn take(&mut self, index: usize) -> Result<RecordSample> {
        self.take_opt(index)?
            .ok_or_else(|| anyhow!("joined part {index} is absent"))
    }

    /// Takes the part at `index`; `Ok(None)` if that source had no record.
    pub fn take_opt(&mut self, index: usize) -> Result<Option<RecordSample>> {
        ensure!(
            index < self.parts.len(),
            "joined sample has {} parts, no index {index}",
            self.parts.len()
        );
        Ok(self.parts[index].take())
    }

    /// Takes a part by source name, failing if the slot is empty.
    pub fn take_named(&mut self, name: &str) -> Result<RecordSample> {
        self.take_named_opt(name)?
            .ok_or_else(|| anyhow!("joined part '{name}' is absent"))
    }

    /// Takes a part by source name; `Ok(None)` if that source had no record.
    pub fn take_named_opt(&mut self, name: &str) -> Result<Option<RecordSample>> {
        let names = self
            .names
            .as_ref()
            .ok_or_else(|| anyhow!("sources were registered positionally, not by name"))?;
        let index = names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| anyhow!("no source named '{name}' (have: {})", names.join(", ")))?;
        Ok(self.parts[index].take())
    }
}

/// ============================================================================
/// The capability of being built from the per-source parts of one joined
/// position. Implemented by every output type of a merged pipeline; the trait
/// bound makes "cannot compose this type" a compile-time error instead of a
/// late runtime failure.
pub trait FromJoined: Sized {
    fn from_joined(parts: JoinedParts) -> Result<Self>;
}

/// The default composition: fields of every present part are merged into one
/// flat sample, prefixed with the source name (or its position for
/// positional sources). Identity comes from the primary part.
impl FromJoined for RecordSample {
    fn from_joined(mut parts: JoinedParts) -> Result<Self> {
        ensure!(
            parts.get(0).is_some(),
            "joined sample is missing its primary part"
        );
        let names = parts.names().map(<[String]>::to_vec);
        let mut sample = RecordSample::new(String::new());
        for index in 0..parts.len() {
            let Some(part) = parts.take_opt(index)? else {
                continue;
            };
            if index == 0 {
                sample.id = part.id.clone();
            }
            let prefix = match &names {
                Some(names) => names[index].clone(),
                None => index.to_string(),
            };
            for (field, value) in part.fields {
                sample.fields.insert(format!("{prefix}.{field}"), value);
            }
        }
        Ok(sample)
    }
}
