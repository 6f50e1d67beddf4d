//! Database entries.
//!
//! Binary format:
//! ```text
//! [key: 24 bytes][value_len: u64][value bytes][tag_count: u64]
//! [tag_len: u64][tag bytes] * tag_count
//! ```

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::DecodeError;
use crate::key::{DbKey, INITIAL_KEY};
use crate::wire::codec::{ByteReader, ByteWriter};

/// Added to every entry produced by a merge.
pub const MERGED_TAG: &str = "MERGED";

/// Forces a merge even when the colliding entries are identical.
pub const FORCE_MERGE_TAG: &str = "MERGE_STRATEGY=FORCE_MERGE";

/// Result of inserting an entry over an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Same key, tags and value; nothing changed.
    Unchanged,
    /// Values concatenated, tags unioned.
    Merged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbEntry {
    key: DbKey,
    tags: BTreeSet<String>,
    value: Vec<u8>,
}

impl Default for DbEntry {
    fn default() -> Self {
        Self { key: INITIAL_KEY, tags: BTreeSet::new(), value: Vec::new() }
    }
}

impl DbEntry {
    pub fn new<I, T>(key: DbKey, tags: I, value: impl Into<Vec<u8>>) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            key,
            tags: tags.into_iter().map(Into::into).collect(),
            value: value.into(),
        }
    }

    /// Entry without a producer-chosen key.
    pub fn unkeyed<I, T>(tags: I, value: impl Into<Vec<u8>>) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::new(INITIAL_KEY, tags, value)
    }

    pub fn key(&self) -> DbKey {
        self.key
    }

    pub fn set_key(&mut self, key: DbKey) {
        self.key = key;
    }

    pub fn is_random_key(&self) -> bool {
        self.key.is_random()
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) -> bool {
        self.tags.insert(tag.into())
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        self.tags.remove(tag)
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn value_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }

    pub fn set_value(&mut self, value: impl Into<Vec<u8>>) {
        self.value = value.into();
    }

    /// Append `line` followed by a newline.
    pub fn add_to_value(&mut self, line: &str) {
        self.value.extend_from_slice(line.as_bytes());
        self.value.push(b'\n');
    }

    /// Fold a colliding entry into this one.
    ///
    /// Identical entries stay as they are unless either carries the
    /// force-merge tag; otherwise values are joined with a newline (this
    /// entry first) and the tag sets unioned plus `MERGED`.
    pub fn merge(&mut self, other: DbEntry) -> MergeOutcome {
        let forced = self.has_tag(FORCE_MERGE_TAG) || other.has_tag(FORCE_MERGE_TAG);
        if !forced && self.tags == other.tags && self.value == other.value {
            return MergeOutcome::Unchanged;
        }
        self.value.push(b'\n');
        self.value.extend_from_slice(&other.value);
        self.tags.extend(other.tags);
        self.tags.insert(MERGED_TAG.to_string());
        MergeOutcome::Merged
    }

    /// Serialized size in bytes.
    pub fn encoded_len(&self) -> usize {
        24 + 8 + self.value.len() + 8 + self.tags.iter().map(|t| 8 + t.len()).sum::<usize>()
    }

    pub fn encode(&self, w: &mut ByteWriter) {
        w.put_key(&self.key);
        w.put_bytes(&self.value);
        w.put_len(self.tags.len());
        for tag in &self.tags {
            w.put_str(tag);
        }
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let key = r.get_key()?;
        let value = r.get_bytes()?.to_vec();
        let count = r.get_len(8)?;
        let mut tags = BTreeSet::new();
        for _ in 0..count {
            tags.insert(r.get_string("tag")?);
        }
        Ok(Self { key, tags, value })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(self.encoded_len());
        self.encode(&mut w);
        w.into_inner()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = ByteReader::new(bytes);
        let entry = Self::decode(&mut r)?;
        r.finish()?;
        Ok(entry)
    }
}

impl fmt::Display for DbEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "KEY:")?;
        if self.is_random_key() {
            write!(f, "(random)")?;
        }
        writeln!(f, "{}", self.key)?;
        writeln!(f, "TAGS:")?;
        for tag in &self.tags {
            writeln!(f, "{}", tag)?;
        }
        writeln!(f, "VALUE:")?;
        write!(f, "{}", self.value_str())
    }
}
