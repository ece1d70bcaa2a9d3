//! Shared data types for the grebe log storage engine.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use grebe_time::Time;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::{collections::BTreeMap, fmt, str::FromStr};
use uuid::Uuid;

/// Errors raised when parsing identifiers from text.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum IdError {
    #[snafu(display("invalid id \"{}\": {}", text, source))]
    InvalidId { text: String, source: uuid::Error },
}

/// Unique ID of a log store.
///
/// A store is one physical collection of chunks; a deployment may query
/// several stores at once and merge the results.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StoreId(Uuid);

impl StoreId {
    /// Create a new, random store ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl Default for StoreId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for StoreId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for StoreId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s).map_err(|source| IdError::InvalidId {
            text: s.to_string(),
            source,
        })?;
        Ok(Self(uuid))
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique ID of a chunk within a store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChunkId(Uuid);

impl ChunkId {
    /// Create a new, random chunk ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl Default for ChunkId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ChunkId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for ChunkId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s).map_err(|source| IdError::InvalidId {
            text: s.to_string(),
            source,
        })?;
        Ok(Self(uuid))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fully qualified location of one record in the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    /// The store holding the record.
    pub store_id: StoreId,
    /// The chunk holding the record.
    pub chunk_id: ChunkId,
    /// Zero-based record offset within the chunk.
    pub position: u64,
}

/// One ingested log record.
///
/// Records are immutable once written; the pipeline clones before mutating.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Timestamp assigned when the record was written to its chunk. Weakly
    /// monotonic within a chunk.
    pub write_ts: Time,
    /// Timestamp assigned at ingest; the cross-chunk merge order.
    pub ingest_ts: Time,
    /// Timestamp claimed by the log source itself, when one was parsed.
    pub source_ts: Option<Time>,
    /// Identifier of the log source that produced the record.
    pub source_id: String,
    /// The store this record lives in.
    pub store_id: StoreId,
    /// The chunk this record lives in.
    pub chunk_id: ChunkId,
    /// Zero-based offset of this record within its chunk.
    pub position: u64,
    /// Structured attributes attached at ingest. Attribute values win over
    /// fields extracted from `raw` on key collision.
    pub attrs: BTreeMap<String, String>,
    /// The opaque log payload.
    pub raw: Vec<u8>,
}

impl Record {
    /// The fully qualified location of this record.
    pub fn record_ref(&self) -> RecordRef {
        RecordRef {
            store_id: self.store_id,
            chunk_id: self.chunk_id,
            position: self.position,
        }
    }
}

/// Metadata describing one chunk.
///
/// Sealed chunks have final timestamp bounds and may carry indexes; active
/// chunks are still accepting appends, have open end bounds, and never have
/// indexes. `None` bounds mean "unknown" and never cause a chunk to be
/// rejected during selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    /// The chunk ID.
    pub id: ChunkId,
    /// The store this chunk belongs to.
    pub store_id: StoreId,
    /// Smallest `write_ts` in the chunk.
    pub start_ts: Option<Time>,
    /// Largest `write_ts` in the chunk.
    pub end_ts: Option<Time>,
    /// Smallest `ingest_ts` in the chunk.
    pub ingest_start: Option<Time>,
    /// Largest `ingest_ts` in the chunk.
    pub ingest_end: Option<Time>,
    /// Smallest `source_ts` in the chunk.
    pub source_start: Option<Time>,
    /// Largest `source_ts` in the chunk.
    pub source_end: Option<Time>,
    /// Number of records in the chunk.
    pub record_count: u64,
    /// Whether the chunk is closed to appends.
    pub sealed: bool,
}

/// Position marker for a chunk that a search has fully consumed.
pub const EXHAUSTED: u64 = u64::MAX;

/// Last-yielded position of one chunk inside a [`ResumeToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePosition {
    /// The store the chunk belongs to.
    pub store_id: StoreId,
    /// The chunk.
    pub chunk_id: ChunkId,
    /// Last position yielded from the chunk, or [`EXHAUSTED`].
    pub position: u64,
}

impl ResumePosition {
    /// Whether this chunk was fully consumed.
    pub fn is_exhausted(&self) -> bool {
        self.position == EXHAUSTED
    }
}

/// Serializable continuation state of a multi-chunk search.
///
/// Contains the last-yielded position of every chunk the search touched,
/// with [`EXHAUSTED`] marking chunks that have no further matches. A token
/// is only valid while every non-exhausted chunk it references still exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    /// Per-chunk positions, in the order the search first touched them.
    pub positions: Vec<ResumePosition>,
}

impl ResumeToken {
    /// Look up the stored position for a chunk, if the previous search
    /// touched it.
    pub fn position_for(&self, store_id: StoreId, chunk_id: ChunkId) -> Option<u64> {
        self.positions
            .iter()
            .find(|p| p.store_id == store_id && p.chunk_id == chunk_id)
            .map(|p| p.position)
    }

    /// Whether every chunk in the token has been fully consumed.
    pub fn all_exhausted(&self) -> bool {
        self.positions.iter().all(|p| p.is_exhausted())
    }
}

/// A tabular query result, produced by aggregation or the `raw` operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableResult {
    /// Column names; rows are keyed by position.
    pub columns: Vec<String>,
    /// Row data. Every row has exactly `columns.len()` cells.
    pub rows: Vec<Vec<String>>,
    /// Set when a cardinality or scan cap forced the result to be partial.
    pub truncated: bool,
}

impl TableResult {
    /// Index of the named column, if present.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}
