//! Contains the grebe query engine: planner, per-chunk scanner, k-way
//! merger, search surface, and the post-scan pipeline operators.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use async_trait::async_trait;
use data_types::{ChunkId, ChunkMeta, Record, RecordRef, StoreId};
use grebe_time::{SystemProvider, Time, TimeProvider};
use predicate::Expr;
use snafu::Snafu;
use std::{fmt::Debug, sync::Arc, time::Duration};

pub mod error;
pub mod fields;
pub mod histogram;
pub mod pipeline;
pub mod plan;
pub mod positions;
pub mod pruning;
pub mod runtime;
pub mod search;
pub mod tokenize;

mod filter;
mod merge;
mod scan;

pub use error::{Error, Result};
pub use histogram::{HistogramQuery, HistogramResult, Severity};
pub use pipeline::{Pipeline, PipelineOp, PipelineOutput};
pub use plan::{ChunkPlan, PlanAction, QueryPlan};
pub use search::{ContextResult, ContextSearchResults, FollowStream, SearchResults};
pub use tokenize::DefaultTokenizer;

/// Failures reported by chunk store implementations.
///
/// The engine wraps these with query context before surfacing them; a
/// distinct type keeps the collaborator contract independent of engine
/// error handling.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[allow(missing_docs)]
pub enum StoreError {
    #[snafu(display("chunk {} not found", chunk_id))]
    ChunkNotFound { chunk_id: ChunkId },

    #[snafu(display("position {} out of bounds for chunk {}", position, chunk_id))]
    PositionOutOfBounds { chunk_id: ChunkId, position: u64 },

    #[snafu(display("storage failure: {}", message))]
    Failure { message: String },
}

/// Failures reported by index store implementations.
///
/// `NotFound` is a recoverable signal: the scanner falls back to a runtime
/// filter. Any other failure is treated the same way and never surfaced.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[allow(missing_docs)]
pub enum IndexError {
    #[snafu(display("no {} index for chunk {}", what, chunk_id))]
    NotFound { what: String, chunk_id: ChunkId },

    #[snafu(display("index failure: {}", message))]
    Failure { message: String },
}

/// A pull cursor over the records of one chunk.
///
/// The cursor models a position `p` in `0..=record_count`: [`seek`] sets it,
/// [`next`] returns the record at `p` and advances, [`prev`] steps back one
/// and returns the record it landed on. Reverse scans therefore start by
/// seeking to `record_count` and calling [`prev`] repeatedly.
///
/// Resources are released on drop.
///
/// [`seek`]: Self::seek
/// [`next`]: Self::next
/// [`prev`]: Self::prev
#[async_trait]
pub trait RecordCursor: Send + Debug {
    /// Position the cursor so the next call to [`next`](Self::next) returns
    /// the record at `position`.
    async fn seek(&mut self, position: u64) -> Result<(), StoreError>;

    /// Return the record at the current position and advance, or `None` at
    /// the end of the chunk.
    async fn next(&mut self) -> Result<Option<Record>, StoreError>;

    /// Step back one position and return the record there, or `None` at the
    /// start of the chunk.
    async fn prev(&mut self) -> Result<Option<Record>, StoreError>;
}

/// One physical chunk store.
#[async_trait]
pub trait ChunkStore: Send + Sync + Debug {
    /// All chunks currently in the store.
    async fn list(&self) -> Result<Vec<ChunkMeta>, StoreError>;

    /// Open a cursor over `chunk_id`.
    async fn open_cursor(&self, chunk_id: ChunkId) -> Result<Box<dyn RecordCursor>, StoreError>;

    /// Binary-search the chunk's timestamp side-index: the first position
    /// whose `write_ts >= t`, or `None` when every record is earlier.
    async fn find_start_position(
        &self,
        chunk_id: ChunkId,
        t: Time,
    ) -> Result<Option<u64>, StoreError>;

    /// Bulk-read `write_ts` for the given positions, in order.
    async fn read_write_timestamps(
        &self,
        chunk_id: ChunkId,
        positions: &[u64],
    ) -> Result<Vec<Time>, StoreError>;
}

/// Reader over a chunk's token index.
#[async_trait]
pub trait TokenIndexReader: Send + Sync {
    /// Positions of records containing `token`, or `None` when the token is
    /// not in the index.
    async fn lookup(&self, token: &str) -> Result<Option<Vec<u64>>, IndexError>;

    /// Positions of records containing any token starting with `prefix`.
    async fn lookup_prefix(&self, prefix: &str) -> Result<Option<Vec<u64>>, IndexError>;
}

/// Reader over a key/value pair index.
#[async_trait]
pub trait KvIndexReader: Send + Sync {
    /// Positions of records carrying `key=value`.
    async fn lookup(&self, key: &str, value: &str) -> Result<Option<Vec<u64>>, IndexError>;

    /// Whether the index admitted only a subset of observed pairs. Capped
    /// indexes are inconclusive on a miss and unusable for narrowing.
    fn capped(&self) -> bool;
}

/// Reader over a key-only index.
#[async_trait]
pub trait KeyIndexReader: Send + Sync {
    /// Positions of records carrying `key` with any value.
    async fn lookup(&self, key: &str) -> Result<Option<Vec<u64>>, IndexError>;

    /// See [`KvIndexReader::capped`].
    fn capped(&self) -> bool;
}

/// Reader over a value-only index.
#[async_trait]
pub trait ValueIndexReader: Send + Sync {
    /// Positions of records carrying `value` under any key.
    async fn lookup(&self, value: &str) -> Result<Option<Vec<u64>>, IndexError>;

    /// See [`KvIndexReader::capped`].
    fn capped(&self) -> bool;
}

/// Reader over a chunk's structural JSON index.
///
/// Paths use [`JSON_PATH_SEPARATOR`] between segments; the scanner converts
/// dotted query keys before lookup.
#[async_trait]
pub trait JsonIndexReader: Send + Sync {
    /// Positions of records where the JSON path exists.
    async fn lookup_path(&self, path: &str) -> Result<Option<Vec<u64>>, IndexError>;

    /// Positions of records where the JSON path holds `value`.
    async fn lookup_path_value(
        &self,
        path: &str,
        value: &str,
    ) -> Result<Option<Vec<u64>>, IndexError>;

    /// Whether the path-value side of the index is capped.
    fn pv_capped(&self) -> bool;
}

/// Separator between JSON path segments in index keys.
///
/// NUL cannot appear in normal keys, so dotted user keys convert without
/// ambiguity.
pub const JSON_PATH_SEPARATOR: char = '\0';

/// Per-store index access.
///
/// Every accessor reports [`IndexError::NotFound`] when the chunk has no
/// such index (active chunks never do), which the planner distinguishes
/// from "index present, no matches".
#[async_trait]
pub trait IndexStore: Send + Sync + Debug {
    /// Token index over tokenized record bodies.
    async fn token_index(&self, chunk_id: ChunkId)
        -> Result<Arc<dyn TokenIndexReader>, IndexError>;

    /// Key/value index over pairs extracted from record bodies (heuristic).
    async fn kv_index(&self, chunk_id: ChunkId) -> Result<Arc<dyn KvIndexReader>, IndexError>;

    /// Key-only index over extracted body pairs (heuristic).
    async fn kv_key_index(&self, chunk_id: ChunkId) -> Result<Arc<dyn KeyIndexReader>, IndexError>;

    /// Value-only index over extracted body pairs (heuristic).
    async fn kv_value_index(
        &self,
        chunk_id: ChunkId,
    ) -> Result<Arc<dyn ValueIndexReader>, IndexError>;

    /// Key/value index over record attributes (authoritative).
    async fn attr_kv_index(&self, chunk_id: ChunkId) -> Result<Arc<dyn KvIndexReader>, IndexError>;

    /// Key-only index over record attributes (authoritative).
    async fn attr_key_index(
        &self,
        chunk_id: ChunkId,
    ) -> Result<Arc<dyn KeyIndexReader>, IndexError>;

    /// Value-only index over record attributes (authoritative).
    async fn attr_value_index(
        &self,
        chunk_id: ChunkId,
    ) -> Result<Arc<dyn ValueIndexReader>, IndexError>;

    /// Structural JSON path / path-value index (heuristic).
    async fn json_index(&self, chunk_id: ChunkId) -> Result<Arc<dyn JsonIndexReader>, IndexError>;

    /// First position whose `ingest_ts >= t`, from the ingest side-index.
    async fn find_ingest_start_position(
        &self,
        chunk_id: ChunkId,
        t: Time,
    ) -> Result<Option<u64>, IndexError>;

    /// First position whose `source_ts >= t`, from the source side-index.
    async fn find_source_start_position(
        &self,
        chunk_id: ChunkId,
        t: Time,
    ) -> Result<Option<u64>, IndexError>;
}

/// The registry of stores a query runs against.
#[async_trait]
pub trait Catalog: Send + Sync + Debug {
    /// IDs of all stores currently known. Re-consulted by `follow` on every
    /// poll so stores created at runtime become visible.
    async fn store_ids(&self) -> Vec<StoreId>;

    /// The chunk store for `store_id`, if it exists.
    fn chunk_store(&self, store_id: StoreId) -> Option<Arc<dyn ChunkStore>>;

    /// The index store for `store_id`. Stores without indexes return `None`;
    /// every lookup then falls back to runtime filtering.
    fn index_store(&self, store_id: StoreId) -> Option<Arc<dyn IndexStore>>;
}

/// Tokenization policy, supplied by the ingest side.
///
/// The scanner leans on `is_indexable` for a correctness-critical shortcut:
/// if a query token is indexable and absent from a chunk's token index, the
/// chunk provably has no matches.
pub trait Tokenizer: Send + Sync + Debug {
    /// Split a raw record body into lowercase tokens.
    fn tokenize(&self, raw: &[u8]) -> Vec<String>;

    /// Whether the tokenizer would have admitted `token` into an index.
    fn is_indexable(&self, token: &str) -> bool;

    /// Flat `key=value` pairs extracted from the record body.
    fn kv_pairs(&self, raw: &[u8]) -> Vec<(String, String)>;
}

/// A structured search request.
///
/// After normalization all filter logic lives in `expr`; time bounds select
/// on `write_ts` and `end < start` flips the query into reverse order.
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Lower `write_ts` bound (inclusive).
    pub start: Option<Time>,
    /// Upper `write_ts` bound (exclusive). An `end` before `start` makes the
    /// query reverse.
    pub end: Option<Time>,
    /// Lower `source_ts` bound (inclusive).
    pub source_start: Option<Time>,
    /// Upper `source_ts` bound (exclusive).
    pub source_end: Option<Time>,
    /// Lower `ingest_ts` bound (inclusive).
    pub ingest_start: Option<Time>,
    /// Upper `ingest_ts` bound (exclusive).
    pub ingest_end: Option<Time>,
    /// The boolean filter expression, if any.
    pub expr: Option<Expr>,
    /// Yield newest-first.
    pub reverse: bool,
    /// Stop after this many records.
    pub limit: Option<usize>,
    /// Restrict the search to exactly one record location.
    pub pos: Option<RecordRef>,
    /// Context records to emit before each match (`search_with_context`).
    pub context_before: usize,
    /// Context records to emit after each match (`search_with_context`).
    pub context_after: usize,
}

/// Engine tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Distinct stats groups before the aggregator starts dropping new ones.
    pub max_group_cardinality: usize,
    /// Records a filtered timechart/histogram scan may read before stopping.
    pub record_scan_cap: usize,
    /// Sleep between follow polls.
    pub follow_poll_interval: Duration,
    /// Hard cap on per-match context window sizes.
    pub max_context_records: usize,
    /// Records between cancellation checks in the scanner.
    pub cancel_poll_stride: usize,
    /// Default timechart bucket count.
    pub default_timechart_buckets: usize,
    /// Maximum timechart bucket count.
    pub max_timechart_buckets: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_group_cardinality: 10_000,
            record_scan_cap: 1_000_000,
            follow_poll_interval: Duration::from_millis(100),
            max_context_records: 100,
            cancel_poll_stride: 1024,
            default_timechart_buckets: 50,
            max_timechart_buckets: 500,
        }
    }
}

/// The query engine.
///
/// Stateless apart from its collaborators: each call builds its own scanner
/// and merger state, so one engine value can serve concurrent queries.
#[derive(Debug, Clone)]
pub struct Engine {
    catalog: Arc<dyn Catalog>,
    tokenizer: Arc<dyn Tokenizer>,
    time_provider: Arc<dyn TimeProvider>,
    config: EngineConfig,
}

impl Engine {
    /// Create an engine over `catalog` using the default tokenizer policy,
    /// system clock, and configuration.
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self {
            catalog,
            tokenizer: Arc::new(tokenize::DefaultTokenizer::default()),
            time_provider: Arc::new(SystemProvider::new()),
            config: EngineConfig::default(),
        }
    }

    /// Use a custom tokenization policy. Must match the policy the indexes
    /// were built with.
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    /// Use a custom time source.
    pub fn with_time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    /// Override the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub(crate) fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    #[allow(dead_code)]
    pub(crate) fn time_provider(&self) -> &Arc<dyn TimeProvider> {
        &self.time_provider
    }

    /// Resolve the chunk store for `store_id` or fail with
    /// [`Error::UnknownStore`].
    pub(crate) fn chunk_store(&self, store_id: StoreId) -> Result<Arc<dyn ChunkStore>> {
        self.catalog
            .chunk_store(store_id)
            .ok_or(Error::UnknownStore { store_id })
    }
}
