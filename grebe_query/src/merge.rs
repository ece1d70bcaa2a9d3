//! K-way merging of per-chunk scanners into one `ingest_ts`-ordered record
//! stream, with resumable positions and cross-store deduplication.

use crate::{scan::ChunkScanner, Error, Result};
use data_types::{ChunkId, Record, ResumePosition, ResumeToken, StoreId, EXHAUSTED};
use grebe_time::Time;
use hashbrown::HashSet;
use std::{cmp::Ordering, collections::BinaryHeap};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Attribute carrying the ingester identity used for cross-store dedup.
pub(crate) const INGESTER_ID_ATTR: &str = "ingester_id";

/// One record waiting in the merge heap.
#[derive(Debug)]
struct MergeEntry {
    record: Record,
    /// Stream slot the record came from.
    slot: usize,
    /// Flips the heap into newest-first order.
    reverse: bool,
}

impl MergeEntry {
    fn key(&self) -> (Time, StoreId, ChunkId, u64) {
        (
            self.record.ingest_ts,
            self.record.store_id,
            self.record.chunk_id,
            self.record.position,
        )
    }
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the maximum; invert for forward order so the
        // earliest ingest_ts (with deterministic tie-breaks) pops first
        if self.reverse {
            self.key().cmp(&other.key())
        } else {
            other.key().cmp(&self.key())
        }
    }
}

/// The merging core shared by every search entry point.
///
/// Pulls each chunk scanner once to prime the heap, then repeatedly pops the
/// earliest entry, refills from the popped stream, and tracks last-yielded
/// positions so iteration can stop and resume at any point.
#[derive(Debug)]
pub(crate) struct MergeCore {
    streams: Vec<Option<ChunkScanner>>,
    heap: BinaryHeap<MergeEntry>,
    positions: Vec<ResumePosition>,
    reverse: bool,
    limit: Option<usize>,
    yielded: usize,
    initialized: bool,
    finished: bool,
    cancel: CancellationToken,
    dedup_ts: Option<Time>,
    dedup_ids: HashSet<String>,
}

impl MergeCore {
    /// Build a merge over `scanners`. `seed` carries positions from a resume
    /// token so chunks that are never pulled again keep their recorded
    /// state.
    pub(crate) fn new(
        scanners: Vec<ChunkScanner>,
        reverse: bool,
        limit: Option<usize>,
        cancel: CancellationToken,
        seed: Vec<ResumePosition>,
    ) -> Self {
        Self {
            streams: scanners.into_iter().map(Some).collect(),
            heap: BinaryHeap::new(),
            positions: seed,
            reverse,
            limit,
            yielded: 0,
            initialized: false,
            finished: false,
            cancel,
            dedup_ts: None,
            dedup_ids: HashSet::new(),
        }
    }

    /// The next merged record, or `None` once every stream is exhausted or
    /// the limit was reached.
    pub(crate) async fn next(&mut self) -> Result<Option<Record>> {
        if self.finished {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            self.teardown();
            return Err(Error::Canceled);
        }

        // single-chunk fast path: no heap, pull straight from the scanner
        if self.streams.len() == 1 {
            return self.next_single().await;
        }

        if !self.initialized {
            self.initialized = true;
            for slot in 0..self.streams.len() {
                if let Err(e) = self.advance(slot).await {
                    self.teardown();
                    return Err(e);
                }
            }
        }

        loop {
            let Some(entry) = self.heap.pop() else {
                self.finished = true;
                return Ok(None);
            };

            let record = entry.record;
            let slot = entry.slot;
            self.set_position(record.store_id, record.chunk_id, record.position);

            if let Err(e) = self.advance(slot).await {
                self.teardown();
                return Err(e);
            }

            // records replicated across stores carry the same ingest
            // identity; yield the first copy only
            if self.is_duplicate(&record) {
                trace!(position = record.position, "skipping cross-store duplicate");
                continue;
            }

            self.yielded += 1;
            if let Some(limit) = self.limit {
                if self.yielded >= limit {
                    self.teardown();
                }
            }
            return Ok(Some(record));
        }
    }

    async fn next_single(&mut self) -> Result<Option<Record>> {
        let read = match self.streams[0].as_mut() {
            Some(scanner) => scanner.next().await,
            None => Ok(None),
        };
        match read {
            Ok(Some(record)) => {
                self.set_position(record.store_id, record.chunk_id, record.position);
                self.yielded += 1;
                if let Some(limit) = self.limit {
                    if self.yielded >= limit {
                        self.teardown();
                    }
                }
                Ok(Some(record))
            }
            Ok(None) => {
                if let Some(scanner) = self.streams[0].take() {
                    let meta = scanner.meta();
                    let (store_id, chunk_id) = (meta.store_id, meta.id);
                    drop(scanner);
                    self.set_position(store_id, chunk_id, EXHAUSTED);
                }
                self.finished = true;
                Ok(None)
            }
            Err(e) => {
                self.teardown();
                Err(e)
            }
        }
    }

    /// Serializable continuation state, or `None` when iteration finished
    /// with every touched chunk exhausted.
    pub(crate) fn resume_token(&self) -> Option<ResumeToken> {
        if self.finished && self.positions.iter().all(|p| p.is_exhausted()) {
            return None;
        }
        Some(ResumeToken {
            positions: self.positions.clone(),
        })
    }

    /// Pull one record from `slot` into the heap; an exhausted stream marks
    /// its chunk with the [`EXHAUSTED`] sentinel and is dropped.
    async fn advance(&mut self, slot: usize) -> Result<()> {
        let Some(scanner) = self.streams[slot].as_mut() else { return Ok(()) };

        match scanner.next().await? {
            Some(record) => {
                self.heap.push(MergeEntry {
                    record,
                    slot,
                    reverse: self.reverse,
                });
            }
            None => {
                let meta = scanner.meta();
                let (store_id, chunk_id) = (meta.store_id, meta.id);
                self.streams[slot] = None;
                self.set_position(store_id, chunk_id, EXHAUSTED);
            }
        }
        Ok(())
    }

    fn set_position(&mut self, store_id: StoreId, chunk_id: ChunkId, position: u64) {
        match self
            .positions
            .iter_mut()
            .find(|p| p.store_id == store_id && p.chunk_id == chunk_id)
        {
            Some(p) => p.position = position,
            None => self.positions.push(ResumePosition {
                store_id,
                chunk_id,
                position,
            }),
        }
    }

    fn is_duplicate(&mut self, record: &Record) -> bool {
        let Some(ingester_id) = record.attrs.get(INGESTER_ID_ATTR) else { return false };

        if self.dedup_ts != Some(record.ingest_ts) {
            self.dedup_ts = Some(record.ingest_ts);
            self.dedup_ids.clear();
        }
        !self.dedup_ids.insert(ingester_id.clone())
    }

    /// Drop every open stream, newest first, and stop iteration. The
    /// position map survives so a resume token can still be produced.
    fn teardown(&mut self) {
        self.finished = true;
        while let Some(stream) = self.streams.pop() {
            drop(stream);
        }
        self.heap.clear();
    }
}
