//! Chunk selection: filter out chunks that provably contain no matches for
//! a query's time bounds, before any cursor or index is opened.

use data_types::{ChunkId, ChunkMeta};
use grebe_time::Time;
use tracing::debug;

/// Normalized time bounds used for selection. All lower bounds are
/// inclusive, all upper bounds exclusive.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionBounds {
    /// `write_ts` lower bound.
    pub lower: Option<Time>,
    /// `write_ts` upper bound.
    pub upper: Option<Time>,
    /// `ingest_ts` lower bound.
    pub ingest_lower: Option<Time>,
    /// `ingest_ts` upper bound.
    pub ingest_upper: Option<Time>,
    /// `source_ts` lower bound.
    pub source_lower: Option<Time>,
    /// `source_ts` upper bound.
    pub source_upper: Option<Time>,
}

/// Select the chunks that may contain matching records.
///
/// Sealed chunks must overlap every provided bound; a `None` bound on the
/// chunk side means "unknown" and never rejects. Active chunks have open end
/// bounds and are always included. The result is ordered by `start_ts`
/// (descending for reverse queries) with the chunk ID as tie-break so runs
/// are deterministic.
pub fn select_chunks(
    mut chunks: Vec<ChunkMeta>,
    bounds: &SelectionBounds,
    chunk_ids: Option<&[ChunkId]>,
    reverse: bool,
) -> Vec<ChunkMeta> {
    chunks.retain(|chunk| {
        if let Some(ids) = chunk_ids {
            if !ids.contains(&chunk.id) {
                return false;
            }
        }

        if !chunk.sealed {
            return true;
        }

        let keep = overlaps(chunk.start_ts, chunk.end_ts, bounds.lower, bounds.upper)
            && overlaps(
                chunk.ingest_start,
                chunk.ingest_end,
                bounds.ingest_lower,
                bounds.ingest_upper,
            )
            && overlaps(
                chunk.source_start,
                chunk.source_end,
                bounds.source_lower,
                bounds.source_upper,
            );
        if !keep {
            debug!(chunk_id=%chunk.id, "chunk outside query time bounds, skipping");
        }
        keep
    });

    chunks.sort_by(|a, b| (a.start_ts, a.id).cmp(&(b.start_ts, b.id)));
    if reverse {
        chunks.reverse();
    }
    chunks
}

/// Whether `[chunk_start, chunk_end]` overlaps the query range
/// `[lower, upper)`. Unknown chunk bounds never reject.
fn overlaps(
    chunk_start: Option<Time>,
    chunk_end: Option<Time>,
    lower: Option<Time>,
    upper: Option<Time>,
) -> bool {
    if let (Some(end), Some(lower)) = (chunk_end, lower) {
        if end < lower {
            return false;
        }
    }
    if let (Some(start), Some(upper)) = (chunk_start, upper) {
        if start >= upper {
            return false;
        }
    }
    true
}
