//! The engine's user-facing error taxonomy.

use crate::StoreError;
use data_types::{ChunkId, StoreId};
use snafu::Snafu;

/// Errors surfaced by engine entry points and their iterators.
///
/// Index unavailability is deliberately absent: a missing or failing index
/// only ever demotes the scanner to a runtime filter.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("invalid resume token: chunk {} no longer exists", chunk_id))]
    InvalidResumeToken { chunk_id: ChunkId },

    #[snafu(display("unknown store: {}", store_id))]
    UnknownStore { store_id: StoreId },

    #[snafu(display("unknown chunk: {}", chunk_id))]
    UnknownChunk { chunk_id: ChunkId },

    #[snafu(display("listing chunks of store {} failed: {}", store_id, source))]
    ListFailed {
        store_id: StoreId,
        source: StoreError,
    },

    #[snafu(display("opening cursor for chunk {} failed: {}", chunk_id, source))]
    OpenFailed {
        chunk_id: ChunkId,
        source: StoreError,
    },

    #[snafu(display(
        "seek to position {} in chunk {} failed: {}",
        position,
        chunk_id,
        source
    ))]
    SeekFailed {
        chunk_id: ChunkId,
        position: u64,
        source: StoreError,
    },

    #[snafu(display("reading from chunk {} failed: {}", chunk_id, source))]
    ReadFailed {
        chunk_id: ChunkId,
        source: StoreError,
    },

    #[snafu(display("unsupported pipeline shape: {}", reason))]
    UnsupportedPipeline { reason: String },

    #[snafu(display("unknown aggregate function: {}", name))]
    UnknownAggregate { name: String },

    #[snafu(display("invalid bin duration: {}", reason))]
    InvalidBinDuration { reason: String },

    #[snafu(display("context windows are not supported across multiple stores"))]
    MultiStoreNotSupported,

    #[snafu(display("query was canceled"))]
    Canceled,
}

/// Convenient result alias for engine operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
