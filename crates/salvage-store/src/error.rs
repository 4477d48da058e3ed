//! Error types for chunk storage operations.

use salvage_types::ChunkId;

/// Errors that can occur while persisting or loading chunks.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A chunk header could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Chunk data on disk does not match the hashes in its header.
    ///
    /// The chunk is treated as lost: the file is removed and the loss
    /// callback fires.
    #[error("chunk corruption detected for {id}: {reason}")]
    CorruptChunk {
        /// The chunk that was requested.
        id: ChunkId,
        /// What was wrong with it.
        reason: String,
    },
}
