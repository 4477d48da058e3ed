//! Per-chunk load failures.

use std::path::PathBuf;

use salvage_types::events::LoadOutcome;

/// Why a chunk could not be rebuilt from an installed build.
///
/// Every variant is local to one chunk: the source carries on and reports
/// the chunk as unavailable so another source can supply it.
#[derive(Debug, thiserror::Error)]
pub enum ChunkLoadError {
    /// No installed build can supply the chunk.
    #[error("chunk not available from any installed build")]
    NotFound,

    /// The manifest records neither a strong nor a weak hash.
    #[error("manifest has no hash for chunk")]
    MissingHashInfo,

    /// The manifest lists no fragments that rebuild the whole chunk.
    #[error("manifest has no complete part list for chunk")]
    MissingPartInfo,

    /// A source file could not be opened or read.
    #[error("failed to read {}: {source}", path.display())]
    OpenFileFail {
        /// The file that failed.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A source file is shorter than the fragment requires.
    #[error("{} is {actual} bytes, need at least {expected}", path.display())]
    IncorrectFileSize {
        /// The file that is too short.
        path: PathBuf,
        /// Minimum size the fragment needs.
        expected: u64,
        /// Actual size on disk.
        actual: u64,
    },

    /// The rebuilt bytes do not match the recorded hash.
    #[error("rebuilt chunk failed hash check")]
    HashCheckFailed,

    /// The source was aborted mid-load.
    #[error("load aborted")]
    Aborted,
}

impl ChunkLoadError {
    /// The matching event outcome.
    pub fn outcome(&self) -> LoadOutcome {
        match self {
            Self::NotFound => LoadOutcome::NotFound,
            Self::MissingHashInfo => LoadOutcome::MissingHashInfo,
            Self::MissingPartInfo => LoadOutcome::MissingPartInfo,
            Self::OpenFileFail { .. } => LoadOutcome::OpenFileFail,
            Self::IncorrectFileSize { .. } => LoadOutcome::IncorrectFileSize,
            Self::HashCheckFailed => LoadOutcome::HashCheckFailed,
            Self::Aborted => LoadOutcome::Aborted,
        }
    }
}
