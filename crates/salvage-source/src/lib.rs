//! Chunk sources for the install pipeline.
//!
//! The [`InstallChunkSource`] recycles chunks that already exist inside
//! previously installed builds: it plans prefetch batches from the
//! [`ReferenceTracker`](salvage_manifest::ReferenceTracker), rebuilds each
//! chunk from the file fragments the build's manifest lists, verifies it
//! and hands it to the [`ChunkStore`](salvage_store::ChunkStore).
//!
//! Sources are combined with [`ChainedChunkSource`], which asks each in
//! turn and passes along the requirements the earlier ones cannot satisfy.

mod chained;
mod config;
mod error;
mod install;
mod source;
mod stats;


pub use chained::ChainedChunkSource;
pub use config::{BATCH_FETCH_LIMIT, InstallSourceConfig};
pub use error::ChunkLoadError;
pub use install::{InstalledBuild, InstallChunkSource};
pub use source::{ChunkSource, Controllable, UnavailableChunksCallback};
pub use stats::{InstallSourceStats, StatsSnapshot};
