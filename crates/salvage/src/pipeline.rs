//! Wiring of manifests, stores and sources for one target build.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use anyhow::{Context, Result, bail};
use salvage_manifest::{
    BuildManifest, ChunkManifest, ChunkReferenceTracker, ReferenceTracker, read_manifest_file,
};
use salvage_source::{
    ChainedChunkSource, ChunkSource, InstallChunkSource, InstalledBuild, StatsSnapshot,
};
use salvage_store::{ChunkStore, DiskChunkStore, MemoryChunkStore, ReferenceEvictionPolicy};
use salvage_types::ChunkId;
use salvage_types::events::{ChunkBooted, ChunkCleaned, ChunkLost, EventBus};
use tracing::{debug, info, warn};

use crate::config::CliConfig;

/// What the installed builds could contribute to the target.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Distinct chunks the target files need.
    pub required: usize,
    /// Producible required chunks per installed build root.
    pub per_build: Vec<(PathBuf, usize)>,
    /// Required chunks at least one build can produce.
    pub available: usize,
    /// Total size of the available chunks.
    pub available_bytes: u64,
}

/// Outcome of replaying the target's chunk references.
#[derive(Debug, Default)]
pub struct RecycleReport {
    /// References consumed.
    pub references: usize,
    /// References served by the source chain.
    pub served: usize,
    /// References no source could serve.
    pub missing: usize,
    /// Served chunks whose data did not match the target manifest.
    pub mismatched: usize,
    /// Chunks moved to the overflow store.
    pub booted: usize,
    /// Chunks dropped from memory once unreferenced.
    pub cleaned: usize,
    /// Chunks discarded while still needed.
    pub lost: usize,
    /// Install source counters.
    pub stats: StatsSnapshot,
}

/// A fully wired recycling pipeline.
pub struct Pipeline {
    target: Arc<BuildManifest>,
    required: HashSet<ChunkId>,
    builds: Vec<InstalledBuild>,
    tracker: Arc<ChunkReferenceTracker>,
    store: Arc<MemoryChunkStore>,
    install: Arc<InstallChunkSource>,
    chain: Arc<ChainedChunkSource>,
    events: EventBus,
}

impl Pipeline {
    /// Load every manifest named in `config` and connect the components.
    pub fn build(config: &CliConfig) -> Result<Self> {
        let target_path = config
            .builds
            .target
            .as_deref()
            .context("no target manifest configured ([builds] target or --target)")?;
        let target = Arc::new(
            read_manifest_file(target_path)
                .with_context(|| format!("failed to load target manifest {}", target_path.display()))?,
        );

        let files: HashSet<PathBuf> = if config.builds.files.is_empty() {
            target.files().iter().map(|f| f.filename.clone()).collect()
        } else {
            config.builds.files.iter().cloned().collect()
        };
        for file in &files {
            if target.file(file).is_none() {
                bail!("target manifest has no file {}", file.display());
            }
        }
        let tracker = Arc::new(ChunkReferenceTracker::from_manifest(&target, &files));
        let required = tracker.referenced_chunks();

        let mut builds = Vec::with_capacity(config.builds.installed.len());
        for entry in &config.builds.installed {
            let manifest = read_manifest_file(&entry.manifest).with_context(|| {
                format!("failed to load installed manifest {}", entry.manifest.display())
            })?;
            debug!(
                root = %entry.root.display(),
                version = manifest.build_version(),
                "loaded installed build"
            );
            builds.push(InstalledBuild {
                root: entry.root.clone(),
                manifest: Arc::new(manifest),
            });
        }

        let events = EventBus::new();
        let policy = Arc::new(ReferenceEvictionPolicy::new(tracker.clone()));
        let mut memory = MemoryChunkStore::new(config.memory_chunks(), policy).with_events(events.clone());
        let mut overflow: Option<Arc<DiskChunkStore>> = None;
        if let Some(dir) = &config.store.overflow_dir {
            let disk = Arc::new(
                DiskChunkStore::new(dir)
                    .with_context(|| format!("failed to open overflow store {}", dir.display()))?
                    .with_events(events.clone()),
            );
            memory = memory.with_overflow(disk.clone());
            overflow = Some(disk);
        }
        let store = Arc::new(memory);

        let install = Arc::new(
            InstallChunkSource::new(
                config.install_source_config()?,
                store.clone(),
                tracker.clone(),
                builds.clone(),
                &required,
            )
            .with_events(events.clone()),
        );
        let sources: Vec<Arc<dyn ChunkSource>> = vec![install.clone()];
        let chain = Arc::new(ChainedChunkSource::new(sources));

        chain.set_unavailable_chunks_callback(Arc::new(|ids: &HashSet<ChunkId>| {
            warn!(count = ids.len(), "chunks could not be recycled");
        }));
        store.set_lost_chunk_callback(repeat_on_loss(&chain));
        if let Some(disk) = &overflow {
            disk.set_lost_chunk_callback(repeat_on_loss(&chain));
        }

        info!(
            target = target.build_version(),
            files = files.len(),
            required = required.len(),
            builds = builds.len(),
            memory_chunks = store.size(),
            overflow = overflow.is_some(),
            "pipeline ready"
        );

        Ok(Self {
            target,
            required,
            builds,
            tracker,
            store,
            install,
            chain,
            events,
        })
    }

    /// Report which required chunks the installed builds can produce.
    pub fn scan(&self) -> ScanReport {
        let per_build = self
            .builds
            .iter()
            .map(|b| {
                let producible = b.manifest.enumerate_producible_chunks(&b.root, &self.required);
                (b.root.clone(), producible.len())
            })
            .collect();

        let available = self.chain.available_chunks();
        let available_bytes = available
            .iter()
            .filter_map(|id| self.target.chunk_info(id))
            .map(|info| u64::from(info.window_size))
            .sum();

        ScanReport {
            required: self.required.len(),
            per_build,
            available: available.len(),
            available_bytes,
        }
    }

    /// Consume the target's chunk references in order, the way an
    /// installer writing the files would.
    pub fn recycle(&self) -> RecycleReport {
        let mut booted = self.events.subscribe::<ChunkBooted>();
        let mut cleaned = self.events.subscribe::<ChunkCleaned>();
        let mut lost = self.events.subscribe::<ChunkLost>();
        let mut report = RecycleReport::default();

        while let Some(id) = self.tracker.next_references(1, &|_: &ChunkId| true).first().copied() {
            report.references += 1;
            match self.chain.get(&id) {
                Some(chunk) => {
                    report.served += 1;
                    let lock = chunk.acquire_lock();
                    let matches = self
                        .target
                        .chunk_info(&id)
                        .is_some_and(|info| info.hashes().matches(&lock.data));
                    if !matches {
                        warn!(%id, "recycled chunk does not match target manifest");
                        report.mismatched += 1;
                    }
                }
                None => report.missing += 1,
            }

            self.tracker.pop_reference(&id);
            if self.tracker.next_usage(&id).is_none() {
                self.store.remove(&id);
            }

            report.booted += booted.drain().len();
            report.cleaned += cleaned.drain().len();
            report.lost += lost.drain().len();
        }

        report.stats = self.install.stats();
        info!(
            references = report.references,
            served = report.served,
            missing = report.missing,
            recycled = report.stats.chunks_recycled,
            failed = report.stats.chunks_failed,
            "recycle complete"
        );
        report
    }
}

/// Loss callback that asks the chain to deliver the chunk again.
fn repeat_on_loss(chain: &Arc<ChainedChunkSource>) -> Box<dyn Fn(&ChunkId) + Send + Sync> {
    let chain: Weak<ChainedChunkSource> = Arc::downgrade(chain);
    Box::new(move |id: &ChunkId| {
        if let Some(chain) = chain.upgrade()
            && !chain.add_repeat_requirement(id)
        {
            debug!(%id, "lost chunk cannot be repeated");
        }
    })
}
