//! The index itself: an in-memory centroid tree routing queries to
//! disk-resident posting lists, with incremental inserts, tombstone
//! deletes, compaction, and generation snapshots.
//!
//! Concurrency model: searches are lock-free after cloning the live
//! `Arc` handles; structural mutations (build, add, compact, save) are
//! serialized through a try-lock and fail fast with
//! [`VectorError::ConcurrentMutation`] instead of queueing. The head is
//! copy-on-write: mutators clone it, adjust the clone, persist, then
//! swap the shared handle.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::config::IndexConfig;
use crate::distance::{distance, Metric};
use crate::error::{Result, VectorError};
use crate::head::{ClusterId, ClusterParams, HeadIndex};
use crate::meta::{FileMetadataStore, MetadataStore};
use crate::persist::{self, GenerationLayout, Manifest};
use crate::posting::{PostingEntry, PostingStore};
use crate::query::{QueryResult, ResultSlot, TopK};
use crate::tombstone::DeletedIdSet;

const BUILD_SEED: u64 = 0x5449_4552;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexState {
    Empty,
    Building,
    Ready,
    Updating,
}

#[derive(Clone, Copy, Debug)]
pub struct SearchOptions {
    pub with_metadata: bool,
    pub with_vector: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            with_metadata: true,
            with_vector: false,
        }
    }
}

/// What a compaction pass actually did.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompactionReport {
    pub clusters_rewritten: usize,
    pub clusters_merged: usize,
    pub entries_dropped: usize,
    pub vectors_purged: usize,
}

struct Inner {
    layout: GenerationLayout,
    config: RwLock<IndexConfig>,
    state: RwLock<IndexState>,
    // structural mutations fail fast rather than queue
    mutation: Mutex<()>,
    // serializes manifest rewrites from add/delete/compact
    counters: Mutex<()>,
    head: RwLock<Option<Arc<HeadIndex>>>,
    postings: RwLock<Option<Arc<PostingStore>>>,
    deleted: RwLock<Option<Arc<DeletedIdSet>>>,
    meta: RwLock<Option<Arc<FileMetadataStore>>>,
    live_gen: RwLock<Option<String>>,
    next_vid: AtomicI64,
    samples: AtomicUsize,
}

/// Cheaply clonable handle; all clones share one index instance.
#[derive(Clone)]
pub struct TierIndex {
    inner: Arc<Inner>,
}

impl TierIndex {
    /// Fresh, empty index rooted at `root`. Nothing is written until
    /// the first build.
    pub fn create(root: impl AsRef<Path>, mut config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let layout = GenerationLayout::new(root.as_ref());
        fs::create_dir_all(layout.root())?;
        Ok(TierIndex {
            inner: Arc::new(Inner {
                layout,
                config: RwLock::new(config),
                state: RwLock::new(IndexState::Empty),
                mutation: Mutex::new(()),
                counters: Mutex::new(()),
                head: RwLock::new(None),
                postings: RwLock::new(None),
                deleted: RwLock::new(None),
                meta: RwLock::new(None),
                live_gen: RwLock::new(None),
                next_vid: AtomicI64::new(0),
                samples: AtomicUsize::new(0),
            }),
        })
    }

    /// Open the generation `CURRENT` points at. Head or manifest
    /// corruption is fatal here; posting logs tolerate torn tails.
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let layout = GenerationLayout::new(root.as_ref());
        let Some(gen) = layout.read_current()? else {
            return Err(VectorError::config(format!(
                "no generation published under {}",
                layout.root().display()
            )));
        };
        let dir = layout.generation_dir(&gen);
        let manifest = persist::read_manifest(&dir)?;
        let head = persist::read_head(&dir)?;
        let postings = PostingStore::open(layout.postings_dir(&gen))?;
        let deleted = DeletedIdSet::open(dir.join(persist::DELETED_FILE))?;
        let meta = FileMetadataStore::open(dir.join(persist::METADATA_FILE))?;
        tracing::info!(
            generation = %gen,
            samples = manifest.sample_count,
            deleted = deleted.len(),
            clusters = head.cluster_count(),
            "index loaded"
        );
        Ok(TierIndex {
            inner: Arc::new(Inner {
                layout,
                config: RwLock::new(manifest.config.clone()),
                state: RwLock::new(IndexState::Ready),
                mutation: Mutex::new(()),
                counters: Mutex::new(()),
                head: RwLock::new(Some(Arc::new(head))),
                postings: RwLock::new(Some(Arc::new(postings))),
                deleted: RwLock::new(Some(Arc::new(deleted))),
                meta: RwLock::new(Some(Arc::new(meta))),
                live_gen: RwLock::new(Some(gen)),
                next_vid: AtomicI64::new(manifest.next_vid),
                samples: AtomicUsize::new(manifest.sample_count),
            }),
        })
    }

    pub fn state(&self) -> IndexState {
        *self.inner.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == IndexState::Ready
    }

    /// Total vectors ever assigned (tombstoned ones included until
    /// compaction purges them).
    pub fn sample_count(&self) -> usize {
        self.inner.samples.load(AtomicOrdering::Relaxed)
    }

    pub fn deleted_count(&self) -> usize {
        self.inner
            .deleted
            .read()
            .as_ref()
            .map(|d| d.len())
            .unwrap_or(0)
    }

    pub fn dim(&self) -> usize {
        self.inner
            .head
            .read()
            .as_ref()
            .map(|h| h.dim())
            .unwrap_or(0)
    }

    pub fn config(&self) -> IndexConfig {
        self.inner.config.read().clone()
    }

    pub fn cluster_count(&self) -> usize {
        self.inner
            .head
            .read()
            .as_ref()
            .map(|h| h.cluster_count())
            .unwrap_or(0)
    }

    /// Build the index. From `Empty` (or with `replace`) this is a full
    /// rebuild assigning vids `0..n` in input order; on a `Ready` index
    /// without `replace` it extends in place, exactly like [`Self::add`].
    /// Fails with `ConcurrentMutation` if another structural mutation is
    /// in flight.
    pub fn build(
        &self,
        vectors: &[Vec<f32>],
        metadata: Option<&[Vec<u8>]>,
        dim: usize,
        replace: bool,
    ) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner
            .mutation
            .try_lock()
            .ok_or(VectorError::ConcurrentMutation)?;
        let prior = *inner.state.read();
        match prior {
            IndexState::Empty => *inner.state.write() = IndexState::Building,
            IndexState::Ready if replace => *inner.state.write() = IndexState::Updating,
            IndexState::Ready => {
                // already built: extend in place
                if dim != self.dim() {
                    return Err(VectorError::DimMismatch {
                        expected: self.dim(),
                        got: dim,
                    });
                }
                return self.add_locked(vectors, metadata).map(|_| ());
            }
            IndexState::Building | IndexState::Updating => {
                return Err(VectorError::ConcurrentMutation)
            }
        }
        let result = self.build_locked(vectors, metadata, dim);
        match &result {
            Ok(()) => *inner.state.write() = IndexState::Ready,
            Err(_) => *inner.state.write() = prior,
        }
        result
    }

    fn build_locked(
        &self,
        vectors: &[Vec<f32>],
        metadata: Option<&[Vec<u8>]>,
        dim: usize,
    ) -> Result<()> {
        let inner = &self.inner;
        let config = inner.config.read().clone();
        for v in vectors {
            if v.len() != dim {
                return Err(VectorError::DimMismatch {
                    expected: dim,
                    got: v.len(),
                });
            }
        }
        if let Some(meta) = metadata {
            if meta.len() != vectors.len() {
                return Err(VectorError::config(
                    "metadata count does not match vector count",
                ));
            }
        }

        let params = ClusterParams {
            target_clusters: config.target_clusters,
            max_leaf: config.max_cluster_size,
            kmeans_iters: config.kmeans_iters,
            seed: BUILD_SEED,
        };
        let (mut head, assignment) = if vectors.len() > config.training_sample {
            // train on a sample, then route the full collection through
            // the trained tree
            let mut rng = StdRng::seed_from_u64(BUILD_SEED);
            let mut picks: Vec<usize> = (0..vectors.len()).collect();
            picks.shuffle(&mut rng);
            picks.truncate(config.training_sample);
            let sample: Vec<Vec<f32>> = picks.iter().map(|&i| vectors[i].clone()).collect();
            let (head, _) = HeadIndex::build(&sample, dim, config.metric, params)?;
            (head, Vec::new())
        } else {
            HeadIndex::build(vectors, dim, config.metric, params)?
        };

        // bucket every vector into its replication targets
        let mut buckets: HashMap<ClusterId, Vec<PostingEntry>> = HashMap::new();
        for (i, vector) in vectors.iter().enumerate() {
            let vid = i as i64;
            let targets = if config.replication == 1 && assignment.len() == vectors.len() {
                vec![assignment[i]]
            } else {
                head.assign(vector, config.replication)?
            };
            for cluster in targets {
                buckets.entry(cluster).or_default().push(PostingEntry {
                    vid,
                    vector: vector.clone(),
                });
            }
        }
        for cluster in head.cluster_ids() {
            let count = buckets.get(&cluster).map(|b| b.len()).unwrap_or(0);
            head.set_members(cluster, count)?;
        }

        let gen = inner.layout.next_generation_name()?;
        let dir = inner.layout.generation_dir(&gen);
        fs::create_dir_all(&dir)?;
        let postings = PostingStore::open(inner.layout.postings_dir(&gen))?;
        for (cluster, batch) in &buckets {
            postings.append_batch(*cluster, batch)?;
        }
        persist::write_head(&dir, &head)?;

        let deleted = DeletedIdSet::open(dir.join(persist::DELETED_FILE))?;
        let meta_store = FileMetadataStore::open(dir.join(persist::METADATA_FILE))?;
        if let Some(meta) = metadata {
            for (i, value) in meta.iter().enumerate() {
                meta_store.put(i as i64, value.clone());
            }
            meta_store.save()?;
        }
        let manifest = Manifest::new(
            config,
            vectors.len() as i64,
            vectors.len(),
            0,
            head.cluster_count(),
        );
        persist::write_manifest(&dir, &manifest)?;
        inner.layout.publish(&gen)?;

        *inner.head.write() = Some(Arc::new(head));
        *inner.postings.write() = Some(Arc::new(postings));
        *inner.deleted.write() = Some(Arc::new(deleted));
        *inner.meta.write() = Some(Arc::new(meta_store));
        *inner.live_gen.write() = Some(gen);
        inner
            .next_vid
            .store(vectors.len() as i64, AtomicOrdering::SeqCst);
        inner.samples.store(vectors.len(), AtomicOrdering::SeqCst);
        Ok(())
    }

    /// Incremental insert. Returns the assigned vids, dense and in
    /// input order. Delegates to a full build when the index is empty.
    pub fn add(
        &self,
        vectors: &[Vec<f32>],
        metadata: Option<&[Vec<u8>]>,
    ) -> Result<Vec<i64>> {
        if self.state() == IndexState::Empty {
            let dim = vectors.first().map(|v| v.len()).unwrap_or(0);
            if dim == 0 {
                return Err(VectorError::config("cannot infer dimension from empty add"));
            }
            self.build(vectors, metadata, dim, false)?;
            return Ok((0..vectors.len() as i64).collect());
        }

        let inner = &self.inner;
        let _guard = inner
            .mutation
            .try_lock()
            .ok_or(VectorError::ConcurrentMutation)?;
        if *inner.state.read() != IndexState::Ready {
            return Err(VectorError::NotReady);
        }
        self.add_locked(vectors, metadata)
    }

    /// Incremental core; caller holds the mutation lock and has checked
    /// the state.
    fn add_locked(
        &self,
        vectors: &[Vec<f32>],
        metadata: Option<&[Vec<u8>]>,
    ) -> Result<Vec<i64>> {
        let inner = &self.inner;
        if vectors.is_empty() {
            return Ok(Vec::new());
        }
        let config = inner.config.read().clone();
        let head = inner
            .head
            .read()
            .as_ref()
            .cloned()
            .ok_or(VectorError::NotReady)?;
        let postings = inner
            .postings
            .read()
            .as_ref()
            .cloned()
            .ok_or(VectorError::NotReady)?;
        for v in vectors {
            if v.len() != head.dim() {
                return Err(VectorError::DimMismatch {
                    expected: head.dim(),
                    got: v.len(),
                });
            }
        }
        if let Some(meta) = metadata {
            if meta.len() != vectors.len() {
                return Err(VectorError::config(
                    "metadata count does not match vector count",
                ));
            }
        }

        let first = inner
            .next_vid
            .fetch_add(vectors.len() as i64, AtomicOrdering::SeqCst);
        let vids: Vec<i64> = (0..vectors.len() as i64).map(|i| first + i).collect();

        let mut buckets: HashMap<ClusterId, Vec<PostingEntry>> = HashMap::new();
        for (vid, vector) in vids.iter().zip(vectors) {
            for cluster in head.assign(vector, config.replication)? {
                buckets.entry(cluster).or_default().push(PostingEntry {
                    vid: *vid,
                    vector: vector.clone(),
                });
            }
        }

        let mut new_head = (*head).clone();
        for (cluster, batch) in &buckets {
            postings.append_batch(*cluster, batch)?;
            new_head.add_members(*cluster, batch.len())?;
        }
        inner
            .samples
            .fetch_add(vectors.len(), AtomicOrdering::SeqCst);

        if let Some(meta) = metadata {
            let store = inner
                .meta
                .read()
                .as_ref()
                .cloned()
                .ok_or(VectorError::NotReady)?;
            for (vid, value) in vids.iter().zip(meta) {
                store.put(*vid, value.clone());
            }
            store.save()?;
        }

        // split any posting list the batch pushed past the bound
        let overflow: Vec<ClusterId> = buckets
            .keys()
            .copied()
            .filter(|&c| {
                new_head
                    .members(c)
                    .map(|m| m > config.max_cluster_size)
                    .unwrap_or(false)
            })
            .collect();
        let mut retired = Vec::new();
        for cluster in overflow {
            self.split_cluster(&mut new_head, &postings, cluster, &config, &mut retired)?;
        }

        let gen = inner.live_gen.read().clone().ok_or(VectorError::NotReady)?;
        let dir = inner.layout.generation_dir(&gen);
        persist::write_head(&dir, &new_head)?;
        *inner.head.write() = Some(Arc::new(new_head));
        // only after the swap: searches still routed by the old tree
        // must keep finding the pre-split logs
        for cluster in retired {
            postings.remove(cluster)?;
        }
        self.persist_counters(&dir, &config)?;
        tracing::debug!(added = vectors.len(), first_vid = first, "vectors added");
        Ok(vids)
    }

    /// Tombstone a vid. Durable before returning. Unknown or already
    /// deleted vids are a no-op returning `false`.
    pub fn delete(&self, vid: i64) -> Result<bool> {
        let inner = &self.inner;
        if *inner.state.read() != IndexState::Ready {
            return Err(VectorError::NotReady);
        }
        if vid < 0 || vid >= inner.next_vid.load(AtomicOrdering::SeqCst) {
            return Ok(false);
        }
        // insert under the held read guard so a save swapping the set
        // in cannot slip between the clone and the append
        let inserted = {
            let guard = inner.deleted.read();
            let deleted = guard.as_ref().ok_or(VectorError::NotReady)?;
            deleted.insert(vid)?
        };
        if inserted {
            let config = inner.config.read().clone();
            let gen = inner.live_gen.read().clone().ok_or(VectorError::NotReady)?;
            self.persist_counters(&inner.layout.generation_dir(&gen), &config)?;
            tracing::debug!(vid, "vector tombstoned");
        }
        Ok(inserted)
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<QueryResult> {
        self.search_with_options(query, k, SearchOptions::default())
    }

    /// Approximate nearest neighbors. The result always carries
    /// `batch_capacity` slots; unused ones keep the sentinel vid.
    pub fn search_with_options(
        &self,
        query: &[f32],
        k: usize,
        options: SearchOptions,
    ) -> Result<QueryResult> {
        let inner = &self.inner;
        if *inner.state.read() != IndexState::Ready {
            return Err(VectorError::NotReady);
        }
        if k == 0 {
            return Err(VectorError::config("k must be positive"));
        }
        let config = inner.config.read().clone();
        let head = inner
            .head
            .read()
            .as_ref()
            .cloned()
            .ok_or(VectorError::NotReady)?;
        let postings = inner
            .postings
            .read()
            .as_ref()
            .cloned()
            .ok_or(VectorError::NotReady)?;
        let deleted = inner
            .deleted
            .read()
            .as_ref()
            .cloned()
            .ok_or(VectorError::NotReady)?;
        if query.len() != head.dim() {
            return Err(VectorError::DimMismatch {
                expected: head.dim(),
                got: query.len(),
            });
        }

        let k = k.min(config.batch_capacity);
        let candidates = head.nearest_centroids(query, config.search_fanout)?;
        let mut topk = TopK::new(k);
        let mut kept_vectors: HashMap<i64, Vec<f32>> = HashMap::new();
        let mut seen: HashSet<i64> = HashSet::new();
        let mut attempted = 0usize;
        let mut failed = 0usize;
        let mut first_error: Option<VectorError> = None;

        // fetch eagerly in parallel past the threshold, lazily below it
        // so early termination can skip the IO entirely
        let mut prefetched = if candidates.len() >= config.parallel_fetch_min {
            let lists: Vec<Result<Arc<Vec<PostingEntry>>>> = candidates
                .par_iter()
                .map(|&(cluster, _)| postings.read(cluster))
                .collect();
            Some(lists.into_iter())
        } else {
            None
        };

        for &(cluster, centroid_dist) in &candidates {
            if let Some(threshold) = topk.threshold() {
                if centroid_dist > threshold * (1.0 + config.pruning_slack) {
                    break;
                }
            }
            attempted += 1;
            let fetched = prefetched
                .as_mut()
                .and_then(|lists| lists.next())
                .unwrap_or_else(|| postings.read(cluster));
            let entries = match fetched {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(cluster, error = %e, "posting fetch failed, skipping cluster");
                    failed += 1;
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    continue;
                }
            };
            for entry in entries.iter() {
                if deleted.contains(entry.vid) || !seen.insert(entry.vid) {
                    continue;
                }
                let d = distance(config.metric, query, &entry.vector);
                if topk.push(entry.vid, d) && options.with_vector {
                    kept_vectors.insert(entry.vid, entry.vector.clone());
                }
            }
        }

        // a lone bad cluster only costs recall; losing the majority of
        // the candidate set is a failed search
        if failed > 0 && failed * 2 > attempted {
            return Err(first_error.unwrap_or_else(|| {
                VectorError::corruption("majority of posting fetches failed")
            }));
        }

        let meta_store = if options.with_metadata {
            inner.meta.read().as_ref().cloned()
        } else {
            None
        };
        let mut result = QueryResult::with_capacity(config.batch_capacity);
        result.fill(topk.into_sorted().into_iter().map(|(vid, dist)| ResultSlot {
            vid,
            distance: dist,
            metadata: meta_store.as_ref().and_then(|m| m.get(vid)),
            vector: kept_vectors.remove(&vid),
        }));
        Ok(result)
    }

    /// Rewrite posting lists dropping tombstoned entries, merge
    /// clusters that fell under the size floor, and clear the purged
    /// tombstones.
    pub fn compact(&self) -> Result<CompactionReport> {
        let inner = &self.inner;
        let _guard = inner
            .mutation
            .try_lock()
            .ok_or(VectorError::ConcurrentMutation)?;
        if *inner.state.read() != IndexState::Ready {
            return Err(VectorError::NotReady);
        }
        let config = inner.config.read().clone();
        let head = inner
            .head
            .read()
            .as_ref()
            .cloned()
            .ok_or(VectorError::NotReady)?;
        let postings = inner
            .postings
            .read()
            .as_ref()
            .cloned()
            .ok_or(VectorError::NotReady)?;
        let deleted = inner
            .deleted
            .read()
            .as_ref()
            .cloned()
            .ok_or(VectorError::NotReady)?;

        let start_set: HashSet<i64> = deleted.snapshot().into_iter().collect();
        let mut new_head = (*head).clone();
        let mut report = CompactionReport::default();
        let mut purged: HashSet<i64> = HashSet::new();

        for cluster in new_head.cluster_ids() {
            let entries = postings.read(cluster)?;
            let live: Vec<PostingEntry> = entries
                .iter()
                .filter(|e| !start_set.contains(&e.vid))
                .cloned()
                .collect();
            if live.len() != entries.len() {
                for entry in entries.iter() {
                    if start_set.contains(&entry.vid) {
                        purged.insert(entry.vid);
                    }
                }
                report.entries_dropped += entries.len() - live.len();
                report.clusters_rewritten += 1;
                postings.rewrite(cluster, &live)?;
            }
            new_head.set_members(cluster, live.len())?;
        }

        // fold undersized clusters into their nearest neighbor
        let mut retired = Vec::new();
        if new_head.cluster_count() > 1 {
            let undersized: Vec<ClusterId> = new_head
                .cluster_ids()
                .into_iter()
                .filter(|&c| {
                    new_head
                        .members(c)
                        .map(|m| m < config.min_cluster_size)
                        .unwrap_or(false)
                })
                .collect();
            for cluster in undersized {
                if new_head.cluster_count() <= 1 {
                    break;
                }
                let centroid = new_head.centroid(cluster)?.to_vec();
                let target = new_head
                    .nearest_centroids(&centroid, 2)?
                    .into_iter()
                    .map(|(c, _)| c)
                    .find(|&c| c != cluster);
                let Some(target) = target else { continue };
                let moving = postings.read(cluster)?;
                if !moving.is_empty() {
                    postings.append_batch(target, &moving)?;
                    new_head.add_members(target, moving.len())?;
                }
                new_head.retire_leaf(cluster)?;
                retired.push(cluster);
                report.clusters_merged += 1;
            }
        }

        // a merge target can overflow; split it back under the bound
        let overflow: Vec<ClusterId> = new_head
            .cluster_ids()
            .into_iter()
            .filter(|&c| {
                new_head
                    .members(c)
                    .map(|m| m > config.max_cluster_size)
                    .unwrap_or(false)
            })
            .collect();
        for cluster in overflow {
            self.split_cluster(&mut new_head, &postings, cluster, &config, &mut retired)?;
        }

        report.vectors_purged = purged.len();
        if report.vectors_purged > 0 {
            let meta_store = inner.meta.read().as_ref().cloned();
            if let Some(store) = meta_store {
                for vid in &purged {
                    store.delete(*vid);
                }
                store.save()?;
            }
            let samples = inner.samples.load(AtomicOrdering::SeqCst);
            inner
                .samples
                .store(samples.saturating_sub(purged.len()), AtomicOrdering::SeqCst);
        }

        let gen = inner.live_gen.read().clone().ok_or(VectorError::NotReady)?;
        let dir = inner.layout.generation_dir(&gen);
        persist::write_head(&dir, &new_head)?;
        *inner.head.write() = Some(Arc::new(new_head));
        // only after the swap: searches still routed by the old tree
        // must keep finding the pre-merge logs
        for cluster in retired {
            postings.remove(cluster)?;
        }

        deleted.purge(&start_set)?;
        self.persist_counters(&dir, &config)?;
        tracing::info!(
            rewritten = report.clusters_rewritten,
            merged = report.clusters_merged,
            dropped = report.entries_dropped,
            "compaction finished"
        );
        Ok(report)
    }

    /// Snapshot the live index into a fresh generation and publish it.
    /// Returns the generation name.
    pub fn save(&self) -> Result<String> {
        let inner = &self.inner;
        let _guard = inner
            .mutation
            .try_lock()
            .ok_or(VectorError::ConcurrentMutation)?;
        if *inner.state.read() != IndexState::Ready {
            return Err(VectorError::NotReady);
        }
        let config = inner.config.read().clone();
        let head = inner
            .head
            .read()
            .as_ref()
            .cloned()
            .ok_or(VectorError::NotReady)?;
        let postings = inner
            .postings
            .read()
            .as_ref()
            .cloned()
            .ok_or(VectorError::NotReady)?;
        let deleted = inner
            .deleted
            .read()
            .as_ref()
            .cloned()
            .ok_or(VectorError::NotReady)?;
        let meta_store = inner
            .meta
            .read()
            .as_ref()
            .cloned()
            .ok_or(VectorError::NotReady)?;

        let gen = inner.layout.next_generation_name()?;
        let dir = inner.layout.generation_dir(&gen);
        let postings_dir = inner.layout.postings_dir(&gen);
        fs::create_dir_all(&postings_dir)?;
        for cluster in head.cluster_ids() {
            postings.copy_into(cluster, &postings_dir)?;
        }
        persist::write_head(&dir, &head)?;
        // snapshot from memory, never copy a file another thread is
        // appending to
        DeletedIdSet::write_snapshot(&dir.join(persist::DELETED_FILE), &deleted.snapshot())?;
        meta_store.save_to(&dir.join(persist::METADATA_FILE))?;
        let manifest = Manifest::new(
            config,
            inner.next_vid.load(AtomicOrdering::SeqCst),
            inner.samples.load(AtomicOrdering::SeqCst),
            deleted.len(),
            head.cluster_count(),
        );
        persist::write_manifest(&dir, &manifest)?;
        inner.layout.publish(&gen)?;

        // serve from the new generation so later appends land there
        *inner.postings.write() = Some(Arc::new(PostingStore::open(&postings_dir)?));
        {
            // swap under the write lock; deletes insert under the read
            // guard, so anything that raced in since the snapshot is
            // still in the old set and gets re-appended here
            let mut slot = inner.deleted.write();
            let fresh = DeletedIdSet::open(dir.join(persist::DELETED_FILE))?;
            for vid in deleted.snapshot() {
                if !fresh.contains(vid) {
                    fresh.insert(vid)?;
                }
            }
            *slot = Some(Arc::new(fresh));
        }
        *inner.meta.write() = Some(Arc::new(FileMetadataStore::open(
            dir.join(persist::METADATA_FILE),
        )?));
        *inner.live_gen.write() = Some(gen.clone());
        Ok(gen)
    }

    /// Split one overfull cluster. Ordering matters twice over: for
    /// crash safety the new posting files are written before the head
    /// swap on disk (an interruption leaves only orphan files), and the
    /// old log is not removed here at all — searches routed by the
    /// still-live old tree must keep finding it, so the caller deletes
    /// the `retired` logs after swapping the in-memory head.
    fn split_cluster(
        &self,
        head: &mut HeadIndex,
        postings: &PostingStore,
        cluster: ClusterId,
        config: &IndexConfig,
        retired: &mut Vec<ClusterId>,
    ) -> Result<()> {
        let entries = postings.read(cluster)?;
        if entries.len() <= config.max_cluster_size {
            return Ok(());
        }
        let parts = partition_entries(&entries, config.metric, config.kmeans_iters);
        if parts.len() < 2 {
            return Ok(());
        }
        let shapes: Vec<(Vec<f32>, usize)> = parts
            .iter()
            .map(|(centroid, members)| (centroid.clone(), members.len()))
            .collect();
        let new_ids = head.split_leaf(cluster, &shapes)?;
        for (id, (_, members)) in new_ids.iter().zip(&parts) {
            postings.append_batch(*id, members)?;
        }
        let gen = self
            .inner
            .live_gen
            .read()
            .clone()
            .ok_or(VectorError::NotReady)?;
        persist::write_head(&self.inner.layout.generation_dir(&gen), head)?;
        retired.push(cluster);
        tracing::info!(cluster, parts = new_ids.len(), "cluster split");
        // a lopsided split can leave a half still over the bound
        for id in new_ids {
            if head.members(id)? > config.max_cluster_size {
                self.split_cluster(head, postings, id, config, retired)?;
            }
        }
        Ok(())
    }

    fn persist_counters(&self, dir: &Path, config: &IndexConfig) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.counters.lock();
        let manifest = Manifest::new(
            config.clone(),
            inner.next_vid.load(AtomicOrdering::SeqCst),
            inner.samples.load(AtomicOrdering::SeqCst),
            self.deleted_count(),
            self.cluster_count(),
        );
        persist::write_manifest(dir, &manifest)
    }
}

/// Two-way k-means over posting entries for a leaf split. Falls back to
/// an order split when the data is too degenerate to partition.
fn partition_entries(
    entries: &[PostingEntry],
    metric: Metric,
    iters: usize,
) -> Vec<(Vec<f32>, Vec<PostingEntry>)> {
    let dim = entries[0].vector.len();
    let mut rng = StdRng::seed_from_u64(BUILD_SEED ^ entries.len() as u64);
    let mut seeds: Vec<&PostingEntry> = entries.iter().collect();
    seeds.shuffle(&mut rng);
    let mut centroids = vec![
        seeds[0].vector.clone(),
        seeds
            .iter()
            .find(|e| e.vector != seeds[0].vector)
            .map(|e| e.vector.clone())
            .unwrap_or_else(|| seeds[0].vector.clone()),
    ];

    let mut halves: Vec<Vec<PostingEntry>> = Vec::new();
    for _ in 0..iters.max(1) {
        halves = vec![Vec::new(), Vec::new()];
        for entry in entries {
            let d0 = distance(metric, &centroids[0], &entry.vector);
            let d1 = distance(metric, &centroids[1], &entry.vector);
            halves[usize::from(d1 < d0)].push(entry.clone());
        }
        for (c, half) in halves.iter().enumerate() {
            if !half.is_empty() {
                let mut mean = vec![0.0f32; dim];
                for entry in half {
                    for (dst, &src) in mean.iter_mut().zip(&entry.vector) {
                        *dst += src;
                    }
                }
                let inv = 1.0 / half.len() as f32;
                mean.iter_mut().for_each(|v| *v *= inv);
                centroids[c] = mean;
            }
        }
    }
    if halves.iter().any(|h| h.is_empty()) {
        // identical vectors: split by order so the bound still holds
        let mid = entries.len() / 2;
        halves = vec![entries[..mid].to_vec(), entries[mid..].to_vec()];
        centroids = vec![centroids[0].clone(), centroids[0].clone()];
    }
    centroids.into_iter().zip(halves).collect()
}
