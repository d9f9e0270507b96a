//! Scale-adaptive vector index.
//!
//! [`VectorIndexManager`] owns the in-memory vectors of every indexed chunk
//! and picks a search structure from the collection size N:
//!
//! | N | Strategy |
//! |---|----------|
//! | `N ≤ exact_threshold` | [`IndexStrategy::Exact`] linear scan |
//! | `≤ graph_threshold` | [`IndexStrategy::Graph`] single HNSW graph |
//! | larger | [`IndexStrategy::Hybrid`] k-means partitions, one graph each |
//!
//! # Concurrency
//!
//! Mutations are serialised by a writer mutex. Readers clone an `Arc` of the
//! active handle and search it under a shared lock. A rebuild snapshots the
//! entries, builds a fresh handle while the old one keeps serving and taking
//! writes, then replays those writes onto the fresh handle and swaps it in
//! under a brief write lock.
//!
//! A document can be staged: its vectors are indexed but hidden from
//! searches until it is published.
//!
//! Vectors are normalised on insert; similarity is the dot product of unit
//! vectors, clamped to `[-1, 1]`.

pub mod exact;
pub mod hnsw;
pub mod hybrid;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use crate::config::VectorIndexConfig;
use crate::embedding::normalize;
use crate::error::{IndexError, RagError, Result, Stage};
use exact::ExactIndex;
use hnsw::{HnswGraph, HnswParams};
use hybrid::HybridIndex;

/// Search structure backing the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndexStrategy {
    Exact,
    Graph,
    Hybrid,
}

impl IndexStrategy {
    /// Strategy for a collection of `n` vectors.
    pub fn select(n: usize, exact_threshold: usize, graph_threshold: usize) -> Self {
        if n <= exact_threshold {
            IndexStrategy::Exact
        } else if n <= graph_threshold {
            IndexStrategy::Graph
        } else {
            IndexStrategy::Hybrid
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStrategy::Exact => "EXACT",
            IndexStrategy::Graph => "GRAPH",
            IndexStrategy::Hybrid => "HYBRID",
        }
    }
}

impl fmt::Display for IndexStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an indexed vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKey {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_number: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_number: i64,
    pub similarity: f32,
}

/// A nearest-neighbour structure over unit vectors addressed by slot.
pub(crate) trait AnnIndex: Send + Sync {
    fn insert(&mut self, slot: u32, vector: Arc<[f32]>);
    fn remove(&mut self, slot: u32);
    /// Up to roughly `k` best slots passing `allow`, best first. May return
    /// more than `k` when scores tie at the cut-off.
    fn search(&self, query: &[f32], k: usize, allow: &dyn Fn(u32) -> bool) -> Vec<(u32, f32)>;
    fn len(&self) -> usize;
    fn tombstones(&self) -> usize;
}

pub(crate) fn similarity(a: &[f32], b: &[f32]) -> f32 {
    crate::embedding::dot(a, b).clamp(-1.0, 1.0)
}

/// Best `k` by score (slot asc on ties), extended with anything tied with
/// the k-th score.
pub(crate) fn top_with_ties(mut scored: Vec<(u32, f32)>, k: usize) -> Vec<(u32, f32)> {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    if k == 0 {
        return Vec::new();
    }
    if scored.len() > k {
        let cutoff = scored[k - 1].1;
        let keep = scored.iter().take_while(|(_, s)| *s >= cutoff).count();
        scored.truncate(keep);
    }
    scored
}

#[derive(Debug, Clone)]
struct Entry {
    chunk_id: String,
    document_id: String,
    chunk_number: i64,
    vector: Arc<[f32]>,
}

struct IndexState {
    ann: Box<dyn AnnIndex>,
    entries: HashMap<u32, Entry>,
    slots: HashMap<String, u32>,
    by_document: HashMap<String, BTreeSet<u32>>,
    next_slot: u32,
}

impl IndexState {
    fn remove_slot(&mut self, slot: u32) {
        if let Some(entry) = self.entries.remove(&slot) {
            self.ann.remove(slot);
            self.slots.remove(&entry.chunk_id);
            if let Some(set) = self.by_document.get_mut(&entry.document_id) {
                set.remove(&slot);
                if set.is_empty() {
                    self.by_document.remove(&entry.document_id);
                }
            }
        }
    }

    fn insert(&mut self, key: IndexKey, vector: Arc<[f32]>) {
        if let Some(old) = self.slots.get(&key.chunk_id).copied() {
            self.remove_slot(old);
        }
        let slot = self.next_slot;
        self.next_slot += 1;

        self.ann.insert(slot, vector.clone());
        self.slots.insert(key.chunk_id.clone(), slot);
        self.by_document
            .entry(key.document_id.clone())
            .or_default()
            .insert(slot);
        self.entries.insert(
            slot,
            Entry {
                chunk_id: key.chunk_id,
                document_id: key.document_id,
                chunk_number: key.chunk_number,
                vector,
            },
        );
    }
}

struct IndexHandle {
    strategy: IndexStrategy,
    state: RwLock<IndexState>,
}

/// A mutation, recorded while a rebuild is building so it can be replayed
/// onto the new handle before the swap.
#[derive(Debug, Clone)]
enum WriteOp {
    Upsert(IndexKey, Arc<[f32]>),
    Delete(String),
    DeleteDocument(String),
}

impl IndexState {
    fn remove_document(&mut self, document_id: &str) -> usize {
        let slots: Vec<u32> = self
            .by_document
            .get(document_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for slot in &slots {
            self.remove_slot(*slot);
        }
        slots.len()
    }

    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::Upsert(key, vector) => self.insert(key, vector),
            WriteOp::Delete(chunk_id) => {
                if let Some(slot) = self.slots.get(&chunk_id).copied() {
                    self.remove_slot(slot);
                }
            }
            WriteOp::DeleteDocument(document_id) => {
                self.remove_document(&document_id);
            }
        }
    }
}

/// Snapshot taken at the start of a rebuild.
pub(crate) struct RebuildPlan {
    from: IndexStrategy,
    target: IndexStrategy,
    entries: Vec<(u32, Entry)>,
    next_slot: u32,
}

pub struct VectorIndexManager {
    dimension: usize,
    config: VectorIndexConfig,
    /// Serialises mutations. Holds the journal while a rebuild is building.
    writer: Mutex<Option<Vec<WriteOp>>>,
    rebuilding: Mutex<()>,
    active: RwLock<Arc<IndexHandle>>,
    /// Documents whose vectors are indexed but not yet searchable.
    staged: RwLock<HashSet<String>>,
}

fn poisoned<T>(_: T) -> RagError {
    RagError::index(
        Stage::Index,
        IndexError::Corrupted("index lock poisoned".to_string()),
    )
}

impl VectorIndexManager {
    pub fn new(config: &VectorIndexConfig) -> Self {
        let handle = build_handle(config, IndexStrategy::Exact, Vec::new(), 0);
        Self {
            dimension: config.dimension,
            config: config.clone(),
            writer: Mutex::new(None),
            rebuilding: Mutex::new(()),
            active: RwLock::new(Arc::new(handle)),
            staged: RwLock::new(HashSet::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn handle(&self) -> Result<Arc<IndexHandle>> {
        Ok(self.active.read().map_err(poisoned)?.clone())
    }

    pub fn strategy(&self) -> Result<IndexStrategy> {
        Ok(self.handle()?.strategy)
    }

    /// Number of live vectors, staged documents included.
    pub fn len(&self) -> Result<usize> {
        let handle = self.handle()?;
        let state = handle.state.read().map_err(poisoned)?;
        Ok(state.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn has_document(&self, document_id: &str) -> Result<bool> {
        let handle = self.handle()?;
        let state = handle.state.read().map_err(poisoned)?;
        Ok(state.by_document.contains_key(document_id))
    }

    /// Hide `document_id` from searches until [`publish_document`] is called.
    ///
    /// [`publish_document`]: VectorIndexManager::publish_document
    pub fn stage_document(&self, document_id: &str) -> Result<()> {
        self.staged
            .write()
            .map_err(poisoned)?
            .insert(document_id.to_string());
        Ok(())
    }

    /// Make a staged document searchable.
    pub fn publish_document(&self, document_id: &str) -> Result<()> {
        self.staged.write().map_err(poisoned)?.remove(document_id);
        Ok(())
    }

    fn prepare(&self, chunk_id: &str, vector: &[f32]) -> Result<Arc<[f32]>> {
        if vector.len() != self.dimension {
            return Err(RagError::index(
                Stage::Index,
                IndexError::DimensionMismatch {
                    expected: self.dimension,
                    got: vector.len(),
                },
            ));
        }
        normalize(vector)
            .map(Arc::from)
            .ok_or_else(|| RagError::index(Stage::Index, IndexError::ZeroVector(chunk_id.to_string())))
    }

    /// Apply `ops` to the active handle, journaling them when a rebuild is
    /// in flight.
    fn commit(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut journal = self.writer.lock().map_err(poisoned)?;
        let handle = self.handle()?;
        let mut state = handle.state.write().map_err(poisoned)?;
        match journal.as_mut() {
            Some(log) => {
                for op in ops {
                    state.apply(op.clone());
                    log.push(op);
                }
            }
            None => ops.into_iter().for_each(|op| state.apply(op)),
        }
        Ok(())
    }

    /// Insert a vector, or atomically replace the one stored for `key.chunk_id`.
    pub fn upsert(&self, key: IndexKey, vector: &[f32]) -> Result<()> {
        let vector = self.prepare(&key.chunk_id, vector)?;
        self.commit(vec![WriteOp::Upsert(key, vector)])
    }

    /// Upsert many vectors. Nothing is applied unless every vector is valid.
    pub fn upsert_batch(&self, items: Vec<(IndexKey, Vec<f32>)>) -> Result<()> {
        let ops = items
            .into_iter()
            .map(|(key, v)| {
                let vector = self.prepare(&key.chunk_id, &v)?;
                Ok(WriteOp::Upsert(key, vector))
            })
            .collect::<Result<Vec<_>>>()?;
        self.commit(ops)
    }

    pub fn delete(&self, chunk_id: &str) -> Result<()> {
        let mut journal = self.writer.lock().map_err(poisoned)?;
        let handle = self.handle()?;
        let mut state = handle.state.write().map_err(poisoned)?;
        let slot = state
            .slots
            .get(chunk_id)
            .copied()
            .ok_or_else(|| RagError::not_found(Stage::Index, format!("chunk {}", chunk_id)))?;
        state.remove_slot(slot);
        if let Some(log) = journal.as_mut() {
            log.push(WriteOp::Delete(chunk_id.to_string()));
        }
        Ok(())
    }

    /// Remove every vector of a document. Returns how many were removed.
    pub fn delete_document(&self, document_id: &str) -> Result<usize> {
        let removed = {
            let mut journal = self.writer.lock().map_err(poisoned)?;
            let handle = self.handle()?;
            let mut state = handle.state.write().map_err(poisoned)?;
            if let Some(log) = journal.as_mut() {
                log.push(WriteOp::DeleteDocument(document_id.to_string()));
            }
            state.remove_document(document_id)
        };
        self.publish_document(document_id)?;
        Ok(removed)
    }

    /// Nearest chunks to `query`, optionally restricted to some documents.
    ///
    /// Sorted by similarity desc, then chunk_number asc, then chunk_id asc.
    /// Staged documents are invisible, including to the filter.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        document_filter: Option<&[String]>,
    ) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(RagError::index(
                Stage::Search,
                IndexError::DimensionMismatch {
                    expected: self.dimension,
                    got: query.len(),
                },
            ));
        }
        let query = normalize(query).ok_or_else(|| {
            RagError::index(Stage::Search, IndexError::ZeroVector("query".to_string()))
        })?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let staged = self.staged.read().map_err(poisoned)?.clone();
        let handle = self.handle()?;
        let state = handle.state.read().map_err(poisoned)?;

        let candidates = match document_filter {
            None if staged.is_empty() => state.ann.search(&query, top_k, &|_| true),
            None => {
                let visible = |slot: u32| {
                    state
                        .entries
                        .get(&slot)
                        .is_some_and(|e| !staged.contains(&e.document_id))
                };
                state.ann.search(&query, top_k, &visible)
            }
            Some(documents) => {
                let mut allowed: HashSet<u32> = HashSet::new();
                for document_id in documents {
                    let slots = state
                        .by_document
                        .get(document_id)
                        .filter(|_| !staged.contains(document_id))
                        .ok_or_else(|| {
                            RagError::not_found(Stage::Search, format!("document {}", document_id))
                        })?;
                    allowed.extend(slots.iter().copied());
                }

                if allowed.len() <= self.config.exact_threshold {
                    let scored = allowed
                        .iter()
                        .filter_map(|slot| state.entries.get(slot).map(|e| (*slot, similarity(&e.vector, &query))))
                        .collect();
                    top_with_ties(scored, top_k)
                } else {
                    state.ann.search(&query, top_k, &|slot| allowed.contains(&slot))
                }
            }
        };

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .filter_map(|(slot, sim)| {
                state.entries.get(&slot).map(|e| SearchHit {
                    chunk_id: e.chunk_id.clone(),
                    document_id: e.document_id.clone(),
                    chunk_number: e.chunk_number,
                    similarity: sim,
                })
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Re-evaluate the strategy for the current size and rebuild when it
    /// changed or when soft deletions exceed a quarter of the structure.
    /// Returns whether a rebuild happened.
    ///
    /// The new structure is built without holding the writer lock; writes
    /// made meanwhile are replayed onto it before it is swapped in.
    pub fn rebuild_if_needed(&self) -> Result<bool> {
        let _rebuilding = self.rebuilding.lock().map_err(poisoned)?;
        match self.begin_rebuild(false)? {
            Some(plan) => {
                self.finish_rebuild(plan)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Unconditionally rebuild with the strategy for the current size.
    pub fn rebuild(&self) -> Result<()> {
        let _rebuilding = self.rebuilding.lock().map_err(poisoned)?;
        if let Some(plan) = self.begin_rebuild(true)? {
            self.finish_rebuild(plan)?;
        }
        Ok(())
    }

    /// Snapshot the live entries and start journaling writes. `None` when
    /// no rebuild is needed and `force` is unset.
    pub(crate) fn begin_rebuild(&self, force: bool) -> Result<Option<RebuildPlan>> {
        let mut journal = self.writer.lock().map_err(poisoned)?;
        let current = self.handle()?;
        let state = current.state.read().map_err(poisoned)?;

        let n = state.entries.len();
        let tombstones = state.ann.tombstones();
        let target =
            IndexStrategy::select(n, self.config.exact_threshold, self.config.graph_threshold);
        let needs_compaction = tombstones * 4 > n + tombstones;
        if !force && target == current.strategy && !needs_compaction {
            return Ok(None);
        }

        let mut entries: Vec<(u32, Entry)> =
            state.entries.iter().map(|(s, e)| (*s, e.clone())).collect();
        entries.sort_by_key(|(slot, _)| *slot);
        *journal = Some(Vec::new());

        Ok(Some(RebuildPlan {
            from: current.strategy,
            target,
            entries,
            next_slot: state.next_slot,
        }))
    }

    /// Build the planned structure, replay journaled writes and swap it in.
    /// Only the replay and the swap hold the writer lock.
    pub(crate) fn finish_rebuild(&self, plan: RebuildPlan) -> Result<()> {
        let started = std::time::Instant::now();
        let count = plan.entries.len();
        let mut fresh = build_handle(&self.config, plan.target, plan.entries, plan.next_slot);

        let mut journal = self.writer.lock().map_err(poisoned)?;
        let replayed = {
            let state = fresh.state.get_mut().map_err(poisoned)?;
            let ops = journal.take().unwrap_or_default();
            let replayed = ops.len();
            ops.into_iter().for_each(|op| state.apply(op));
            replayed
        };
        *self.active.write().map_err(poisoned)? = Arc::new(fresh);
        drop(journal);

        tracing::info!(
            from = %plan.from,
            to = %plan.target,
            vectors = count,
            replayed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "vector index rebuilt"
        );
        Ok(())
    }
}

fn build_handle(
    config: &VectorIndexConfig,
    strategy: IndexStrategy,
    entries: Vec<(u32, Entry)>,
    next_slot: u32,
) -> IndexHandle {
    let params = HnswParams {
        m: config.m,
        ef_construction: config.ef_construction,
        ef_search: config.ef_search,
    };

    let mut ann: Box<dyn AnnIndex> = match strategy {
        IndexStrategy::Exact => Box::new(ExactIndex::default()),
        IndexStrategy::Graph => Box::new(HnswGraph::new(params)),
        IndexStrategy::Hybrid => {
            let vectors: Vec<(u32, Arc<[f32]>)> = entries
                .iter()
                .map(|(slot, e)| (*slot, e.vector.clone()))
                .collect();
            Box::new(HybridIndex::build(
                &vectors,
                config.partitions,
                config.probes,
                params,
            ))
        }
    };
    if strategy != IndexStrategy::Hybrid {
        for (slot, entry) in &entries {
            ann.insert(*slot, entry.vector.clone());
        }
    }

    let mut slots = HashMap::with_capacity(entries.len());
    let mut by_document: HashMap<String, BTreeSet<u32>> = HashMap::new();
    let mut map = HashMap::with_capacity(entries.len());
    for (slot, entry) in entries {
        slots.insert(entry.chunk_id.clone(), slot);
        by_document
            .entry(entry.document_id.clone())
            .or_default()
            .insert(slot);
        map.insert(slot, entry);
    }

    IndexHandle {
        strategy,
        state: RwLock::new(IndexState {
            ann,
            entries: map,
            slots,
            by_document,
            next_slot,
        }),
    }
}

/// Similarity desc, chunk_number asc, chunk_id asc.
pub fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then(a.chunk_number.cmp(&b.chunk_number))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

#[cfg(test)]
pub(crate) fn test_vectors(n: usize, dim: usize, seed: u64) -> Vec<Arc<[f32]>> {
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((state >> 33) as f32 / (1u64 << 31) as f32) * 2.0 - 1.0
    };
    (0..n)
        .map(|_| {
            let v: Vec<f32> = (0..dim).map(|_| next()).collect();
            Arc::from(normalize(&v).unwrap_or_else(|| vec![1.0; dim]))
        })
        .collect()
}
