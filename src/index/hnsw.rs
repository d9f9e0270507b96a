//! HNSW (Hierarchical Navigable Small World) graph.
//!
//! A multi-layer proximity graph for approximate nearest-neighbour search:
//! - higher layers hold exponentially fewer nodes
//! - search starts at the top layer and greedily descends
//! - layer 0 is searched with a beam of width `ef`
//!
//! Vectors are stored unit-length, so similarity is a dot product.
//! Removal is a soft delete: the node keeps routing traffic but never
//! appears in results. The manager compacts by rebuilding.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use super::{similarity, AnnIndex};

const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Scored {
    score: f32,
    slot: u32,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        // NaN never reaches here: vectors are validated on insert
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.slot.cmp(&self.slot))
    }
}

#[derive(Debug)]
struct Node {
    vector: Arc<[f32]>,
    neighbors: Vec<Vec<u32>>,
    deleted: bool,
}

/// Tuning knobs for [`HnswGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HnswParams {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

#[derive(Debug)]
pub struct HnswGraph {
    m: usize,
    m_max0: usize,
    ef_construction: usize,
    ef_search: usize,
    level_mult: f64,
    nodes: HashMap<u32, Node>,
    entry_point: Option<u32>,
    level_max: usize,
    deleted: usize,
    rng_state: u64,
}

impl HnswGraph {
    pub fn new(params: HnswParams) -> Self {
        let m = params.m.max(2);
        Self {
            m,
            m_max0: m * 2,
            ef_construction: params.ef_construction.max(1),
            ef_search: params.ef_search.max(1),
            level_mult: 1.0 / (m as f64).ln(),
            nodes: HashMap::new(),
            entry_point: None,
            level_max: 0,
            deleted: 0,
            rng_state: 42,
        }
    }

    fn select_level(&mut self) -> usize {
        // LCG keeps level assignment deterministic across rebuilds
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        let r = ((self.rng_state >> 32) as f64 / u32::MAX as f64).max(1e-9);
        let level = (-r.ln() * self.level_mult).floor() as usize;
        level.min(MAX_LEVEL)
    }

    fn score(&self, slot: u32, query: &[f32]) -> f32 {
        match self.nodes.get(&slot) {
            Some(node) => similarity(&node.vector, query),
            None => f32::NEG_INFINITY,
        }
    }

    fn greedy_closest(&self, entry: u32, query: &[f32], level: usize) -> u32 {
        let mut current = entry;
        let mut current_score = self.score(current, query);

        loop {
            let mut changed = false;
            if let Some(node) = self.nodes.get(&current) {
                if let Some(layer) = node.neighbors.get(level) {
                    for &neighbor in layer {
                        let s = self.score(neighbor, query);
                        if s > current_score {
                            current = neighbor;
                            current_score = s;
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                return current;
            }
        }
    }

    /// Beam search at one layer. Every node is traversed, but only nodes
    /// passing `accept` enter the result set. Sorted by similarity desc.
    fn search_layer(
        &self,
        entry: u32,
        query: &[f32],
        ef: usize,
        level: usize,
        accept: &dyn Fn(u32) -> bool,
    ) -> Vec<Scored> {
        let mut visited: HashSet<u32> = HashSet::new();
        let mut candidates: BinaryHeap<Scored> = BinaryHeap::new();
        let mut results: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();

        let start = Scored {
            score: self.score(entry, query),
            slot: entry,
        };
        visited.insert(entry);
        candidates.push(start);
        if accept(entry) {
            results.push(Reverse(start));
        }

        while let Some(current) = candidates.pop() {
            let worst = results.peek().map(|r| r.0.score).unwrap_or(f32::NEG_INFINITY);
            if results.len() >= ef && current.score < worst {
                break;
            }

            let Some(node) = self.nodes.get(&current.slot) else {
                continue;
            };
            let Some(layer) = node.neighbors.get(level) else {
                continue;
            };

            for &neighbor in layer {
                if !visited.insert(neighbor) {
                    continue;
                }
                let scored = Scored {
                    score: self.score(neighbor, query),
                    slot: neighbor,
                };
                let worst = results.peek().map(|r| r.0.score).unwrap_or(f32::NEG_INFINITY);
                if results.len() < ef || scored.score > worst {
                    candidates.push(scored);
                    if accept(neighbor) {
                        results.push(Reverse(scored));
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<Scored> = results.into_iter().map(|r| r.0).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    fn add_neighbor(&mut self, from: u32, to: u32, level: usize) {
        if let Some(node) = self.nodes.get_mut(&from) {
            while node.neighbors.len() <= level {
                node.neighbors.push(Vec::new());
            }
            if !node.neighbors[level].contains(&to) {
                node.neighbors[level].push(to);
            }
        }
    }

    /// Keep only the `max` most similar neighbours of `slot` at `level`.
    fn prune_neighbors(&mut self, slot: u32, level: usize, max: usize) {
        let (vector, neighbors) = match self.nodes.get(&slot) {
            Some(node) if node.neighbors.get(level).map_or(0, Vec::len) > max => {
                (node.vector.clone(), node.neighbors[level].clone())
            }
            _ => return,
        };

        let mut scored: Vec<Scored> = neighbors
            .into_iter()
            .map(|n| Scored {
                score: self.score(n, &vector),
                slot: n,
            })
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        scored.truncate(max);

        if let Some(node) = self.nodes.get_mut(&slot) {
            node.neighbors[level] = scored.into_iter().map(|s| s.slot).collect();
        }
    }
}

impl AnnIndex for HnswGraph {
    fn insert(&mut self, slot: u32, vector: Arc<[f32]>) {
        self.insert_node(slot, vector)
    }

    fn remove(&mut self, slot: u32) {
        if let Some(node) = self.nodes.get_mut(&slot) {
            if !node.deleted {
                node.deleted = true;
                self.deleted += 1;
            }
        }
    }

    fn search(&self, query: &[f32], k: usize, allow: &dyn Fn(u32) -> bool) -> Vec<(u32, f32)> {
        let Some(mut entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        for level in (1..=self.level_max).rev() {
            entry = self.greedy_closest(entry, query, level);
        }

        let accept = |slot: u32| {
            self.nodes.get(&slot).is_some_and(|n| !n.deleted) && allow(slot)
        };
        let ef = self.ef_search.max(k);
        self.search_layer(entry, query, ef, 0, &accept)
            .into_iter()
            .map(|s| (s.slot, s.score))
            .collect()
    }

    fn len(&self) -> usize {
        self.nodes.len() - self.deleted
    }

    fn tombstones(&self) -> usize {
        self.deleted
    }
}

impl HnswGraph {
    fn insert_node(&mut self, slot: u32, vector: Arc<[f32]>) {
        if let Some(old) = self.nodes.get(&slot) {
            if old.deleted {
                self.deleted -= 1;
            }
            self.unlink(slot);
        }

        let level = self.select_level();
        let node = Node {
            vector: vector.clone(),
            neighbors: vec![Vec::new(); level + 1],
            deleted: false,
        };

        let Some(mut entry) = self.entry_point.filter(|ep| *ep != slot) else {
            self.nodes.insert(slot, node);
            self.entry_point = Some(slot);
            self.level_max = level;
            return;
        };
        self.nodes.insert(slot, node);

        for lc in ((level + 1)..=self.level_max).rev() {
            entry = self.greedy_closest(entry, &vector, lc);
        }

        let accept_all = |s: u32| s != slot;
        for lc in (0..=level.min(self.level_max)).rev() {
            let neighbors = self.search_layer(entry, &vector, self.ef_construction, lc, &accept_all);
            let limit = if lc == 0 { self.m_max0 } else { self.m };
            let selected: Vec<u32> = neighbors.iter().take(limit).map(|s| s.slot).collect();

            for &neighbor in &selected {
                self.add_neighbor(neighbor, slot, lc);
                self.add_neighbor(slot, neighbor, lc);
            }
            for &neighbor in &selected {
                self.prune_neighbors(neighbor, lc, limit);
            }
            if let Some(best) = neighbors.first() {
                entry = best.slot;
            }
        }

        if level > self.level_max {
            self.entry_point = Some(slot);
            self.level_max = level;
        }
    }

    /// Drop every edge pointing at `slot` so the node can be re-linked.
    fn unlink(&mut self, slot: u32) {
        for node in self.nodes.values_mut() {
            for layer in node.neighbors.iter_mut() {
                layer.retain(|n| *n != slot);
            }
        }
        self.nodes.remove(&slot);
        if self.entry_point == Some(slot) {
            self.entry_point = self.nodes.keys().min().copied();
            self.level_max = self
                .entry_point
                .and_then(|ep| self.nodes.get(&ep))
                .map_or(0, |n| n.neighbors.len().saturating_sub(1));
        }
    }
}
