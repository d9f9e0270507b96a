//! Partitioned index for very large collections.
//!
//! Vectors are clustered with spherical k-means into coarse partitions, each
//! backed by its own [`HnswGraph`]. A query probes the partitions whose
//! centroids are most similar to it and merges their hits.

use std::collections::HashMap;
use std::sync::Arc;

use super::hnsw::{HnswGraph, HnswParams};
use super::{similarity, top_with_ties, AnnIndex};
use crate::embedding::normalize;

const KMEANS_ITERATIONS: usize = 6;
/// Training sample size per partition.
const SAMPLES_PER_PARTITION: usize = 16;

#[derive(Debug)]
pub struct HybridIndex {
    centroids: Vec<Vec<f32>>,
    partitions: Vec<HnswGraph>,
    assignment: HashMap<u32, usize>,
    params: HnswParams,
    probes: usize,
}

impl HybridIndex {
    /// Cluster `vectors` into `nlist` partitions (0 means `sqrt(N)`) and
    /// build one graph per partition.
    pub fn build(
        vectors: &[(u32, Arc<[f32]>)],
        nlist: usize,
        probes: usize,
        params: HnswParams,
    ) -> Self {
        let nlist = if nlist == 0 {
            (vectors.len() as f64).sqrt().ceil() as usize
        } else {
            nlist
        }
        .clamp(1, vectors.len().max(1));

        let centroids = train_centroids(vectors, nlist);
        let mut index = Self {
            partitions: (0..centroids.len()).map(|_| HnswGraph::new(params)).collect(),
            centroids,
            assignment: HashMap::with_capacity(vectors.len()),
            params,
            probes: probes.max(1),
        };
        for (slot, vector) in vectors {
            index.insert(*slot, vector.clone());
        }
        index
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn nearest_partitions(&self, query: &[f32], n: usize) -> Vec<usize> {
        let scored: Vec<(u32, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i as u32, similarity(c, query)))
            .collect();
        let mut ranked = top_with_ties(scored, n);
        ranked.truncate(n);
        ranked.into_iter().map(|(i, _)| i as usize).collect()
    }
}

impl AnnIndex for HybridIndex {
    fn insert(&mut self, slot: u32, vector: Arc<[f32]>) {
        if self.centroids.is_empty() {
            self.centroids.push(vector.to_vec());
            self.partitions.push(HnswGraph::new(self.params));
        }
        if let Some(old) = self.assignment.remove(&slot) {
            self.partitions[old].remove(slot);
        }
        let partition = self.nearest_partitions(&vector, 1)[0];
        self.partitions[partition].insert(slot, vector);
        self.assignment.insert(slot, partition);
    }

    fn remove(&mut self, slot: u32) {
        if let Some(partition) = self.assignment.remove(&slot) {
            self.partitions[partition].remove(slot);
        }
    }

    fn search(&self, query: &[f32], k: usize, allow: &dyn Fn(u32) -> bool) -> Vec<(u32, f32)> {
        let hits = self
            .nearest_partitions(query, self.probes)
            .into_iter()
            .flat_map(|p| self.partitions[p].search(query, k, allow))
            .collect();
        top_with_ties(hits, k)
    }

    fn len(&self) -> usize {
        self.assignment.len()
    }

    fn tombstones(&self) -> usize {
        self.partitions.iter().map(AnnIndex::tombstones).sum()
    }
}

/// Spherical k-means over an evenly strided training sample.
fn train_centroids(vectors: &[(u32, Arc<[f32]>)], k: usize) -> Vec<Vec<f32>> {
    if vectors.is_empty() {
        return Vec::new();
    }
    let dim = vectors[0].1.len();
    let sample_size = (k * SAMPLES_PER_PARTITION).min(vectors.len());
    let stride = vectors.len() / sample_size;
    let sample: Vec<&[f32]> = (0..sample_size)
        .map(|i| &*vectors[i * stride].1)
        .collect();

    let k = k.min(sample.len());
    let step = sample.len() / k;
    let mut centroids: Vec<Vec<f32>> = (0..k).map(|i| sample[i * step].to_vec()).collect();
    let mut assignments = vec![usize::MAX; sample.len()];

    for _ in 0..KMEANS_ITERATIONS {
        let mut changed = false;
        for (i, v) in sample.iter().enumerate() {
            let best = centroids
                .iter()
                .enumerate()
                .map(|(ci, c)| (ci, similarity(c, v)))
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map_or(0, |(ci, _)| ci);
            if assignments[i] != best {
                assignments[i] = best;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (i, v) in sample.iter().enumerate() {
            let c = assignments[i];
            counts[c] += 1;
            for (s, x) in sums[c].iter_mut().zip(v.iter()) {
                *s += x;
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                continue;
            }
            if let Some(unit) = normalize(&sums[c]) {
                centroids[c] = unit;
            }
        }
    }

    centroids
}
