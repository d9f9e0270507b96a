//! Brute-force index: every query is a linear scan.

use std::collections::HashMap;
use std::sync::Arc;

use super::{similarity, top_with_ties, AnnIndex};

#[derive(Debug, Default)]
pub struct ExactIndex {
    vectors: HashMap<u32, Arc<[f32]>>,
}

impl AnnIndex for ExactIndex {
    fn insert(&mut self, slot: u32, vector: Arc<[f32]>) {
        self.vectors.insert(slot, vector);
    }

    fn remove(&mut self, slot: u32) {
        self.vectors.remove(&slot);
    }

    fn search(&self, query: &[f32], k: usize, allow: &dyn Fn(u32) -> bool) -> Vec<(u32, f32)> {
        let scored = self
            .vectors
            .iter()
            .filter(|(slot, _)| allow(**slot))
            .map(|(slot, v)| (*slot, similarity(v, query)))
            .collect();
        top_with_ties(scored, k)
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn tombstones(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::test_vectors;

    #[test]
    fn test_scan_orders_by_similarity() {
        let mut index = ExactIndex::default();
        index.insert(1, Arc::from(vec![1.0, 0.0]));
        index.insert(2, Arc::from(vec![0.6, 0.8]));
        index.insert(3, Arc::from(vec![0.0, 1.0]));

        let hits = index.search(&[1.0, 0.0], 2, &|_| true);
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![1, 2]);
        assert!((hits[1].1 - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_keeps_ties_at_cutoff() {
        let mut index = ExactIndex::default();
        for slot in 0..4 {
            index.insert(slot, Arc::from(vec![1.0, 0.0]));
        }
        let hits = index.search(&[1.0, 0.0], 2, &|_| true);
        assert_eq!(hits.len(), 4);
    }

    #[test]
    fn test_remove_and_filter() {
        let vectors = test_vectors(10, 4, 2);
        let mut index = ExactIndex::default();
        for (slot, v) in vectors.iter().enumerate() {
            index.insert(slot as u32, v.clone());
        }
        index.remove(3);
        assert_eq!(index.len(), 9);
        let hits = index.search(&vectors[3], 10, &|s| s < 5);
        assert_eq!(hits.len(), 4);
        assert!(hits.iter().all(|(s, _)| *s != 3 && *s < 5));
    }
}
