//! Random-hyperplane projections for approximate search.
//!
//! Each table hashes a vector to a bit signature (one bit per hyperplane,
//! set when the projection is non-negative). A query collects the entries in
//! its own bucket plus every bucket one bit-flip away in each table. The
//! hyperplanes come from a fixed seed, so a rebuilt index hashes identically.

use rand::prelude::*;
use rand_distr::StandardNormal;
use std::collections::{HashMap, HashSet};

const SEED: u64 = 42;

pub struct ProjectionIndex {
    dimension: usize,
    bits: usize,
    /// `tables * bits` hyperplanes, each of `dimension` components
    hyperplanes: Vec<Vec<f32>>,
    buckets: Vec<HashMap<u64, Vec<usize>>>,
}

impl ProjectionIndex {
    pub fn new(dimension: usize, tables: usize, bits: usize) -> Self {
        let tables = tables.max(1);
        let bits = bits.clamp(1, 64);
        let mut rng = StdRng::seed_from_u64(SEED);
        let hyperplanes = (0..tables * bits)
            .map(|_| {
                (0..dimension)
                    .map(|_| rng.sample::<f32, _>(StandardNormal))
                    .collect()
            })
            .collect();

        Self {
            dimension,
            bits,
            hyperplanes,
            buckets: vec![HashMap::new(); tables],
        }
    }

    pub fn tables(&self) -> usize {
        self.buckets.len()
    }

    fn signature(&self, vector: &[f32], table: usize) -> u64 {
        let start = table * self.bits;
        self.hyperplanes[start..start + self.bits]
            .iter()
            .enumerate()
            .fold(0u64, |acc, (bit, plane)| {
                let projection: f64 = plane
                    .iter()
                    .zip(vector.iter())
                    .map(|(&a, &b)| a as f64 * b as f64)
                    .sum();
                if projection >= 0.0 {
                    acc | (1 << bit)
                } else {
                    acc
                }
            })
    }

    /// Register `slot` under the vector's signature in every table.
    pub fn insert(&mut self, slot: usize, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dimension);
        for table in 0..self.buckets.len() {
            let signature = self.signature(vector, table);
            self.buckets[table].entry(signature).or_default().push(slot);
        }
    }

    /// Slots sharing a bucket with the query, including single-bit neighbours.
    pub fn candidates(&self, query: &[f32]) -> HashSet<usize> {
        let mut candidates = HashSet::new();
        for (table, buckets) in self.buckets.iter().enumerate() {
            let signature = self.signature(query, table);
            if let Some(bucket) = buckets.get(&signature) {
                candidates.extend(bucket.iter().copied());
            }
            for bit in 0..self.bits {
                if let Some(bucket) = buckets.get(&(signature ^ (1 << bit))) {
                    candidates.extend(bucket.iter().copied());
                }
            }
        }
        candidates
    }

    pub fn clear(&mut self) {
        for table in &mut self.buckets {
            table.clear();
        }
    }
}
