use crate::core::record::ImageRecord;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// Label given to points that belong to no cluster.
pub const NOISE: i32 = -1;

pub const DEFAULT_EPS: f64 = 0.3;
pub const DEFAULT_MIN_SAMPLES: usize = 2;

/// Cluster label per record path. Records without a usable perceptual hash
/// have no entry at all.
pub type ClusterAssignment = BTreeMap<String, i32>;

/// Density clustering over perceptual hashes, used to keep look-alike images
/// inside a single split. Each digest is expanded to its bit vector and
/// distances are hamming distances normalised by the vector length, so `eps`
/// lies in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct SimilarityClusterer {
    pub eps: f64,
    pub min_samples: usize,
}

impl SimilarityClusterer {
    pub fn new(eps: f64, min_samples: usize) -> Self {
        Self { eps, min_samples }
    }

    pub fn cluster(&self, records: &[ImageRecord]) -> ClusterAssignment {
        let points: Vec<(&str, Vec<bool>)> = records
            .iter()
            .filter_map(|r| {
                r.perceptual_hash
                    .to_bit_vector()
                    .map(|bits| (r.path.as_str(), bits))
            })
            .collect();

        let skipped = records.len() - points.len();
        if skipped > 0 {
            log::warn!("{} record(s) without a perceptual hash left unclustered", skipped);
        }
        if points.is_empty() {
            return ClusterAssignment::new();
        }

        let vectors: Vec<&[bool]> = points.iter().map(|(_, bits)| bits.as_slice()).collect();
        let labels = self.dbscan(&vectors);

        let clusters: BTreeSet<i32> = labels.iter().copied().filter(|&l| l != NOISE).collect();
        let noise = labels.iter().filter(|&&l| l == NOISE).count();
        log::info!(
            "Created {} similarity cluster(s), {} noise point(s)",
            clusters.len(),
            noise
        );

        points
            .into_iter()
            .zip(labels)
            .map(|((path, _), label)| (path.to_string(), label))
            .collect()
    }

    /// Labels follow the order in which core points are first reached when
    /// walking the input front to back. Border points join the first cluster
    /// that reaches them.
    fn dbscan(&self, vectors: &[&[bool]]) -> Vec<i32> {
        let neighborhoods: Vec<Vec<usize>> = (0..vectors.len())
            .into_par_iter()
            .map(|i| self.region_query(vectors, i))
            .collect();
        let is_core: Vec<bool> = neighborhoods
            .iter()
            .map(|n| n.len() >= self.min_samples)
            .collect();

        let mut labels = vec![NOISE; vectors.len()];
        let mut next_label = 0;
        let mut stack = Vec::new();

        for start in 0..vectors.len() {
            if labels[start] != NOISE || !is_core[start] {
                continue;
            }

            stack.push(start);
            while let Some(i) = stack.pop() {
                if labels[i] != NOISE {
                    continue;
                }
                labels[i] = next_label;
                if is_core[i] {
                    stack.extend(
                        neighborhoods[i]
                            .iter()
                            .copied()
                            .filter(|&j| labels[j] == NOISE),
                    );
                }
            }
            next_label += 1;
        }
        labels
    }

    fn region_query(&self, vectors: &[&[bool]], i: usize) -> Vec<usize> {
        vectors
            .iter()
            .enumerate()
            .filter(|(_, other)| {
                normalized_hamming(vectors[i], other).is_some_and(|d| d <= self.eps)
            })
            .map(|(j, _)| j)
            .collect()
    }
}

/// Fraction of positions where the two bit vectors differ. Vectors of
/// different lengths are never comparable.
fn normalized_hamming(a: &[bool], b: &[bool]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let differing = a.iter().zip(b).filter(|(x, y)| x != y).count();
    Some(differing as f64 / a.len() as f64)
}

impl Default for SimilarityClusterer {
    fn default() -> Self {
        Self::new(DEFAULT_EPS, DEFAULT_MIN_SAMPLES)
    }
}

/// Number of distinct non-noise labels.
pub fn cluster_count(assignment: &ClusterAssignment) -> usize {
    assignment
        .values()
        .filter(|&&l| l != NOISE)
        .collect::<BTreeSet<_>>()
        .len()
}
