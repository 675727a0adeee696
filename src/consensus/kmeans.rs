use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::GroupDetector;
use crate::error::ComputeError;

pub const MAX_CLUSTERS: usize = 5;
pub const PARTICIPANTS_PER_CLUSTER: usize = 10;

const DEFAULT_MAX_ITERATIONS: usize = 100;
const CONVERGENCE_TOLERANCE: f64 = 1e-6;

/// `min(5, participants / 10)`, at least 1.
pub fn cluster_count(participants: usize) -> usize {
    (participants / PARTICIPANTS_PER_CLUSTER).min(MAX_CLUSTERS).max(1)
}

/// Lloyd's k-means with k-means++ seeding from a fixed seed.
#[derive(Debug, Clone)]
pub struct KMeans {
    seed: u64,
    max_iterations: usize,
}

impl KMeans {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    fn initial_centroids(&self, points: &[Vec<f64>], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
        let mut centroids = vec![points[rng.gen_range(0..points.len())].clone()];

        while centroids.len() < k {
            let weights: Vec<f64> = points
                .iter()
                .map(|p| {
                    centroids
                        .iter()
                        .map(|c| squared_distance(p, c))
                        .fold(f64::INFINITY, f64::min)
                })
                .collect();
            let total: f64 = weights.iter().sum();

            let next = if total <= 0.0 {
                rng.gen_range(0..points.len())
            } else {
                let mut target = rng.gen_range(0.0..1.0_f64) * total;
                weights
                    .iter()
                    .position(|w| {
                        target -= w;
                        target <= 0.0
                    })
                    .unwrap_or(points.len() - 1)
            };
            centroids.push(points[next].clone());
        }
        centroids
    }
}

impl Default for KMeans {
    fn default() -> Self {
        Self::new(42)
    }
}

impl GroupDetector for KMeans {
    fn cluster(&self, coordinates: &[Vec<f64>]) -> Result<Vec<usize>, ComputeError> {
        let n = coordinates.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        let dims = coordinates[0].len();
        for (i, point) in coordinates.iter().enumerate() {
            if point.len() != dims {
                return Err(ComputeError::Clustering(format!(
                    "point {} has {} dimensions, expected {}",
                    i,
                    point.len(),
                    dims
                )));
            }
            if point.iter().any(|x| !x.is_finite()) {
                return Err(ComputeError::Clustering(format!("point {} is not finite", i)));
            }
        }

        let k = cluster_count(n);
        if k == 1 {
            return Ok(vec![0; n]);
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut centroids = self.initial_centroids(coordinates, k, &mut rng);
        let mut labels = vec![0usize; n];

        for iteration in 0..self.max_iterations {
            for (label, point) in labels.iter_mut().zip(coordinates) {
                *label = nearest(point, &centroids);
            }

            let mut sums = vec![vec![0.0; dims]; k];
            let mut counts = vec![0usize; k];
            for (label, point) in labels.iter().zip(coordinates) {
                counts[*label] += 1;
                for (s, x) in sums[*label].iter_mut().zip(point) {
                    *s += x;
                }
            }

            let mut shift: f64 = 0.0;
            for c in 0..k {
                // An empty cluster keeps its previous centroid.
                if counts[c] == 0 {
                    continue;
                }
                let updated: Vec<f64> = sums[c].iter().map(|s| s / counts[c] as f64).collect();
                shift = shift.max(squared_distance(&updated, &centroids[c]).sqrt());
                centroids[c] = updated;
            }

            if shift < CONVERGENCE_TOLERANCE {
                debug!("k-means converged after {} iterations (k={})", iteration + 1, k);
                break;
            }
        }

        for (label, point) in labels.iter_mut().zip(coordinates) {
            *label = nearest(point, &centroids);
        }
        Ok(relabel_by_first_appearance(&labels))
    }
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = squared_distance(point, c);
        if d < best_distance {
            best = i;
            best_distance = d;
        }
    }
    best
}

/// Compacts labels to 0..m in order of first appearance.
fn relabel_by_first_appearance(labels: &[usize]) -> Vec<usize> {
    let mut mapping: Vec<(usize, usize)> = Vec::new();
    labels
        .iter()
        .map(|label| match mapping.iter().find(|(from, _)| from == label) {
            Some((_, to)) => *to,
            None => {
                let to = mapping.len();
                mapping.push((*label, to));
                to
            }
        })
        .collect()
}
