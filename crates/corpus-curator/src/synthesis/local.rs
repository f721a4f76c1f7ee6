//! In-process clustering and projection.
//!
//! Used when no external clustering service is configured.

use std::collections::HashMap;

use crate::error::ServiceResult;
use crate::services::{Clusterer, Reducer};

const ITERATIONS: usize = 50;

/// Deterministic k-means with `k = min(5, max(2, n / 3))`.
///
/// Seeds are chosen farthest-first starting from the first vector.
#[derive(Debug, Clone, Copy, Default)]
pub struct KMeans;

impl KMeans {
    /// Cluster count for `n` vectors.
    #[must_use]
    pub fn k_for(n: usize) -> usize {
        (n / 3).max(2).min(5).min(n)
    }

    /// Assign each vector to a cluster.
    #[must_use]
    pub fn assign(vectors: &[&[f32]]) -> Vec<u32> {
        let n = vectors.len();
        if n == 0 {
            return Vec::new();
        }
        let k = Self::k_for(n);
        let mut centroids: Vec<Vec<f64>> = vec![to_f64(vectors[0])];
        while centroids.len() < k {
            let next = (0..n)
                .max_by(|&a, &b| {
                    nearest(&centroids, vectors[a])
                        .1
                        .total_cmp(&nearest(&centroids, vectors[b]).1)
                })
                .unwrap_or(0);
            centroids.push(to_f64(vectors[next]));
        }

        let mut labels = vec![0u32; n];
        for _ in 0..ITERATIONS {
            let mut changed = false;
            for (i, v) in vectors.iter().enumerate() {
                let (c, _) = nearest(&centroids, v);
                if labels[i] != c {
                    labels[i] = c;
                    changed = true;
                }
            }
            for (c, centroid) in centroids.iter_mut().enumerate() {
                let members: Vec<&[f32]> = vectors
                    .iter()
                    .zip(&labels)
                    .filter(|(_, l)| **l as usize == c)
                    .map(|(v, _)| *v)
                    .collect();
                if !members.is_empty() {
                    *centroid = mean(&members);
                }
            }
            if !changed {
                break;
            }
        }
        labels
    }
}

#[async_trait::async_trait]
impl Clusterer for KMeans {
    async fn cluster(
        &self,
        vectors: &[(String, Vec<f32>)],
    ) -> ServiceResult<HashMap<String, Option<u32>>> {
        let refs: Vec<&[f32]> = vectors.iter().map(|(_, v)| v.as_slice()).collect();
        let labels = Self::assign(&refs);
        Ok(vectors.iter().zip(labels).map(|((id, _), l)| (id.clone(), Some(l))).collect())
    }
}

/// Projection onto the two leading principal components (power iteration).
#[derive(Debug, Clone, Copy, Default)]
pub struct PrincipalComponents;

impl PrincipalComponents {
    /// Project vectors to 2D.
    #[must_use]
    pub fn project(vectors: &[&[f32]]) -> Vec<(f32, f32)> {
        if vectors.is_empty() {
            return Vec::new();
        }
        let centre = mean(vectors);
        let centred: Vec<Vec<f64>> = vectors
            .iter()
            .map(|v| v.iter().zip(&centre).map(|(x, m)| f64::from(*x) - m).collect())
            .collect();

        let first = leading_axis(&centred, None);
        let second = leading_axis(&centred, Some(&first));
        centred
            .iter()
            .map(|row| (dot(row, &first) as f32, dot(row, &second) as f32))
            .collect()
    }
}

#[async_trait::async_trait]
impl Reducer for PrincipalComponents {
    async fn reduce(
        &self,
        vectors: &[(String, Vec<f32>)],
    ) -> ServiceResult<HashMap<String, (f32, f32)>> {
        let refs: Vec<&[f32]> = vectors.iter().map(|(_, v)| v.as_slice()).collect();
        let coords = Self::project(&refs);
        Ok(vectors.iter().zip(coords).map(|((id, _), c)| (id.clone(), c)).collect())
    }
}

fn to_f64(v: &[f32]) -> Vec<f64> {
    v.iter().map(|x| f64::from(*x)).collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn mean(vectors: &[&[f32]]) -> Vec<f64> {
    let dims = vectors.iter().map(|v| v.len()).max().unwrap_or(0);
    let mut sum = vec![0.0; dims];
    for v in vectors {
        for (s, x) in sum.iter_mut().zip(v.iter()) {
            *s += f64::from(*x);
        }
    }
    let n = vectors.len().max(1) as f64;
    sum.iter().map(|s| s / n).collect()
}

/// Index and squared distance of the closest centroid.
fn nearest(centroids: &[Vec<f64>], v: &[f32]) -> (u32, f64) {
    let mut best = (0u32, f64::INFINITY);
    for (c, centroid) in centroids.iter().enumerate() {
        let d: f64 = centroid
            .iter()
            .zip(v)
            .map(|(m, x)| (f64::from(*x) - m).powi(2))
            .sum();
        if d < best.1 {
            best = (c as u32, d);
        }
    }
    best
}

/// Dominant eigenvector of the covariance, orthogonal to `exclude`.
fn leading_axis(rows: &[Vec<f64>], exclude: Option<&[f64]>) -> Vec<f64> {
    let dims = rows.first().map_or(0, Vec::len);
    let mut axis: Vec<f64> = (0..dims).map(|i| 1.0 / (i as f64 + 1.0)).collect();
    for _ in 0..ITERATIONS {
        let mut next = vec![0.0; dims];
        for row in rows {
            let weight = dot(row, &axis);
            for (n, x) in next.iter_mut().zip(row) {
                *n += weight * x;
            }
        }
        let raw = dot(&next, &next).sqrt();
        if let Some(ex) = exclude {
            let overlap = dot(&next, ex);
            for (n, e) in next.iter_mut().zip(ex) {
                *n -= overlap * e;
            }
        }
        let norm = dot(&next, &next).sqrt();
        // No variance left in this direction.
        if norm <= raw * 1e-9 || norm == 0.0 {
            return vec![0.0; dims];
        }
        axis = next.iter().map(|x| x / norm).collect();
    }
    axis
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_k_for() {
        assert_eq!(KMeans::k_for(4), 2);
        assert_eq!(KMeans::k_for(9), 3);
        assert_eq!(KMeans::k_for(100), 5);
        assert_eq!(KMeans::k_for(1), 1);
    }

    #[test]
    fn test_kmeans_separates_groups() {
        let data: Vec<Vec<f32>> = vec![
            vec![0.0, 0.0],
            vec![0.1, 0.0],
            vec![0.0, 0.1],
            vec![10.0, 10.0],
            vec![10.1, 10.0],
            vec![10.0, 10.1],
        ];
        let refs: Vec<&[f32]> = data.iter().map(Vec::as_slice).collect();
        let labels = KMeans::assign(&refs);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[0], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_ne!(labels[0], labels[3]);
    }

    #[test]
    fn test_projection_spreads_along_main_axis() {
        let data: Vec<Vec<f32>> =
            vec![vec![0.0, 0.0, 0.0], vec![1.0, 1.0, 0.0], vec![2.0, 2.0, 0.0], vec![3.0, 3.0, 0.0]];
        let refs: Vec<&[f32]> = data.iter().map(Vec::as_slice).collect();
        let coords = PrincipalComponents::project(&refs);
        assert_eq!(coords.len(), 4);
        let spread = (coords[3].0 - coords[0].0).abs();
        assert!(spread > 4.0);
        assert!(coords.iter().all(|c| c.1.abs() < 1e-3));
    }
}
