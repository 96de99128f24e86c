//! Spatial indexing abstractions for person proximity queries.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Common behaviour exposed by proximity indices.
///
/// Implementations must report every point whose distance to the queried
/// point is within the radius, each exactly once, never the queried point
/// itself.
pub trait ProximityIndex {
    /// Rebuild internal structures from person positions.
    fn rebuild(&mut self, positions: &[(f32, f32)]);

    /// Visit neighbors of point `idx` within the provided squared radius,
    /// passing each neighbor's index and squared distance.
    fn neighbors_within(
        &self,
        idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );
}

/// Uniform grid bucketing points into square cells keyed by cell coordinate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    cell_size: f32,
    #[serde(skip)]
    positions: Vec<(f32, f32)>,
    #[serde(skip)]
    buckets: HashMap<(i32, i32), Vec<usize>>,
}

impl UniformGridIndex {
    /// Create a grid with the provided cell size.
    pub fn new(cell_size: f32) -> Result<Self, IndexError> {
        if !cell_size.is_finite() || cell_size <= 0.0 {
            return Err(IndexError::InvalidConfig(
                "cell_size must be positive and finite",
            ));
        }
        Ok(Self {
            cell_size,
            positions: Vec::new(),
            buckets: HashMap::new(),
        })
    }

    /// Edge length of each grid cell.
    #[must_use]
    pub const fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Number of indexed points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the index holds no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self {
            cell_size: 125.0,
            positions: Vec::new(),
            buckets: HashMap::new(),
        }
    }
}

fn cell_key(cell_size: f32, x: f32, y: f32) -> (i32, i32) {
    ((x / cell_size).floor() as i32, (y / cell_size).floor() as i32)
}

impl ProximityIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[(f32, f32)]) {
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        self.buckets.clear();
        for (idx, &(x, y)) in positions.iter().enumerate() {
            let key = cell_key(self.cell_size, x, y);
            self.buckets.entry(key).or_default().push(idx);
        }
    }

    fn neighbors_within(
        &self,
        idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        let Some(&(qx, qy)) = self.positions.get(idx) else {
            return;
        };
        if radius_sq < 0.0 {
            return;
        }
        let reach = (radius_sq.sqrt() / self.cell_size).ceil() as i32;
        let (cx, cy) = cell_key(self.cell_size, qx, qy);
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                let Some(bucket) = self.buckets.get(&(cx + dx, cy + dy)) else {
                    continue;
                };
                for &other in bucket {
                    if other == idx {
                        continue;
                    }
                    let (px, py) = self.positions[other];
                    let dist_sq = (px - qx).powi(2) + (py - qy).powi(2);
                    if dist_sq <= radius_sq {
                        visitor(other, OrderedFloat(dist_sq));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::SmallRng};

    fn collect(index: &UniformGridIndex, idx: usize, radius_sq: f32) -> Vec<(usize, f32)> {
        let mut found = Vec::new();
        index.neighbors_within(idx, radius_sq, &mut |other, dist_sq| {
            found.push((other, dist_sq.into_inner()));
        });
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    fn exhaustive(positions: &[(f32, f32)], idx: usize, radius_sq: f32) -> Vec<(usize, f32)> {
        let (qx, qy) = positions[idx];
        let mut found: Vec<(usize, f32)> = positions
            .iter()
            .enumerate()
            .filter(|&(other, _)| other != idx)
            .filter_map(|(other, &(px, py))| {
                let dist_sq = (px - qx).powi(2) + (py - qy).powi(2);
                (dist_sq <= radius_sq).then_some((other, dist_sq))
            })
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    #[test]
    fn rejects_nonpositive_cell_size() {
        assert!(UniformGridIndex::new(0.0).is_err());
        assert!(UniformGridIndex::new(-4.0).is_err());
        assert!(UniformGridIndex::new(f32::NAN).is_err());
        assert!(UniformGridIndex::new(50.0).is_ok());
    }

    #[test]
    fn matches_exhaustive_scan() {
        let mut rng = SmallRng::seed_from_u64(9);
        let positions: Vec<(f32, f32)> = (0..250)
            .map(|_| (rng.random_range(0.0..500.0), rng.random_range(0.0..500.0)))
            .collect();
        let mut index = UniformGridIndex::new(50.0).expect("index");
        index.rebuild(&positions);

        let radius_sq = 60.0_f32 * 60.0;
        for idx in 0..positions.len() {
            assert_eq!(
                collect(&index, idx, radius_sq),
                exhaustive(&positions, idx, radius_sq),
                "grid and scan disagree for point {idx}"
            );
        }
    }

    #[test]
    fn radius_spanning_many_cells() {
        let positions: Vec<(f32, f32)> = (0..20).map(|i| (i as f32 * 10.0, 0.0)).collect();
        let mut index = UniformGridIndex::new(5.0).expect("index");
        index.rebuild(&positions);

        let found = collect(&index, 0, 35.0 * 35.0);
        let indices: Vec<usize> = found.iter().map(|&(other, _)| other).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn never_reports_the_queried_point() {
        let positions = vec![(10.0, 10.0), (10.0, 10.0), (11.0, 10.0)];
        let mut index = UniformGridIndex::new(25.0).expect("index");
        index.rebuild(&positions);

        let found = collect(&index, 0, 100.0);
        assert!(found.iter().all(|&(other, _)| other != 0));
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn unknown_index_yields_nothing() {
        let mut index = UniformGridIndex::new(25.0).expect("index");
        index.rebuild(&[(0.0, 0.0)]);
        assert!(collect(&index, 5, 100.0).is_empty());
        index.rebuild(&[]);
        assert!(collect(&index, 0, 100.0).is_empty());
    }
}
