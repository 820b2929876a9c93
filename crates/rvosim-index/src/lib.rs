//! Spatial indexing abstractions for agent neighborhood queries.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// A single radius-query hit: point index plus squared distance to the query point.
pub type RadiusHit = (usize, OrderedFloat<f32>);

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from agent positions.
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError>;

    /// Collect every indexed point within `radius` of `point` into `hits`,
    /// ascending by squared distance. `hits` is cleared first. The query
    /// point's own entry (distance zero) is included when indexed; callers
    /// filter out self-hits by index.
    fn query_radius_sorted(&self, point: (f32, f32), radius: f32, hits: &mut Vec<RadiusHit>);
}

/// Uniform grid index bucketing agent positions by cell.
///
/// Positions outside the configured bounds clamp onto the edge cells, so
/// agents that wander out of bounds remain queryable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Edge length of each grid cell used for bucketing agents.
    pub cell_size: f32,
    width: f32,
    height: f32,
    cols: usize,
    rows: usize,
    #[serde(skip)]
    buckets: Vec<Vec<u32>>,
    #[serde(skip)]
    positions: Vec<(f32, f32)>,
}

impl UniformGridIndex {
    /// Create a new uniform grid covering `width * height` world units.
    #[must_use]
    pub fn new(cell_size: f32, width: f32, height: f32) -> Self {
        let cols = Self::cell_count(width, cell_size);
        let rows = Self::cell_count(height, cell_size);
        Self {
            cell_size,
            width,
            height,
            cols,
            rows,
            buckets: vec![Vec::new(); cols * rows],
            positions: Vec::new(),
        }
    }

    /// Number of points currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true when nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn cell_count(extent: f32, cell_size: f32) -> usize {
        if extent <= 0.0 || cell_size <= 0.0 {
            return 1;
        }
        ((extent / cell_size).ceil() as usize).max(1)
    }

    #[inline]
    fn clamp_axis(value: f32, cell_size: f32, cells: usize) -> usize {
        if value <= 0.0 {
            return 0;
        }
        ((value / cell_size) as usize).min(cells - 1)
    }

    #[inline]
    fn cell_of(&self, position: (f32, f32)) -> (usize, usize) {
        (
            Self::clamp_axis(position.0, self.cell_size, self.cols),
            Self::clamp_axis(position.1, self.cell_size, self.rows),
        )
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self::new(2.5, 20.0, 20.0)
    }
}

impl NeighborhoodIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError> {
        if self.cell_size <= 0.0 {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        if self.width <= 0.0 || self.height <= 0.0 {
            return Err(IndexError::InvalidConfig("grid extents must be positive"));
        }
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        if self.buckets.len() != self.cols * self.rows {
            self.buckets.resize(self.cols * self.rows, Vec::new());
        }
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        for (idx, &position) in positions.iter().enumerate() {
            let (cx, cy) = self.cell_of(position);
            self.buckets[cy * self.cols + cx].push(idx as u32);
        }
        Ok(())
    }

    fn query_radius_sorted(&self, point: (f32, f32), radius: f32, hits: &mut Vec<RadiusHit>) {
        hits.clear();
        if self.positions.is_empty() || radius < 0.0 {
            return;
        }
        let radius_sq = radius * radius;
        let (min_cx, min_cy) = self.cell_of((point.0 - radius, point.1 - radius));
        let (max_cx, max_cy) = self.cell_of((point.0 + radius, point.1 + radius));
        for cy in min_cy..=max_cy {
            for cx in min_cx..=max_cx {
                for &idx in &self.buckets[cy * self.cols + cx] {
                    let (px, py) = self.positions[idx as usize];
                    let dx = px - point.0;
                    let dy = py - point.1;
                    let dist_sq = dx * dx + dy * dy;
                    if dist_sq <= radius_sq {
                        hits.push((idx as usize, OrderedFloat(dist_sq)));
                    }
                }
            }
        }
        hits.sort_unstable_by_key(|&(idx, dist_sq)| (dist_sq, idx));
    }
}
