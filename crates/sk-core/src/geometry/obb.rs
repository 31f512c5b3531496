//! Oriented bounding box fitted to a point set.
//!
//! The box axes are the principal axes of the point covariance, so a thin
//! arm or tire gets a tight box regardless of how it sits in the assembly.

use glam::{DMat3, DVec3};
use serde::{Deserialize, Serialize};

use super::eigen::symmetric_eigen;
use super::line::Line;
use crate::constants::GEOMETRY_EPSILON;

/// Oriented bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Obb {
    /// Center in world coordinates
    pub center: DVec3,
    /// Half-extents along each local axis
    pub half_extents: DVec3,
    /// Local axes as orthonormal, right-handed columns
    pub axes: DMat3,
}

impl Default for Obb {
    fn default() -> Self {
        Self {
            center: DVec3::ZERO,
            half_extents: DVec3::ZERO,
            axes: DMat3::IDENTITY,
        }
    }
}

impl Obb {
    /// Fit a box to `points` using the eigenvectors of their covariance
    pub fn set_from_vertices(points: &[DVec3]) -> Self {
        if points.is_empty() {
            return Self::default();
        }

        let n = points.len() as f64;
        let mean = points.iter().copied().sum::<DVec3>() / n;

        let mut cov = DMat3::ZERO;
        for p in points {
            let d = *p - mean;
            cov += DMat3::from_cols(d * d.x, d * d.y, d * d.z);
        }
        cov *= 1.0 / n;

        let eigen = symmetric_eigen(cov);
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| eigen.values[b].total_cmp(&eigen.values[a]));

        let axes = orthonormal_basis(
            eigen.vectors.col(order[0]),
            eigen.vectors.col(order[1]),
        );

        let mut min = DVec3::splat(f64::INFINITY);
        let mut max = DVec3::splat(f64::NEG_INFINITY);
        for p in points {
            let proj = axes.transpose() * *p;
            min = min.min(proj);
            max = max.max(proj);
        }

        Self {
            center: axes * ((min + max) * 0.5),
            half_extents: (max - min) * 0.5,
            axes,
        }
    }

    /// Local axis `i` in world coordinates
    pub fn axis(&self, i: usize) -> DVec3 {
        self.axes.col(i)
    }

    pub fn volume(&self) -> f64 {
        8.0 * self.half_extents.x * self.half_extents.y * self.half_extents.z
    }

    pub fn to_local(&self, p: DVec3) -> DVec3 {
        self.axes.transpose() * (p - self.center)
    }

    pub fn to_world(&self, local: DVec3) -> DVec3 {
        self.center + self.axes * local
    }

    pub fn contains(&self, p: DVec3) -> bool {
        let local = self.to_local(p);
        (0..3).all(|i| local[i].abs() <= self.half_extents[i] + GEOMETRY_EPSILON)
    }

    /// The 8 corners; bit 0/1/2 of the index selects the +x/+y/+z side
    pub fn corners(&self) -> [DVec3; 8] {
        std::array::from_fn(|i| self.to_world(self.local_corner(i)))
    }

    fn local_corner(&self, i: usize) -> DVec3 {
        let h = self.half_extents;
        DVec3::new(
            if i & 1 != 0 { h.x } else { -h.x },
            if i & 2 != 0 { h.y } else { -h.y },
            if i & 4 != 0 { h.z } else { -h.z },
        )
    }

    /// Closest point of the box to an infinite line, and its distance.
    ///
    /// The line is moved into box-local space and all 12 edges are checked.
    /// A line that passes through the box returns its entry point at distance 0.
    pub fn get_nearest_neighbor_to_line(&self, line: &Line) -> (DVec3, f64) {
        let origin = self.to_local(line.origin);
        let direction = self.axes.transpose() * line.direction;

        if let Some(t) = self.slab_entry(origin, direction) {
            return (self.to_world(origin + direction * t), 0.0);
        }

        let mut best = (DVec3::ZERO, f64::INFINITY);
        for a in 0..8 {
            for bit in [1, 2, 4] {
                if a & bit != 0 {
                    continue;
                }
                let start = self.local_corner(a);
                let end = self.local_corner(a | bit);
                let point = closest_on_segment_to_line(start, end, origin, direction);
                let t = (point - origin).dot(direction);
                let distance = (origin + direction * t - point).length();
                if distance < best.1 {
                    best = (point, distance);
                }
            }
        }

        (self.to_world(best.0), best.1)
    }

    /// Entry parameter of a local-space line through the box
    fn slab_entry(&self, origin: DVec3, direction: DVec3) -> Option<f64> {
        let mut t_min = f64::NEG_INFINITY;
        let mut t_max = f64::INFINITY;
        for i in 0..3 {
            let h = self.half_extents[i];
            if direction[i].abs() < GEOMETRY_EPSILON {
                if origin[i].abs() > h {
                    return None;
                }
                continue;
            }
            let t1 = (-h - origin[i]) / direction[i];
            let t2 = (h - origin[i]) / direction[i];
            t_min = t_min.max(t1.min(t2));
            t_max = t_max.min(t1.max(t2));
        }
        (t_min <= t_max).then_some(t_min)
    }
}

/// Right-handed orthonormal basis from two approximate directions
fn orthonormal_basis(a: DVec3, b: DVec3) -> DMat3 {
    let x = a.try_normalize().unwrap_or(DVec3::X);
    let y = (b - x * x.dot(b))
        .try_normalize()
        .unwrap_or_else(|| x.any_orthonormal_vector());
    DMat3::from_cols(x, y, x.cross(y))
}

fn closest_on_segment_to_line(start: DVec3, end: DVec3, origin: DVec3, direction: DVec3) -> DVec3 {
    let edge = end - start;
    let len2 = edge.length_squared();
    if len2 < GEOMETRY_EPSILON {
        return start;
    }
    // minimize |(start + s*edge) - line| over s in [0, 1]
    let w = start - origin;
    let b = edge.dot(direction);
    let denom = len2 - b * b;
    let s = if denom.abs() < GEOMETRY_EPSILON {
        0.0
    } else {
        (b * w.dot(direction) - w.dot(edge)) / denom
    };
    start + edge * s.clamp(0.0, 1.0)
}
