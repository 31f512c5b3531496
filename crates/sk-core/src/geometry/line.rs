//! Lines, planes and their intersections

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::constants::GEOMETRY_EPSILON;

/// An infinite line through `origin` along a unit `direction`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub origin: DVec3,
    pub direction: DVec3,
}

impl Line {
    /// Create a line; `None` when the direction is degenerate
    pub fn new(origin: DVec3, direction: DVec3) -> Option<Self> {
        let direction = direction.try_normalize()?;
        Some(Self { origin, direction })
    }

    /// Line through two distinct points
    pub fn through(a: DVec3, b: DVec3) -> Option<Self> {
        Self::new(a, b - a)
    }

    pub fn point_at(&self, t: f64) -> DVec3 {
        self.origin + self.direction * t
    }

    /// Parameter of the orthogonal projection of `p`
    pub fn project_parameter(&self, p: DVec3) -> f64 {
        (p - self.origin).dot(self.direction)
    }

    pub fn closest_point(&self, p: DVec3) -> DVec3 {
        self.point_at(self.project_parameter(p))
    }

    pub fn distance_to_point(&self, p: DVec3) -> f64 {
        (p - self.closest_point(p)).length()
    }

    /// Closest points `(on self, on other)`; `None` for parallel lines
    pub fn closest_points(&self, other: &Line) -> Option<(DVec3, DVec3)> {
        let w0 = self.origin - other.origin;
        let b = self.direction.dot(other.direction);
        let d = self.direction.dot(w0);
        let e = other.direction.dot(w0);
        let denom = 1.0 - b * b;
        if denom.abs() < GEOMETRY_EPSILON {
            return None;
        }
        let s = (b * e - d) / denom;
        let t = (e - b * d) / denom;
        Some((self.point_at(s), other.point_at(t)))
    }

    /// Shortest distance between two lines (parallel lines included)
    pub fn distance_to_line(&self, other: &Line) -> f64 {
        match self.closest_points(other) {
            Some((a, b)) => (a - b).length(),
            None => self.distance_to_point(other.origin),
        }
    }
}

/// A plane through `origin` with unit `normal`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Plane {
    pub origin: DVec3,
    pub normal: DVec3,
}

impl Plane {
    /// Create a plane; `None` when the normal is degenerate
    pub fn new(origin: DVec3, normal: DVec3) -> Option<Self> {
        let normal = normal.try_normalize()?;
        Some(Self { origin, normal })
    }

    /// Plane through three non-collinear points
    pub fn through(a: DVec3, b: DVec3, c: DVec3) -> Option<Self> {
        Self::new(a, (b - a).cross(c - a))
    }

    /// Signed distance, positive on the normal side
    pub fn signed_distance(&self, p: DVec3) -> f64 {
        (p - self.origin).dot(self.normal)
    }

    pub fn project(&self, p: DVec3) -> DVec3 {
        p - self.normal * self.signed_distance(p)
    }

    /// Same plane shifted along its normal
    pub fn offset(&self, distance: f64) -> Self {
        Self {
            origin: self.origin + self.normal * distance,
            normal: self.normal,
        }
    }

    /// Intersection point with a line; `None` when parallel
    pub fn intersect_line(&self, line: &Line) -> Option<DVec3> {
        let denom = self.normal.dot(line.direction);
        if denom.abs() < GEOMETRY_EPSILON {
            return None;
        }
        let t = (self.origin - line.origin).dot(self.normal) / denom;
        Some(line.point_at(t))
    }

    /// Intersection line with another plane; `None` when parallel
    pub fn intersect_plane(&self, other: &Plane) -> Option<Line> {
        let direction = self.normal.cross(other.normal);
        let len2 = direction.length_squared();
        if len2 < GEOMETRY_EPSILON {
            return None;
        }
        let d1 = self.normal.dot(self.origin);
        let d2 = other.normal.dot(other.origin);
        let origin =
            (other.normal.cross(direction) * d1 + direction.cross(self.normal) * d2) / len2;
        Line::new(origin, direction)
    }

    /// Common point of three planes; `None` when they do not meet in a point
    pub fn intersect_three(a: &Plane, b: &Plane, c: &Plane) -> Option<DVec3> {
        let det = a.normal.dot(b.normal.cross(c.normal));
        if det.abs() < GEOMETRY_EPSILON {
            return None;
        }
        let d1 = a.normal.dot(a.origin);
        let d2 = b.normal.dot(b.origin);
        let d3 = c.normal.dot(c.origin);
        Some(
            (b.normal.cross(c.normal) * d1
                + c.normal.cross(a.normal) * d2
                + a.normal.cross(b.normal) * d3)
                / det,
        )
    }
}

/// Unsigned angle between two directions in radians
pub fn angle_between(a: DVec3, b: DVec3) -> Option<f64> {
    let a = a.try_normalize()?;
    let b = b.try_normalize()?;
    Some(a.dot(b).clamp(-1.0, 1.0).acos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_line_plane_intersection() {
        let plane = Plane::new(DVec3::new(0.0, 0.0, 5.0), DVec3::Z).unwrap();
        let line = Line::new(DVec3::new(1.0, 2.0, 0.0), DVec3::new(0.0, 0.0, 2.0)).unwrap();
        let p = plane.intersect_line(&line).unwrap();
        assert_relative_eq!(p.z, 5.0, epsilon = 1e-12);
        assert_relative_eq!(p.x, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_parallel_line_plane() {
        let plane = Plane::new(DVec3::ZERO, DVec3::Z).unwrap();
        let line = Line::new(DVec3::Z, DVec3::X).unwrap();
        assert!(plane.intersect_line(&line).is_none());
    }

    #[test]
    fn test_plane_plane_intersection() {
        let xy = Plane::new(DVec3::new(0.0, 0.0, 2.0), DVec3::Z).unwrap();
        let xz = Plane::new(DVec3::new(0.0, 3.0, 0.0), DVec3::Y).unwrap();
        let line = xy.intersect_plane(&xz).unwrap();
        assert_relative_eq!(line.direction.dot(DVec3::X).abs(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(line.origin.z, 2.0, epsilon = 1e-12);
        assert_relative_eq!(line.origin.y, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_three_planes() {
        let a = Plane::new(DVec3::new(1.0, 0.0, 0.0), DVec3::X).unwrap();
        let b = Plane::new(DVec3::new(0.0, 2.0, 0.0), DVec3::Y).unwrap();
        let c = Plane::new(DVec3::new(0.0, 0.0, 3.0), DVec3::new(0.0, 0.0, -1.0)).unwrap();
        let p = Plane::intersect_three(&a, &b, &c).unwrap();
        assert_relative_eq!(p.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(p.y, 2.0, epsilon = 1e-12);
        assert_relative_eq!(p.z, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_skew_lines_distance() {
        let a = Line::new(DVec3::ZERO, DVec3::X).unwrap();
        let b = Line::new(DVec3::new(0.0, 0.0, 4.0), DVec3::Y).unwrap();
        assert_relative_eq!(a.distance_to_line(&b), 4.0, epsilon = 1e-12);
        let c = Line::new(DVec3::new(0.0, 2.0, 0.0), DVec3::X).unwrap();
        assert_relative_eq!(a.distance_to_line(&c), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(Line::through(DVec3::ONE, DVec3::ONE).is_none());
        assert!(Plane::through(DVec3::ZERO, DVec3::X, DVec3::X * 2.0).is_none());
    }
}
