//! Measure tools over datums

use glam::DVec3;
use serde::{Deserialize, Serialize};

use super::DerivedObjectError;
use super::datum::{DatumObject, DatumType, DatumValue};
use crate::constants::GEOMETRY_EPSILON;
use crate::geometry::angle_between;

/// World axis selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn component(&self, v: DVec3) -> f64 {
        match self {
            Self::X => v.x,
            Self::Y => v.y,
            Self::Z => v.z,
        }
    }
}

/// What a measure tool computes. Indices refer to datums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeasureKind {
    /// Minimum distance between any two datums (mm)
    Distance { a: usize, b: usize },
    /// Angle between lines and/or planes (degrees)
    Angle { a: usize, b: usize },
    /// One coordinate of a point datum
    Coordinate { datum: usize, axis: Axis },
}

impl MeasureKind {
    pub fn datums(&self) -> Vec<usize> {
        match *self {
            Self::Distance { a, b } | Self::Angle { a, b } => vec![a, b],
            Self::Coordinate { datum, .. } => vec![datum],
        }
    }

    /// Whether a datum of type `ty` is accepted as an operand
    pub fn accepts(&self, ty: DatumType) -> bool {
        match self {
            Self::Distance { .. } => true,
            Self::Angle { .. } => ty != DatumType::Point,
            Self::Coordinate { .. } => ty == DatumType::Point,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureTool {
    pub name: String,
    pub kind: MeasureKind,
    #[serde(skip)]
    pub value: Option<f64>,
    #[serde(skip)]
    pub error: Option<DerivedObjectError>,
}

impl MeasureTool {
    pub fn new(name: impl Into<String>, kind: MeasureKind) -> Self {
        Self {
            name: name.into(),
            kind,
            value: None,
            error: None,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.error.is_some()
    }

    pub(super) fn compute(&self, datums: &[DatumObject]) -> Result<f64, DerivedObjectError> {
        let get = |index: usize| {
            datums
                .get(index)
                .filter(|d| !d.is_stale())
                .and_then(|d| d.value)
                .ok_or_else(|| DerivedObjectError::StaleDependency(self.name.clone()))
        };
        match &self.kind {
            MeasureKind::Distance { a, b } => Ok(distance(&get(*a)?, &get(*b)?)),
            MeasureKind::Angle { a, b } => {
                let (da, db) = (get(*a)?, get(*b)?);
                angle(&da, &db)
                    .map(f64::to_degrees)
                    .ok_or_else(|| DerivedObjectError::Degenerate(self.name.clone()))
            }
            MeasureKind::Coordinate { datum, axis } => get(*datum)?
                .as_point()
                .map(|p| axis.component(p))
                .ok_or_else(|| DerivedObjectError::WrongKind {
                    object: self.name.clone(),
                    index: *datum,
                    expected: DatumType::Point.label(),
                }),
        }
    }
}

/// Minimum distance between two datums; zero where they intersect
fn distance(a: &DatumValue, b: &DatumValue) -> f64 {
    use DatumValue::{Line, Plane, Point};
    match (a, b) {
        (Point(p), Point(q)) => (*p - *q).length(),
        (Point(p), Line(l)) | (Line(l), Point(p)) => l.distance_to_point(*p),
        (Point(p), Plane(pl)) | (Plane(pl), Point(p)) => pl.signed_distance(*p).abs(),
        (Line(l), Line(m)) => l.distance_to_line(m),
        (Line(l), Plane(pl)) | (Plane(pl), Line(l)) => {
            if pl.normal.dot(l.direction).abs() < GEOMETRY_EPSILON {
                pl.signed_distance(l.origin).abs()
            } else {
                0.0
            }
        }
        (Plane(p), Plane(q)) => {
            if p.normal.cross(q.normal).length_squared() < GEOMETRY_EPSILON {
                p.signed_distance(q.origin).abs()
            } else {
                0.0
            }
        }
    }
}

/// Angle in radians between lines and planes, folded into `[0, pi/2]`
fn angle(a: &DatumValue, b: &DatumValue) -> Option<f64> {
    use DatumValue::{Line, Plane};
    let fold = |theta: f64| theta.min(std::f64::consts::PI - theta);
    match (a, b) {
        (Line(l), Line(m)) => angle_between(l.direction, m.direction).map(fold),
        (Plane(p), Plane(q)) => angle_between(p.normal, q.normal).map(fold),
        (Line(l), Plane(p)) | (Plane(p), Line(l)) => {
            angle_between(l.direction, p.normal).map(|t| std::f64::consts::FRAC_PI_2 - fold(t))
        }
        _ => None,
    }
}
