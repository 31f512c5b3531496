//! Datum points, lines and planes

use glam::DVec3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::DerivedObjectError;
use crate::assembly::PointSource;
use crate::geometry::{Line, Plane};

/// Geometric type produced by a datum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatumType {
    Point,
    Line,
    Plane,
}

impl DatumType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Point => "point",
            Self::Line => "line",
            Self::Plane => "plane",
        }
    }
}

/// How a datum is constructed. Indices refer to earlier datums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DatumKind {
    // Points
    Fixed { position: DVec3 },
    ElementPoint { element: Uuid, point: String },
    Midpoint { a: usize, b: usize },
    LinePlaneIntersection { line: usize, plane: usize },
    ProjectOnPlane { point: usize, plane: usize },
    ThreePlaneIntersection { a: usize, b: usize, c: usize },
    // Lines
    TwoPoints { a: usize, b: usize },
    PlaneIntersection { a: usize, b: usize },
    PointDirection { point: usize, direction: DVec3 },
    // Planes
    ThreePoints { a: usize, b: usize, c: usize },
    PointNormal { point: usize, normal: DVec3 },
    Offset { plane: usize, distance: f64 },
}

impl DatumKind {
    pub fn output(&self) -> DatumType {
        match self {
            Self::Fixed { .. }
            | Self::ElementPoint { .. }
            | Self::Midpoint { .. }
            | Self::LinePlaneIntersection { .. }
            | Self::ProjectOnPlane { .. }
            | Self::ThreePlaneIntersection { .. } => DatumType::Point,
            Self::TwoPoints { .. }
            | Self::PlaneIntersection { .. }
            | Self::PointDirection { .. } => DatumType::Line,
            Self::ThreePoints { .. } | Self::PointNormal { .. } | Self::Offset { .. } => {
                DatumType::Plane
            }
        }
    }

    /// Referenced datum indices with the type each must produce
    pub fn references(&self) -> Vec<(usize, DatumType)> {
        use DatumType::{Line as L, Plane as P, Point as Pt};
        match *self {
            Self::Fixed { .. } | Self::ElementPoint { .. } => Vec::new(),
            Self::Midpoint { a, b } | Self::TwoPoints { a, b } => vec![(a, Pt), (b, Pt)],
            Self::LinePlaneIntersection { line, plane } => vec![(line, L), (plane, P)],
            Self::ProjectOnPlane { point, plane } => vec![(point, Pt), (plane, P)],
            Self::ThreePlaneIntersection { a, b, c } => vec![(a, P), (b, P), (c, P)],
            Self::PlaneIntersection { a, b } => vec![(a, P), (b, P)],
            Self::PointDirection { point, .. } | Self::PointNormal { point, .. } => {
                vec![(point, Pt)]
            }
            Self::ThreePoints { a, b, c } => vec![(a, Pt), (b, Pt), (c, Pt)],
            Self::Offset { plane, .. } => vec![(plane, P)],
        }
    }
}

/// Computed datum geometry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DatumValue {
    Point(DVec3),
    Line(Line),
    Plane(Plane),
}

impl DatumValue {
    pub fn datum_type(&self) -> DatumType {
        match self {
            Self::Point(_) => DatumType::Point,
            Self::Line(_) => DatumType::Line,
            Self::Plane(_) => DatumType::Plane,
        }
    }

    pub fn as_point(&self) -> Option<DVec3> {
        match self {
            Self::Point(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_line(&self) -> Option<Line> {
        match self {
            Self::Line(l) => Some(*l),
            _ => None,
        }
    }

    pub fn as_plane(&self) -> Option<Plane> {
        match self {
            Self::Plane(p) => Some(*p),
            _ => None,
        }
    }
}

/// A named datum with its last valid value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatumObject {
    pub name: String,
    pub kind: DatumKind,
    #[serde(skip)]
    pub value: Option<DatumValue>,
    /// Why the last update failed; `Some` means stale
    #[serde(skip)]
    pub error: Option<DerivedObjectError>,
}

impl DatumObject {
    pub fn new(name: impl Into<String>, kind: DatumKind) -> Self {
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

    /// Compute the value from the current source and earlier datums
    pub(super) fn compute(
        &self,
        earlier: &[DatumObject],
        source: &impl PointSource,
    ) -> Result<DatumValue, DerivedObjectError> {
        let dep = |index: usize| -> Result<DatumValue, DerivedObjectError> {
            earlier
                .get(index)
                .filter(|d| !d.is_stale())
                .and_then(|d| d.value)
                .ok_or_else(|| DerivedObjectError::StaleDependency(self.name.clone()))
        };
        let point = |i| {
            dep(i).and_then(|v| v.as_point().ok_or_else(|| self.mismatch(i, DatumType::Point)))
        };
        let line =
            |i| dep(i).and_then(|v| v.as_line().ok_or_else(|| self.mismatch(i, DatumType::Line)));
        let plane = |i| {
            dep(i).and_then(|v| v.as_plane().ok_or_else(|| self.mismatch(i, DatumType::Plane)))
        };
        let degenerate = || DerivedObjectError::Degenerate(self.name.clone());

        let value = match &self.kind {
            DatumKind::Fixed { position } => DatumValue::Point(*position),
            DatumKind::ElementPoint { element, point } => DatumValue::Point(
                source
                    .world_point(*element, point)
                    .ok_or_else(|| DerivedObjectError::MissingPoint(*element, point.clone()))?,
            ),
            DatumKind::Midpoint { a, b } => DatumValue::Point((point(*a)? + point(*b)?) * 0.5),
            DatumKind::LinePlaneIntersection { line: l, plane: p } => DatumValue::Point(
                plane(*p)?.intersect_line(&line(*l)?).ok_or_else(degenerate)?,
            ),
            DatumKind::ProjectOnPlane { point: pt, plane: p } => {
                DatumValue::Point(plane(*p)?.project(point(*pt)?))
            }
            DatumKind::ThreePlaneIntersection { a, b, c } => {
                let p = Plane::intersect_three(&plane(*a)?, &plane(*b)?, &plane(*c)?);
                DatumValue::Point(p.ok_or_else(degenerate)?)
            }
            DatumKind::TwoPoints { a, b } => {
                DatumValue::Line(Line::through(point(*a)?, point(*b)?).ok_or_else(degenerate)?)
            }
            DatumKind::PlaneIntersection { a, b } => {
                DatumValue::Line(plane(*a)?.intersect_plane(&plane(*b)?).ok_or_else(degenerate)?)
            }
            DatumKind::PointDirection { point: pt, direction } => {
                DatumValue::Line(Line::new(point(*pt)?, *direction).ok_or_else(degenerate)?)
            }
            DatumKind::ThreePoints { a, b, c } => DatumValue::Plane(
                Plane::through(point(*a)?, point(*b)?, point(*c)?).ok_or_else(degenerate)?,
            ),
            DatumKind::PointNormal { point: pt, normal } => {
                DatumValue::Plane(Plane::new(point(*pt)?, *normal).ok_or_else(degenerate)?)
            }
            DatumKind::Offset { plane: p, distance } => {
                DatumValue::Plane(plane(*p)?.offset(*distance))
            }
        };
        Ok(value)
    }

    fn mismatch(&self, index: usize, expected: DatumType) -> DerivedObjectError {
        DerivedObjectError::WrongKind {
            object: self.name.clone(),
            index,
            expected: expected.label(),
        }
    }
}
