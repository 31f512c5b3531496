//! Joint constraints between elements

use glam::DVec3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One side of a joint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JointEnd {
    /// A fixed point in world coordinates
    Ground { position: DVec3 },
    /// A named point on an element
    Element { element: Uuid, point: String },
}

impl JointEnd {
    pub fn ground(position: DVec3) -> Self {
        Self::Ground { position }
    }

    pub fn point(element: Uuid, point: impl Into<String>) -> Self {
        Self::Element {
            element,
            point: point.into(),
        }
    }

    pub fn element(&self) -> Option<Uuid> {
        match self {
            Self::Ground { .. } => None,
            Self::Element { element, .. } => Some(*element),
        }
    }
}

/// Kind of joint and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JointKind {
    /// Points coincide
    Ball,
    /// Points coincide and the axes (local to each side) stay parallel
    Revolute { axis_a: DVec3, axis_b: DVec3 },
    /// Point B stays on the line through A along `axis` (local to A)
    Slide { axis: DVec3 },
    /// Point B sits at `dl` along `axis` (local to A); `dl` is clamped to its bounds
    LinearBushing {
        axis: DVec3,
        dl: f64,
        dl_min: f64,
        dl_max: f64,
    },
}

impl JointKind {
    /// Number of scalar equations this joint contributes
    pub fn equation_count(&self) -> usize {
        match self {
            Self::Ball => 3,
            Self::Revolute { .. } => 5,
            Self::Slide { .. } => 2,
            Self::LinearBushing { .. } => 3,
        }
    }
}

/// A joint binding two elements (or an element and ground)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointConstraint {
    pub id: Uuid,
    pub name: String,
    pub kind: JointKind,
    pub a: JointEnd,
    pub b: JointEnd,
    /// Allowed play in mm for compliant joints (ignored when elastic elements are disabled)
    #[serde(default)]
    pub elastic: Option<f64>,
}

impl JointConstraint {
    pub fn new(name: impl Into<String>, kind: JointKind, a: JointEnd, b: JointEnd) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            a,
            b,
            elastic: None,
        }
    }

    pub fn ball(name: impl Into<String>, a: JointEnd, b: JointEnd) -> Self {
        Self::new(name, JointKind::Ball, a, b)
    }

    pub fn revolute(
        name: impl Into<String>,
        a: JointEnd,
        b: JointEnd,
        axis_a: DVec3,
        axis_b: DVec3,
    ) -> Self {
        Self::new(
            name,
            JointKind::Revolute {
                axis_a: axis_a.try_normalize().unwrap_or(DVec3::Z),
                axis_b: axis_b.try_normalize().unwrap_or(DVec3::Z),
            },
            a,
            b,
        )
    }

    pub fn slide(name: impl Into<String>, a: JointEnd, b: JointEnd, axis: DVec3) -> Self {
        Self::new(
            name,
            JointKind::Slide {
                axis: axis.try_normalize().unwrap_or(DVec3::Z),
            },
            a,
            b,
        )
    }

    pub fn linear_bushing(
        name: impl Into<String>,
        a: JointEnd,
        b: JointEnd,
        axis: DVec3,
        dl_min: f64,
        dl_max: f64,
    ) -> Self {
        Self::new(
            name,
            JointKind::LinearBushing {
                axis: axis.try_normalize().unwrap_or(DVec3::Z),
                dl: 0.0_f64.max(dl_min).min(dl_max),
                dl_min,
                dl_max,
            },
            a,
            b,
        )
    }

    pub fn with_elastic(mut self, play: f64) -> Self {
        self.elastic = Some(play.abs());
        self
    }

    /// Whether either end is on `element`
    pub fn touches(&self, element: Uuid) -> bool {
        self.a.element() == Some(element) || self.b.element() == Some(element)
    }

    /// Current bushing travel
    pub fn travel(&self) -> Option<f64> {
        match self.kind {
            JointKind::LinearBushing { dl, .. } => Some(dl),
            _ => None,
        }
    }

    /// Set bushing travel clamped to its bounds; returns the stored value
    pub fn set_travel(&mut self, value: f64) -> Option<f64> {
        match &mut self.kind {
            JointKind::LinearBushing {
                dl, dl_min, dl_max, ..
            } => {
                *dl = value.max(*dl_min).min(*dl_max);
                Some(*dl)
            }
            _ => None,
        }
    }

    /// Re-clamp the current travel
    pub fn clamp_travel(&mut self) {
        if let Some(dl) = self.travel() {
            self.set_travel(dl);
        }
    }
}
