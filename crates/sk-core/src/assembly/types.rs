//! Element types for the suspension assembly

use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::joint::JointEnd;

/// Position and orientation relative to the parent element (or world)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub position: DVec3,
    pub rotation: DQuat,
}

impl Default for Frame {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Frame {
    pub const IDENTITY: Self = Self {
        position: DVec3::ZERO,
        rotation: DQuat::IDENTITY,
    };

    pub fn new(position: DVec3, rotation: DQuat) -> Self {
        Self { position, rotation }
    }

    pub fn from_position(position: DVec3) -> Self {
        Self {
            position,
            rotation: DQuat::IDENTITY,
        }
    }

    /// `self` followed by `child` (child expressed in self)
    pub fn compose(&self, child: &Frame) -> Frame {
        Frame {
            position: self.position + self.rotation * child.position,
            rotation: (self.rotation * child.rotation).normalize(),
        }
    }

    pub fn inverse(&self) -> Frame {
        let rotation = self.rotation.inverse();
        Frame {
            position: -(rotation * self.position),
            rotation,
        }
    }

    pub fn transform_point(&self, local: DVec3) -> DVec3 {
        self.position + self.rotation * local
    }

    pub fn transform_vector(&self, local: DVec3) -> DVec3 {
        self.rotation * local
    }

    /// Pose as 7 values: position then quaternion `xyzw`
    pub fn to_dofs(&self) -> Vec<f64> {
        let p = self.position;
        let q = self.rotation;
        vec![p.x, p.y, p.z, q.x, q.y, q.z, q.w]
    }

    /// Inverse of [`Frame::to_dofs`]; `None` when the slice is not 7 long
    pub fn from_dofs(dofs: &[f64]) -> Option<Frame> {
        let [px, py, pz, qx, qy, qz, qw] = *dofs else {
            return None;
        };
        Some(Frame {
            position: DVec3::new(px, py, pz),
            rotation: DQuat::from_xyzw(qx, qy, qz, qw),
        })
    }
}

/// A named point in element-local coordinates.
///
/// Coordinates are formulas; `position` holds the last resolved value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalPoint {
    pub name: String,
    pub coords: [String; 3],
    #[serde(default)]
    pub position: DVec3,
}

impl LocalPoint {
    /// A point with literal coordinates
    pub fn new(name: impl Into<String>, position: DVec3) -> Self {
        Self {
            name: name.into(),
            coords: [
                position.x.to_string(),
                position.y.to_string(),
                position.z.to_string(),
            ],
            position,
        }
    }

    /// A point whose coordinates are formulas (resolved by `apply_formulas`)
    pub fn formula(name: impl Into<String>, coords: [&str; 3]) -> Self {
        Self {
            name: name.into(),
            coords: coords.map(str::to_string),
            position: DVec3::ZERO,
        }
    }
}

/// Kind of a rigid element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ElementKind {
    /// Chassis or reference frame
    Frame,
    /// Control arm / wishbone
    Arm,
    /// Tie rod, push rod or any two-point link
    Bar,
    /// Upright, rocker or other generic body
    Body,
    Tire {
        radius: f64,
        width: f64,
    },
    /// Connector between two points; carries no solver DOFs
    SpringDamper {
        end_a: JointEnd,
        end_b: JointEnd,
        free_length: f64,
        min_length: f64,
        max_length: f64,
    },
    /// Grouping of child elements
    Assembly,
}

impl ElementKind {
    /// Whether the solver moves this element as a rigid body
    pub fn is_body(&self) -> bool {
        !matches!(self, Self::SpringDamper { .. } | Self::Assembly)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Frame => "Frame",
            Self::Arm => "Arm",
            Self::Bar => "Bar",
            Self::Body => "Body",
            Self::Tire { .. } => "Tire",
            Self::SpringDamper { .. } => "SpringDamper",
            Self::Assembly => "Assembly",
        }
    }
}

/// A rigid element in the assembly tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigidElement {
    pub id: Uuid,
    pub name: String,
    pub kind: ElementKind,
    /// Parent element (None for roots)
    pub parent: Option<Uuid>,
    /// Transform relative to the parent
    pub frame: Frame,
    pub points: Vec<LocalPoint>,
    /// Fixed elements act as ground for the solver
    pub fixed: bool,
}

impl RigidElement {
    /// Create a new element at the parent origin
    pub fn new(name: impl Into<String>, kind: ElementKind) -> Self {
        let fixed = matches!(kind, ElementKind::Frame);
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            parent: None,
            frame: Frame::IDENTITY,
            points: Vec::new(),
            fixed,
        }
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = frame;
        self
    }

    pub fn with_point(mut self, name: impl Into<String>, position: DVec3) -> Self {
        self.points.push(LocalPoint::new(name, position));
        self
    }

    pub fn with_formula_point(mut self, name: impl Into<String>, coords: [&str; 3]) -> Self {
        self.points.push(LocalPoint::formula(name, coords));
        self
    }

    pub fn fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }

    /// Local position of a named point
    pub fn point(&self, name: &str) -> Option<DVec3> {
        self.points
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_frame_compose_inverse() {
        let a = Frame::new(
            DVec3::new(1.0, 2.0, 3.0),
            DQuat::from_rotation_z(std::f64::consts::FRAC_PI_2),
        );
        let p = DVec3::new(1.0, 0.0, 0.0);
        let world = a.transform_point(p);
        assert_relative_eq!(world.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(world.y, 3.0, epsilon = 1e-12);

        let back = a.inverse().transform_point(world);
        assert!(back.abs_diff_eq(p, 1e-12));

        let identity = a.compose(&a.inverse());
        assert!(identity.position.abs_diff_eq(DVec3::ZERO, 1e-12));
    }

    #[test]
    fn test_frame_dofs() {
        let f = Frame::new(DVec3::new(1.0, 2.0, 3.0), DQuat::from_rotation_x(0.4));
        assert_eq!(Frame::from_dofs(&f.to_dofs()), Some(f));
        assert_eq!(Frame::from_dofs(&[1.0, 2.0]), None);
    }

    #[test]
    fn test_kind_is_body() {
        assert!(ElementKind::Arm.is_body());
        assert!(!ElementKind::Assembly.is_body());
        assert!(RigidElement::new("chassis", ElementKind::Frame).fixed);
    }
}
