//! Solver-ready view of an assembly

use std::collections::HashMap;

use glam::DVec3;
use uuid::Uuid;

use super::joint::{JointEnd, JointKind};
use super::types::{ElementKind, Frame};
use super::{Assembly, AssemblyError};

/// Where a constraint end sits in the flattened assembly
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlatAnchor {
    /// World position
    Ground(DVec3),
    /// Point in body-local coordinates
    Body { body: usize, local: DVec3 },
}

impl FlatAnchor {
    pub fn body(&self) -> Option<usize> {
        match self {
            Self::Ground(_) => None,
            Self::Body { body, .. } => Some(*body),
        }
    }
}

/// A rigid body with its world pose
#[derive(Debug, Clone, PartialEq)]
pub struct FlatBody {
    pub element: Uuid,
    pub name: String,
    pub pose: Frame,
    pub fixed: bool,
}

/// Joint kind with everything the solver needs resolved
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlatKind {
    Ball,
    Revolute { axis_a: DVec3, axis_b: DVec3 },
    Slide { axis: DVec3 },
    LinearBushing { axis: DVec3, dl: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlatConstraint {
    pub id: Uuid,
    pub name: String,
    pub kind: FlatKind,
    pub a: FlatAnchor,
    pub b: FlatAnchor,
    pub elastic: Option<f64>,
}

/// Spring-damper connector with its length at flatten time
#[derive(Debug, Clone, PartialEq)]
pub struct FlatSpring {
    pub element: Uuid,
    pub a: FlatAnchor,
    pub b: FlatAnchor,
    pub length: f64,
}

/// Movable bodies that share constraints, solved together
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatComponent {
    pub bodies: Vec<usize>,
    pub constraints: Vec<usize>,
    pub springs: Vec<usize>,
    /// Whether any constraint ties the component to ground or a fixed body
    pub anchored: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatAssembly {
    pub bodies: Vec<FlatBody>,
    pub constraints: Vec<FlatConstraint>,
    pub springs: Vec<FlatSpring>,
    pub components: Vec<FlatComponent>,
    pub body_index: HashMap<Uuid, usize>,
}

impl FlatAssembly {
    /// Body index if the anchor is on a movable body
    pub fn movable(&self, anchor: &FlatAnchor) -> Option<usize> {
        anchor.body().filter(|&b| !self.bodies[b].fixed)
    }

    pub fn dof_count(&self, component: &FlatComponent) -> usize {
        component.bodies.len() * 6
    }
}

impl Assembly {
    /// Flatten the tree into bodies, constraints and independent components
    pub fn flatten(&self) -> Result<FlatAssembly, AssemblyError> {
        let mut flat = FlatAssembly::default();

        for id in self.elements_depth_first() {
            let element = &self.elements[&id];
            if !element.kind.is_body() {
                continue;
            }
            flat.body_index.insert(id, flat.bodies.len());
            flat.bodies.push(FlatBody {
                element: id,
                name: element.name.clone(),
                pose: self.world_frame(id)?,
                fixed: element.fixed,
            });
        }

        let mut joints: Vec<_> = self.constraints.values().collect();
        joints.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        for joint in joints {
            let kind = match joint.kind {
                JointKind::Ball => FlatKind::Ball,
                JointKind::Revolute { axis_a, axis_b } => FlatKind::Revolute { axis_a, axis_b },
                JointKind::Slide { axis } => FlatKind::Slide { axis },
                JointKind::LinearBushing {
                    axis,
                    dl,
                    dl_min,
                    dl_max,
                } => FlatKind::LinearBushing {
                    axis,
                    dl: dl.max(dl_min).min(dl_max),
                },
            };
            flat.constraints.push(FlatConstraint {
                id: joint.id,
                name: joint.name.clone(),
                kind,
                a: self.anchor(&flat, &joint.a)?,
                b: self.anchor(&flat, &joint.b)?,
                elastic: joint.elastic,
            });
        }

        for id in self.elements_depth_first() {
            let element = &self.elements[&id];
            if let ElementKind::SpringDamper { end_a, end_b, .. } = &element.kind {
                let length = (self.end_position(end_b)? - self.end_position(end_a)?).length();
                flat.springs.push(FlatSpring {
                    element: id,
                    a: self.anchor(&flat, end_a)?,
                    b: self.anchor(&flat, end_b)?,
                    length,
                });
            }
        }

        flat.components = partition(&flat);
        Ok(flat)
    }

    fn anchor(&self, flat: &FlatAssembly, end: &JointEnd) -> Result<FlatAnchor, AssemblyError> {
        match end {
            JointEnd::Ground { position } => Ok(FlatAnchor::Ground(*position)),
            JointEnd::Element { element, point } => {
                let body = *flat
                    .body_index
                    .get(element)
                    .ok_or(AssemblyError::NotABody(*element))?;
                let local = self.elements[element]
                    .point(point)
                    .ok_or_else(|| AssemblyError::PointNotFound(*element, point.clone()))?;
                Ok(FlatAnchor::Body { body, local })
            }
        }
    }
}

/// Group movable bodies connected through constraints or springs
fn partition(flat: &FlatAssembly) -> Vec<FlatComponent> {
    let mut parent: Vec<usize> = (0..flat.bodies.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let links = flat
        .constraints
        .iter()
        .map(|c| (c.a, c.b))
        .chain(flat.springs.iter().map(|s| (s.a, s.b)));
    for (a, b) in links {
        if let (Some(a), Some(b)) = (flat.movable(&a), flat.movable(&b)) {
            let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
            if ra != rb {
                parent[rb] = ra;
            }
        }
    }

    let mut components: Vec<FlatComponent> = Vec::new();
    let mut by_root: HashMap<usize, usize> = HashMap::new();
    for (i, body) in flat.bodies.iter().enumerate() {
        if body.fixed {
            continue;
        }
        let root = find(&mut parent, i);
        let index = *by_root.entry(root).or_insert_with(|| {
            components.push(FlatComponent::default());
            components.len() - 1
        });
        components[index].bodies.push(i);
    }

    let mut component_of = |anchor: &FlatAnchor| {
        flat.movable(anchor)
            .map(|b| find(&mut parent, b))
            .and_then(|root| by_root.get(&root).copied())
    };

    for (ci, c) in flat.constraints.iter().enumerate() {
        let Some(index) = component_of(&c.a).or_else(|| component_of(&c.b)) else {
            continue;
        };
        components[index].constraints.push(ci);
        if flat.movable(&c.a).is_none() || flat.movable(&c.b).is_none() {
            components[index].anchored = true;
        }
    }
    for (si, s) in flat.springs.iter().enumerate() {
        if let Some(index) = component_of(&s.a).or_else(|| component_of(&s.b)) {
            components[index].springs.push(si);
        }
    }

    components
}
