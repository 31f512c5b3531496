//! Assembly (element tree) for suspension geometry
//!
//! Elements live in an arena keyed by id; parents, joint ends and control
//! targets refer to elements by id only.

mod control;
mod flatten;
mod joint;
mod tree_cache;
mod types;

use std::cell::RefCell;
use std::collections::HashMap;

use glam::DVec3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use control::{Control, InputBinding, InputKind};
pub use flatten::{
    FlatAnchor, FlatAssembly, FlatBody, FlatComponent, FlatConstraint, FlatKind, FlatSpring,
};
pub use joint::{JointConstraint, JointEnd, JointKind};
pub use types::{ElementKind, Frame, LocalPoint, RigidElement};

use crate::formula::{FormulaError, FormulaSet};
use tree_cache::TreeCache;

/// Read access to world-space positions, used by derived objects
pub trait PointSource {
    /// World position of a named point on an element
    fn world_point(&self, element: Uuid, point: &str) -> Option<DVec3>;

    /// Current length of a spring-damper element
    fn spring_length(&self, element: Uuid) -> Option<f64>;
}

/// Raw assembly data for deserialization (used internally)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AssemblyData {
    name: String,
    elements: HashMap<Uuid, RigidElement>,
    constraints: HashMap<Uuid, JointConstraint>,
    #[serde(default)]
    controls: Vec<Control>,
}

/// Suspension assembly
#[derive(Debug, Clone, Serialize)]
#[serde(into = "AssemblyData")]
pub struct Assembly {
    pub name: String,
    /// All elements
    pub elements: HashMap<Uuid, RigidElement>,
    /// All joints
    pub constraints: HashMap<Uuid, JointConstraint>,
    /// Controls in creation order
    pub controls: Vec<Control>,
    /// Name to ID index for elements (O(1) lookup)
    pub(crate) element_name_index: HashMap<String, Uuid>,
    /// Cached tree structure (interior mutability for lazy evaluation)
    cache: RefCell<TreeCache>,
}

impl From<Assembly> for AssemblyData {
    fn from(assembly: Assembly) -> Self {
        Self {
            name: assembly.name,
            elements: assembly.elements,
            constraints: assembly.constraints,
            controls: assembly.controls,
        }
    }
}

impl From<AssemblyData> for Assembly {
    fn from(data: AssemblyData) -> Self {
        let mut assembly = Self {
            name: data.name,
            elements: data.elements,
            constraints: data.constraints,
            controls: data.controls,
            element_name_index: HashMap::new(),
            cache: RefCell::new(TreeCache::default()),
        };
        assembly.rebuild_indices();
        assembly
    }
}

impl<'de> Deserialize<'de> for Assembly {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let data = AssemblyData::deserialize(deserializer)?;
        Ok(Assembly::from(data))
    }
}

impl Default for Assembly {
    fn default() -> Self {
        Self::new("suspension")
    }
}

impl Assembly {
    /// Create a new empty assembly
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            elements: HashMap::new(),
            constraints: HashMap::new(),
            controls: Vec::new(),
            element_name_index: HashMap::new(),
            cache: RefCell::new(TreeCache::default()),
        }
    }

    /// Rebuild name indices (call after deserialization)
    pub fn rebuild_indices(&mut self) {
        self.element_name_index.clear();
        for (id, element) in &self.elements {
            self.element_name_index.insert(element.name.clone(), *id);
        }
        self.invalidate_cache();
    }

    /// Invalidate the tree cache (call after any structural change)
    pub(crate) fn invalidate_cache(&self) {
        self.cache.borrow_mut().invalidate();
    }

    /// Ensure the cache is valid, rebuilding if necessary
    pub(crate) fn ensure_cache_valid(&self) {
        let mut cache = self.cache.borrow_mut();
        if !cache.valid {
            cache.rebuild(&self.elements);
        }
    }

    // ============== Elements ==============

    /// Add an element; its parent must already exist and its name be unique
    pub fn add_element(&mut self, element: RigidElement) -> Result<Uuid, AssemblyError> {
        if self.element_name_index.contains_key(&element.name) {
            return Err(AssemblyError::DuplicateName(element.name));
        }
        if let Some(parent) = element.parent
            && !self.elements.contains_key(&parent)
        {
            return Err(AssemblyError::ElementNotFound(parent));
        }
        let id = element.id;
        self.element_name_index.insert(element.name.clone(), id);
        self.elements.insert(id, element);
        self.invalidate_cache();
        Ok(id)
    }

    /// Remove an element with its descendants, and every joint and control
    /// that referenced them. Returns the removed element IDs.
    pub fn remove_element(&mut self, id: Uuid) -> Result<Vec<Uuid>, AssemblyError> {
        if !self.elements.contains_key(&id) {
            return Err(AssemblyError::ElementNotFound(id));
        }
        let mut removed = vec![id];
        removed.extend(self.descendants(id));

        for rid in &removed {
            if let Some(element) = self.elements.remove(rid) {
                self.element_name_index.remove(&element.name);
            }
        }
        self.constraints
            .retain(|_, c| !removed.iter().any(|&r| c.touches(r)));
        self.controls.retain(|c| !removed.contains(&c.target));
        self.invalidate_cache();

        tracing::debug!("Removed {} elements", removed.len());
        Ok(removed)
    }

    /// Move an element under a new parent (or to the root)
    pub fn set_parent(&mut self, id: Uuid, parent: Option<Uuid>) -> Result<(), AssemblyError> {
        if !self.elements.contains_key(&id) {
            return Err(AssemblyError::ElementNotFound(id));
        }
        if let Some(p) = parent {
            if !self.elements.contains_key(&p) {
                return Err(AssemblyError::ElementNotFound(p));
            }
            if p == id || self.descendants(id).contains(&p) {
                return Err(AssemblyError::WouldCreateCycle);
            }
        }
        if let Some(element) = self.elements.get_mut(&id) {
            element.parent = parent;
        }
        self.invalidate_cache();
        Ok(())
    }

    pub fn get_element(&self, id: Uuid) -> Option<&RigidElement> {
        self.elements.get(&id)
    }

    pub fn get_element_mut(&mut self, id: Uuid) -> Option<&mut RigidElement> {
        self.elements.get_mut(&id)
    }

    pub fn element_by_name(&self, name: &str) -> Option<&RigidElement> {
        self.element_name_index
            .get(name)
            .and_then(|id| self.elements.get(id))
    }

    /// All root elements (no parent), sorted by name
    pub fn get_root_elements(&self) -> Vec<Uuid> {
        self.ensure_cache_valid();
        self.cache.borrow().roots.clone()
    }

    /// Direct children sorted by name
    pub fn children(&self, id: Uuid) -> Vec<Uuid> {
        self.ensure_cache_valid();
        self.cache
            .borrow()
            .children
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// All descendants, depth-first
    pub fn descendants(&self, id: Uuid) -> Vec<Uuid> {
        let mut result = Vec::new();
        let mut stack = self.children(id);
        stack.reverse();
        while let Some(child) = stack.pop() {
            result.push(child);
            let mut grand = self.children(child);
            grand.reverse();
            stack.extend(grand);
        }
        result
    }

    /// All elements in depth-first order from all roots
    pub fn elements_depth_first(&self) -> Vec<Uuid> {
        self.ensure_cache_valid();
        self.cache.borrow().depth_first()
    }

    /// Depth of an element (root = 0)
    pub fn depth(&self, id: Uuid) -> Option<usize> {
        self.ensure_cache_valid();
        self.cache.borrow().depths.get(&id).copied()
    }

    // ============== Frames and points ==============

    /// World frame of an element (composition of its parent chain)
    pub fn world_frame(&self, id: Uuid) -> Result<Frame, AssemblyError> {
        self.ensure_cache_valid();
        let cache = self.cache.borrow();
        let chain = cache
            .ancestors
            .get(&id)
            .ok_or(AssemblyError::ElementNotFound(id))?;
        Ok(chain.iter().fold(Frame::IDENTITY, |world, link| {
            world.compose(&self.elements[link].frame)
        }))
    }

    /// Set an element's frame from a world pose, keeping its parent
    pub fn set_world_frame(&mut self, id: Uuid, world: Frame) -> Result<(), AssemblyError> {
        let parent = self
            .elements
            .get(&id)
            .ok_or(AssemblyError::ElementNotFound(id))?
            .parent;
        let parent_world = match parent {
            Some(p) => self.world_frame(p)?,
            None => Frame::IDENTITY,
        };
        let local = parent_world.inverse().compose(&world);
        if let Some(element) = self.elements.get_mut(&id) {
            element.frame = local;
        }
        Ok(())
    }

    /// World position of a named point
    pub fn world_position(&self, id: Uuid, point: &str) -> Result<DVec3, AssemblyError> {
        let element = self
            .elements
            .get(&id)
            .ok_or(AssemblyError::ElementNotFound(id))?;
        let local = element
            .point(point)
            .ok_or_else(|| AssemblyError::PointNotFound(id, point.to_string()))?;
        Ok(self.world_frame(id)?.transform_point(local))
    }

    /// World position of a joint end
    pub fn end_position(&self, end: &JointEnd) -> Result<DVec3, AssemblyError> {
        match end {
            JointEnd::Ground { position } => Ok(*position),
            JointEnd::Element { element, point } => self.world_position(*element, point),
        }
    }

    /// Resolve every point coordinate formula, scoped by element name
    pub fn apply_formulas(&mut self, formulas: &FormulaSet) -> Result<(), AssemblyError> {
        for element in self.elements.values_mut() {
            for point in &mut element.points {
                let mut resolved = [0.0; 3];
                for (axis, coord) in point.coords.iter().enumerate() {
                    resolved[axis] = formulas.evaluate(coord, &element.name).map_err(|source| {
                        AssemblyError::Formula {
                            element: element.name.clone(),
                            point: point.name.clone(),
                            source,
                        }
                    })?;
                }
                point.position = DVec3::from_array(resolved);
            }
        }
        Ok(())
    }

    // ============== Joints ==============

    /// Add a joint; ends must reference existing points
    pub fn add_constraint(&mut self, mut joint: JointConstraint) -> Result<Uuid, AssemblyError> {
        for end in [&joint.a, &joint.b] {
            if let JointEnd::Element { element, point } = end {
                let target = self
                    .elements
                    .get(element)
                    .ok_or(AssemblyError::ElementNotFound(*element))?;
                if target.point(point).is_none() {
                    return Err(AssemblyError::PointNotFound(*element, point.clone()));
                }
            }
        }
        if let JointKind::LinearBushing { dl_min, dl_max, .. } = joint.kind
            && dl_min > dl_max
        {
            return Err(AssemblyError::InvalidTravelBounds(joint.id));
        }
        joint.clamp_travel();
        let id = joint.id;
        self.constraints.insert(id, joint);
        Ok(id)
    }

    pub fn remove_constraint(&mut self, id: Uuid) -> Option<JointConstraint> {
        self.constraints.remove(&id)
    }

    pub fn get_constraint(&self, id: Uuid) -> Option<&JointConstraint> {
        self.constraints.get(&id)
    }

    /// Set bushing travel (clamped); returns the stored value
    pub fn set_travel(&mut self, id: Uuid, dl: f64) -> Result<f64, AssemblyError> {
        self.constraints
            .get_mut(&id)
            .ok_or(AssemblyError::ConstraintNotFound(id))?
            .set_travel(dl)
            .ok_or(AssemblyError::NotABushing(id))
    }

    /// Clamp every bushing travel to its bounds
    pub fn clamp_travel(&mut self) {
        for joint in self.constraints.values_mut() {
            joint.clamp_travel();
        }
    }

    // ============== Controls ==============

    pub fn add_control(&mut self, control: Control) -> Result<Uuid, AssemblyError> {
        if !self.elements.contains_key(&control.target) {
            return Err(AssemblyError::ElementNotFound(control.target));
        }
        let id = control.id;
        self.controls.push(control);
        Ok(id)
    }

    pub fn get_control(&self, id: Uuid) -> Option<&Control> {
        self.controls.iter().find(|c| c.id == id)
    }

    /// Advance the active controls by `dt` seconds.
    ///
    /// Each active control moves the travel of every bushing touching its
    /// target; travel is clamped. Returns the number of joints updated.
    pub fn apply_controls(&mut self, dt: f64, active: &[Uuid]) -> usize {
        let mut updated = 0;
        for control in self.controls.iter_mut().filter(|c| active.contains(&c.id)) {
            let delta = control.delta(dt);
            control.value += delta;
            for joint in self.constraints.values_mut() {
                if !joint.touches(control.target) {
                    continue;
                }
                if let Some(dl) = joint.travel() {
                    joint.set_travel(dl + delta);
                    updated += 1;
                }
            }
        }
        updated
    }

    /// Set the absolute travel of every bushing touching a control's target
    pub fn set_control_value(&mut self, id: Uuid, value: f64) -> Result<(), AssemblyError> {
        let control = self
            .controls
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(AssemblyError::ControlNotFound(id))?;
        control.value = value;
        let target = control.target;
        for joint in self.constraints.values_mut().filter(|j| j.touches(target)) {
            joint.set_travel(value);
        }
        Ok(())
    }

    /// Validate references of all joints, controls and spring-dampers
    pub fn validate(&self) -> Result<(), Vec<AssemblyError>> {
        let mut errors = Vec::new();

        let check_end = |end: &JointEnd, errors: &mut Vec<AssemblyError>| {
            if let JointEnd::Element { element, point } = end {
                match self.elements.get(element) {
                    None => errors.push(AssemblyError::ElementNotFound(*element)),
                    Some(e) if e.point(point).is_none() => {
                        errors.push(AssemblyError::PointNotFound(*element, point.clone()))
                    }
                    Some(_) => {}
                }
            }
        };

        for joint in self.constraints.values() {
            check_end(&joint.a, &mut errors);
            check_end(&joint.b, &mut errors);
        }
        for element in self.elements.values() {
            if let ElementKind::SpringDamper { end_a, end_b, .. } = &element.kind {
                check_end(end_a, &mut errors);
                check_end(end_b, &mut errors);
            }
            if let Some(parent) = element.parent
                && !self.elements.contains_key(&parent)
            {
                errors.push(AssemblyError::ElementNotFound(parent));
            }
        }
        for control in &self.controls {
            if !self.elements.contains_key(&control.target) {
                errors.push(AssemblyError::ElementNotFound(control.target));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl PointSource for Assembly {
    fn world_point(&self, element: Uuid, point: &str) -> Option<DVec3> {
        self.world_position(element, point).ok()
    }

    fn spring_length(&self, element: Uuid) -> Option<f64> {
        match &self.elements.get(&element)?.kind {
            ElementKind::SpringDamper { end_a, end_b, .. } => {
                let a = self.end_position(end_a).ok()?;
                let b = self.end_position(end_b).ok()?;
                Some((b - a).length())
            }
            _ => None,
        }
    }
}

/// Assembly-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum AssemblyError {
    #[error("Element not found: {0}")]
    ElementNotFound(Uuid),
    #[error("Point '{1}' not found on element {0}")]
    PointNotFound(Uuid, String),
    #[error("Joint not found: {0}")]
    ConstraintNotFound(Uuid),
    #[error("Control not found: {0}")]
    ControlNotFound(Uuid),
    #[error("Element name already in use: {0}")]
    DuplicateName(String),
    #[error("Reparenting would create a cycle")]
    WouldCreateCycle,
    #[error("Element {0} is not a rigid body")]
    NotABody(Uuid),
    #[error("Joint {0} is not a linear bushing")]
    NotABushing(Uuid),
    #[error("Joint {0} has dl_min > dl_max")]
    InvalidTravelBounds(Uuid),
    #[error("Formula error at {element}.{point}: {source}")]
    Formula {
        element: String,
        point: String,
        source: FormulaError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::NamedScalar;
    use approx::assert_relative_eq;
    use glam::DQuat;

    fn sample() -> (Assembly, Uuid, Uuid, Uuid) {
        let mut assembly = Assembly::new("front");
        let chassis = assembly
            .add_element(
                RigidElement::new("chassis", ElementKind::Frame)
                    .with_frame(Frame::from_position(DVec3::new(0.0, 0.0, 300.0)))
                    .with_point("rack_mount", DVec3::new(0.0, 0.0, 0.0)),
            )
            .unwrap();
        let corner = assembly
            .add_element(
                RigidElement::new("corner", ElementKind::Assembly)
                    .with_parent(chassis)
                    .with_frame(Frame::new(
                        DVec3::new(600.0, 0.0, 0.0),
                        DQuat::from_rotation_z(std::f64::consts::FRAC_PI_2),
                    )),
            )
            .unwrap();
        let upright = assembly
            .add_element(
                RigidElement::new("upright", ElementKind::Body)
                    .with_parent(corner)
                    .with_frame(Frame::from_position(DVec3::new(10.0, 0.0, 0.0)))
                    .with_point("hub", DVec3::new(0.0, 0.0, 5.0)),
            )
            .unwrap();
        (assembly, chassis, corner, upright)
    }

    #[test]
    fn test_world_frame_composes_parents() {
        let (assembly, _, _, upright) = sample();
        let hub = assembly.world_position(upright, "hub").unwrap();
        assert_relative_eq!(hub.x, 600.0, epsilon = 1e-9);
        assert_relative_eq!(hub.y, 10.0, epsilon = 1e-9);
        assert_relative_eq!(hub.z, 305.0, epsilon = 1e-9);
    }

    #[test]
    fn test_set_world_frame_round_trip() {
        let (mut assembly, _, _, upright) = sample();
        let target = Frame::new(DVec3::new(1.0, 2.0, 3.0), DQuat::from_rotation_x(0.3));
        assembly.set_world_frame(upright, target).unwrap();
        let world = assembly.world_frame(upright).unwrap();
        assert!(world.position.abs_diff_eq(target.position, 1e-9));
        assert!(world.rotation.abs_diff_eq(target.rotation, 1e-9));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (mut assembly, ..) = sample();
        let err = assembly
            .add_element(RigidElement::new("upright", ElementKind::Body))
            .unwrap_err();
        assert!(matches!(err, AssemblyError::DuplicateName(_)));
    }

    #[test]
    fn test_remove_element_cascades() {
        let (mut assembly, chassis, corner, upright) = sample();
        let joint = assembly
            .add_constraint(JointConstraint::ball(
                "hub_ball",
                JointEnd::point(chassis, "rack_mount"),
                JointEnd::point(upright, "hub"),
            ))
            .unwrap();
        assembly
            .add_control(Control::new("bump", upright, InputBinding::keyboard("W"), 10.0))
            .unwrap();

        let removed = assembly.remove_element(corner).unwrap();
        assert_eq!(removed, vec![corner, upright]);
        assert!(assembly.get_constraint(joint).is_none());
        assert!(assembly.controls.is_empty());
        assert!(assembly.element_by_name("upright").is_none());
    }

    #[test]
    fn test_reparent_cycle_rejected() {
        let (mut assembly, chassis, _, upright) = sample();
        let err = assembly.set_parent(chassis, Some(upright)).unwrap_err();
        assert!(matches!(err, AssemblyError::WouldCreateCycle));
    }

    #[test]
    fn test_apply_formulas_scoped_by_element() {
        let mut assembly = Assembly::new("a");
        let arm = assembly
            .add_element(
                RigidElement::new("lower_arm", ElementKind::Arm)
                    .with_formula_point("outer", ["length", "track / 2", "0"]),
            )
            .unwrap();
        let formulas = FormulaSet::from_scalars(vec![
            NamedScalar::new("track", "1200"),
            NamedScalar::scoped("lower_arm", "length", "350"),
        ]);
        assembly.apply_formulas(&formulas).unwrap();
        let outer = assembly.get_element(arm).unwrap().point("outer").unwrap();
        assert_eq!(outer, DVec3::new(350.0, 600.0, 0.0));
    }

    #[test]
    fn test_apply_formulas_reports_unknown() {
        let mut assembly = Assembly::new("a");
        assembly
            .add_element(
                RigidElement::new("arm", ElementKind::Arm)
                    .with_formula_point("p", ["nope", "0", "0"]),
            )
            .unwrap();
        let err = assembly.apply_formulas(&FormulaSet::new()).unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::Formula {
                source: FormulaError::UnknownVariable { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_apply_formulas_ignores_unused_broken_global() {
        let mut assembly = Assembly::new("a");
        let arm = assembly
            .add_element(
                RigidElement::new("arm", ElementKind::Arm)
                    .with_formula_point("p", ["track / 2", "0", "0"]),
            )
            .unwrap();
        let formulas = FormulaSet::from_scalars(vec![
            NamedScalar::new("track", "1200"),
            NamedScalar::new("unused", "not_defined * 2"),
        ]);
        assembly.apply_formulas(&formulas).unwrap();
        let p = assembly.get_element(arm).unwrap().point("p").unwrap();
        assert_eq!(p, DVec3::new(600.0, 0.0, 0.0));
    }

    #[test]
    fn test_controls_clamp_travel() {
        let (mut assembly, chassis, _, upright) = sample();
        let joint = assembly
            .add_constraint(JointConstraint::linear_bushing(
                "rack",
                JointEnd::point(chassis, "rack_mount"),
                JointEnd::point(upright, "hub"),
                DVec3::Y,
                -20.0,
                20.0,
            ))
            .unwrap();
        let control = assembly
            .add_control(Control::new("steer", upright, InputBinding::keyboard("D"), 50.0))
            .unwrap();

        assert_eq!(assembly.apply_controls(0.3, &[control]), 1);
        assert_eq!(assembly.get_constraint(joint).unwrap().travel(), Some(15.0));
        assembly.apply_controls(0.3, &[control]);
        assert_eq!(assembly.get_constraint(joint).unwrap().travel(), Some(20.0));
        assert_eq!(assembly.apply_controls(0.3, &[]), 0);
    }

    #[test]
    fn test_invalid_travel_bounds() {
        let (mut assembly, chassis, _, upright) = sample();
        let err = assembly
            .add_constraint(JointConstraint::linear_bushing(
                "rack",
                JointEnd::point(chassis, "rack_mount"),
                JointEnd::point(upright, "hub"),
                DVec3::Y,
                5.0,
                -5.0,
            ))
            .unwrap_err();
        assert!(matches!(err, AssemblyError::InvalidTravelBounds(_)));
    }

    #[test]
    fn test_serde_round_trip_rebuilds_index() {
        let (assembly, _, _, upright) = sample();
        let text = ron::to_string(&assembly).unwrap();
        let back: Assembly = ron::from_str(&text).unwrap();
        assert_eq!(back.element_by_name("upright").map(|e| e.id), Some(upright));
        let hub = back.world_position(upright, "hub").unwrap();
        assert_relative_eq!(hub.z, 305.0, epsilon = 1e-9);
    }
}
