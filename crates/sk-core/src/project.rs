//! Project file serialization

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::assembly::Assembly;
use crate::constants::{
    SOLVER_FD_STEP, SOLVER_INITIAL_DAMPING, SOLVER_MAX_ITERATIONS, SOLVER_TOLERANCE,
};
use crate::derived::DerivedObjects;
use crate::formula::FormulaSet;

/// Current file format version
pub const PROJECT_VERSION: u32 = 1;

/// Solver settings stored with the project
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Residual norm below which a component is solved (mm)
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Initial Levenberg-Marquardt damping
    pub initial_damping: f64,
    pub finite_difference_step: f64,
    /// Hold every spring-damper at its current length
    pub freeze_spring_dampers: bool,
    /// Treat compliant joints as rigid
    pub disable_elastic: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            tolerance: SOLVER_TOLERANCE,
            max_iterations: SOLVER_MAX_ITERATIONS,
            initial_damping: SOLVER_INITIAL_DAMPING,
            finite_difference_step: SOLVER_FD_STEP,
            freeze_spring_dampers: false,
            disable_elastic: false,
        }
    }
}

impl SolverOptions {
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_initial_damping(mut self, damping: f64) -> Self {
        self.initial_damping = damping;
        self
    }

    pub fn with_finite_difference_step(mut self, step: f64) -> Self {
        self.finite_difference_step = step;
        self
    }

    pub fn with_frozen_spring_dampers(mut self, freeze: bool) -> Self {
        self.freeze_spring_dampers = freeze;
        self
    }

    pub fn with_elastic_disabled(mut self, disable: bool) -> Self {
        self.disable_elastic = disable;
        self
    }
}

/// Project file bundling the assembly with its formulas and derived objects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// File format version
    pub version: u32,
    /// Project name
    pub name: String,
    pub assembly: Assembly,
    #[serde(default)]
    pub formulas: FormulaSet,
    #[serde(default)]
    pub derived: DerivedObjects,
    #[serde(default)]
    pub options: SolverOptions,
}

impl Default for Project {
    fn default() -> Self {
        Self::new("New Project")
    }
}

impl Project {
    /// Create a new empty project
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: PROJECT_VERSION,
            name: name.into(),
            assembly: Assembly::default(),
            formulas: FormulaSet::new(),
            derived: DerivedObjects::new(),
            options: SolverOptions::default(),
        }
    }

    /// Save project to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ProjectError> {
        let path = path.as_ref();
        let content = self.to_bytes()?;
        std::fs::write(path, content).map_err(|e| ProjectError::Io(e.to_string()))?;
        tracing::info!("Saved project '{}' to {}", self.name, path.display());
        Ok(())
    }

    /// Serialize project to RON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProjectError> {
        let content = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ProjectError::Serialize(e.to_string()))?;
        Ok(content.into_bytes())
    }

    /// Load project from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProjectError> {
        let path = path.as_ref();
        let content = std::fs::read(path).map_err(|e| ProjectError::Io(e.to_string()))?;
        Self::load_from_bytes(&content)
    }

    /// Load project from RON bytes
    pub fn load_from_bytes(data: &[u8]) -> Result<Self, ProjectError> {
        let content =
            std::str::from_utf8(data).map_err(|e| ProjectError::Deserialize(e.to_string()))?;
        let project: Project =
            ron::from_str(content).map_err(|e| ProjectError::Deserialize(e.to_string()))?;
        if project.version > PROJECT_VERSION {
            return Err(ProjectError::UnsupportedVersion(project.version));
        }
        Ok(project)
    }
}

/// Project-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProjectError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
    #[error("Deserialization error: {0}")]
    Deserialize(String),
    #[error("Unsupported project version: {0}")]
    UnsupportedVersion(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{ElementKind, JointConstraint, JointEnd, RigidElement};
    use crate::derived::{DatumKind, DatumObject};
    use crate::formula::NamedScalar;
    use glam::DVec3;

    fn sample() -> Project {
        let mut project = Project::new("Front axle");
        let arm = project
            .assembly
            .add_element(
                RigidElement::new("lower_arm", ElementKind::Arm)
                    .with_formula_point("outer", ["track / 2", "0", "0"]),
            )
            .unwrap();
        project
            .formulas
            .insert(NamedScalar::new("track", "1250"))
            .unwrap();
        project
            .assembly
            .add_constraint(JointConstraint::ball(
                "inner",
                JointEnd::ground(DVec3::ZERO),
                JointEnd::point(arm, "outer"),
            ))
            .unwrap();
        project
            .derived
            .add_datum(DatumObject::new("origin", DatumKind::Fixed { position: DVec3::ZERO }))
            .unwrap();
        project.options = SolverOptions::default().with_max_iterations(42);
        project
    }

    #[test]
    fn test_bytes_round_trip() {
        let project = sample();
        let bytes = project.to_bytes().unwrap();
        let loaded = Project::load_from_bytes(&bytes).unwrap();

        assert_eq!(loaded.name, "Front axle");
        assert_eq!(loaded.options.max_iterations, 42);
        assert_eq!(loaded.formulas, project.formulas);
        assert_eq!(loaded.derived.datums.len(), 1);
        assert!(loaded.assembly.element_by_name("lower_arm").is_some());
        assert_eq!(loaded.assembly.constraints.len(), 1);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("axle.ron");
        sample().save(&path).unwrap();
        let loaded = Project::load(&path).unwrap();
        assert_eq!(loaded.version, PROJECT_VERSION);
    }

    #[test]
    fn test_load_rejects_garbage() {
        assert!(matches!(
            Project::load_from_bytes(b"not a project"),
            Err(ProjectError::Deserialize(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Project::load(dir.path().join("missing.ron")),
            Err(ProjectError::Io(_))
        ));
    }
}
