//! Core data model for the suspension kinematics engine
//!
//! This crate provides:
//! - Named, formula-driven scalars with dependency and cycle detection
//! - Geometric primitives (lines, planes, oriented bounding boxes)
//! - The assembly model: rigid elements, joint constraints and controls
//! - Derived objects (datums, measure tools, readonly variables)
//! - Project serialization

pub mod assembly;
pub mod constants;
pub mod derived;
pub mod formula;
pub mod geometry;
pub mod project;

// Re-exports for convenience
pub use assembly::{
    Assembly, AssemblyError, Control, ElementKind, FlatAnchor, FlatAssembly, FlatBody,
    FlatComponent, FlatConstraint, FlatKind, FlatSpring, Frame, InputBinding, InputKind,
    JointConstraint, JointEnd, JointKind, LocalPoint, PointSource, RigidElement,
};
pub use derived::{
    DatumKind, DatumObject, DatumValue, DerivedObjectError, DerivedObjects, MeasureKind,
    MeasureTool, ReadonlySource, ReadonlyVariable,
};
pub use formula::{FormulaError, FormulaSet, FormulaStatus, NamedScalar};
pub use geometry::{Line, Obb, Plane};
pub use project::{Project, ProjectError, SolverOptions};
