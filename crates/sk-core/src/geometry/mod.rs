//! Geometric primitives

mod eigen;
mod line;
mod obb;

pub use eigen::{SymmetricEigen, symmetric_eigen};
pub use line::{Line, Plane, angle_between};
pub use obb::Obb;
