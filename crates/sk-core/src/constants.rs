//! Global constants for sk-core

/// Default residual norm below which a component counts as solved (mm)
pub const SOLVER_TOLERANCE: f64 = 1e-9;

/// Default Newton/LM iteration ceiling per component
pub const SOLVER_MAX_ITERATIONS: usize = 100;

/// Initial Levenberg-Marquardt damping factor
pub const SOLVER_INITIAL_DAMPING: f64 = 1e-3;

/// Central finite-difference step for the numerical Jacobian
pub const SOLVER_FD_STEP: f64 = 1e-7;

/// Lengths and directions shorter than this are treated as degenerate
pub const GEOMETRY_EPSILON: f64 = 1e-12;

/// Sweeps never run more solver invocations than this unless asked to
pub const SWEEP_MAX_COUNT: usize = 64;

/// Scope path of project-wide formulas
pub const GLOBAL_SCOPE: &str = "";

/// Names understood by the expression evaluator that are never variables
pub const RESERVED_NAMES: &[&str] = &[
    "sqrt", "exp", "ln", "log", "abs", "sin", "cos", "tan", "asin", "acos", "atan", "atan2",
    "sinh", "cosh", "tanh", "asinh", "acosh", "atanh", "floor", "ceil", "round", "signum", "max",
    "min", "pi", "e", "deg", "rad",
];
