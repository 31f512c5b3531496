//! Kinematic Solver
//!
//! Levenberg-Marquardt solver over the joint equations of a flattened
//! assembly. Each independent component is solved on its own; a component
//! that fails keeps its pre-solve pose while the others commit.

use std::collections::{BTreeMap, HashMap};

use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sk_core::assembly::FlatAnchor;
use sk_core::{
    Assembly, AssemblyError, FlatAssembly, FlatComponent, FlatKind, Frame, SolverOptions,
};

use crate::snapshot::SolverSnapshot;

/// Damping floor; keeps steps along free (unconstrained) directions small
const MIN_DAMPING: f64 = 1e-9;

/// Upper bound on the LM damping before a component is declared stuck
const MAX_DAMPING: f64 = 1e12;

/// Solver errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SolveError {
    #[error("Component {component} did not converge in {iterations} iterations ({residual:.3e})")]
    NonConvergence {
        component: usize,
        iterations: usize,
        residual: f64,
    },
    #[error("Component {component}: singular system")]
    Singular { component: usize },
    #[error("Component {component} is over-constrained ({equations} equations, {dofs} DOFs)")]
    OverConstrained {
        component: usize,
        equations: usize,
        dofs: usize,
    },
    #[error("Component {component} has no joint to ground or a fixed body")]
    Unanchored { component: usize },
    #[error("Element not found: {0}")]
    MissingElement(Uuid),
    #[error("Point '{1}' not found on element {0}")]
    MissingPoint(Uuid, String),
    #[error("Snapshot pose of {0} is not 7 values")]
    InvalidState(Uuid),
    #[error("Invalid assembly: {0}")]
    InvalidAssembly(String),
}

impl From<AssemblyError> for SolveError {
    fn from(e: AssemblyError) -> Self {
        match e {
            AssemblyError::ElementNotFound(id) | AssemblyError::NotABody(id) => {
                Self::MissingElement(id)
            }
            AssemblyError::PointNotFound(id, point) => Self::MissingPoint(id, point),
            other => Self::InvalidAssembly(other.to_string()),
        }
    }
}

/// Convergence statistics of one component
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentStats {
    pub iterations: usize,
    pub residual: f64,
    pub equations: usize,
    pub dofs: usize,
}

/// Outcome of one independent component
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentReport {
    pub index: usize,
    /// Elements moved by this component
    pub bodies: Vec<Uuid>,
    pub outcome: Result<ComponentStats, SolveError>,
}

/// Result of solving every component
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolveResult {
    pub components: Vec<ComponentReport>,
    /// Whether poses were reverted to the rest configuration
    pub reverted: bool,
}

impl SolveResult {
    pub fn is_success(&self) -> bool {
        self.components.iter().all(|c| c.outcome.is_ok())
    }

    /// Every component failed (false when there is nothing to solve)
    pub fn all_failed(&self) -> bool {
        !self.components.is_empty() && self.components.iter().all(|c| c.outcome.is_err())
    }

    pub fn converged(&self) -> usize {
        self.components.iter().filter(|c| c.outcome.is_ok()).count()
    }

    pub fn errors(&self) -> impl Iterator<Item = &SolveError> {
        self.components.iter().filter_map(|c| c.outcome.as_ref().err())
    }

    /// First component error, if any
    pub fn into_result(self) -> Result<Self, SolveError> {
        if let Some(e) = self.errors().next().cloned() {
            return Err(e);
        }
        Ok(self)
    }
}

/// World poses and spring lengths for the current solver state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseReport {
    pub poses: BTreeMap<Uuid, Frame>,
    pub spring_lengths: BTreeMap<Uuid, f64>,
}

/// Kinematic solver holding the current and rest poses of movable bodies
#[derive(Debug, Clone)]
pub struct KinematicSolver {
    options: SolverOptions,
    /// Current world pose of each movable body
    q: BTreeMap<Uuid, Frame>,
    /// Rest pose captured when the solver was created
    initial_q: BTreeMap<Uuid, Frame>,
}

impl KinematicSolver {
    /// Create a solver; the current poses of `flat` become the rest pose
    pub fn new(flat: &FlatAssembly, options: SolverOptions) -> Self {
        let q: BTreeMap<Uuid, Frame> = flat
            .bodies
            .iter()
            .filter(|b| !b.fixed)
            .map(|b| (b.element, b.pose))
            .collect();
        Self {
            options,
            initial_q: q.clone(),
            q,
        }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: SolverOptions) {
        self.options = options;
    }

    /// Current world pose of a movable body
    pub fn pose(&self, element: Uuid) -> Option<Frame> {
        self.q.get(&element).copied()
    }

    /// Flatten and solve an assembly
    pub fn solve_assembly(&mut self, assembly: &Assembly) -> Result<SolveResult, SolveError> {
        let flat = assembly.flatten()?;
        Ok(self.solve(&flat))
    }

    /// Solve every component of `flat`, starting from its poses
    pub fn solve(&mut self, flat: &FlatAssembly) -> SolveResult {
        let mut result = SolveResult::default();

        for (index, component) in flat.components.iter().enumerate() {
            let bodies: Vec<Uuid> = component
                .bodies
                .iter()
                .map(|&b| flat.bodies[b].element)
                .collect();
            let start: Vec<Frame> = component.bodies.iter().map(|&b| flat.bodies[b].pose).collect();
            for (id, pose) in bodies.iter().zip(&start) {
                self.q.insert(*id, *pose);
                self.initial_q.entry(*id).or_insert(*pose);
            }

            let system = System::new(flat, component, &self.options);
            let outcome = if component.anchored {
                system.solve(index, start)
            } else {
                Err(SolveError::Unanchored { component: index })
            };

            match outcome {
                Ok((poses, stats)) => {
                    tracing::debug!(
                        "Component {} converged in {} iterations (residual {:.3e})",
                        index,
                        stats.iterations,
                        stats.residual
                    );
                    for (id, pose) in bodies.iter().zip(poses) {
                        self.q.insert(*id, pose);
                    }
                    result.components.push(ComponentReport {
                        index,
                        bodies,
                        outcome: Ok(stats),
                    });
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    result.components.push(ComponentReport {
                        index,
                        bodies,
                        outcome: Err(e),
                    });
                }
            }
        }

        result
    }

    /// Reset every pose to the rest configuration
    pub fn restore_initial_q(&mut self) {
        self.q = self.initial_q.clone();
    }

    /// Capture the current poses
    pub fn snapshot(&self) -> SolverSnapshot {
        SolverSnapshot::from_dof_state(self.q.iter().map(|(id, f)| (*id, f.to_dofs())).collect())
    }

    /// Load poses from a snapshot without solving
    pub fn restore_state(&mut self, snapshot: &SolverSnapshot) -> Result<(), SolveError> {
        let mut q = BTreeMap::new();
        for (id, dofs) in snapshot.dof_state() {
            let frame = Frame::from_dofs(dofs).ok_or(SolveError::InvalidState(*id))?;
            q.insert(*id, frame);
        }
        self.q.extend(q);
        Ok(())
    }

    /// World poses and spring lengths for the current state, without solving
    pub fn post_process(&self, flat: &FlatAssembly) -> PoseReport {
        let pose_of = |body: usize| {
            let b = &flat.bodies[body];
            self.q.get(&b.element).copied().unwrap_or(b.pose)
        };
        let position = |anchor: &FlatAnchor| match *anchor {
            FlatAnchor::Ground(p) => p,
            FlatAnchor::Body { body, local } => pose_of(body).transform_point(local),
        };

        PoseReport {
            poses: (0..flat.bodies.len())
                .map(|i| (flat.bodies[i].element, pose_of(i)))
                .collect(),
            spring_lengths: flat
                .springs
                .iter()
                .map(|s| (s.element, (position(&s.b) - position(&s.a)).length()))
                .collect(),
        }
    }

    /// Write the current poses back into the assembly frames
    pub fn commit(&self, assembly: &mut Assembly) -> Result<(), SolveError> {
        for id in assembly.elements_depth_first() {
            if let Some(pose) = self.q.get(&id) {
                assembly.set_world_frame(id, *pose)?;
            }
        }
        Ok(())
    }
}

/// Residual system of one component
struct System<'a> {
    flat: &'a FlatAssembly,
    component: &'a FlatComponent,
    options: &'a SolverOptions,
    /// Flat body index to slot in the component
    slots: HashMap<usize, usize>,
}

impl<'a> System<'a> {
    fn new(
        flat: &'a FlatAssembly,
        component: &'a FlatComponent,
        options: &'a SolverOptions,
    ) -> Self {
        let slots = component
            .bodies
            .iter()
            .enumerate()
            .map(|(slot, &body)| (body, slot))
            .collect();
        Self {
            flat,
            component,
            options,
            slots,
        }
    }

    /// World position and rotation of a constraint end
    fn anchor(&self, poses: &[Frame], anchor: &FlatAnchor) -> (DVec3, DQuat) {
        match *anchor {
            FlatAnchor::Ground(p) => (p, DQuat::IDENTITY),
            FlatAnchor::Body { body, local } => {
                let pose = match self.slots.get(&body) {
                    Some(&slot) => poses[slot],
                    None => self.flat.bodies[body].pose,
                };
                (pose.transform_point(local), pose.rotation)
            }
        }
    }

    fn residuals(&self, poses: &[Frame]) -> Vec<f64> {
        let mut rows = Vec::new();

        for &ci in &self.component.constraints {
            let c = &self.flat.constraints[ci];
            let start = rows.len();
            let (pa, ra) = self.anchor(poses, &c.a);
            let (pb, rb) = self.anchor(poses, &c.b);

            match c.kind {
                FlatKind::Ball => rows.extend((pa - pb).to_array()),
                FlatKind::Revolute { axis_a, axis_b } => {
                    rows.extend((pa - pb).to_array());
                    let (u, v) = normal_pair(ra * axis_a);
                    let wb = rb * axis_b;
                    rows.push(wb.dot(u));
                    rows.push(wb.dot(v));
                }
                FlatKind::Slide { axis } => {
                    let (u, v) = normal_pair(ra * axis);
                    let d = pb - pa;
                    rows.push(d.dot(u));
                    rows.push(d.dot(v));
                }
                FlatKind::LinearBushing { axis, dl } => {
                    rows.extend((pb - (pa + ra * axis * dl)).to_array());
                }
            }

            if let Some(play) = c.elastic
                && !self.options.disable_elastic
            {
                for r in &mut rows[start..] {
                    *r = r.signum() * (r.abs() - play).max(0.0);
                }
            }
        }

        if self.options.freeze_spring_dampers {
            for &si in &self.component.springs {
                let s = &self.flat.springs[si];
                let (pa, _) = self.anchor(poses, &s.a);
                let (pb, _) = self.anchor(poses, &s.b);
                rows.push((pb - pa).length() - s.length);
            }
        }

        rows
    }

    /// Levenberg-Marquardt iteration from `start`
    fn solve(
        &self,
        index: usize,
        start: Vec<Frame>,
    ) -> Result<(Vec<Frame>, ComponentStats), SolveError> {
        let n = start.len() * 6;
        let mut poses = start;
        let mut r = self.residuals(&poses);
        let m = r.len();
        let mut norm = norm2(&r);
        let mut lambda = self.options.initial_damping;

        let stats = |iterations, residual| ComponentStats {
            iterations,
            residual,
            equations: m,
            dofs: n,
        };

        for iteration in 0..self.options.max_iterations {
            if norm < self.options.tolerance {
                return Ok((poses, stats(iteration, norm)));
            }

            let j = self.jacobian(&poses, n);

            // Normal equations: (J^T J + lambda D) dx = -J^T r
            let mut jtj = vec![vec![0.0; n]; n];
            let mut jtr = vec![0.0; n];
            for row in 0..m {
                for a in 0..n {
                    let ja = j[row][a];
                    if ja == 0.0 {
                        continue;
                    }
                    jtr[a] -= ja * r[row];
                    for b in 0..n {
                        jtj[a][b] += ja * j[row][b];
                    }
                }
            }
            for (a, row) in jtj.iter_mut().enumerate() {
                row[a] += lambda * (1.0 + row[a]);
            }

            let Some(dx) = gaussian_elimination(&mut jtj, &mut jtr) else {
                return Err(SolveError::Singular { component: index });
            };

            let candidate = perturb(&poses, &dx);
            let r_new = self.residuals(&candidate);
            let norm_new = norm2(&r_new);
            if norm_new < norm {
                poses = candidate;
                r = r_new;
                norm = norm_new;
                lambda = (lambda * 0.1).max(MIN_DAMPING);
            } else {
                lambda *= 10.0;
                if lambda > MAX_DAMPING {
                    tracing::debug!("Component {} stalled at iteration {}", index, iteration);
                    return Err(self.failure(index, iteration + 1, norm, m, n));
                }
            }
        }

        if norm < self.options.tolerance {
            return Ok((poses, stats(self.options.max_iterations, norm)));
        }
        Err(self.failure(index, self.options.max_iterations, norm, m, n))
    }

    fn failure(
        &self,
        component: usize,
        iterations: usize,
        residual: f64,
        m: usize,
        n: usize,
    ) -> SolveError {
        if m > n {
            SolveError::OverConstrained {
                component,
                equations: m,
                dofs: n,
            }
        } else {
            SolveError::NonConvergence {
                component,
                iterations,
                residual,
            }
        }
    }

    /// Central-difference Jacobian over the local DOFs (m x n)
    fn jacobian(&self, poses: &[Frame], n: usize) -> Vec<Vec<f64>> {
        let h = self.options.finite_difference_step;
        let mut columns = Vec::with_capacity(n);
        let mut delta = vec![0.0; n];
        for k in 0..n {
            delta[k] = h;
            let plus = self.residuals(&perturb(poses, &delta));
            delta[k] = -h;
            let minus = self.residuals(&perturb(poses, &delta));
            delta[k] = 0.0;
            columns.push(
                plus.iter()
                    .zip(&minus)
                    .map(|(p, q)| (p - q) / (2.0 * h))
                    .collect::<Vec<_>>(),
            );
        }

        let m = columns.first().map_or(0, Vec::len);
        (0..m)
            .map(|row| columns.iter().map(|col| col[row]).collect())
            .collect()
    }
}

/// Apply 6 local DOFs per body: translation, then a rotation vector on the left
fn perturb(poses: &[Frame], delta: &[f64]) -> Vec<Frame> {
    poses
        .iter()
        .zip(delta.chunks_exact(6))
        .map(|(pose, d)| Frame {
            position: pose.position + DVec3::new(d[0], d[1], d[2]),
            rotation: (DQuat::from_scaled_axis(DVec3::new(d[3], d[4], d[5])) * pose.rotation)
                .normalize(),
        })
        .collect()
}

/// Two unit vectors spanning the plane normal to `axis`
fn normal_pair(axis: DVec3) -> (DVec3, DVec3) {
    let axis = axis.try_normalize().unwrap_or(DVec3::Z);
    axis.any_orthonormal_pair()
}

fn norm2(r: &[f64]) -> f64 {
    r.iter().map(|e| e * e).sum::<f64>().sqrt()
}

/// Gaussian elimination with partial pivoting
#[allow(clippy::needless_range_loop)]
fn gaussian_elimination(a: &mut [Vec<f64>], b: &mut [f64]) -> Option<Vec<f64>> {
    let n = b.len();
    if n == 0 {
        return Some(vec![]);
    }

    // Forward elimination
    for i in 0..n {
        let mut max_row = i;
        let mut max_val = a[i][i].abs();
        for k in (i + 1)..n {
            if a[k][i].abs() > max_val {
                max_val = a[k][i].abs();
                max_row = k;
            }
        }

        if max_val < 1e-300 {
            return None;
        }

        if max_row != i {
            a.swap(i, max_row);
            b.swap(i, max_row);
        }

        for k in (i + 1)..n {
            let factor = a[k][i] / a[i][i];
            for j in i..n {
                a[k][j] -= factor * a[i][j];
            }
            b[k] -= factor * b[i];
        }
    }

    // Back substitution
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        x[i] = b[i];
        for j in (i + 1)..n {
            x[i] -= a[i][j] * x[j];
        }
        x[i] /= a[i][i];
    }
    Some(x)
}
