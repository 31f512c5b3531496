//! Engine context
//!
//! Owns the assembly, its formulas and derived objects together with the
//! solver, and exposes the operations an editor or a worker drives.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::ControlFlow;

use uuid::Uuid;

use sk_core::constants::GLOBAL_SCOPE;
use sk_core::{
    Assembly, AssemblyError, DerivedObjects, FormulaError, FormulaSet, Project, ProjectError,
    SolverOptions,
};

use crate::snapshot::SolverSnapshot;
use crate::solver::{KinematicSolver, PoseReport, SolveError, SolveResult};
use crate::sweep::{SweepRequest, SweepResponse, SweepSample, SweepSetter, solve_max_v};

/// Engine errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Formula(#[from] FormulaError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error(transparent)]
    Solve(#[from] SolveError),
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error("Invalid sweep request: {0}")]
    InvalidSweep(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Interactive engine state
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub name: String,
    assembly: Assembly,
    formulas: FormulaSet,
    derived: DerivedObjects,
    solver: KinematicSolver,
}

impl EngineContext {
    /// Resolve formulas and capture the current poses as the rest pose
    pub fn new(
        mut assembly: Assembly,
        mut formulas: FormulaSet,
        derived: DerivedObjects,
        options: SolverOptions,
    ) -> EngineResult<Self> {
        formulas.evaluate_all()?;
        assembly.apply_formulas(&formulas)?;
        assembly.clamp_travel();

        let flat = assembly.flatten()?;
        let solver = KinematicSolver::new(&flat, options);
        let mut context = Self {
            name: assembly.name.clone(),
            assembly,
            formulas,
            derived,
            solver,
        };
        context.update_derived();
        Ok(context)
    }

    pub fn from_project(project: Project) -> EngineResult<Self> {
        let mut context = Self::new(
            project.assembly,
            project.formulas,
            project.derived,
            project.options,
        )?;
        context.name = project.name;
        Ok(context)
    }

    /// Bundle the current state into a project
    pub fn to_project(&self) -> Project {
        let mut project = Project::new(self.name.clone());
        project.assembly = self.assembly.clone();
        project.formulas = self.formulas.clone();
        project.derived = self.derived.clone();
        project.options = *self.solver.options();
        project
    }

    pub fn assembly(&self) -> &Assembly {
        &self.assembly
    }

    pub fn formulas(&self) -> &FormulaSet {
        &self.formulas
    }

    pub fn derived(&self) -> &DerivedObjects {
        &self.derived
    }

    pub fn options(&self) -> &SolverOptions {
        self.solver.options()
    }

    pub fn set_options(&mut self, options: SolverOptions) {
        self.solver.set_options(options);
    }

    /// Change one formula and re-resolve every point coordinate
    pub fn set_formula(
        &mut self,
        scope: &str,
        name: &str,
        formula: impl Into<String>,
    ) -> EngineResult<()> {
        self.formulas.set_formula(scope, name, formula)?;
        self.apply_formulas()
    }

    /// Re-evaluate formulas and push the values into the assembly points
    pub fn apply_formulas(&mut self) -> EngineResult<()> {
        self.formulas.evaluate_all()?;
        self.assembly.apply_formulas(&self.formulas)?;
        Ok(())
    }

    /// Solve and commit.
    ///
    /// Converged components commit their poses; failed ones keep their
    /// pre-solve pose. When every component fails the whole assembly reverts
    /// to the rest pose.
    pub fn solve(&mut self) -> EngineResult<SolveResult> {
        self.assembly.clamp_travel();
        let mut result = self.solver.solve_assembly(&self.assembly)?;
        if result.all_failed() {
            tracing::warn!("All components failed; reverting to the rest pose");
            self.solver.restore_initial_q();
            result.reverted = true;
        }
        self.solver.commit(&mut self.assembly)?;
        self.update_derived();
        Ok(result)
    }

    /// Advance the active controls by `dt` seconds and re-solve
    pub fn tick(&mut self, dt: f64, active_controls: &[Uuid]) -> EngineResult<SolveResult> {
        self.assembly.apply_controls(dt, active_controls);
        self.solve()
    }

    /// World poses and spring lengths of the current state, without solving
    pub fn post_process(&self) -> EngineResult<PoseReport> {
        let flat = self.assembly.flatten()?;
        Ok(self.solver.post_process(&flat))
    }

    /// Recompute derived objects; returns the number of stale objects
    pub fn update_derived(&mut self) -> usize {
        self.derived.update(&self.assembly)
    }

    pub fn snapshot(&self) -> SolverSnapshot {
        let controls = self.assembly.controls.iter().map(|c| (c.id, c.value)).collect();
        let travel = self
            .assembly
            .constraints
            .values()
            .filter_map(|j| j.travel().map(|dl| (j.id, dl)))
            .collect();
        let measures = (!self.derived.measures.is_empty()).then(|| self.derived.measure_values());
        let readonly = (!self.derived.readonly.is_empty()).then(|| self.derived.readonly_values());

        self.solver
            .snapshot()
            .with_controls(controls)
            .with_joint_travel(travel)
            .with_measure_tools(measures)
            .with_readonly_variables(readonly)
            .with_globals(self.formulas.globals())
    }

    /// Load a snapshot without solving
    pub fn restore_state(&mut self, snapshot: &SolverSnapshot) -> EngineResult<()> {
        self.restore_globals(snapshot.globals())?;

        for control in &mut self.assembly.controls {
            if let Some(value) = snapshot.control_state().get(&control.id) {
                control.value = *value;
            }
        }
        for (id, dl) in snapshot.joint_travel() {
            if self.assembly.get_constraint(*id).is_some() {
                self.assembly.set_travel(*id, *dl)?;
            }
        }

        self.solver.restore_state(snapshot)?;
        self.solver.commit(&mut self.assembly)?;
        self.update_derived();
        Ok(())
    }

    /// Literal global formulas take the snapshot value; computed ones follow.
    ///
    /// Returns the computed globals that still disagree with the snapshot.
    fn restore_globals(&mut self, globals: &BTreeMap<String, f64>) -> EngineResult<Vec<String>> {
        let mut changed = false;
        for (name, value) in globals {
            let Some(scalar) = self.formulas.get(GLOBAL_SCOPE, name) else {
                continue;
            };
            let literal = scalar.formula.trim().parse::<f64>().is_ok();
            if literal && scalar.value != *value {
                self.formulas.set_formula(GLOBAL_SCOPE, name, format!("{value}"))?;
                changed = true;
            }
        }
        if changed {
            self.apply_formulas()?;
        }

        let drifted: Vec<String> = globals
            .iter()
            .filter(|&(name, value)| self.formulas.value(name).is_some_and(|v| v != *value))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &drifted {
            tracing::warn!(
                "Global '{}' is computed ({:?}) and differs from the snapshot value {}",
                name,
                self.formulas.value(name),
                globals[name]
            );
        }
        Ok(drifted)
    }

    /// Return to the rest pose captured at creation
    pub fn restore_initial(&mut self) -> EngineResult<()> {
        self.solver.restore_initial_q();
        self.solver.commit(&mut self.assembly)?;
        self.update_derived();
        Ok(())
    }

    /// Bisection sweep on a copy of this context
    pub fn solve_max_v(&self, request: &SweepRequest) -> EngineResult<SweepResponse> {
        self.solve_max_v_with(request, |_| ControlFlow::Continue(()))
    }

    /// Sweep, reporting every accepted sample to `on_accept` as it is found.
    /// Breaking from `on_accept` stops the sweep.
    pub fn solve_max_v_with(
        &self,
        request: &SweepRequest,
        mut on_accept: impl FnMut(&SweepSample) -> ControlFlow<()>,
    ) -> EngineResult<SweepResponse> {
        let range = request.range();
        let valid = range.min <= range.max && range.tolerance > 0.0;
        if !valid {
            return Err(EngineError::InvalidSweep(format!(
                "range [{}, {}] with tolerance {}",
                range.min, range.max, range.tolerance
            )));
        }
        if request.setters.is_empty() {
            return Err(EngineError::InvalidSweep("no setters".to_string()));
        }

        let mut base = self.clone();
        if let Some(snapshot) = &request.initial_snapshot {
            base.restore_state(snapshot)?;
        }
        let work = RefCell::new(base.clone());

        tracing::info!(
            "Sweep '{}' step {} over [{}, {}]",
            request.test_id,
            request.step,
            range.min,
            range.max
        );

        let outcome = solve_max_v(
            range,
            request.max_count,
            |value| {
                let mut ctx = work.borrow_mut();
                *ctx = base.clone();
                match ctx.try_value(&request.setters, value) {
                    Ok(feasible) => feasible,
                    Err(e) => {
                        tracing::debug!("Sweep candidate {} rejected: {}", value, e);
                        false
                    }
                }
            },
            |value| {
                let sample = SweepSample {
                    value,
                    snapshot: work.borrow().snapshot(),
                };
                on_accept(&sample)?;
                ControlFlow::Continue(sample)
            },
        );

        Ok(SweepResponse {
            test_id: request.test_id.clone(),
            step: request.step,
            snapshots: outcome.accepted.into_iter().map(|(_, s)| s).collect(),
            max_value: outcome.max_value,
            invocations: outcome.invocations,
            cancelled: outcome.cancelled,
        })
    }

    /// Apply the setters at `value` and solve; feasible when every component converges
    fn try_value(&mut self, setters: &[SweepSetter], value: f64) -> EngineResult<bool> {
        let mut formulas_changed = false;
        for setter in setters {
            match setter {
                SweepSetter::Global { name } => {
                    self.formulas.set_formula(GLOBAL_SCOPE, name, format!("{value}"))?;
                    formulas_changed = true;
                }
                SweepSetter::ControlValue { control } => {
                    self.assembly.set_control_value(*control, value)?;
                }
                SweepSetter::JointTravel { constraint } => {
                    self.assembly.set_travel(*constraint, value)?;
                }
            }
        }
        if formulas_changed {
            self.apply_formulas()?;
        }
        Ok(self.solve()?.is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::{DQuat, DVec3};
    use sk_core::derived::{Axis, DatumKind, DatumObject, MeasureKind, MeasureTool};
    use sk_core::{
        Control, ElementKind, Frame, InputBinding, JointConstraint, JointEnd, NamedScalar,
        RigidElement,
    };

    /// Bar pinned at one end whose other end must reach a rail at x = `offset`
    fn rail_context() -> (EngineContext, Uuid) {
        let mut assembly = Assembly::new("rail");
        let chassis = assembly
            .add_element(
                RigidElement::new("chassis", ElementKind::Frame)
                    .with_point("pivot", DVec3::ZERO)
                    .with_formula_point("rail", ["offset", "0", "0"]),
            )
            .unwrap();
        let bar = assembly
            .add_element(
                RigidElement::new("bar", ElementKind::Bar)
                    .with_frame(Frame::new(
                        DVec3::ZERO,
                        DQuat::from_rotation_z(std::f64::consts::FRAC_PI_4),
                    ))
                    .with_point("a", DVec3::ZERO)
                    .with_point("b", DVec3::new(100.0, 0.0, 0.0)),
            )
            .unwrap();
        assembly
            .add_constraint(JointConstraint::ball(
                "pivot",
                JointEnd::point(chassis, "pivot"),
                JointEnd::point(bar, "a"),
            ))
            .unwrap();
        assembly
            .add_constraint(JointConstraint::slide(
                "rail",
                JointEnd::point(chassis, "rail"),
                JointEnd::point(bar, "b"),
                DVec3::Y,
            ))
            .unwrap();

        let formulas = FormulaSet::from_scalars(vec![NamedScalar::new("offset", "50")]);
        let mut derived = DerivedObjects::new();
        derived
            .add_datum(DatumObject::new(
                "tip",
                DatumKind::ElementPoint {
                    element: bar,
                    point: "b".to_string(),
                },
            ))
            .unwrap();
        derived
            .add_measure(MeasureTool::new(
                "tip_x",
                MeasureKind::Coordinate {
                    datum: 0,
                    axis: Axis::X,
                },
            ))
            .unwrap();

        let context =
            EngineContext::new(assembly, formulas, derived, SolverOptions::default()).unwrap();
        (context, bar)
    }

    /// Bar on a steering rack (bushing along Y) whose tip is pinned to ground
    fn rack_context(start: Frame) -> (EngineContext, Uuid, Uuid) {
        let mut assembly = Assembly::new("rack");
        let bar = assembly
            .add_element(
                RigidElement::new("tie_rod", ElementKind::Bar)
                    .with_frame(start)
                    .with_point("inner", DVec3::ZERO)
                    .with_point("outer", DVec3::new(100.0, 0.0, 0.0)),
            )
            .unwrap();
        let rack = assembly
            .add_constraint(JointConstraint::linear_bushing(
                "rack",
                JointEnd::ground(DVec3::ZERO),
                JointEnd::point(bar, "inner"),
                DVec3::Y,
                -200.0,
                200.0,
            ))
            .unwrap();
        assembly
            .add_constraint(JointConstraint::ball(
                "outer",
                JointEnd::ground(DVec3::new(100.0, 0.0, 0.0)),
                JointEnd::point(bar, "outer"),
            ))
            .unwrap();
        assembly
            .add_control(Control::new("steer", bar, InputBinding::keyboard("D"), 10.0))
            .unwrap();
        let context = EngineContext::new(
            assembly,
            FormulaSet::new(),
            DerivedObjects::new(),
            SolverOptions::default(),
        )
        .unwrap();
        (context, bar, rack)
    }

    #[test]
    fn test_solve_updates_derived() {
        let (mut context, bar) = rail_context();
        let result = context.solve().unwrap();
        assert!(result.is_success(), "{:?}", result);

        let tip = context.assembly().world_position(bar, "b").unwrap();
        assert_relative_eq!(tip.x, 50.0, epsilon = 1e-6);
        assert_relative_eq!(tip.length(), 100.0, epsilon = 1e-6);
        assert_relative_eq!(context.derived().measure_values()[0], 50.0, epsilon = 1e-6);
    }

    #[test]
    fn test_total_failure_reverts_to_rest() {
        let rest = Frame::from_position(DVec3::new(1.0, 1.0, 1.0));
        let (mut context, bar, rack) = rack_context(rest);

        assert!(context.solve().unwrap().is_success());
        let solved = context.assembly().world_position(bar, "inner").unwrap();
        assert!(solved.abs_diff_eq(DVec3::ZERO, 1e-6));

        // rack travel moves the inner end off the circle around the outer pin
        context.assembly.set_travel(rack, 50.0).unwrap();
        let result = context.solve().unwrap();
        assert!(result.all_failed());
        assert!(result.reverted);

        let frame = context.assembly().world_frame(bar).unwrap();
        assert!(frame.position.abs_diff_eq(rest.position, 1e-12));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (mut context, bar) = rail_context();
        assert!(context.solve().unwrap().is_success());
        let before = context.snapshot();
        assert_eq!(before.globals()["offset"], 50.0);
        assert!(before.pose(bar).is_some());

        context.set_formula(GLOBAL_SCOPE, "offset", "80").unwrap();
        assert!(context.solve().unwrap().is_success());
        assert_ne!(context.snapshot(), before);

        context.restore_state(&before).unwrap();
        assert_eq!(context.formulas().value("offset"), Some(50.0));
        assert_eq!(context.snapshot(), before);
    }

    #[test]
    fn test_restore_reports_drifted_computed_global() {
        let (mut context, _) = rail_context();
        context.formulas.insert(NamedScalar::new("half", "offset / 2")).unwrap();
        context.apply_formulas().unwrap();
        assert!(context.solve().unwrap().is_success());
        let snapshot = context.snapshot();
        assert_eq!(snapshot.globals()["half"], 25.0);

        // restoring the literal brings a dependent global back in line
        context.set_formula(GLOBAL_SCOPE, "offset", "80").unwrap();
        assert!(context.restore_globals(snapshot.globals()).unwrap().is_empty());
        assert_eq!(context.formulas().value("half"), Some(25.0));

        // a changed computed formula cannot be restored
        context.set_formula(GLOBAL_SCOPE, "half", "offset / 5").unwrap();
        let drifted = context.restore_globals(snapshot.globals()).unwrap();
        assert_eq!(drifted, vec!["half".to_string()]);
        assert_eq!(context.formulas().get(GLOBAL_SCOPE, "half").unwrap().formula, "offset / 5");
        assert_eq!(context.formulas().value("offset"), Some(50.0));
    }

    #[test]
    fn test_restore_initial() {
        let (mut context, bar) = rail_context();
        let rest = context.assembly().world_frame(bar).unwrap();
        context.solve().unwrap();
        context.restore_initial().unwrap();
        let frame = context.assembly().world_frame(bar).unwrap();
        assert!(frame.position.abs_diff_eq(rest.position, 1e-12));
        assert!(frame.rotation.abs_diff_eq(rest.rotation, 1e-12));
    }

    #[test]
    fn test_post_process_reports_spring_length() {
        let (mut context, bar) = rail_context();
        let chassis = context.assembly().element_by_name("chassis").unwrap().id;
        let mut assembly = context.assembly().clone();
        let spring = assembly
            .add_element(RigidElement::new(
                "spring",
                ElementKind::SpringDamper {
                    end_a: JointEnd::point(chassis, "pivot"),
                    end_b: JointEnd::point(bar, "b"),
                    free_length: 120.0,
                    min_length: 60.0,
                    max_length: 120.0,
                },
            ))
            .unwrap();
        context = EngineContext::new(
            assembly,
            context.formulas().clone(),
            DerivedObjects::new(),
            SolverOptions::default(),
        )
        .unwrap();

        assert!(context.solve().unwrap().is_success());
        let report = context.post_process().unwrap();
        assert_relative_eq!(report.spring_lengths[&spring], 100.0, epsilon = 1e-6);
        assert!(report.poses.contains_key(&bar));
        assert!(report.poses.contains_key(&chassis));
    }

    #[test]
    fn test_tick_drives_controls() {
        let (mut context, _, rack) = rack_context(Frame::IDENTITY);
        let steer = context.assembly().controls[0].id;
        context.tick(0.5, &[steer]).unwrap();
        assert_eq!(context.assembly().get_constraint(rack).unwrap().travel(), Some(5.0));
        assert_eq!(context.snapshot().control_state()[&steer], 5.0);
    }

    #[test]
    fn test_control_beyond_max_solves_at_max() {
        let mut assembly = Assembly::new("slider");
        let body = assembly
            .add_element(
                RigidElement::new("slider", ElementKind::Body).with_point("p", DVec3::ZERO),
            )
            .unwrap();
        let guide = assembly
            .add_constraint(JointConstraint::linear_bushing(
                "guide",
                JointEnd::ground(DVec3::ZERO),
                JointEnd::point(body, "p"),
                DVec3::X,
                0.0,
                30.0,
            ))
            .unwrap();
        let push = assembly
            .add_control(Control::new("push", body, InputBinding::joystick("A"), 100.0))
            .unwrap();
        let mut context = EngineContext::new(
            assembly,
            FormulaSet::new(),
            DerivedObjects::new(),
            SolverOptions::default(),
        )
        .unwrap();

        assert!(context.tick(1.0, &[push]).unwrap().is_success());
        assert_eq!(context.assembly().get_constraint(guide).unwrap().travel(), Some(30.0));
        let p = context.assembly().world_position(body, "p").unwrap();
        assert!(p.abs_diff_eq(DVec3::new(30.0, 0.0, 0.0), 1e-6), "p at {p}");
    }

    #[test]
    fn test_sweep_finds_rail_limit() {
        let (context, _) = rail_context();
        let request = SweepRequest::new(
            "rail_reach",
            vec![SweepSetter::Global {
                name: "offset".to_string(),
            }],
            0.0,
            190.0,
            1.0,
        )
        .with_step(7);

        let response = context.solve_max_v(&request).unwrap();
        assert_eq!(response.step, 7);
        assert_eq!(response.test_id, "rail_reach");
        assert!(response.invocations <= request.range().invocation_bound());

        let max = response.max_value.unwrap();
        assert!((98.0..=100.0).contains(&max), "max = {max}");
        let values: Vec<f64> = response.snapshots.iter().map(|s| s.value).collect();
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(response.snapshots.last().unwrap().snapshot.globals()["offset"], max);

        // the interactive context is untouched
        assert_eq!(context.formulas().value("offset"), Some(50.0));
    }

    #[test]
    fn test_invalid_sweep_rejected() {
        let (context, _) = rail_context();
        let request = SweepRequest::new("bad", vec![], 0.0, 1.0, 0.1);
        assert!(matches!(
            context.solve_max_v(&request),
            Err(EngineError::InvalidSweep(_))
        ));
    }
}
