//! Parameter sweeps
//!
//! Bisection over one swept value, e.g. the highest steering travel or
//! formula value at which the assembly still solves.

use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sk_core::constants::SWEEP_MAX_COUNT;

use crate::snapshot::SolverSnapshot;

/// Swept interval and the width at which the search stops
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepRange {
    pub min: f64,
    pub max: f64,
    pub tolerance: f64,
}

impl SweepRange {
    pub fn new(min: f64, max: f64, tolerance: f64) -> Self {
        Self {
            min,
            max,
            tolerance,
        }
    }

    /// Invocations needed to narrow the range below tolerance
    pub fn invocation_bound(&self) -> usize {
        if self.tolerance <= 0.0 || self.max <= self.min {
            return 0;
        }
        ((self.max - self.min) / self.tolerance).log2().ceil().max(0.0) as usize
    }
}

/// Result of a bisection sweep
#[derive(Debug, Clone, PartialEq)]
pub struct SweepOutcome<S> {
    /// Highest feasible value found
    pub max_value: Option<f64>,
    /// Accepted values with their snapshots, in insertion order
    pub accepted: Vec<(f64, S)>,
    pub invocations: usize,
    /// Whether `get_snapshot` asked to stop early
    pub cancelled: bool,
}

/// Find the highest feasible value in `range` by bisection.
///
/// Each feasible candidate is recorded through `get_snapshot` and raises the
/// lower bound; an infeasible one lowers the upper bound. Stops after
/// `max_count` invocations of `feasible`, once the interval is narrower than
/// the tolerance, or when `get_snapshot` breaks.
pub fn solve_max_v<S>(
    range: SweepRange,
    max_count: usize,
    mut feasible: impl FnMut(f64) -> bool,
    mut get_snapshot: impl FnMut(f64) -> ControlFlow<(), S>,
) -> SweepOutcome<S> {
    let mut outcome = SweepOutcome {
        max_value: None,
        accepted: Vec::new(),
        invocations: 0,
        cancelled: false,
    };
    let (mut lo, mut hi) = (range.min, range.max);

    while outcome.invocations < max_count && hi - lo > range.tolerance {
        let candidate = lo + (hi - lo) * 0.5;
        outcome.invocations += 1;

        if feasible(candidate) {
            match get_snapshot(candidate) {
                ControlFlow::Continue(snapshot) => outcome.accepted.push((candidate, snapshot)),
                ControlFlow::Break(()) => {
                    outcome.cancelled = true;
                    break;
                }
            }
            outcome.max_value = Some(candidate);
            lo = candidate;
        } else {
            hi = candidate;
        }
        tracing::debug!("Sweep candidate {} -> [{}, {}]", candidate, lo, hi);
    }

    outcome
}

/// What a sweep changes at each candidate value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SweepSetter {
    /// Set a global formula to the literal value
    Global { name: String },
    /// Set a control's value (and the travel of its bushings)
    ControlValue { control: Uuid },
    /// Set the travel of one bushing
    JointTravel { constraint: Uuid },
}

fn default_max_count() -> usize {
    SWEEP_MAX_COUNT
}

/// A sweep request, tagged for correlating asynchronous results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRequest {
    pub test_id: String,
    pub setters: Vec<SweepSetter>,
    /// State to start every candidate from (the current state if `None`)
    #[serde(default)]
    pub initial_snapshot: Option<SolverSnapshot>,
    pub step: u64,
    pub min: f64,
    pub max: f64,
    pub tolerance: f64,
    #[serde(default = "default_max_count")]
    pub max_count: usize,
}

impl SweepRequest {
    pub fn new(
        test_id: impl Into<String>,
        setters: Vec<SweepSetter>,
        min: f64,
        max: f64,
        tolerance: f64,
    ) -> Self {
        Self {
            test_id: test_id.into(),
            setters,
            initial_snapshot: None,
            step: 0,
            min,
            max,
            tolerance,
            max_count: SWEEP_MAX_COUNT,
        }
    }

    pub fn with_step(mut self, step: u64) -> Self {
        self.step = step;
        self
    }

    pub fn with_initial_snapshot(mut self, snapshot: SolverSnapshot) -> Self {
        self.initial_snapshot = Some(snapshot);
        self
    }

    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count;
        self
    }

    pub fn range(&self) -> SweepRange {
        SweepRange::new(self.min, self.max, self.tolerance)
    }
}

/// An accepted sweep value and the state captured there
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSample {
    pub value: f64,
    pub snapshot: SolverSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResponse {
    pub test_id: String,
    pub step: u64,
    /// Accepted samples in insertion order
    pub snapshots: Vec<SweepSample>,
    pub max_value: Option<f64>,
    pub invocations: usize,
    #[serde(default)]
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold_sweep(threshold: f64, range: SweepRange, max_count: usize) -> SweepOutcome<f64> {
        solve_max_v(range, max_count, |v| v <= threshold, |v| ControlFlow::Continue(v * 2.0))
    }

    #[test]
    fn test_finds_threshold_within_bound() {
        let range = SweepRange::new(0.0, 100.0, 0.01);
        let outcome = threshold_sweep(37.3, range, 1000);

        assert_eq!(range.invocation_bound(), 14);
        assert!(outcome.invocations <= range.invocation_bound());
        let max = outcome.max_value.unwrap();
        assert!(max <= 37.3 && 37.3 - max <= 0.01, "max = {max}");
    }

    #[test]
    fn test_accepted_in_insertion_order() {
        let outcome = threshold_sweep(60.0, SweepRange::new(0.0, 100.0, 1.0), 64);
        let values: Vec<f64> = outcome.accepted.iter().map(|(v, _)| *v).collect();
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert!(outcome.accepted.iter().all(|(v, s)| *s == v * 2.0));
        assert_eq!(outcome.max_value, values.last().copied());
    }

    #[test]
    fn test_respects_max_count() {
        let outcome = threshold_sweep(60.0, SweepRange::new(0.0, 100.0, 1e-9), 5);
        assert_eq!(outcome.invocations, 5);
    }

    #[test]
    fn test_nothing_feasible() {
        let outcome = threshold_sweep(-1.0, SweepRange::new(0.0, 10.0, 0.5), 64);
        assert_eq!(outcome.max_value, None);
        assert!(outcome.accepted.is_empty());
    }

    #[test]
    fn test_break_cancels() {
        let mut seen = 0;
        let outcome: SweepOutcome<()> = solve_max_v(
            SweepRange::new(0.0, 100.0, 0.1),
            64,
            |_| true,
            |_| {
                seen += 1;
                if seen == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        );
        assert!(outcome.cancelled);
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.invocations, 2);
    }
}
