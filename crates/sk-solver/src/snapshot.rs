//! Solver snapshots

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sk_core::Frame;

/// Captured solver configuration.
///
/// Holds everything needed to restore an exact solved state without
/// re-solving: body poses (position + quaternion `xyzw`), control values,
/// bushing travel, derived values and the global formula scope in effect.
/// A snapshot has no mutating API once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolverSnapshot {
    dof_state: BTreeMap<Uuid, Vec<f64>>,
    #[serde(default)]
    control_state: BTreeMap<Uuid, f64>,
    #[serde(default)]
    joint_travel: BTreeMap<Uuid, f64>,
    #[serde(default)]
    measure_tools: Option<Vec<f64>>,
    #[serde(default)]
    readonly_variables: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    globals: BTreeMap<String, f64>,
}

impl SolverSnapshot {
    pub fn from_dof_state(dof_state: BTreeMap<Uuid, Vec<f64>>) -> Self {
        Self {
            dof_state,
            ..Default::default()
        }
    }

    pub fn with_controls(self, control_state: BTreeMap<Uuid, f64>) -> Self {
        Self {
            control_state,
            ..self
        }
    }

    pub fn with_joint_travel(self, joint_travel: BTreeMap<Uuid, f64>) -> Self {
        Self {
            joint_travel,
            ..self
        }
    }

    pub fn with_measure_tools(self, measure_tools: Option<Vec<f64>>) -> Self {
        Self {
            measure_tools,
            ..self
        }
    }

    pub fn with_readonly_variables(
        self,
        readonly_variables: Option<BTreeMap<String, f64>>,
    ) -> Self {
        Self {
            readonly_variables,
            ..self
        }
    }

    pub fn with_globals(self, globals: BTreeMap<String, f64>) -> Self {
        Self { globals, ..self }
    }

    pub fn dof_state(&self) -> &BTreeMap<Uuid, Vec<f64>> {
        &self.dof_state
    }

    /// Pose of one body, if captured
    pub fn pose(&self, element: Uuid) -> Option<Frame> {
        self.dof_state.get(&element).and_then(|d| Frame::from_dofs(d))
    }

    pub fn control_state(&self) -> &BTreeMap<Uuid, f64> {
        &self.control_state
    }

    pub fn joint_travel(&self) -> &BTreeMap<Uuid, f64> {
        &self.joint_travel
    }

    pub fn measure_tools(&self) -> Option<&[f64]> {
        self.measure_tools.as_deref()
    }

    pub fn readonly_variables(&self) -> Option<&BTreeMap<String, f64>> {
        self.readonly_variables.as_ref()
    }

    pub fn globals(&self) -> &BTreeMap<String, f64> {
        &self.globals
    }
}
