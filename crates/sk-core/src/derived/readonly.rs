//! Readonly variables exposed to formulas and snapshots

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::DerivedObjectError;
use super::measure::{Axis, MeasureTool};
use crate::assembly::PointSource;
use crate::formula::eval_formula;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReadonlySource {
    /// One world coordinate of an element point
    ElementPoint {
        element: Uuid,
        point: String,
        axis: Axis,
    },
    /// Value of a measure tool
    Measure { index: usize },
    /// Current length of a spring-damper
    SpringLength { element: Uuid },
    /// Formula over earlier readonly variables
    Expression { formula: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadonlyVariable {
    pub name: String,
    pub source: ReadonlySource,
    #[serde(skip)]
    pub value: Option<f64>,
    #[serde(skip)]
    pub error: Option<DerivedObjectError>,
}

impl ReadonlyVariable {
    pub fn new(name: impl Into<String>, source: ReadonlySource) -> Self {
        Self {
            name: name.into(),
            source,
            value: None,
            error: None,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.error.is_some()
    }

    pub(super) fn compute(
        &self,
        earlier: &[ReadonlyVariable],
        measures: &[MeasureTool],
        source: &impl PointSource,
    ) -> Result<f64, DerivedObjectError> {
        let stale = || DerivedObjectError::StaleDependency(self.name.clone());
        match &self.source {
            ReadonlySource::ElementPoint {
                element,
                point,
                axis,
            } => source
                .world_point(*element, point)
                .map(|p| axis.component(p))
                .ok_or_else(|| DerivedObjectError::MissingPoint(*element, point.clone())),
            ReadonlySource::Measure { index } => measures
                .get(*index)
                .filter(|m| !m.is_stale())
                .and_then(|m| m.value)
                .ok_or_else(stale),
            ReadonlySource::SpringLength { element } => source
                .spring_length(*element)
                .ok_or(DerivedObjectError::MissingElement(*element)),
            ReadonlySource::Expression { formula } => {
                let mut bindings = Vec::new();
                for name in crate::formula::free_identifiers(formula) {
                    let value = earlier
                        .iter()
                        .find(|v| v.name == name)
                        .filter(|v| !v.is_stale())
                        .and_then(|v| v.value)
                        .ok_or_else(stale)?;
                    bindings.push((name, value));
                }
                Ok(eval_formula(&self.name, formula, &bindings)?)
            }
        }
    }
}
