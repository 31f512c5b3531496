//! Derived objects: datums, measure tools and readonly variables
//!
//! Objects are stored in creation order and may only reference objects of
//! the same layer created before them, so the dependency graph is acyclic by
//! construction. [`DerivedObjects::update`] recomputes every layer in order;
//! an object that fails keeps its last valid value and is flagged stale.

mod datum;
mod measure;
mod readonly;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use datum::{DatumKind, DatumObject, DatumType, DatumValue};
pub use measure::{Axis, MeasureKind, MeasureTool};
pub use readonly::{ReadonlySource, ReadonlyVariable};

use crate::assembly::PointSource;
use crate::formula::{FormulaError, free_identifiers, is_valid_name};

/// Derived-object errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DerivedObjectError {
    #[error("Element not found: {0}")]
    MissingElement(Uuid),
    #[error("Point '{1}' not found on element {0}")]
    MissingPoint(Uuid, String),
    #[error("{0} depends on a stale or missing object")]
    StaleDependency(String),
    #[error("{0} is degenerate")]
    Degenerate(String),
    #[error("{object} references index {index}, which is not an earlier object")]
    InvalidReference { object: String, index: usize },
    #[error("{object} expects a {expected} at index {index}")]
    WrongKind {
        object: String,
        index: usize,
        expected: &'static str,
    },
    #[error("Invalid or duplicated readonly variable name: {0}")]
    InvalidName(String),
    #[error(transparent)]
    Formula(#[from] FormulaError),
}

/// Reference to a derived object by layer and index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DerivedRef {
    Datum(usize),
    Measure(usize),
    Readonly(usize),
}

/// All derived objects of a project
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedObjects {
    #[serde(default)]
    pub datums: Vec<DatumObject>,
    #[serde(default)]
    pub measures: Vec<MeasureTool>,
    #[serde(default)]
    pub readonly: Vec<ReadonlyVariable>,
}

impl DerivedObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.datums.is_empty() && self.measures.is_empty() && self.readonly.is_empty()
    }

    /// Append a datum; it may only reference earlier datums of the right type
    pub fn add_datum(&mut self, datum: DatumObject) -> Result<usize, DerivedObjectError> {
        for (index, expected) in datum.kind.references() {
            let target = self
                .datums
                .get(index)
                .ok_or_else(|| DerivedObjectError::InvalidReference {
                    object: datum.name.clone(),
                    index,
                })?;
            if target.kind.output() != expected {
                return Err(DerivedObjectError::WrongKind {
                    object: datum.name.clone(),
                    index,
                    expected: expected.label(),
                });
            }
        }
        self.datums.push(datum);
        Ok(self.datums.len() - 1)
    }

    pub fn add_measure(&mut self, measure: MeasureTool) -> Result<usize, DerivedObjectError> {
        for index in measure.kind.datums() {
            let target = self
                .datums
                .get(index)
                .ok_or_else(|| DerivedObjectError::InvalidReference {
                    object: measure.name.clone(),
                    index,
                })?;
            let ty = target.kind.output();
            if !measure.kind.accepts(ty) {
                return Err(DerivedObjectError::WrongKind {
                    object: measure.name.clone(),
                    index,
                    expected: match measure.kind {
                        MeasureKind::Coordinate { .. } => DatumType::Point.label(),
                        _ => "line or plane",
                    },
                });
            }
        }
        self.measures.push(measure);
        Ok(self.measures.len() - 1)
    }

    /// Append a readonly variable. Expressions may only name earlier
    /// readonly variables.
    pub fn add_readonly(
        &mut self,
        variable: ReadonlyVariable,
    ) -> Result<usize, DerivedObjectError> {
        if !is_valid_name(&variable.name) || self.readonly_index(&variable.name).is_some() {
            return Err(DerivedObjectError::InvalidName(variable.name));
        }
        match &variable.source {
            ReadonlySource::Measure { index } if *index >= self.measures.len() => {
                return Err(DerivedObjectError::InvalidReference {
                    object: variable.name.clone(),
                    index: *index,
                });
            }
            ReadonlySource::Expression { formula } => {
                for name in free_identifiers(formula) {
                    if self.readonly_index(&name).is_none() {
                        return Err(FormulaError::UnknownVariable {
                            name,
                            referenced_by: variable.name.clone(),
                        }
                        .into());
                    }
                }
            }
            _ => {}
        }
        self.readonly.push(variable);
        Ok(self.readonly.len() - 1)
    }

    pub fn readonly_index(&self, name: &str) -> Option<usize> {
        self.readonly.iter().position(|v| v.name == name)
    }

    /// Recompute datums, then measures, then readonly variables.
    ///
    /// Returns the number of stale objects after the pass.
    pub fn update(&mut self, source: &impl PointSource) -> usize {
        for i in 0..self.datums.len() {
            let (earlier, rest) = self.datums.split_at_mut(i);
            let datum = &mut rest[0];
            match datum.compute(earlier, source) {
                Ok(value) => {
                    datum.value = Some(value);
                    datum.error = None;
                }
                Err(e) => mark_stale(&datum.name, &mut datum.error, e),
            }
        }

        for measure in &mut self.measures {
            match measure.compute(&self.datums) {
                Ok(value) => {
                    measure.value = Some(value);
                    measure.error = None;
                }
                Err(e) => mark_stale(&measure.name, &mut measure.error, e),
            }
        }

        for i in 0..self.readonly.len() {
            let (earlier, rest) = self.readonly.split_at_mut(i);
            let variable = &mut rest[0];
            match variable.compute(earlier, &self.measures, source) {
                Ok(value) => {
                    variable.value = Some(value);
                    variable.error = None;
                }
                Err(e) => mark_stale(&variable.name, &mut variable.error, e),
            }
        }

        self.stale().len()
    }

    /// Objects whose last update failed
    pub fn stale(&self) -> Vec<DerivedRef> {
        let datums = self
            .datums
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_stale())
            .map(|(i, _)| DerivedRef::Datum(i));
        let measures = self
            .measures
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_stale())
            .map(|(i, _)| DerivedRef::Measure(i));
        let readonly = self
            .readonly
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_stale())
            .map(|(i, _)| DerivedRef::Readonly(i));
        datums.chain(measures).chain(readonly).collect()
    }

    /// Last valid measure values in index order (NaN if never computed)
    pub fn measure_values(&self) -> Vec<f64> {
        self.measures
            .iter()
            .map(|m| m.value.unwrap_or(f64::NAN))
            .collect()
    }

    /// Last valid readonly values by name
    pub fn readonly_values(&self) -> BTreeMap<String, f64> {
        self.readonly
            .iter()
            .filter_map(|v| v.value.map(|value| (v.name.clone(), value)))
            .collect()
    }

    /// Drop cached values and stale flags
    pub fn reset(&mut self) {
        for datum in &mut self.datums {
            datum.value = None;
            datum.error = None;
        }
        for measure in &mut self.measures {
            measure.value = None;
            measure.error = None;
        }
        for variable in &mut self.readonly {
            variable.value = None;
            variable.error = None;
        }
    }
}

fn mark_stale(name: &str, slot: &mut Option<DerivedObjectError>, error: DerivedObjectError) {
    if slot.is_none() {
        tracing::warn!("Derived object '{}' is stale: {}", name, error);
    }
    *slot = Some(error);
}
