//! Named, formula-driven scalars
//!
//! Formulas reference other scalars by name. A name resolves in the formula's
//! own scope first and then in the global scope. Evaluation is ordered by a
//! topological sort of the references, so cycles and unknown names surface as
//! structured errors before any value is computed.

mod expr;
mod graph;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

pub use expr::{eval_formula, free_identifiers, is_reserved, is_valid_name, rename_identifier};
pub use graph::{DependencyGraph, DependencyNode};

use crate::constants::GLOBAL_SCOPE;

/// Formula-related errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormulaError {
    #[error("Duplicated name: {0}")]
    DuplicatedName(String),
    #[error("Unknown variable '{name}' referenced by {referenced_by}")]
    UnknownVariable { name: String, referenced_by: String },
    #[error("Circular reference: {}", .cycle.join(" -> "))]
    CircularReference { cycle: Vec<String> },
    #[error("Invalid formula for {name}: {reason}")]
    InvalidFormula { name: String, reason: String },
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl FormulaError {
    /// Status code of this error
    pub fn status(&self) -> FormulaStatus {
        match self {
            Self::DuplicatedName(_) => FormulaStatus::DuplicatedName,
            Self::UnknownVariable { .. } => FormulaStatus::UnknownVariable,
            Self::CircularReference { .. } => FormulaStatus::CircularReference,
            Self::InvalidFormula { .. } => FormulaStatus::InvalidFormula,
            Self::Unexpected(_) => FormulaStatus::UnexpectedError,
        }
    }
}

/// Outcome of validating a whole formula set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormulaStatus {
    Ok,
    DuplicatedName,
    UnknownVariable,
    CircularReference,
    InvalidFormula,
    UnexpectedError,
}

impl<T> From<&Result<T, FormulaError>> for FormulaStatus {
    fn from(result: &Result<T, FormulaError>) -> Self {
        match result {
            Ok(_) => FormulaStatus::Ok,
            Err(e) => e.status(),
        }
    }
}

/// Identity of a scalar: scope path plus name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScalarKey {
    pub scope: String,
    pub name: String,
}

impl ScalarKey {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }

    pub fn global(name: impl Into<String>) -> Self {
        Self::new(GLOBAL_SCOPE, name)
    }
}

impl fmt::Display for ScalarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scope.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}.{}", self.scope, self.name)
        }
    }
}

/// A named scalar defined by a formula
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedScalar {
    pub name: String,
    pub formula: String,
    /// Scope path (empty for global)
    #[serde(default)]
    pub scope: String,
    /// Last evaluated value
    #[serde(default)]
    pub value: f64,
}

impl NamedScalar {
    /// Create a global scalar
    pub fn new(name: impl Into<String>, formula: impl Into<String>) -> Self {
        Self::scoped(GLOBAL_SCOPE, name, formula)
    }

    /// Create a scalar inside a scope
    pub fn scoped(
        scope: impl Into<String>,
        name: impl Into<String>,
        formula: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            formula: formula.into(),
            scope: scope.into(),
            value: 0.0,
        }
    }

    pub fn key(&self) -> ScalarKey {
        ScalarKey::new(self.scope.clone(), self.name.clone())
    }
}

/// Reject the first `(scope, name)` pair that appears twice
pub fn check_unique(scalars: &[NamedScalar]) -> Result<(), FormulaError> {
    let mut seen = HashSet::new();
    for s in scalars {
        if !seen.insert(s.key()) {
            return Err(FormulaError::DuplicatedName(s.key().to_string()));
        }
    }
    Ok(())
}

/// Validate and evaluate every scalar.
///
/// Returns the values aligned with `scalars`.
pub fn validate_all(scalars: &[NamedScalar]) -> Result<Vec<f64>, FormulaError> {
    check_unique(scalars)?;
    let mut graph = DependencyGraph::build(scalars)?;
    let order = graph.topological_order(None)?;

    let mut values = vec![0.0; scalars.len()];
    for i in order {
        values[i] = evaluate_node(scalars, &graph, i, &values)?;
    }
    Ok(values)
}

/// Evaluate an ad-hoc formula against `scalars` without touching unrelated ones.
///
/// The formula acts as a terminal node: only its transitive dependencies are
/// sorted and evaluated.
pub fn evaluate(formula: &str, scope: &str, scalars: &[NamedScalar]) -> Result<f64, FormulaError> {
    check_unique(scalars)?;
    let (mut graph, subtree) =
        DependencyGraph::build_reachable(scalars, formula, scope, || "<expression>".to_string())?;
    let order = graph.topological_order(Some(&subtree))?;

    let mut values = vec![0.0; scalars.len()];
    for i in order {
        values[i] = evaluate_node(scalars, &graph, i, &values)?;
    }

    let bindings = bindings_for(formula, scope, &graph, &values);
    expr::eval_formula("<expression>", formula, &bindings)
}

fn evaluate_node(
    scalars: &[NamedScalar],
    graph: &DependencyGraph,
    index: usize,
    values: &[f64],
) -> Result<f64, FormulaError> {
    let scalar = &scalars[index];
    let bindings = bindings_for(&scalar.formula, &scalar.scope, graph, values);
    expr::eval_formula(&scalar.key().to_string(), &scalar.formula, &bindings)
}

fn bindings_for(
    formula: &str,
    scope: &str,
    graph: &DependencyGraph,
    values: &[f64],
) -> Vec<(String, f64)> {
    free_identifiers(formula)
        .into_iter()
        .filter_map(|name| graph.lookup(&name, scope).map(|i| (name, values[i])))
        .collect()
}

/// An editable set of named scalars
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormulaSet {
    scalars: Vec<NamedScalar>,
}

impl FormulaSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from existing scalars (uniqueness is checked on validation)
    pub fn from_scalars(scalars: Vec<NamedScalar>) -> Self {
        Self { scalars }
    }

    pub fn len(&self) -> usize {
        self.scalars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scalars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedScalar> {
        self.scalars.iter()
    }

    pub fn scalars(&self) -> &[NamedScalar] {
        &self.scalars
    }

    /// Add a scalar; its name must be valid and unique within its scope
    pub fn insert(&mut self, scalar: NamedScalar) -> Result<(), FormulaError> {
        if !is_valid_name(&scalar.name) {
            return Err(FormulaError::InvalidFormula {
                name: scalar.name.clone(),
                reason: "not a valid identifier".into(),
            });
        }
        if self.position(&scalar.scope, &scalar.name).is_some() {
            return Err(FormulaError::DuplicatedName(scalar.key().to_string()));
        }
        self.scalars.push(scalar);
        Ok(())
    }

    /// Remove a scalar
    pub fn remove(&mut self, scope: &str, name: &str) -> Option<NamedScalar> {
        let index = self.position(scope, name)?;
        Some(self.scalars.remove(index))
    }

    pub fn get(&self, scope: &str, name: &str) -> Option<&NamedScalar> {
        self.position(scope, name).map(|i| &self.scalars[i])
    }

    /// Cached value of a global scalar
    pub fn value(&self, name: &str) -> Option<f64> {
        self.get(GLOBAL_SCOPE, name).map(|s| s.value)
    }

    /// Replace the formula of an existing scalar (not re-evaluated)
    pub fn set_formula(
        &mut self,
        scope: &str,
        name: &str,
        formula: impl Into<String>,
    ) -> Result<(), FormulaError> {
        let index = self
            .position(scope, name)
            .ok_or_else(|| FormulaError::UnknownVariable {
                name: name.to_string(),
                referenced_by: "set_formula".into(),
            })?;
        self.scalars[index].formula = formula.into();
        Ok(())
    }

    /// Status of the whole set without mutating cached values
    pub fn validate_all(&self) -> FormulaStatus {
        FormulaStatus::from(&validate_all(&self.scalars))
    }

    /// Evaluate all formulas and store the values
    pub fn evaluate_all(&mut self) -> Result<(), FormulaError> {
        let values = validate_all(&self.scalars)?;
        for (scalar, value) in self.scalars.iter_mut().zip(values) {
            scalar.value = value;
        }
        Ok(())
    }

    /// Evaluate an ad-hoc formula as seen from `scope`
    pub fn evaluate(&self, formula: &str, scope: &str) -> Result<f64, FormulaError> {
        evaluate(formula, scope, &self.scalars)
    }

    /// Keys of scalars whose formulas reference `(scope, name)` directly
    pub fn dependents(&self, scope: &str, name: &str) -> Vec<ScalarKey> {
        let target = ScalarKey::new(scope, name);
        self.scalars
            .iter()
            .filter(|s| {
                free_identifiers(&s.formula)
                    .iter()
                    .any(|id| self.resolve_key(id, &s.scope).as_ref() == Some(&target))
            })
            .map(NamedScalar::key)
            .collect()
    }

    /// Rename a scalar and rewrite every formula that resolves to it.
    ///
    /// Returns the number of rewritten formulas.
    pub fn rename(&mut self, scope: &str, old: &str, new: &str) -> Result<usize, FormulaError> {
        if !is_valid_name(new) {
            return Err(FormulaError::InvalidFormula {
                name: new.to_string(),
                reason: "not a valid identifier".into(),
            });
        }
        let index = self
            .position(scope, old)
            .ok_or_else(|| FormulaError::UnknownVariable {
                name: old.to_string(),
                referenced_by: "rename".into(),
            })?;
        if old == new {
            return Ok(0);
        }
        if self.position(scope, new).is_some() {
            return Err(FormulaError::DuplicatedName(ScalarKey::new(scope, new).to_string()));
        }

        let target = ScalarKey::new(scope, old);
        let rewrite: BTreeSet<usize> = self
            .scalars
            .iter()
            .enumerate()
            .filter(|(_, s)| self.resolve_key(old, &s.scope).as_ref() == Some(&target))
            .filter(|(_, s)| free_identifiers(&s.formula).contains(old))
            .map(|(i, _)| i)
            .collect();

        // a rewritten reference must still bind to the renamed scalar
        if let Some(&i) = rewrite.iter().find(|&&i| {
            let owner = &self.scalars[i].scope;
            owner != scope && self.position(owner, new).is_some()
        }) {
            let shadow = ScalarKey::new(self.scalars[i].scope.clone(), new);
            return Err(FormulaError::DuplicatedName(shadow.to_string()));
        }
        // and references to a global `new` inside the scope must not be captured
        if !scope.is_empty()
            && let Some(s) = self
                .scalars
                .iter()
                .find(|s| s.scope == scope && free_identifiers(&s.formula).contains(new))
        {
            return Err(FormulaError::DuplicatedName(format!(
                "{} (referenced by {})",
                ScalarKey::global(new),
                s.key()
            )));
        }

        for &i in &rewrite {
            let rewritten = rename_identifier(&self.scalars[i].formula, old, new);
            self.scalars[i].formula = rewritten;
        }
        self.scalars[index].name = new.to_string();

        tracing::debug!("Renamed {} to {} ({} formulas rewritten)", target, new, rewrite.len());
        Ok(rewrite.len())
    }

    /// Name -> value map of the global scope
    pub fn globals(&self) -> BTreeMap<String, f64> {
        self.scalars
            .iter()
            .filter(|s| s.scope.is_empty())
            .map(|s| (s.name.clone(), s.value))
            .collect()
    }

    fn position(&self, scope: &str, name: &str) -> Option<usize> {
        self.scalars
            .iter()
            .position(|s| s.scope == scope && s.name == name)
    }

    fn resolve_key(&self, name: &str, scope: &str) -> Option<ScalarKey> {
        if !scope.is_empty() && self.position(scope, name).is_some() {
            return Some(ScalarKey::new(scope, name));
        }
        self.position(GLOBAL_SCOPE, name)
            .map(|_| ScalarKey::global(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(defs: &[(&str, &str)]) -> FormulaSet {
        FormulaSet::from_scalars(defs.iter().map(|(n, f)| NamedScalar::new(*n, *f)).collect())
    }

    #[test]
    fn test_validate_ok_and_values() {
        let mut formulas = set(&[
            ("track", "1200"),
            ("half_track", "track / 2"),
            ("offset", "half_track - 25"),
        ]);
        assert_eq!(formulas.validate_all(), FormulaStatus::Ok);
        formulas.evaluate_all().unwrap();
        assert_eq!(formulas.value("offset"), Some(575.0));
    }

    #[test]
    fn test_duplicated_name() {
        let formulas = set(&[("a", "1"), ("a", "2")]);
        assert_eq!(formulas.validate_all(), FormulaStatus::DuplicatedName);
    }

    #[test]
    fn test_same_name_different_scope_is_not_duplicate() {
        let formulas = FormulaSet::from_scalars(vec![
            NamedScalar::new("len", "100"),
            NamedScalar::scoped("tie_rod", "len", "len + 5"),
        ]);
        // the local `len` references itself, not the global one
        assert_eq!(formulas.validate_all(), FormulaStatus::CircularReference);
    }

    #[test]
    fn test_transitive_cycle() {
        let formulas = set(&[("a", "b"), ("b", "c * 2"), ("c", "a + 1")]);
        assert_eq!(formulas.validate_all(), FormulaStatus::CircularReference);
    }

    #[test]
    fn test_self_reference() {
        let formulas = set(&[("a", "a + 1")]);
        assert_eq!(formulas.validate_all(), FormulaStatus::CircularReference);
    }

    #[test]
    fn test_unknown_variable() {
        let formulas = set(&[("a", "b + 1")]);
        assert_eq!(formulas.validate_all(), FormulaStatus::UnknownVariable);
    }

    #[test]
    fn test_invalid_formula() {
        let formulas = set(&[("a", "sqrt(0 - 4)")]);
        assert_eq!(formulas.validate_all(), FormulaStatus::InvalidFormula);
    }

    #[test]
    fn test_evaluate_ignores_unrelated_broken_formulas() {
        // `broken` is cyclic, but the ad-hoc formula only depends on `a`
        let formulas = set(&[("a", "3"), ("broken", "broken + 1")]);
        let value = formulas.evaluate("a * 4", "").unwrap();
        assert_eq!(value, 12.0);
        assert!(formulas.evaluate("broken", "").is_err());
    }

    #[test]
    fn test_evaluate_scoped() {
        let formulas = FormulaSet::from_scalars(vec![
            NamedScalar::new("k", "2"),
            NamedScalar::scoped("arm", "k", "10"),
        ]);
        assert_eq!(formulas.evaluate("k", "arm").unwrap(), 10.0);
        assert_eq!(formulas.evaluate("k", "bar").unwrap(), 2.0);
    }

    #[test]
    fn test_rename_round_trip() {
        let mut formulas = set(&[("x", "10"), ("xx", "x * x + 1"), ("z", "max(x, xx) - x2")]);
        formulas.insert(NamedScalar::new("x2", "4")).unwrap();
        let original = formulas.clone();

        let rewritten = formulas.rename("", "x", "y").unwrap();
        assert_eq!(rewritten, 2);
        assert_eq!(formulas.get("", "xx").unwrap().formula, "y * y + 1");
        assert_eq!(formulas.get("", "z").unwrap().formula, "max(y, xx) - x2");

        formulas.rename("", "y", "x").unwrap();
        assert_eq!(formulas, original);
    }

    #[test]
    fn test_rename_rejects_existing_name() {
        let mut formulas = set(&[("a", "1"), ("b", "a")]);
        let err = formulas.rename("", "a", "b").unwrap_err();
        assert_eq!(err.status(), FormulaStatus::DuplicatedName);
    }

    #[test]
    fn test_rename_skips_shadowed_references() {
        let mut formulas = FormulaSet::from_scalars(vec![
            NamedScalar::new("k", "1"),
            NamedScalar::scoped("arm", "k", "3"),
            NamedScalar::scoped("arm", "h", "k * 2"),
            NamedScalar::new("g", "k + 1"),
        ]);
        formulas.rename("", "k", "gain").unwrap();
        assert_eq!(formulas.get("arm", "h").unwrap().formula, "k * 2");
        assert_eq!(formulas.get("", "g").unwrap().formula, "gain + 1");
    }

    #[test]
    fn test_rename_rejects_name_shadowed_in_referencing_scope() {
        let mut formulas = FormulaSet::from_scalars(vec![
            NamedScalar::new("x", "10"),
            NamedScalar::scoped("arm", "y", "1000"),
            NamedScalar::scoped("arm", "h", "x * 2"),
        ]);
        let before = formulas.clone();
        let err = formulas.rename("", "x", "y").unwrap_err();
        assert_eq!(err.status(), FormulaStatus::DuplicatedName);
        assert_eq!(formulas, before);
        assert_eq!(formulas.evaluate("h", "arm").unwrap(), 20.0);
    }

    #[test]
    fn test_rename_local_rejects_captured_global() {
        let mut formulas = FormulaSet::from_scalars(vec![
            NamedScalar::new("y", "5"),
            NamedScalar::scoped("arm", "k", "3"),
            NamedScalar::scoped("arm", "h", "y + k"),
        ]);
        let err = formulas.rename("arm", "k", "y").unwrap_err();
        assert_eq!(err.status(), FormulaStatus::DuplicatedName);
        assert_eq!(formulas.get("arm", "k").unwrap().formula, "3");
    }

    #[test]
    fn test_rename_local_alongside_unused_global() {
        let mut formulas = FormulaSet::from_scalars(vec![
            NamedScalar::new("y", "5"),
            NamedScalar::scoped("arm", "k", "3"),
            NamedScalar::scoped("arm", "h", "k * 2"),
        ]);
        assert_eq!(formulas.rename("arm", "k", "y").unwrap(), 1);
        assert_eq!(formulas.evaluate("h", "arm").unwrap(), 6.0);
    }

    #[test]
    fn test_evaluate_ignores_unrelated_unknown_variable() {
        let formulas = set(&[("a", "3"), ("typo", "missing_name + 1")]);
        assert_eq!(formulas.evaluate("a * 4", "").unwrap(), 12.0);
        assert_eq!(formulas.validate_all(), FormulaStatus::UnknownVariable);
    }

    #[test]
    fn test_wrong_argument_count_is_invalid_formula() {
        let formulas = set(&[("a", "atan2(1)")]);
        assert_eq!(formulas.validate_all(), FormulaStatus::InvalidFormula);
    }

    #[test]
    fn test_dependents() {
        let formulas = set(&[("a", "1"), ("b", "a"), ("c", "b + a"), ("d", "4")]);
        let deps = formulas.dependents("", "a");
        assert_eq!(deps, vec![ScalarKey::global("b"), ScalarKey::global("c")]);
    }
}
