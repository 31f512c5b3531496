//! Identifier scanning, rewriting and evaluation of a single formula

use std::collections::BTreeSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::LazyLock;

use meval::{Context, Expr};
use regex::{Captures, Regex};

use crate::constants::RESERVED_NAMES;

use super::FormulaError;

/// An identifier token that is not the tail of a number (`1e5`) or of another
/// identifier. Group 1 is the separator, group 2 the identifier.
static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[^A-Za-z0-9_.])([A-Za-z_][A-Za-z0-9_]*)").expect("identifier regex is valid")
});

static VALID_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("name regex is valid"));

/// Whether `name` may be used as a scalar name
pub fn is_valid_name(name: &str) -> bool {
    VALID_NAME.is_match(name) && !is_reserved(name)
}

/// Whether `name` is a built-in function or constant
pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Free identifiers of a formula, built-ins excluded
pub fn free_identifiers(formula: &str) -> BTreeSet<String> {
    IDENTIFIER
        .captures_iter(formula)
        .map(|c| c[2].to_string())
        .filter(|name| !is_reserved(name))
        .collect()
}

/// Replace whole-identifier occurrences of `from` with `to`
pub fn rename_identifier(formula: &str, from: &str, to: &str) -> String {
    IDENTIFIER
        .replace_all(formula, |caps: &Captures| {
            if &caps[2] == from {
                format!("{}{}", &caps[1], to)
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Evaluate `formula` with the given identifier bindings.
///
/// Parse failures, evaluator errors (wrong argument counts, unbound names)
/// and non-finite results are `InvalidFormula`. Only evaluator panics are
/// `Unexpected`.
pub fn eval_formula(
    owner: &str,
    formula: &str,
    bindings: &[(String, f64)],
) -> Result<f64, FormulaError> {
    let expr: Expr = formula.parse().map_err(|e: meval::Error| invalid(owner, e))?;

    let mut context = base_context();
    for (name, value) in bindings {
        context.var(name.clone(), *value);
    }

    let value = guarded(owner, || expr.eval_with_context(&context))?;

    if !value.is_finite() {
        return Err(FormulaError::InvalidFormula {
            name: owner.to_string(),
            reason: format!("result is not a finite number ({value})"),
        });
    }
    Ok(value)
}

/// Run an evaluation, turning a panic into `Unexpected`
fn guarded(
    owner: &str,
    eval: impl FnOnce() -> Result<f64, meval::Error>,
) -> Result<f64, FormulaError> {
    catch_unwind(AssertUnwindSafe(eval))
        .map_err(|_| FormulaError::Unexpected(format!("evaluator panicked on {owner}")))?
        .map_err(|e| invalid(owner, e))
}

fn invalid(owner: &str, error: meval::Error) -> FormulaError {
    FormulaError::InvalidFormula {
        name: owner.to_string(),
        reason: error.to_string(),
    }
}

fn base_context() -> Context<'static> {
    let mut context = Context::new();
    context
        .func("log", f64::log10)
        .func("deg", f64::to_degrees)
        .func("rad", f64::to_radians);
    context
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_identifiers_skip_builtins_and_exponents() {
        let ids = free_identifiers("sin(angle) * track_width + 1e5 - 2.5e-3 * pi");
        assert_eq!(
            ids.into_iter().collect::<Vec<_>>(),
            vec!["angle".to_string(), "track_width".to_string()]
        );
    }

    #[test]
    fn test_rename_whole_identifiers_only() {
        let renamed = rename_identifier("x + x2 + x*x + max(x, xx)", "x", "y");
        assert_eq!(renamed, "y + x2 + y*y + max(y, xx)");
    }

    #[test]
    fn test_eval_with_bindings() {
        let value = eval_formula("a", "w / 2 + deg(pi)", &[("w".into(), 10.0)]).unwrap();
        assert!((value - 185.0).abs() < 1e-12);
    }

    #[test]
    fn test_eval_non_finite_is_invalid() {
        let err = eval_formula("a", "1 / 0", &[]).unwrap_err();
        assert!(matches!(err, FormulaError::InvalidFormula { .. }));
    }

    #[test]
    fn test_eval_parse_error_is_invalid() {
        let err = eval_formula("a", "3 + * 4", &[]).unwrap_err();
        assert!(matches!(err, FormulaError::InvalidFormula { .. }));
    }

    #[test]
    fn test_eval_wrong_argument_count_is_invalid() {
        let err = eval_formula("a", "atan2(1)", &[]).unwrap_err();
        assert!(matches!(err, FormulaError::InvalidFormula { .. }));
        let err = eval_formula("a", "max()", &[]).unwrap_err();
        assert!(matches!(err, FormulaError::InvalidFormula { .. }));
    }

    #[test]
    fn test_eval_unbound_name_is_invalid() {
        let err = eval_formula("a", "w * 2", &[]).unwrap_err();
        assert!(matches!(err, FormulaError::InvalidFormula { .. }));
    }

    #[test]
    fn test_evaluator_panic_is_unexpected() {
        let err = guarded("a", || panic!("evaluator bug")).unwrap_err();
        assert_eq!(err, FormulaError::Unexpected("evaluator panicked on a".into()));
        assert_eq!(guarded("a", || Ok(2.0)), Ok(2.0));
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("wheel_base"));
        assert!(!is_valid_name("2x"));
        assert!(!is_valid_name("sin"));
        assert!(!is_valid_name("a-b"));
    }
}
