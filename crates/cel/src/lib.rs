//! Tether expressions: sandboxed CEL evaluated against untyped documents.
//!
//! Each top-level binding becomes a dynamic variable. Timestamps are UTC by default.
//! Compilation rejects syntax errors, undeclared references, unknown functions and
//! invalid regex, timestamp or duration literals before anything runs; evaluation is
//! bounded by a nesting limit and a size-aware cost budget.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use regex::Regex;
use serde_json::{Map, Value as Json};
use thiserror::Error;

mod check;
mod eval;
mod lexer;
mod library;
mod parser;
mod quantity;
mod temporal;
mod urls;
mod value;

pub use eval::DEFAULT_COST_BUDGET;
pub use parser::MAX_NESTING;
pub use quantity::Quantity;
pub use value::Val;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("failed to compile expression: {0}")]
    Compile(String),
    #[error("failed to evaluate expression: {0}")]
    Eval(String),
    #[error("expression returned {0}, expected bool")]
    NonBool(String),
}

/// A checked expression, reusable across evaluations with the same variable names.
pub struct Program {
    expr: parser::Expr,
    regexes: HashMap<String, Regex>,
    budget: u64,
}

impl Program {
    pub fn compile(src: &str, variables: &[&str]) -> Result<Program, ExprError> {
        let expr = parser::parse(src)?;
        let checked = check::check(&expr, variables)?;
        Ok(Program { expr, regexes: checked.regexes, budget: DEFAULT_COST_BUDGET })
    }

    pub fn with_budget(mut self, budget: u64) -> Self {
        self.budget = budget;
        self
    }

    pub fn eval_value(&self, bindings: &Map<String, Json>) -> Result<Val, ExprError> {
        let globals: HashMap<String, Val> = bindings.iter().map(|(k, v)| (k.clone(), Val::from_json(v))).collect();
        let mut ev = eval::Evaluator::new(&globals, &self.regexes, self.budget);
        let out = ev.eval(&self.expr).map_err(ExprError::Eval);
        tracing::trace!(cost = ev.cost(), "expression evaluated");
        out
    }

    pub fn eval_bool(&self, bindings: &Map<String, Json>) -> Result<bool, ExprError> {
        match self.eval_value(bindings)? {
            Val::Bool(b) => Ok(b),
            other => Err(ExprError::NonBool(other.type_name().to_string())),
        }
    }
}

/// Compile `expression` with one dynamic variable per binding and evaluate it to a bool.
pub fn eval(expression: &str, bindings: &Map<String, Json>) -> Result<bool, ExprError> {
    let names: Vec<&str> = bindings.keys().map(String::as_str).collect();
    Program::compile(expression, &names)?.eval_bool(bindings)
}

/// [`eval`] with the top-level fields of `document` as bindings. Non-object
/// documents provide no variables.
pub fn eval_document(expression: &str, document: &Json) -> Result<bool, ExprError> {
    let empty = Map::new();
    let bindings = document.as_object().unwrap_or(&empty);
    eval(expression, bindings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Json {
        json!({ "spec": { "replicas": 3, "tags": ["a", "b"] }, "status": { "replicas": 3 } })
    }

    #[test]
    fn error_classes_are_distinct() {
        assert!(matches!(eval_document("spec.replicas ==", &doc()), Err(ExprError::Compile(_))));
        assert!(matches!(eval_document("nope.replicas == 3", &doc()), Err(ExprError::Compile(_))));
        assert!(matches!(eval_document("spec.missing == 3", &doc()), Err(ExprError::Eval(_))));
        assert!(matches!(eval_document("spec.replicas + 1", &doc()), Err(ExprError::NonBool(t)) if t == "int"));
    }

    #[test]
    fn logical_operators_absorb_errors() {
        assert_eq!(eval_document("spec.missing == 1 || true", &doc()), Ok(true));
        assert_eq!(eval_document("false && spec.missing == 1", &doc()), Ok(false));
        assert_eq!(eval_document("spec.missing == 1 && false", &doc()), Ok(false));
        assert!(eval_document("spec.missing == 1 && true", &doc()).is_err());
    }

    #[test]
    fn cost_budget_stops_runaway_comprehensions() {
        let p = Program::compile("[1,2,3,4,5,6,7,8].all(a, [1,2,3,4,5,6,7,8].all(b, a + b > 0))", &[]).unwrap().with_budget(50);
        assert!(matches!(p.eval_bool(&Map::new()), Err(ExprError::Eval(m)) if m.contains("cost")));
    }

    #[test]
    fn cost_budget_counts_value_sizes() {
        // each level doubles the string; the budget stops it long before it gets large
        let mut expr = "'ab'".to_string();
        for i in 0..30 {
            expr = format!("cel.bind(v{i}, {expr}, v{i} + v{i})");
        }
        let out = eval_document(&format!("size({expr}) > 0"), &doc());
        assert!(matches!(out, Err(ExprError::Eval(ref m)) if m.contains("cost")), "{out:?}");

        let grown = "cel.bind(s, 'x' + 'x', s + s + s + s).size() == 8";
        assert_eq!(eval_document(grown, &doc()), Ok(true));
        let replaced = Program::compile("'a'.replace('', 'bcdefgh') == 'bcdefghabcdefgh'", &[]).unwrap().with_budget(12);
        assert!(matches!(replaced.eval_bool(&Map::new()), Err(ExprError::Eval(_))));
    }
}
