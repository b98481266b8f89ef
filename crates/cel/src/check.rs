//! Static checks run before evaluation: every reference is declared, every
//! function exists with a valid arity, and literal regex, timestamp and duration
//! arguments are well formed.

use std::collections::HashMap;

use regex::Regex;

use crate::library;
use crate::temporal;
use crate::parser::{Expr, Lit};
use crate::ExprError;

pub struct Checked {
    pub regexes: HashMap<String, Regex>,
}

pub fn check(expr: &Expr, declared: &[&str]) -> Result<Checked, ExprError> {
    let mut c = Checker { scope: declared.iter().map(|s| s.to_string()).collect(), regexes: HashMap::new() };
    c.walk(expr)?;
    Ok(Checked { regexes: c.regexes })
}

struct Checker {
    scope: Vec<String>,
    regexes: HashMap<String, Regex>,
}

impl Checker {
    fn with_var<F>(&mut self, var: &str, f: F) -> Result<(), ExprError>
    where
        F: FnOnce(&mut Self) -> Result<(), ExprError>,
    {
        self.scope.push(var.to_string());
        let r = f(self);
        self.scope.pop();
        r
    }

    fn walk(&mut self, e: &Expr) -> Result<(), ExprError> {
        match e {
            Expr::Lit(_) => Ok(()),
            Expr::Ident(name) => {
                if self.scope.iter().any(|s| s == name) {
                    Ok(())
                } else {
                    Err(ExprError::Compile(format!("undeclared reference to '{}'", name)))
                }
            }
            Expr::Select(operand, _) | Expr::OptSelect(operand, _) | Expr::Has(operand, _) => self.walk(operand),
            Expr::OptElem(inner) => self.walk(inner),
            Expr::Index(a, b) | Expr::OptIndex(a, b) => {
                self.walk(a)?;
                self.walk(b)
            }
            Expr::Call { target, func, args } => {
                if !library::is_known(func, target.is_some(), args.len()) {
                    let form = if target.is_some() { "member" } else { "global" };
                    return Err(ExprError::Compile(format!(
                        "found no matching overload for {} function '{}' with {} argument(s)",
                        form,
                        func,
                        args.len()
                    )));
                }
                if library::takes_regex(func) {
                    let pattern = match (target.is_some(), args.as_slice()) {
                        (true, [Expr::Lit(Lit::Str(p)), ..]) => Some(p),
                        (false, [_, Expr::Lit(Lit::Str(p)), ..]) => Some(p),
                        _ => None,
                    };
                    if let Some(p) = pattern {
                        let re = Regex::new(p)
                            .map_err(|e| ExprError::Compile(format!("invalid regex literal {:?}: {}", p, e)))?;
                        self.regexes.insert(p.clone(), re);
                    }
                }
                if target.is_none() {
                    if let [Expr::Lit(Lit::Str(text))] = args.as_slice() {
                        let parsed = match func.as_str() {
                            "timestamp" => temporal::parse_timestamp(text).map(drop),
                            "duration" => temporal::parse_duration(text).map(drop),
                            _ => Ok(()),
                        };
                        parsed.map_err(ExprError::Compile)?;
                    }
                }
                if let Some(t) = target {
                    self.walk(t)?;
                }
                args.iter().try_for_each(|a| self.walk(a))
            }
            Expr::List(items) => items.iter().try_for_each(|a| self.walk(a)),
            Expr::Map(entries) => entries.iter().try_for_each(|(k, v)| {
                self.walk(k)?;
                self.walk(v)
            }),
            Expr::Unary(_, a) => self.walk(a),
            Expr::Binary(_, a, b) | Expr::And(a, b) | Expr::Or(a, b) => {
                self.walk(a)?;
                self.walk(b)
            }
            Expr::Cond(a, b, c) => {
                self.walk(a)?;
                self.walk(b)?;
                self.walk(c)
            }
            Expr::Fold { var, range, filter, step, .. } => {
                self.walk(range)?;
                self.with_var(var, |c| {
                    if let Some(f) = filter {
                        c.walk(f)?;
                    }
                    c.walk(step)
                })
            }
            Expr::Bind { var, init, body } => {
                self.walk(init)?;
                self.with_var(var, |c| c.walk(body))
            }
        }
    }
}
