//! Tree-walking evaluator with a cost budget. Every visited node costs one unit, fold
//! ranges cost their length and values that grow (concatenation, `replace`, `join`,
//! comprehension results) cost their size, so the budget also bounds memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use regex::Regex;

use crate::library;
use crate::parser::{BinOp, Expr, Fold, Lit, UnOp};
use crate::temporal;
use crate::value::{Key, Val};

/// Default evaluation budget.
pub const DEFAULT_COST_BUDGET: u64 = 1_000_000;

type Out = Result<Val, String>;

pub struct Evaluator<'a> {
    globals: &'a HashMap<String, Val>,
    regexes: &'a HashMap<String, Regex>,
    locals: Vec<(String, Val)>,
    cost: u64,
    budget: u64,
}

impl<'a> Evaluator<'a> {
    pub fn new(globals: &'a HashMap<String, Val>, regexes: &'a HashMap<String, Regex>, budget: u64) -> Self {
        Self { globals, regexes, locals: Vec::new(), cost: 0, budget }
    }

    pub fn cost(&self) -> u64 { self.cost }

    fn charge(&mut self, n: u64) -> Result<(), String> {
        self.cost = self.cost.saturating_add(n);
        if self.cost > self.budget {
            return Err(format!("operation cancelled: actual cost limit exceeded ({})", self.budget));
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Out {
        if let Some((_, v)) = self.locals.iter().rev().find(|(n, _)| n == name) {
            return Ok(v.clone());
        }
        self.globals.get(name).cloned().ok_or_else(|| format!("no such attribute: {}", name))
    }

    pub fn eval(&mut self, e: &Expr) -> Out {
        self.charge(1)?;
        match e {
            Expr::Lit(l) => Ok(match l {
                Lit::Null => Val::Null,
                Lit::Bool(b) => Val::Bool(*b),
                Lit::Int(i) => Val::Int(*i),
                Lit::Uint(u) => Val::Uint(*u),
                Lit::Double(d) => Val::Double(*d),
                Lit::Str(s) => Val::str(s),
                Lit::Bytes(b) => Val::bytes(b),
            }),
            Expr::Ident(name) => self.lookup(name),
            Expr::Select(operand, field) => match self.eval(operand)? {
                Val::Optional(o) => Ok(opt_select(o.as_deref(), field)),
                base => select(&base, field),
            },
            Expr::OptSelect(operand, field) => match self.eval(operand)? {
                Val::Optional(o) => Ok(opt_select(o.as_deref(), field)),
                base => match base {
                    Val::Map(_) => Ok(opt_select(Some(&base), field)),
                    other => Err(format!("type '{}' does not support field selection", other.type_name())),
                },
            },
            Expr::Has(operand, field) => match self.eval(operand)? {
                Val::Map(m) => Ok(Val::Bool(m.contains_key(&Key::Str(field.clone())))),
                other => Err(format!("invalid type for field selection: {}", other.type_name())),
            },
            Expr::Index(a, b) => {
                let base = self.eval(a)?;
                let idx = self.eval(b)?;
                match base {
                    Val::Optional(o) => opt_index(o.as_deref(), &idx),
                    base => index(&base, &idx),
                }
            }
            Expr::OptIndex(a, b) => {
                let base = self.eval(a)?;
                let idx = self.eval(b)?;
                match base {
                    Val::Optional(o) => opt_index(o.as_deref(), &idx),
                    base => opt_index(Some(&base), &idx),
                }
            }
            Expr::OptElem(_) => Err("optional entry outside a list or map literal".into()),
            Expr::Call { target, func, args } => {
                let t = match target {
                    Some(t) => Some(self.eval(t)?),
                    None => None,
                };
                let vals = args.iter().map(|a| self.eval(a)).collect::<Result<Vec<_>, _>>()?;
                let hint = library::output_hint(func, t.as_ref(), &vals);
                self.charge(hint)?;
                let out = library::call(func, t, vals, self.regexes)?;
                if hint == 0 {
                    self.charge(out.heft())?;
                }
                Ok(out)
            }
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(v) = self.entry(item)? {
                        out.push(v);
                    }
                }
                Ok(Val::list(out))
            }
            Expr::Map(entries) => {
                let mut out = BTreeMap::new();
                for (k, v) in entries {
                    let key = Key::from_val(&self.eval(k)?)?;
                    let Some(val) = self.entry(v)? else { continue };
                    if out.insert(key.clone(), val).is_some() {
                        return Err(format!("duplicate map key {}", key));
                    }
                }
                Ok(Val::Map(Arc::new(out)))
            }
            Expr::Unary(op, a) => {
                let v = self.eval(a)?;
                match (op, v) {
                    (UnOp::Not, Val::Bool(b)) => Ok(Val::Bool(!b)),
                    (UnOp::Neg, Val::Int(i)) => i.checked_neg().map(Val::Int).ok_or_else(|| "int overflow".to_string()),
                    (UnOp::Neg, Val::Double(d)) => Ok(Val::Double(-d)),
                    (UnOp::Neg, Val::Duration(d)) => duration_sum(chrono::Duration::zero().checked_sub(&d)),
                    (op, v) => Err(format!("no such overload: {:?} {}", op, v.type_name())),
                }
            }
            Expr::Binary(op, a, b) => {
                let l = self.eval(a)?;
                let r = self.eval(b)?;
                if *op == BinOp::Add && matches!((&l, &r), (Val::Str(_), Val::Str(_)) | (Val::Bytes(_), Val::Bytes(_)) | (Val::List(_), Val::List(_))) {
                    self.charge(l.heft() + r.heft())?;
                }
                binary(*op, &l, &r)
            }
            Expr::And(a, b) => self.logic(a, b, false),
            Expr::Or(a, b) => self.logic(a, b, true),
            Expr::Cond(c, a, b) => match self.eval(c)? {
                Val::Bool(true) => self.eval(a),
                Val::Bool(false) => self.eval(b),
                other => Err(format!("no such overload: ternary on {}", other.type_name())),
            },
            Expr::Fold { kind, var, range, filter, step } => self.fold(*kind, var, range, filter.as_deref(), step),
            Expr::Bind { var, init, body } => {
                let v = self.eval(init)?;
                self.locals.push((var.clone(), v));
                let out = self.eval(body);
                self.locals.pop();
                out
            }
        }
    }

    /// Aggregate literal entry; `None` for an empty `?optional` entry.
    fn entry(&mut self, e: &Expr) -> Result<Option<Val>, String> {
        match e {
            Expr::OptElem(inner) => match self.eval(inner)? {
                Val::Optional(o) => Ok(o.map(|v| v.as_ref().clone())),
                other => Err(format!("optional entry must be optional_type, got {}", other.type_name())),
            },
            other => self.eval(other).map(Some),
        }
    }

    /// `&&` (short = false) and `||` (short = true); a decisive operand on either
    /// side absorbs an error on the other.
    fn logic(&mut self, a: &Expr, b: &Expr, short: bool) -> Out {
        let as_bool = |r: Out| -> Result<bool, String> {
            match r? {
                Val::Bool(b) => Ok(b),
                other => Err(format!("no such overload: logical operator on {}", other.type_name())),
            }
        };
        let left = as_bool(self.eval(a));
        if let Ok(v) = left {
            if v == short {
                return Ok(Val::Bool(short));
            }
        }
        let right = as_bool(self.eval(b));
        match (left, right) {
            (_, Ok(v)) if v == short => Ok(Val::Bool(short)),
            (Ok(_), Ok(_)) => Ok(Val::Bool(!short)),
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }

    fn fold(&mut self, kind: Fold, var: &str, range: &Expr, filter: Option<&Expr>, step: &Expr) -> Out {
        let items: Vec<Val> = match self.eval(range)? {
            Val::List(l) => l.as_ref().clone(),
            Val::Map(m) => m.keys().map(Key::to_val).collect(),
            other => return Err(format!("cannot iterate over {}", other.type_name())),
        };
        self.charge(items.len() as u64)?;
        let mut trues = 0usize;
        let mut first_err: Option<String> = None;
        let mut out = Vec::new();
        for item in items {
            self.charge(1)?;
            self.locals.push((var.to_string(), item.clone()));
            // None: rejected by the three-argument map filter
            let res = (|| -> Result<Option<Val>, String> {
                if let Some(f) = filter {
                    match self.eval(f)? {
                        Val::Bool(true) => {}
                        Val::Bool(false) => return Ok(None),
                        other => return Err(format!("map filter must be bool, got {}", other.type_name())),
                    }
                }
                self.eval(step).map(Some)
            })();
            self.locals.pop();
            match kind {
                Fold::All | Fold::Exists => {
                    let decisive = kind == Fold::Exists;
                    match res {
                        Ok(Some(Val::Bool(b))) if b == decisive => return Ok(Val::Bool(decisive)),
                        Ok(Some(Val::Bool(_))) => {}
                        Ok(other) => {
                            let name = other.map(|v| v.type_name()).unwrap_or("nothing");
                            first_err.get_or_insert_with(|| format!("predicate must be bool, got {}", name));
                        }
                        Err(e) => {
                            first_err.get_or_insert(e);
                        }
                    }
                }
                Fold::ExistsOne => match res? {
                    Some(Val::Bool(true)) => trues += 1,
                    Some(Val::Bool(false)) => {}
                    other => return Err(format!("predicate must be bool, got {:?}", other.map(|v| v.type_name()))),
                },
                Fold::Filter => match res? {
                    Some(Val::Bool(true)) => out.push(item),
                    Some(Val::Bool(false)) => {}
                    other => return Err(format!("filter predicate must be bool, got {:?}", other.map(|v| v.type_name()))),
                },
                Fold::Map => {
                    if let Some(v) = res? {
                        out.push(v);
                    }
                }
            }
        }
        match kind {
            Fold::All | Fold::Exists => match first_err {
                Some(e) => Err(e),
                None => Ok(Val::Bool(kind == Fold::All)),
            },
            Fold::ExistsOne => Ok(Val::Bool(trues == 1)),
            Fold::Filter | Fold::Map => Ok(Val::list(out)),
        }
    }
}

fn opt_select(base: Option<&Val>, field: &str) -> Val {
    match base {
        Some(Val::Map(m)) => Val::Optional(m.get(&Key::Str(field.to_string())).cloned().map(Arc::new)),
        _ => Val::Optional(None),
    }
}

/// Missing keys and out-of-range positions give `optional.none()`.
fn opt_index(base: Option<&Val>, idx: &Val) -> Out {
    match base {
        None => Ok(Val::Optional(None)),
        Some(b @ (Val::List(_) | Val::Map(_))) => Ok(match index(b, idx) {
            Ok(v) => Val::some(v),
            Err(_) => Val::Optional(None),
        }),
        Some(other) => Err(format!("type '{}' does not support indexing", other.type_name())),
    }
}

fn select(base: &Val, field: &str) -> Out {
    match base {
        Val::Map(m) => m.get(&Key::Str(field.to_string())).cloned().ok_or_else(|| format!("no such key: {}", field)),
        other => Err(format!("type '{}' does not support field selection", other.type_name())),
    }
}

fn index(base: &Val, idx: &Val) -> Out {
    match base {
        Val::List(l) => {
            let i = match idx {
                Val::Int(i) => *i,
                Val::Uint(u) => i64::try_from(*u).map_err(|_| "index out of range".to_string())?,
                Val::Double(d) if d.fract() == 0.0 => *d as i64,
                other => return Err(format!("unsupported index type {}", other.type_name())),
            };
            usize::try_from(i)
                .ok()
                .and_then(|i| l.get(i))
                .cloned()
                .ok_or_else(|| format!("index out of bounds: {}", i))
        }
        Val::Map(m) => {
            let k = Key::from_val(idx)?;
            m.get(&k).cloned().ok_or_else(|| format!("no such key: {}", k))
        }
        other => Err(format!("type '{}' does not support indexing", other.type_name())),
    }
}

fn binary(op: BinOp, l: &Val, r: &Val) -> Out {
    use std::cmp::Ordering::*;
    let overload = || format!("no such overload: {} {:?} {}", l.type_name(), op, r.type_name());
    match op {
        BinOp::Eq => Ok(Val::Bool(l.equals(r))),
        BinOp::Ne => Ok(Val::Bool(!l.equals(r))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = l.compare(r).ok_or_else(overload)?;
            Ok(Val::Bool(match op {
                BinOp::Lt => ord == Less,
                BinOp::Le => ord != Greater,
                BinOp::Gt => ord == Greater,
                _ => ord != Less,
            }))
        }
        BinOp::In => match r {
            Val::List(items) => Ok(Val::Bool(items.iter().any(|v| v.equals(l)))),
            Val::Map(m) => Ok(Val::Bool(Key::from_val(l).map(|k| m.contains_key(&k)).unwrap_or(false))),
            _ => Err(overload()),
        },
        BinOp::Add => match (l, r) {
            (Val::Int(a), Val::Int(b)) => a.checked_add(*b).map(Val::Int).ok_or_else(|| "int overflow".into()),
            (Val::Uint(a), Val::Uint(b)) => a.checked_add(*b).map(Val::Uint).ok_or_else(|| "uint overflow".into()),
            (Val::Double(a), Val::Double(b)) => Ok(Val::Double(a + b)),
            (Val::Str(a), Val::Str(b)) => Ok(Val::str(&format!("{}{}", a, b))),
            (Val::Bytes(a), Val::Bytes(b)) => Ok(Val::bytes(&[a.as_ref(), b.as_ref()].concat())),
            (Val::List(a), Val::List(b)) => Ok(Val::list(a.iter().chain(b.iter()).cloned().collect())),
            (Val::Timestamp(t), Val::Duration(d)) | (Val::Duration(d), Val::Timestamp(t)) => temporal::add(t, d).map(Val::Timestamp),
            (Val::Duration(a), Val::Duration(b)) => duration_sum(a.checked_add(b)),
            _ => Err(overload()),
        },
        BinOp::Sub => match (l, r) {
            (Val::Int(a), Val::Int(b)) => a.checked_sub(*b).map(Val::Int).ok_or_else(|| "int overflow".into()),
            (Val::Uint(a), Val::Uint(b)) => a.checked_sub(*b).map(Val::Uint).ok_or_else(|| "uint overflow".into()),
            (Val::Double(a), Val::Double(b)) => Ok(Val::Double(a - b)),
            (Val::Timestamp(t), Val::Duration(d)) => temporal::sub(t, d).map(Val::Timestamp),
            (Val::Timestamp(a), Val::Timestamp(b)) => temporal::between(a, b).map(Val::Duration),
            (Val::Duration(a), Val::Duration(b)) => duration_sum(a.checked_sub(b)),
            _ => Err(overload()),
        },
        BinOp::Mul => match (l, r) {
            (Val::Int(a), Val::Int(b)) => a.checked_mul(*b).map(Val::Int).ok_or_else(|| "int overflow".into()),
            (Val::Uint(a), Val::Uint(b)) => a.checked_mul(*b).map(Val::Uint).ok_or_else(|| "uint overflow".into()),
            (Val::Double(a), Val::Double(b)) => Ok(Val::Double(a * b)),
            _ => Err(overload()),
        },
        BinOp::Div => match (l, r) {
            (Val::Int(_), Val::Int(0)) | (Val::Uint(_), Val::Uint(0)) => Err("division by zero".into()),
            (Val::Int(a), Val::Int(b)) => a.checked_div(*b).map(Val::Int).ok_or_else(|| "int overflow".into()),
            (Val::Uint(a), Val::Uint(b)) => Ok(Val::Uint(a / b)),
            (Val::Double(a), Val::Double(b)) => Ok(Val::Double(a / b)),
            _ => Err(overload()),
        },
        BinOp::Rem => match (l, r) {
            (Val::Int(_), Val::Int(0)) | (Val::Uint(_), Val::Uint(0)) => Err("modulus by zero".into()),
            (Val::Int(a), Val::Int(b)) => a.checked_rem(*b).map(Val::Int).ok_or_else(|| "int overflow".into()),
            (Val::Uint(a), Val::Uint(b)) => Ok(Val::Uint(a % b)),
            _ => Err(overload()),
        },
    }
}

fn duration_sum(d: Option<chrono::Duration>) -> Out {
    match d {
        Some(d) if d.num_nanoseconds().is_some() => Ok(Val::Duration(d)),
        _ => Err("duration overflow".into()),
    }
}
