use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value as Json;

use crate::quantity::Quantity;
use crate::temporal;
use crate::urls::UrlValue;

/// Map keys. Integer keys of either signedness compare by value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Key {
    Bool(bool),
    Int(i128),
    Str(String),
}

impl Key {
    pub fn from_val(v: &Val) -> Result<Key, String> {
        match v {
            Val::Bool(b) => Ok(Key::Bool(*b)),
            Val::Int(i) => Ok(Key::Int(*i as i128)),
            Val::Uint(u) => Ok(Key::Int(*u as i128)),
            Val::Str(s) => Ok(Key::Str(s.to_string())),
            Val::Double(d) if d.fract() == 0.0 && d.is_finite() => Ok(Key::Int(*d as i128)),
            other => Err(format!("unsupported map key type {}", other.type_name())),
        }
    }

    pub fn to_val(&self) -> Val {
        match self {
            Key::Bool(b) => Val::Bool(*b),
            Key::Int(i) => match i64::try_from(*i) {
                Ok(v) => Val::Int(v),
                Err(_) => Val::Uint(*i as u64),
            },
            Key::Str(s) => Val::str(s),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Bool(b) => write!(f, "{}", b),
            Key::Int(i) => write!(f, "{}", i),
            Key::Str(s) => write!(f, "{:?}", s),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Val {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    List(Arc<Vec<Val>>),
    Map(Arc<BTreeMap<Key, Val>>),
    Timestamp(DateTime<Utc>),
    Duration(Duration),
    /// `optional.none()` is `Optional(None)`.
    Optional(Option<Arc<Val>>),
    Url(Arc<UrlValue>),
    Quantity(Quantity),
}

impl Val {
    pub fn str(s: &str) -> Val {
        Val::Str(Arc::from(s))
    }

    pub fn list(v: Vec<Val>) -> Val {
        Val::List(Arc::new(v))
    }

    pub fn bytes(b: &[u8]) -> Val {
        Val::Bytes(Arc::from(b))
    }

    pub fn some(v: Val) -> Val {
        Val::Optional(Some(Arc::new(v)))
    }

    /// Units charged against the cost budget for producing this value.
    pub fn heft(&self) -> u64 {
        let n = match self {
            Val::Str(s) => s.len(),
            Val::Bytes(b) => b.len(),
            Val::List(l) => l.len(),
            Val::Map(m) => m.len(),
            _ => 1,
        };
        n as u64
    }

    /// The type's default value, as `optional.ofNonZeroValue` sees it.
    pub fn is_zero(&self) -> bool {
        match self {
            Val::Null => true,
            Val::Bool(b) => !b,
            Val::Int(i) => *i == 0,
            Val::Uint(u) => *u == 0,
            Val::Double(d) => *d == 0.0,
            Val::Str(s) => s.is_empty(),
            Val::Bytes(b) => b.is_empty(),
            Val::List(l) => l.is_empty(),
            Val::Map(m) => m.is_empty(),
            Val::Timestamp(t) => t.timestamp() == 0 && t.timestamp_subsec_nanos() == 0,
            Val::Duration(d) => *d == Duration::zero(),
            Val::Optional(o) => o.is_none(),
            Val::Url(_) | Val::Quantity(_) => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Val::Null => "null_type",
            Val::Bool(_) => "bool",
            Val::Int(_) => "int",
            Val::Uint(_) => "uint",
            Val::Double(_) => "double",
            Val::Str(_) => "string",
            Val::Bytes(_) => "bytes",
            Val::List(_) => "list",
            Val::Map(_) => "map",
            Val::Timestamp(_) => "google.protobuf.Timestamp",
            Val::Duration(_) => "google.protobuf.Duration",
            Val::Optional(_) => "optional_type",
            Val::Url(_) => "URL",
            Val::Quantity(_) => "Quantity",
        }
    }

    pub fn from_json(v: &Json) -> Val {
        match v {
            Json::Null => Val::Null,
            Json::Bool(b) => Val::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Val::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Val::Uint(u)
                } else {
                    Val::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Val::str(s),
            Json::Array(a) => Val::list(a.iter().map(Val::from_json).collect()),
            Json::Object(m) => Val::Map(Arc::new(m.iter().map(|(k, v)| (Key::Str(k.clone()), Val::from_json(v))).collect())),
        }
    }

    fn numeric(&self) -> Option<Num> {
        match self {
            Val::Int(i) => Some(Num::I(*i as i128)),
            Val::Uint(u) => Some(Num::I(*u as i128)),
            Val::Double(d) => Some(Num::F(*d)),
            _ => None,
        }
    }

    /// CEL equality: numbers across types by value, aggregates element-wise,
    /// mismatched types are simply unequal.
    pub fn equals(&self, other: &Val) -> bool {
        if let (Some(a), Some(b)) = (self.numeric(), other.numeric()) {
            return a.cmp(b) == Some(Ordering::Equal);
        }
        match (self, other) {
            (Val::Null, Val::Null) => true,
            (Val::Bool(a), Val::Bool(b)) => a == b,
            (Val::Str(a), Val::Str(b)) => a == b,
            (Val::Bytes(a), Val::Bytes(b)) => a == b,
            (Val::Timestamp(a), Val::Timestamp(b)) => a == b,
            (Val::Duration(a), Val::Duration(b)) => a == b,
            (Val::Optional(a), Val::Optional(b)) => match (a, b) {
                (Some(x), Some(y)) => x.equals(y),
                (None, None) => true,
                _ => false,
            },
            (Val::List(a), Val::List(b)) => a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y)),
            (Val::Map(a), Val::Map(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).map(|w| v.equals(w)).unwrap_or(false))
            }
            (Val::Url(a), Val::Url(b)) => a.raw == b.raw,
            (Val::Quantity(a), Val::Quantity(b)) => a == b,
            _ => false,
        }
    }

    /// Ordering for `<`-style operators; `None` when the operands do not compare.
    pub fn compare(&self, other: &Val) -> Option<Ordering> {
        if let (Some(a), Some(b)) = (self.numeric(), other.numeric()) {
            return a.cmp(b);
        }
        match (self, other) {
            (Val::Str(a), Val::Str(b)) => Some(a.cmp(b)),
            (Val::Bytes(a), Val::Bytes(b)) => Some(a.cmp(b)),
            (Val::Bool(a), Val::Bool(b)) => Some(a.cmp(b)),
            (Val::Timestamp(a), Val::Timestamp(b)) => Some(a.cmp(b)),
            (Val::Duration(a), Val::Duration(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn to_display_string(&self) -> String {
        match self {
            Val::Null => "null".into(),
            Val::Bool(b) => b.to_string(),
            Val::Int(i) => i.to_string(),
            Val::Uint(u) => u.to_string(),
            Val::Double(d) => d.to_string(),
            Val::Str(s) => s.to_string(),
            Val::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Val::Timestamp(t) => temporal::format_timestamp(t),
            Val::Duration(d) => temporal::format_duration(d),
            Val::Optional(Some(v)) => format!("optional.of({})", v.to_display_string()),
            Val::Optional(None) => "optional.none()".into(),
            Val::List(l) => format!("[{}]", l.iter().map(|v| v.to_display_string()).collect::<Vec<_>>().join(", ")),
            Val::Map(m) => format!(
                "{{{}}}",
                m.iter().map(|(k, v)| format!("{}: {}", k, v.to_display_string())).collect::<Vec<_>>().join(", ")
            ),
            Val::Url(u) => u.raw.clone(),
            Val::Quantity(q) => q.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    I(i128),
    F(f64),
}

impl Num {
    fn cmp(self, other: Num) -> Option<Ordering> {
        match (self, other) {
            (Num::I(a), Num::I(b)) => Some(a.cmp(&b)),
            (Num::F(a), Num::F(b)) => a.partial_cmp(&b),
            (Num::I(a), Num::F(b)) => (a as f64).partial_cmp(&b),
            (Num::F(a), Num::I(b)) => a.partial_cmp(&(b as f64)),
        }
    }
}
