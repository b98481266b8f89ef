//! Built-in functions: conversions, string extensions, list helpers, sets,
//! encoders, optionals, timestamps, regex, URL and quantity helpers.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use regex::Regex;

use crate::quantity::Quantity;
use crate::temporal;
use crate::urls::UrlValue;
use crate::value::{Key, Val};

struct Sig {
    name: &'static str,
    member: bool,
    min: usize,
    max: usize,
}

const fn g(name: &'static str, min: usize, max: usize) -> Sig {
    Sig { name, member: false, min, max }
}

const fn m(name: &'static str, min: usize, max: usize) -> Sig {
    Sig { name, member: true, min, max }
}

const SIGS: &[Sig] = &[
    g("size", 1, 1),
    g("int", 1, 1),
    g("uint", 1, 1),
    g("double", 1, 1),
    g("string", 1, 1),
    g("bool", 1, 1),
    g("dyn", 1, 1),
    g("matches", 2, 2),
    g("isURL", 1, 1),
    g("url", 1, 1),
    g("isQuantity", 1, 1),
    g("quantity", 1, 1),
    g("sets.contains", 2, 2),
    g("sets.intersects", 2, 2),
    g("sets.equivalent", 2, 2),
    g("timestamp", 1, 1),
    g("duration", 1, 1),
    g("bytes", 1, 1),
    g("base64.encode", 1, 1),
    g("base64.decode", 1, 1),
    g("optional.of", 1, 1),
    g("optional.ofNonZeroValue", 1, 1),
    g("optional.none", 0, 0),
    m("hasValue", 0, 0),
    m("value", 0, 0),
    m("orValue", 1, 1),
    m("or", 1, 1),
    m("getFullYear", 0, 1),
    m("getMonth", 0, 1),
    m("getDayOfMonth", 0, 1),
    m("getDate", 0, 1),
    m("getDayOfWeek", 0, 1),
    m("getDayOfYear", 0, 1),
    m("getHours", 0, 1),
    m("getMinutes", 0, 1),
    m("getSeconds", 0, 1),
    m("getMilliseconds", 0, 1),
    m("size", 0, 0),
    m("startsWith", 1, 1),
    m("endsWith", 1, 1),
    m("contains", 1, 1),
    m("matches", 1, 1),
    m("find", 1, 1),
    m("findAll", 1, 2),
    m("lowerAscii", 0, 0),
    m("upperAscii", 0, 0),
    m("trim", 0, 0),
    m("split", 1, 2),
    m("replace", 2, 3),
    m("indexOf", 1, 2),
    m("lastIndexOf", 1, 2),
    m("substring", 1, 2),
    m("charAt", 1, 1),
    m("join", 0, 1),
    m("isSorted", 0, 0),
    m("sum", 0, 0),
    m("min", 0, 0),
    m("max", 0, 0),
    m("getScheme", 0, 0),
    m("getHost", 0, 0),
    m("getHostname", 0, 0),
    m("getPort", 0, 0),
    m("getEscapedPath", 0, 0),
    m("getQuery", 0, 0),
    m("add", 1, 1),
    m("sub", 1, 1),
    m("isLessThan", 1, 1),
    m("isGreaterThan", 1, 1),
    m("compareTo", 1, 1),
    m("sign", 0, 0),
    m("isInteger", 0, 0),
    m("asInteger", 0, 0),
    m("asApproximateFloat", 0, 0),
];

pub fn is_known(func: &str, member: bool, argc: usize) -> bool {
    SIGS.iter().any(|s| s.name == func && s.member == member && (s.min..=s.max).contains(&argc))
}

pub fn takes_regex(func: &str) -> bool {
    matches!(func, "matches" | "find" | "findAll")
}

type Out = Result<Val, String>;

fn no_overload(func: &str, args: &[&Val]) -> String {
    let types: Vec<&str> = args.iter().map(|v| v.type_name()).collect();
    format!("no such overload: {}({})", func, types.join(", "))
}

fn regex<'a>(cache: &'a HashMap<String, Regex>, owned: &'a mut Option<Regex>, pattern: &str) -> Result<&'a Regex, String> {
    if let Some(re) = cache.get(pattern) {
        return Ok(re);
    }
    let re = Regex::new(pattern).map_err(|e| format!("invalid regex {:?}: {}", pattern, e))?;
    Ok(owned.insert(re))
}

fn as_int(v: &Val) -> Option<i64> {
    match v {
        Val::Int(i) => Some(*i),
        Val::Uint(u) => i64::try_from(*u).ok(),
        _ => None,
    }
}

fn chars_of(s: &str) -> Vec<char> {
    s.chars().collect()
}

fn char_index(hay: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(from);
    }
    (from..=hay.len().saturating_sub(needle.len())).find(|&i| i + needle.len() <= hay.len() && hay[i..i + needle.len()] == *needle)
}

fn char_last_index(hay: &[char], needle: &[char], upto: usize) -> Option<usize> {
    if needle.len() > hay.len() {
        return None;
    }
    let last_start = upto.min(hay.len() - needle.len());
    (0..=last_start).rev().find(|&i| hay[i..i + needle.len()] == *needle)
}

fn quantity_arg(func: &str, v: &Val) -> Result<Quantity, String> {
    match v {
        Val::Quantity(q) => Ok(*q),
        Val::Int(i) => Ok(Quantity::from_int(*i)),
        other => Err(no_overload(func, &[other])),
    }
}

pub fn call(func: &str, target: Option<Val>, args: Vec<Val>, regexes: &HashMap<String, Regex>) -> Out {
    match target {
        None => call_global(func, &args, regexes),
        Some(t) => call_member(func, &t, &args, regexes),
    }
}

/// Cost to charge before calling `func`, for calls whose result can be much larger
/// than their inputs. Zero when the result size is charged afterwards.
pub fn output_hint(func: &str, target: Option<&Val>, args: &[Val]) -> u64 {
    match (func, target) {
        ("replace", Some(Val::Str(s))) => match (args.first(), args.get(1)) {
            (Some(Val::Str(from)), Some(Val::Str(to))) => {
                let hits = if from.is_empty() { s.chars().count() + 1 } else { s.matches(&**from).count() };
                (s.len() + hits.saturating_mul(to.len())) as u64
            }
            _ => 0,
        },
        ("join", Some(Val::List(l))) => {
            let sep = match args.first() {
                Some(Val::Str(sep)) => sep.len(),
                _ => 0,
            };
            let parts: usize = l.iter().map(|v| if let Val::Str(s) = v { s.len() } else { 0 }).sum();
            (parts + sep.saturating_mul(l.len())) as u64
        }
        _ => 0,
    }
}

fn call_global(func: &str, args: &[Val], regexes: &HashMap<String, Regex>) -> Out {
    if func == "optional.none" {
        return Ok(Val::Optional(None));
    }
    let a = args.first().ok_or_else(|| format!("{}: missing argument", func))?;
    match func {
        "size" => size(a),
        "dyn" => Ok(a.clone()),
        "int" => match a {
            Val::Int(_) => Ok(a.clone()),
            Val::Uint(u) => i64::try_from(*u).map(Val::Int).map_err(|_| "int overflow".to_string()),
            Val::Double(d) => {
                if d.is_finite() && *d > -9.223_372_036_854_776e18 && *d < 9.223_372_036_854_776e18 {
                    Ok(Val::Int(d.trunc() as i64))
                } else {
                    Err("int overflow".to_string())
                }
            }
            Val::Str(s) => s.parse::<i64>().map(Val::Int).map_err(|_| format!("cannot convert {:?} to int", s)),
            Val::Timestamp(t) => Ok(Val::Int(t.timestamp())),
            other => Err(no_overload(func, &[other])),
        },
        "uint" => match a {
            Val::Uint(_) => Ok(a.clone()),
            Val::Int(i) => u64::try_from(*i).map(Val::Uint).map_err(|_| "uint overflow".to_string()),
            Val::Double(d) => {
                if d.is_finite() && *d >= 0.0 && *d < 1.844_674_407_370_955_2e19 {
                    Ok(Val::Uint(d.trunc() as u64))
                } else {
                    Err("uint overflow".to_string())
                }
            }
            Val::Str(s) => s.parse::<u64>().map(Val::Uint).map_err(|_| format!("cannot convert {:?} to uint", s)),
            other => Err(no_overload(func, &[other])),
        },
        "double" => match a {
            Val::Double(_) => Ok(a.clone()),
            Val::Int(i) => Ok(Val::Double(*i as f64)),
            Val::Uint(u) => Ok(Val::Double(*u as f64)),
            Val::Str(s) => s.parse::<f64>().map(Val::Double).map_err(|_| format!("cannot convert {:?} to double", s)),
            other => Err(no_overload(func, &[other])),
        },
        "string" => match a {
            Val::Str(_) => Ok(a.clone()),
            Val::Int(_) | Val::Uint(_) | Val::Double(_) | Val::Bool(_) | Val::Timestamp(_) | Val::Duration(_) => {
                Ok(Val::str(&a.to_display_string()))
            }
            Val::Bytes(b) => std::str::from_utf8(b).map(Val::str).map_err(|_| "invalid UTF-8 in bytes".to_string()),
            other => Err(no_overload(func, &[other])),
        },
        "bytes" => match a {
            Val::Bytes(_) => Ok(a.clone()),
            Val::Str(s) => Ok(Val::bytes(s.as_bytes())),
            other => Err(no_overload(func, &[other])),
        },
        "timestamp" => match a {
            Val::Timestamp(_) => Ok(a.clone()),
            Val::Str(s) => temporal::parse_timestamp(s).map(Val::Timestamp),
            Val::Int(i) => temporal::timestamp_from_unix(*i).map(Val::Timestamp),
            other => Err(no_overload(func, &[other])),
        },
        "duration" => match a {
            Val::Duration(_) => Ok(a.clone()),
            Val::Str(s) => temporal::parse_duration(s).map(Val::Duration),
            other => Err(no_overload(func, &[other])),
        },
        "base64.encode" => match a {
            Val::Bytes(b) => Ok(Val::str(&STANDARD.encode(b))),
            other => Err(no_overload(func, &[other])),
        },
        "base64.decode" => match a {
            Val::Str(s) => STANDARD
                .decode(s.as_bytes())
                .or_else(|_| STANDARD_NO_PAD.decode(s.as_bytes()))
                .map(|b| Val::bytes(&b))
                .map_err(|e| format!("invalid base64: {}", e)),
            other => Err(no_overload(func, &[other])),
        },
        "optional.of" => Ok(Val::some(a.clone())),
        "optional.ofNonZeroValue" => Ok(if a.is_zero() { Val::Optional(None) } else { Val::some(a.clone()) }),
        "bool" => match a {
            Val::Bool(_) => Ok(a.clone()),
            Val::Str(s) => match s.as_ref() {
                "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(Val::Bool(true)),
                "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(Val::Bool(false)),
                _ => Err(format!("cannot convert {:?} to bool", s)),
            },
            other => Err(no_overload(func, &[other])),
        },
        "matches" => match (a, args.get(1)) {
            (Val::Str(s), Some(Val::Str(p))) => {
                let mut owned = None;
                Ok(Val::Bool(regex(regexes, &mut owned, p)?.is_match(s)))
            }
            (x, y) => Err(no_overload(func, &[x, y.unwrap_or(&Val::Null)])),
        },
        "isURL" => match a {
            Val::Str(s) => Ok(Val::Bool(UrlValue::parse(s).is_ok())),
            other => Err(no_overload(func, &[other])),
        },
        "url" => match a {
            Val::Str(s) => Ok(Val::Url(Arc::new(UrlValue::parse(s)?))),
            other => Err(no_overload(func, &[other])),
        },
        "isQuantity" => match a {
            Val::Str(s) => Ok(Val::Bool(Quantity::parse(s).is_ok())),
            other => Err(no_overload(func, &[other])),
        },
        "quantity" => match a {
            Val::Str(s) => Ok(Val::Quantity(Quantity::parse(s)?)),
            other => Err(no_overload(func, &[other])),
        },
        "sets.contains" | "sets.intersects" | "sets.equivalent" => {
            let (Val::List(x), Some(Val::List(y))) = (a, args.get(1)) else {
                return Err(no_overload(func, &[a, args.get(1).unwrap_or(&Val::Null)]));
            };
            let contains_all = |big: &[Val], small: &[Val]| small.iter().all(|s| big.iter().any(|b| b.equals(s)));
            Ok(Val::Bool(match func {
                "sets.contains" => contains_all(x, y),
                "sets.intersects" => y.iter().any(|s| x.iter().any(|b| b.equals(s))),
                _ => contains_all(x, y) && contains_all(y, x),
            }))
        }
        other => Err(format!("unknown function {}", other)),
    }
}

fn size(v: &Val) -> Out {
    let n = match v {
        Val::Str(s) => s.chars().count(),
        Val::Bytes(b) => b.len(),
        Val::List(l) => l.len(),
        Val::Map(m) => m.len(),
        other => return Err(no_overload("size", &[other])),
    };
    Ok(Val::Int(n as i64))
}

fn call_member(func: &str, t: &Val, args: &[Val], regexes: &HashMap<String, Regex>) -> Out {
    match t {
        Val::Str(s) => string_member(func, s, args, regexes),
        Val::List(l) => list_member(func, t, l, args),
        Val::Map(_) | Val::Bytes(_) if func == "size" => size(t),
        Val::Optional(o) => optional_member(func, o.as_deref(), args),
        Val::Timestamp(ts) => {
            let tz = match args.first() {
                Some(Val::Str(z)) => Some(z.as_ref()),
                Some(other) => return Err(no_overload(func, &[t, other])),
                None => None,
            };
            temporal::timestamp_part(func, ts, tz).map(Val::Int)
        }
        Val::Duration(d) if args.is_empty() => temporal::duration_part(func, d).map(Val::Int),
        Val::Url(u) => url_member(func, u, args),
        Val::Quantity(q) => quantity_member(func, q, args),
        other => {
            let mut all = vec![other];
            all.extend(args.iter());
            Err(no_overload(func, &all))
        }
    }
}

fn optional_member(func: &str, o: Option<&Val>, args: &[Val]) -> Out {
    match (func, o) {
        ("hasValue", _) => Ok(Val::Bool(o.is_some())),
        ("value", Some(v)) => Ok(v.clone()),
        ("value", None) => Err("optional.none() dereference".into()),
        ("orValue", Some(v)) => Ok(v.clone()),
        ("orValue", None) => args.first().cloned().ok_or_else(|| "orValue: missing argument".into()),
        ("or", Some(v)) => Ok(Val::some(v.clone())),
        ("or", None) => match args.first() {
            Some(alt @ Val::Optional(_)) => Ok(alt.clone()),
            Some(other) => Err(no_overload("or", &[&Val::Optional(None), other])),
            None => Err("or: missing argument".into()),
        },
        (other, _) => Err(format!("no such overload: optional.{}", other)),
    }
}

fn str_arg<'a>(func: &str, args: &'a [Val], i: usize) -> Result<&'a str, String> {
    match args.get(i) {
        Some(Val::Str(s)) => Ok(s),
        Some(other) => Err(no_overload(func, &[other])),
        None => Err(format!("{}: missing argument {}", func, i + 1)),
    }
}

fn int_arg(func: &str, args: &[Val], i: usize) -> Result<i64, String> {
    match args.get(i) {
        Some(v) => as_int(v).ok_or_else(|| no_overload(func, &[v])),
        None => Err(format!("{}: missing argument {}", func, i + 1)),
    }
}

fn string_member(func: &str, s: &str, args: &[Val], regexes: &HashMap<String, Regex>) -> Out {
    match func {
        "size" => Ok(Val::Int(s.chars().count() as i64)),
        "startsWith" => Ok(Val::Bool(s.starts_with(str_arg(func, args, 0)?))),
        "endsWith" => Ok(Val::Bool(s.ends_with(str_arg(func, args, 0)?))),
        "contains" => Ok(Val::Bool(s.contains(str_arg(func, args, 0)?))),
        "matches" => {
            let mut owned = None;
            Ok(Val::Bool(regex(regexes, &mut owned, str_arg(func, args, 0)?)?.is_match(s)))
        }
        "find" => {
            let mut owned = None;
            let re = regex(regexes, &mut owned, str_arg(func, args, 0)?)?;
            Ok(Val::str(re.find(s).map(|m| m.as_str()).unwrap_or("")))
        }
        "findAll" => {
            let mut owned = None;
            let re = regex(regexes, &mut owned, str_arg(func, args, 0)?)?;
            let limit = if args.len() > 1 { int_arg(func, args, 1)? } else { -1 };
            if limit == 0 {
                return Ok(Val::list(Vec::new()));
            }
            let it = re.find_iter(s).map(|m| Val::str(m.as_str()));
            Ok(Val::list(if limit < 0 { it.collect() } else { it.take(limit as usize).collect() }))
        }
        "lowerAscii" => Ok(Val::str(&s.to_ascii_lowercase())),
        "upperAscii" => Ok(Val::str(&s.to_ascii_uppercase())),
        "trim" => Ok(Val::str(s.trim())),
        "split" => {
            let sep = str_arg(func, args, 0)?;
            let limit = if args.len() > 1 { int_arg(func, args, 1)? } else { -1 };
            let parts: Vec<Val> = match limit {
                0 => Vec::new(),
                n if n < 0 => s.split(sep).map(Val::str).collect(),
                n => s.splitn(n as usize, sep).map(Val::str).collect(),
            };
            Ok(Val::list(parts))
        }
        "replace" => {
            let from = str_arg(func, args, 0)?;
            let to = str_arg(func, args, 1)?;
            let limit = if args.len() > 2 { int_arg(func, args, 2)? } else { -1 };
            Ok(Val::str(&if limit < 0 { s.replace(from, to) } else { s.replacen(from, to, limit as usize) }))
        }
        "indexOf" | "lastIndexOf" => {
            let hay = chars_of(s);
            let needle = chars_of(str_arg(func, args, 0)?);
            let last = func == "lastIndexOf";
            let offset = if args.len() > 1 {
                let o = int_arg(func, args, 1)?;
                if o < 0 || o as usize > hay.len() {
                    return Err(format!("index out of range: {}", o));
                }
                o as usize
            } else if last {
                hay.len()
            } else {
                0
            };
            let found = if last { char_last_index(&hay, &needle, offset) } else { char_index(&hay, &needle, offset) };
            Ok(Val::Int(found.map(|i| i as i64).unwrap_or(-1)))
        }
        "substring" => {
            let hay = chars_of(s);
            let start = int_arg(func, args, 0)?;
            let end = if args.len() > 1 { int_arg(func, args, 1)? } else { hay.len() as i64 };
            if start < 0 || end < start || end as usize > hay.len() {
                return Err(format!("substring out of range: [{}, {})", start, end));
            }
            Ok(Val::str(&hay[start as usize..end as usize].iter().collect::<String>()))
        }
        "charAt" => {
            let hay = chars_of(s);
            let i = int_arg(func, args, 0)?;
            if i < 0 || i as usize > hay.len() {
                return Err(format!("index out of range: {}", i));
            }
            Ok(Val::str(&hay.get(i as usize).map(|c| c.to_string()).unwrap_or_default()))
        }
        other => Err(no_overload(other, &[&Val::str(s)])),
    }
}

fn list_member(func: &str, t: &Val, l: &[Val], args: &[Val]) -> Out {
    match func {
        "size" => size(t),
        "join" => {
            let sep = if args.is_empty() { "" } else { str_arg(func, args, 0)? };
            let parts = l
                .iter()
                .map(|v| match v {
                    Val::Str(s) => Ok(s.to_string()),
                    other => Err(no_overload("join", &[other])),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Val::str(&parts.join(sep)))
        }
        "indexOf" | "lastIndexOf" => {
            let needle = args.first().ok_or_else(|| format!("{}: missing argument", func))?;
            let pos = if func == "indexOf" {
                l.iter().position(|v| v.equals(needle))
            } else {
                l.iter().rposition(|v| v.equals(needle))
            };
            Ok(Val::Int(pos.map(|i| i as i64).unwrap_or(-1)))
        }
        "isSorted" => {
            for w in l.windows(2) {
                match w[0].compare(&w[1]) {
                    Some(std::cmp::Ordering::Greater) => return Ok(Val::Bool(false)),
                    Some(_) => {}
                    None => return Err(no_overload("isSorted", &[&w[0], &w[1]])),
                }
            }
            Ok(Val::Bool(true))
        }
        "sum" => {
            let mut int_acc: i64 = 0;
            let mut uint_acc: u64 = 0;
            let mut dbl_acc: f64 = 0.0;
            let mut kind = None;
            for v in l {
                let k = std::mem::discriminant(v);
                if kind.map(|x| x != k).unwrap_or(false) {
                    return Err("sum requires elements of a single numeric type".into());
                }
                kind = Some(k);
                match v {
                    Val::Int(i) => int_acc = int_acc.checked_add(*i).ok_or("int overflow")?,
                    Val::Uint(u) => uint_acc = uint_acc.checked_add(*u).ok_or("uint overflow")?,
                    Val::Double(d) => dbl_acc += d,
                    other => return Err(no_overload("sum", &[other])),
                }
            }
            Ok(match l.first() {
                Some(Val::Uint(_)) => Val::Uint(uint_acc),
                Some(Val::Double(_)) => Val::Double(dbl_acc),
                _ => Val::Int(int_acc),
            })
        }
        "min" | "max" => {
            let mut best = l.first().ok_or_else(|| format!("{} called on empty list", func))?;
            for v in &l[1..] {
                let ord = v.compare(best).ok_or_else(|| no_overload(func, &[v, best]))?;
                let better = if func == "min" { ord.is_lt() } else { ord.is_gt() };
                if better {
                    best = v;
                }
            }
            Ok(best.clone())
        }
        other => Err(no_overload(other, &[t])),
    }
}

fn url_member(func: &str, u: &UrlValue, _args: &[Val]) -> Out {
    Ok(match func {
        "getScheme" => Val::str(u.scheme()),
        "getHost" => Val::str(u.host()),
        "getHostname" => Val::str(u.hostname()),
        "getPort" => Val::str(u.port()),
        "getEscapedPath" => Val::str(u.escaped_path()),
        "getQuery" => Val::Map(Arc::new(
            u.query()
                .iter()
                .map(|(k, vs)| (Key::Str(k.clone()), Val::list(vs.iter().map(|s| Val::str(s)).collect())))
                .collect(),
        )),
        other => return Err(format!("no such overload: URL.{}", other)),
    })
}

fn quantity_member(func: &str, q: &Quantity, args: &[Val]) -> Out {
    let arg = || args.first().ok_or_else(|| format!("{}: missing argument", func));
    Ok(match func {
        "add" => Val::Quantity(q.add(&quantity_arg(func, arg()?)?)?),
        "sub" => Val::Quantity(q.sub(&quantity_arg(func, arg()?)?)?),
        "isLessThan" | "isGreaterThan" | "compareTo" => {
            let other = match arg()? {
                Val::Quantity(o) => *o,
                v => return Err(no_overload(func, &[v])),
            };
            match func {
                "isLessThan" => Val::Bool(*q < other),
                "isGreaterThan" => Val::Bool(*q > other),
                _ => Val::Int(q.cmp(&other) as i64),
            }
        }
        "sign" => Val::Int(q.sign()),
        "isInteger" => Val::Bool(q.is_integer()),
        "asInteger" => Val::Int(q.as_integer()?),
        "asApproximateFloat" => Val::Double(q.as_approximate_float()),
        other => return Err(format!("no such overload: Quantity.{}", other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(func: &str, t: Val, args: Vec<Val>) -> Out {
        call(func, Some(t), args, &HashMap::new())
    }

    #[test]
    fn string_extensions_use_code_points() {
        let s = Val::str("héllo wörld");
        assert!(member("indexOf", s.clone(), vec![Val::str("w")]).unwrap().equals(&Val::Int(6)));
        assert!(member("lastIndexOf", s.clone(), vec![Val::str("l")]).unwrap().equals(&Val::Int(9)));
        assert!(member("substring", s.clone(), vec![Val::Int(1), Val::Int(5)]).unwrap().equals(&Val::str("éllo")));
        assert!(member("charAt", s.clone(), vec![Val::Int(11)]).unwrap().equals(&Val::str("")));
        assert!(member("charAt", s, vec![Val::Int(12)]).is_err());
    }

    #[test]
    fn list_helpers() {
        let l = Val::list(vec![Val::Int(3), Val::Int(1), Val::Int(2)]);
        assert!(member("sum", l.clone(), vec![]).unwrap().equals(&Val::Int(6)));
        assert!(member("min", l.clone(), vec![]).unwrap().equals(&Val::Int(1)));
        assert!(member("isSorted", l.clone(), vec![]).unwrap().equals(&Val::Bool(false)));
        assert!(member("max", Val::list(vec![]), vec![]).is_err());
        assert!(member("indexOf", l, vec![Val::Double(2.0)]).unwrap().equals(&Val::Int(2)));
    }

    #[test]
    fn conversions() {
        let none = HashMap::new();
        assert!(call("int", None, vec![Val::Double(-2.7)], &none).unwrap().equals(&Val::Int(-2)));
        assert!(call("uint", None, vec![Val::Int(-1)], &none).is_err());
        assert!(call("string", None, vec![Val::Double(1.5)], &none).unwrap().equals(&Val::str("1.5")));
        assert!(call("bool", None, vec![Val::str("maybe")], &none).is_err());
        let ts = call("timestamp", None, vec![Val::Int(86_400)], &none).unwrap();
        assert!(call("string", None, vec![ts.clone()], &none).unwrap().equals(&Val::str("1970-01-02T00:00:00Z")));
        assert!(call("int", None, vec![ts], &none).unwrap().equals(&Val::Int(86_400)));
        assert!(call("string", None, vec![Val::bytes(&[0xff])], &none).is_err());
    }

    #[test]
    fn encoders_accept_padded_and_unpadded_input() {
        let none = HashMap::new();
        let enc = call("base64.encode", None, vec![Val::bytes(b"hello")], &none).unwrap();
        assert!(enc.equals(&Val::str("aGVsbG8=")));
        for text in ["aGVsbG8=", "aGVsbG8"] {
            assert!(call("base64.decode", None, vec![Val::str(text)], &none).unwrap().equals(&Val::bytes(b"hello")));
        }
        assert!(call("base64.decode", None, vec![Val::str("!!")], &none).is_err());
    }

    #[test]
    fn optional_members() {
        let none = Val::Optional(None);
        assert!(member("hasValue", none.clone(), vec![]).unwrap().equals(&Val::Bool(false)));
        assert!(member("value", none.clone(), vec![]).is_err());
        assert!(member("orValue", none.clone(), vec![Val::Int(7)]).unwrap().equals(&Val::Int(7)));
        let some = Val::some(Val::Int(1));
        assert!(member("or", none, vec![some.clone()]).unwrap().equals(&some));
        assert!(member("value", some, vec![]).unwrap().equals(&Val::Int(1)));
        let zero = call("optional.ofNonZeroValue", None, vec![Val::str("")], &HashMap::new()).unwrap();
        assert!(zero.equals(&Val::Optional(None)));
    }

    #[test]
    fn growth_is_estimated_before_the_call() {
        let s = Val::str("aaaa");
        assert_eq!(output_hint("replace", Some(&s), &[Val::str("a"), Val::str("xyz")]), 16);
        assert_eq!(output_hint("replace", Some(&s), &[Val::str(""), Val::str("-")]), 9);
        let l = Val::list(vec![Val::str("ab"), Val::str("c")]);
        assert_eq!(output_hint("join", Some(&l), &[Val::str("--")]), 7);
        assert_eq!(output_hint("size", Some(&l), &[]), 0);
    }
}
