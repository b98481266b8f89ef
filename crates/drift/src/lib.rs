//! Tether drift: decides whether a live object differs from what applying the
//! desired manifest would produce, and renders a human-readable diff.

#![forbid(unsafe_code)]

use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;
use serde_json::{Map, Number, Value as Json};
use tracing::debug;

/// Documents nested deeper than this are not diffed.
pub const MAX_DIFF_DEPTH: usize = 512;

/// True when the live object has drifted from the dry-run result.
///
/// A dry-run without `metadata.resourceVersion` means the object would be created.
/// Labels and annotations compare as maps with a missing map equal to an empty one;
/// the rest compares with `metadata` and `status` removed.
pub fn has_drifted(observed: &Json, dry_run: &Json) -> bool {
    let rv = dry_run
        .pointer("/metadata/resourceVersion")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if rv.is_empty() {
        return true;
    }
    for field in ["labels", "annotations"] {
        if !meta_map_eq(observed, dry_run, field) {
            debug!(field, "metadata map drifted");
            return true;
        }
    }
    !semantic_eq(&strip_for_compare(observed), &strip_for_compare(dry_run))
}

fn meta_map_eq(a: &Json, b: &Json, field: &str) -> bool {
    let empty = Json::Object(Map::new());
    let pick = |v: &Json| -> Json {
        match v.get("metadata").and_then(|m| m.get(field)) {
            None | Some(Json::Null) => empty.clone(),
            Some(x) => x.clone(),
        }
    };
    semantic_eq(&pick(a), &pick(b))
}

/// Copy without `metadata` and `status`.
pub fn strip_for_compare(v: &Json) -> Json {
    let mut v = v.clone();
    if let Some(obj) = v.as_object_mut() {
        obj.remove("metadata");
        obj.remove("status");
    }
    v
}

/// Deep equality: maps ignore key order, arrays keep it, numbers compare by value.
pub fn semantic_eq(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => number_eq(x, y),
        (Json::Array(xs), Json::Array(ys)) => xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| semantic_eq(x, y)),
        (Json::Object(xo), Json::Object(yo)) => {
            xo.len() == yo.len() && xo.iter().all(|(k, xv)| yo.get(k).map(|yv| semantic_eq(xv, yv)).unwrap_or(false))
        }
        _ => a == b,
    }
}

fn number_eq(x: &Number, y: &Number) -> bool {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a == b;
    }
    match (x.as_f64(), y.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

fn depth(v: &Json, limit: usize) -> usize {
    // explicit stack; stops as soon as `limit` is exceeded
    let mut max = 0usize;
    let mut stack = vec![(v, 1usize)];
    while let Some((cur, d)) = stack.pop() {
        max = max.max(d);
        if max > limit {
            return max;
        }
        match cur {
            Json::Object(m) => stack.extend(m.values().map(|c| (c, d + 1))),
            Json::Array(a) => stack.extend(a.iter().map(|c| (c, d + 1))),
            _ => {}
        }
    }
    max
}

fn render(v: &Json) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| "<unprintable>".to_string())
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() { key.to_string() } else { format!("{}.{}", path, key) }
}

fn walk(path: &str, from: &Json, to: &Json, out: &mut Vec<String>) {
    match (from, to) {
        (Json::Object(fo), Json::Object(to_)) => {
            for (k, fv) in fo.iter() {
                match to_.get(k) {
                    Some(tv) if semantic_eq(fv, tv) => {}
                    Some(tv) => walk(&join(path, k), fv, tv, out),
                    None => out.push(format!("- {}: {}", join(path, k), render(fv))),
                }
            }
            for (k, tv) in to_.iter() {
                if !fo.contains_key(k) {
                    out.push(format!("+ {}: {}", join(path, k), render(tv)));
                }
            }
        }
        (Json::Array(fa), Json::Array(ta)) => {
            let common = fa.len().min(ta.len());
            for i in 0..common {
                if !semantic_eq(&fa[i], &ta[i]) {
                    walk(&format!("{}[{}]", path, i), &fa[i], &ta[i], out);
                }
            }
            for (i, v) in fa.iter().enumerate().skip(common) {
                out.push(format!("- {}[{}]: {}", path, i, render(v)));
            }
            for (i, v) in ta.iter().enumerate().skip(common) {
                out.push(format!("+ {}[{}]: {}", path, i, render(v)));
            }
        }
        (a, b) => {
            if !semantic_eq(a, b) {
                let at = if path.is_empty() { "<root>" } else { path };
                out.push(format!("~ {}: {} -> {}", at, render(a), render(b)));
            }
        }
    }
}

/// Changed paths from `observed` to `desired`, one per line, ignoring `status` and
/// managed fields. Never panics; anything undiffable yields an empty string.
pub fn safe_diff(observed: &Json, desired: &Json) -> String {
    if depth(observed, MAX_DIFF_DEPTH) > MAX_DIFF_DEPTH || depth(desired, MAX_DIFF_DEPTH) > MAX_DIFF_DEPTH {
        debug!("diff skipped: document nesting over limit");
        return String::new();
    }
    let res = panic::catch_unwind(AssertUnwindSafe(|| {
        let from = strip_noisy(observed.clone());
        let to = strip_noisy(desired.clone());
        let mut lines = Vec::new();
        walk("", &from, &to, &mut lines);
        lines.join("\n")
    }));
    match res {
        Ok(s) => s,
        Err(_) => {
            debug!("diff rendering panicked; returning empty diff");
            String::new()
        }
    }
}

/// [`safe_diff`] over anything serializable; values that do not convert yield "".
pub fn safe_diff_serialize<A: Serialize + ?Sized, B: Serialize + ?Sized>(observed: &A, desired: &B) -> String {
    match (serde_json::to_value(observed), serde_json::to_value(desired)) {
        (Ok(a), Ok(b)) => safe_diff(&a, &b),
        _ => {
            debug!("diff skipped: value does not convert into a document");
            String::new()
        }
    }
}
