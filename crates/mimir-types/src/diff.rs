use crate::value::ConfigValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

/// One structural difference between two documents.
///
/// `path` uses `a.b[2].c` notation; the empty path is the document root.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FieldChange {
    pub path: String,
    pub kind: ChangeKind,
    pub old: Option<ConfigValue>,
    pub new: Option<ConfigValue>,
}

/// Structural comparison of `from` against `to`.
///
/// Maps are compared key by key, arrays position by position. Any other
/// mismatch (including a change of shape, e.g. map → string) is reported as a
/// single `Modified` at that path. Output is ordered by path traversal, which
/// is deterministic because map keys are sorted.
pub fn diff(from: &ConfigValue, to: &ConfigValue) -> Vec<FieldChange> {
    let mut out = Vec::new();
    diff_at(String::new(), from, to, &mut out);
    out
}

fn diff_at(path: String, from: &ConfigValue, to: &ConfigValue, out: &mut Vec<FieldChange>) {
    match (from, to) {
        (ConfigValue::Map(a), ConfigValue::Map(b)) => {
            for (k, old) in a {
                let child = map_path(&path, k);
                match b.get(k) {
                    Some(new) => diff_at(child, old, new, out),
                    None => out.push(removed(child, old)),
                }
            }
            for (k, new) in b {
                if !a.contains_key(k) {
                    out.push(added(map_path(&path, k), new));
                }
            }
        }
        (ConfigValue::Array(a), ConfigValue::Array(b)) => {
            for i in 0..a.len().max(b.len()) {
                let child = format!("{path}[{i}]");
                match (a.get(i), b.get(i)) {
                    (Some(old), Some(new)) => diff_at(child, old, new, out),
                    (Some(old), None) => out.push(removed(child, old)),
                    (None, Some(new)) => out.push(added(child, new)),
                    (None, None) => {}
                }
            }
        }
        _ if from != to => out.push(FieldChange {
            path,
            kind: ChangeKind::Modified,
            old: Some(from.clone()),
            new: Some(to.clone()),
        }),
        _ => {}
    }
}

fn map_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn added(path: String, v: &ConfigValue) -> FieldChange {
    FieldChange { path, kind: ChangeKind::Added, old: None, new: Some(v.clone()) }
}

fn removed(path: String, v: &ConfigValue) -> FieldChange {
    FieldChange { path, kind: ChangeKind::Removed, old: Some(v.clone()), new: None }
}
