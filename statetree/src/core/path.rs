//! Helpers for dot-separated node paths and copy-on-write access by path.
//!
//! A path such as `"a.b.c"` is a key chain into the root map. Writes rebuild
//! only the maps along that chain; every sibling subtree keeps its identity.

use crate::core::value::{StateMap, StateValue};

pub const SEPARATOR: char = '.';

/// Append `name` to `parent`, or return `name` for a root-level node.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        return name.to_string();
    }
    format!("{}{}{}", parent, SEPARATOR, name)
}

pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|segment| !segment.is_empty())
}

/// True if `path` equals `ancestor` or is a strict dot-descendant of it.
///
/// `"a.bc"` is not within `"a.b"`.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor.is_empty() {
        return true;
    }
    match path.strip_prefix(ancestor) {
        Some("") => true,
        Some(rest) => rest.starts_with(SEPARATOR),
        None => false,
    }
}

/// Last segment of `path`.
pub fn leaf_name(path: &str) -> &str {
    path.rsplit(SEPARATOR).next().unwrap_or(path)
}

/// Replace the `from` prefix of `path` with `to`, if `path` is within `from`.
pub fn rebase(path: &str, from: &str, to: &str) -> Option<String> {
    if !is_within(path, from) {
        return None;
    }
    let rest = &path[from.len()..];
    Some(format!("{}{}", to, rest))
}

/// Read the value at `path`; the empty path addresses the root.
pub fn get_value<'a>(root: &'a StateValue, path: &str) -> Option<&'a StateValue> {
    segments(path).try_fold(root, |node, segment| node.get(segment))
}

/// Return a new root with `value` stored at `path`.
///
/// Missing or non-map intermediates are replaced by maps.
pub fn set_value(root: &StateValue, path: &str, value: StateValue) -> StateValue {
    let parts: Vec<&str> = segments(path).collect();
    set_inner(root, &parts, value)
}

fn set_inner(node: &StateValue, parts: &[&str], value: StateValue) -> StateValue {
    let Some((head, rest)) = parts.split_first() else {
        return value;
    };
    let child = node.get(head).cloned().unwrap_or_default();
    node.with_entry(head, set_inner(&child, rest, value))
}

/// Return a new root without the key at `path`.
///
/// A missing path leaves the root untouched (same identity).
pub fn clear_value(root: &StateValue, path: &str) -> StateValue {
    let parts: Vec<&str> = segments(path).collect();
    clear_inner(root, &parts).unwrap_or_else(|| root.clone())
}

fn clear_inner(node: &StateValue, parts: &[&str]) -> Option<StateValue> {
    let map = node.as_map()?;
    let (head, rest) = parts.split_first()?;
    let mut next: StateMap = map.clone();
    if rest.is_empty() {
        next.remove(*head)?;
    } else {
        let cleared = clear_inner(map.get(*head)?, rest)?;
        next.insert(head.to_string(), cleared);
    }
    Some(StateValue::from_map(next))
}
