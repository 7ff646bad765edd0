//! Structural invariants on state names and declaration sets.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Result, StoreError};

static STATE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("state name pattern"));

/// True if `name` is usable as a path segment.
pub fn is_valid_state_name(name: &str) -> bool {
    STATE_NAME.is_match(name)
}

pub fn check_state_name(name: &str) -> Result<()> {
    if is_valid_state_name(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// Check that no name is declared by two distinct definitions.
///
/// Each declaration is `(name, identity)`; repeating the same identity under
/// the same name is allowed (a definition reachable from several parents).
pub fn check_unique_names<'a, I>(declarations: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, usize)>,
{
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for (name, identity) in declarations {
        match seen.get(name) {
            Some(existing) if *existing != identity => {
                return Err(StoreError::DuplicateName(name.to_string()));
            }
            Some(_) => {}
            None => {
                seen.insert(name, identity);
            }
        }
    }
    Ok(())
}
