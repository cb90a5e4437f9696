//! Orders flags so that every flag comes after the flags it depends on.
use std::{collections::HashMap, sync::Arc};

use crate::{evaluation::Flag, Error, Result};

/// Sort `flag_keys` (or every flag, in key order, when empty) dependencies first.
///
/// Each flag is emitted at most once. Keys and dependencies that are not in `flags` are skipped.
///
/// # Errors
///
/// [`Error::DependencyCycle`] if flag dependencies form a cycle, including a flag depending on
/// itself.
pub fn topological_sort<S: AsRef<str>>(
    flags: &HashMap<String, Arc<Flag>>,
    flag_keys: &[S],
) -> Result<Vec<Arc<Flag>>> {
    let mut available: HashMap<&str, &Arc<Flag>> =
        flags.iter().map(|(k, v)| (k.as_str(), v)).collect();

    let starting_keys: Vec<&str> = if flag_keys.is_empty() {
        let mut keys: Vec<&str> = flags.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    } else {
        flag_keys.iter().map(AsRef::as_ref).collect()
    };

    let mut result = Vec::with_capacity(starting_keys.len());
    let mut path = Vec::new();
    for flag_key in starting_keys {
        parent_traversal(flag_key, &mut available, &mut path, &mut result)?;
    }
    Ok(result)
}

fn parent_traversal<'a>(
    flag_key: &str,
    available: &mut HashMap<&'a str, &'a Arc<Flag>>,
    path: &mut Vec<String>,
    result: &mut Vec<Arc<Flag>>,
) -> Result<()> {
    let Some(&flag) = available.get(flag_key) else {
        return Ok(());
    };
    if !flag.dependencies.is_empty() {
        path.push(flag_key.to_owned());
        for parent_key in &flag.dependencies {
            if path.contains(parent_key) {
                return Err(Error::DependencyCycle(path.clone()));
            }
            parent_traversal(parent_key, available, path, result)?;
        }
        path.pop();
    }
    available.remove(flag_key);
    result.push(Arc::clone(flag));
    Ok(())
}
