//! Hierarchical key/value persistence.
//!
//! Paths are `/`-separated (`Tasks/POD-A-0-A/info`). A node can hold a value
//! and have children at the same time; parents exist implicitly as long as
//! one of their descendants does.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};

use crate::error::{StateError, StateResult};

/// Storage backend for all scheduler state.
///
/// Implementations must be safe to share between the scheduler and any
/// background tasks.
pub trait Persister: Send + Sync {
    /// Read the value stored at `path`, if any.
    fn get(&self, path: &str) -> StateResult<Option<Vec<u8>>>;

    /// Write `value` at `path`, creating or replacing it.
    fn set(&self, path: &str, value: &[u8]) -> StateResult<()>;

    /// Remove the value at `path`. Descendants are left in place.
    fn delete(&self, path: &str) -> StateResult<()>;

    /// Names of the direct children of `path`, sorted.
    fn children(&self, path: &str) -> StateResult<Vec<String>>;

    /// Remove `path` and every descendant. Returns the number of values removed.
    fn delete_all(&self, path: &str) -> StateResult<usize>;
}

/// Normalize a path: strip surrounding slashes and reject empty segments.
pub fn normalize(path: &str) -> StateResult<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.split('/').any(str::is_empty) && !trimmed.is_empty() {
        return Err(StateError::InvalidPath(path.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Join path segments with `/`.
pub fn join(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}/{child}")
    }
}

/// Prefix every descendant key of `path` starts with.
pub(crate) fn descendant_prefix(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!("{path}/")
    }
}

/// Collect the distinct first segments of `keys` below `path`.
pub(crate) fn child_names<'a>(path: &str, keys: impl Iterator<Item = &'a str>) -> Vec<String> {
    let prefix = descendant_prefix(path);
    let names: BTreeSet<String> = keys
        .filter_map(|k| k.strip_prefix(prefix.as_str()))
        .filter_map(|rest| rest.split('/').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    names.into_iter().collect()
}

/// Non-durable persister backed by an ordered map.
#[derive(Debug, Default)]
pub struct MemPersister {
    nodes: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemPersister {
    fn get(&self, path: &str) -> StateResult<Option<Vec<u8>>> {
        let path = normalize(path)?;
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        Ok(nodes.get(&path).cloned())
    }

    fn set(&self, path: &str, value: &[u8]) -> StateResult<()> {
        let path = normalize(path)?;
        if path.is_empty() {
            return Err(StateError::InvalidPath("cannot write the root".into()));
        }
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.insert(path, value.to_vec());
        Ok(())
    }

    fn delete(&self, path: &str) -> StateResult<()> {
        let path = normalize(path)?;
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        match nodes.remove(&path) {
            Some(_) => Ok(()),
            None => Err(StateError::NotFound(path)),
        }
    }

    fn children(&self, path: &str) -> StateResult<Vec<String>> {
        let path = normalize(path)?;
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        let prefix = descendant_prefix(&path);
        let keys = nodes
            .range(prefix.clone()..)
            .map(|(k, _)| k.as_str())
            .take_while(|k| k.starts_with(prefix.as_str()));
        Ok(child_names(&path, keys))
    }

    fn delete_all(&self, path: &str) -> StateResult<usize> {
        let path = normalize(path)?;
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let prefix = descendant_prefix(&path);
        let doomed: Vec<String> = nodes
            .keys()
            .filter(|k| **k == path || k.starts_with(prefix.as_str()))
            .cloned()
            .collect();
        for key in &doomed {
            nodes.remove(key);
        }
        Ok(doomed.len())
    }
}
