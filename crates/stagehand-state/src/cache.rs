//! Write-through cache in front of another persister.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::persister::{Persister, child_names, descendant_prefix, join, normalize};

/// Keeps a full copy of the backing persister in memory.
///
/// Reads are served from the copy. Writes go to the backing persister first
/// and only update the copy once they succeed, so a failed write leaves both
/// views unchanged.
pub struct PersisterCache {
    inner: Arc<dyn Persister>,
    nodes: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl PersisterCache {
    /// Load every node from `inner` into memory.
    pub fn new(inner: Arc<dyn Persister>) -> StateResult<Self> {
        let mut nodes = BTreeMap::new();
        load_subtree(inner.as_ref(), "", &mut nodes)?;
        debug!(count = nodes.len(), "persister cache loaded");
        Ok(Self {
            inner,
            nodes: RwLock::new(nodes),
        })
    }
}

fn load_subtree(
    persister: &dyn Persister,
    path: &str,
    out: &mut BTreeMap<String, Vec<u8>>,
) -> StateResult<()> {
    if !path.is_empty() {
        if let Some(value) = persister.get(path)? {
            out.insert(path.to_string(), value);
        }
    }
    for child in persister.children(path)? {
        load_subtree(persister, &join(path, &child), out)?;
    }
    Ok(())
}

impl Persister for PersisterCache {
    fn get(&self, path: &str) -> StateResult<Option<Vec<u8>>> {
        let path = normalize(path)?;
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        Ok(nodes.get(&path).cloned())
    }

    fn set(&self, path: &str, value: &[u8]) -> StateResult<()> {
        let path = normalize(path)?;
        self.inner.set(&path, value)?;
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.insert(path, value.to_vec());
        Ok(())
    }

    fn delete(&self, path: &str) -> StateResult<()> {
        let path = normalize(path)?;
        if !self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&path)
        {
            return Err(StateError::NotFound(path));
        }
        self.inner.delete(&path)?;
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.remove(&path);
        Ok(())
    }

    fn children(&self, path: &str) -> StateResult<Vec<String>> {
        let path = normalize(path)?;
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        Ok(child_names(&path, nodes.keys().map(String::as_str)))
    }

    fn delete_all(&self, path: &str) -> StateResult<usize> {
        let path = normalize(path)?;
        let removed = self.inner.delete_all(&path)?;
        let prefix = descendant_prefix(&path);
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.retain(|k, _| *k != path && !k.starts_with(prefix.as_str()));
        Ok(removed)
    }
}
