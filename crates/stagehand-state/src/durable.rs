//! RedbPersister — durable [`Persister`] backed by redb.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::persister::{Persister, child_names, descendant_prefix, normalize};
use crate::tables::NODES;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe persister storing every node in a single redb table.
#[derive(Clone)]
pub struct RedbPersister {
    db: Arc<Database>,
}

impl RedbPersister {
    /// Open (or create) a persistent database at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let persister = Self { db: Arc::new(db) };
        persister.ensure_tables()?;
        debug!(?path, "persister opened");
        Ok(persister)
    }

    /// Create an ephemeral in-memory database.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let persister = Self { db: Arc::new(db) };
        persister.ensure_tables()?;
        debug!("in-memory persister opened");
        Ok(persister)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Every key at or below `path`.
    fn keys_under(&self, path: &str) -> StateResult<Vec<String>> {
        let prefix = descendant_prefix(path);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if key == path || key.starts_with(prefix.as_str()) {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }
}

impl Persister for RedbPersister {
    fn get(&self, path: &str) -> StateResult<Option<Vec<u8>>> {
        let path = normalize(path)?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let value = table
            .get(path.as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn set(&self, path: &str, value: &[u8]) -> StateResult<()> {
        let path = normalize(path)?;
        if path.is_empty() {
            return Err(StateError::InvalidPath("cannot write the root".into()));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table
                .insert(path.as_str(), value)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn delete(&self, path: &str) -> StateResult<()> {
        let path = normalize(path)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            existed = table
                .remove(path.as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if existed {
            Ok(())
        } else {
            Err(StateError::NotFound(path))
        }
    }

    fn children(&self, path: &str) -> StateResult<Vec<String>> {
        let path = normalize(path)?;
        let keys = self.keys_under(&path)?;
        Ok(child_names(&path, keys.iter().map(String::as_str)))
    }

    fn delete_all(&self, path: &str) -> StateResult<usize> {
        let path = normalize(path)?;
        let keys = self.keys_under(&path)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%path, count = keys.len(), "subtree deleted");
        Ok(keys.len())
    }
}
