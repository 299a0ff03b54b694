//! FrameworkStore — the framework id assigned at first registration.

use std::sync::Arc;

use tracing::info;

use crate::error::{StateError, StateResult};
use crate::persister::Persister;

const FRAMEWORK_ID: &str = "FrameworkID";

#[derive(Clone)]
pub struct FrameworkStore {
    persister: Arc<dyn Persister>,
}

impl FrameworkStore {
    pub fn new(persister: Arc<dyn Persister>) -> Self {
        Self { persister }
    }

    pub fn store_framework_id(&self, framework_id: &str) -> StateResult<()> {
        self.persister.set(FRAMEWORK_ID, framework_id.as_bytes())?;
        info!(%framework_id, "framework id stored");
        Ok(())
    }

    pub fn fetch_framework_id(&self) -> StateResult<Option<String>> {
        match self.persister.get(FRAMEWORK_ID)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StateError::Deserialize(e.to_string())),
            None => Ok(None),
        }
    }
}
