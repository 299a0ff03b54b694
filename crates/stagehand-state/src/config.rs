//! ConfigStore — versioned service configurations and the current target.
//!
//! ```text
//! ConfigTarget             uuid of the target configuration
//! Configurations/<uuid>    encoded configuration
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{StateError, StateResult};
use crate::persister::{Persister, join};

const TARGET: &str = "ConfigTarget";
const CONFIGURATIONS: &str = "Configurations";

/// Converts configurations to and from their stored bytes.
pub trait ConfigCodec<T>: Send + Sync {
    fn encode(&self, config: &T) -> StateResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> StateResult<T>;
}

/// JSON codec for any serde type.
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Serialize + DeserializeOwned> ConfigCodec<T> for JsonCodec<T> {
    fn encode(&self, config: &T) -> StateResult<Vec<u8>> {
        serde_json::to_vec(config).map_err(|e| StateError::Serialize(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> StateResult<T> {
        serde_json::from_slice(bytes).map_err(|e| StateError::Deserialize(e.to_string()))
    }
}

pub struct ConfigStore<T> {
    persister: Arc<dyn Persister>,
    codec: Arc<dyn ConfigCodec<T>>,
}

impl<T> Clone for ConfigStore<T> {
    fn clone(&self) -> Self {
        Self {
            persister: self.persister.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<T: Serialize + DeserializeOwned + 'static> ConfigStore<T> {
    /// Store configurations as JSON.
    pub fn json(persister: Arc<dyn Persister>) -> Self {
        Self::with_codec(persister, Arc::new(JsonCodec::default()))
    }
}

impl<T> ConfigStore<T> {
    pub fn with_codec(persister: Arc<dyn Persister>, codec: Arc<dyn ConfigCodec<T>>) -> Self {
        Self { persister, codec }
    }

    /// Store a new configuration under a fresh id.
    pub fn store(&self, config: &T) -> StateResult<Uuid> {
        let id = Uuid::new_v4();
        let bytes = self.codec.encode(config)?;
        self.persister.set(&join(CONFIGURATIONS, &id.to_string()), &bytes)?;
        debug!(%id, "configuration stored");
        Ok(id)
    }

    pub fn fetch(&self, id: Uuid) -> StateResult<T> {
        let bytes = self
            .persister
            .get(&join(CONFIGURATIONS, &id.to_string()))?
            .ok_or_else(|| StateError::NotFound(format!("configuration {id}")))?;
        self.codec.decode(&bytes)
    }

    /// Ids of every stored configuration.
    pub fn list(&self) -> StateResult<Vec<Uuid>> {
        let mut ids = Vec::new();
        for child in self.persister.children(CONFIGURATIONS)? {
            match Uuid::parse_str(&child) {
                Ok(id) => ids.push(id),
                Err(e) => warn!(%child, error = %e, "ignoring malformed configuration key"),
            }
        }
        Ok(ids)
    }

    pub fn clear(&self, id: Uuid) -> StateResult<()> {
        self.persister
            .delete_all(&join(CONFIGURATIONS, &id.to_string()))?;
        info!(%id, "configuration cleared");
        Ok(())
    }

    pub fn set_target_id(&self, id: Uuid) -> StateResult<()> {
        self.persister.set(TARGET, id.to_string().as_bytes())?;
        info!(%id, "target configuration set");
        Ok(())
    }

    pub fn fetch_target_id(&self) -> StateResult<Option<Uuid>> {
        match self.persister.get(TARGET)? {
            Some(bytes) => {
                let text =
                    String::from_utf8(bytes).map_err(|e| StateError::Deserialize(e.to_string()))?;
                Uuid::parse_str(&text)
                    .map(Some)
                    .map_err(|e| StateError::Deserialize(e.to_string()))
            }
            None => Ok(None),
        }
    }
}
