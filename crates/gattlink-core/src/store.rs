//! Persisted "last attached peripheral" record

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;

/// Settings key the attachment record lives under
pub const LAST_ATTACHED_PERIPHERAL_KEY: &str = "gattlink.last_attached_peripheral";

// ----------------------------------------------------------------------------
// Settings Store
// ----------------------------------------------------------------------------

/// Small key/value settings backend
pub trait SettingsStore: Send {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn save(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

/// In-memory settings, lost when dropped
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.values.get(key).cloned())
    }

    fn save(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }
}

/// Settings kept in a JSON file mapping each key to a hex string
///
/// The whole file is rewritten on every change.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<String, String>, StoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = fs::read_to_string(&self.path)?;
        serde_json::from_str(&contents).map_err(|e| StoreError::Decode(e.to_string()))
    }

    fn write_all(&self, values: &HashMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents =
            serde_json::to_string_pretty(values).map_err(|e| StoreError::Encode(e.to_string()))?;
        fs::write(&self.path, contents)?;
        Ok(())
    }
}

impl SettingsStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.read_all()?.get(key) {
            Some(encoded) => hex::decode(encoded)
                .map(Some)
                .map_err(|e| StoreError::Decode(e.to_string())),
            None => Ok(None),
        }
    }

    fn save(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut values = self.read_all()?;
        values.insert(key.to_string(), hex::encode(value));
        self.write_all(&values)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        let mut values = self.read_all()?;
        if values.remove(key).is_some() {
            self.write_all(&values)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Attachment Record
// ----------------------------------------------------------------------------

/// Identity of the last successfully attached peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    /// Platform identifier understood by the session driver
    pub peripheral_id: String,
    /// Service UUID the peripheral was attached under
    pub service: Uuid,
}

impl AttachmentRecord {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serialize(self).map_err(|e| StoreError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Decode(e.to_string()))
    }
}

/// Typed access to the attachment record in a [`SettingsStore`]
pub struct AttachmentStore {
    store: Box<dyn SettingsStore>,
    key: String,
}

impl AttachmentStore {
    pub fn new(store: Box<dyn SettingsStore>) -> Self {
        Self::with_key(store, LAST_ATTACHED_PERIPHERAL_KEY)
    }

    pub fn with_key(store: Box<dyn SettingsStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn load(&self) -> Result<Option<AttachmentRecord>, StoreError> {
        self.store
            .load(&self.key)?
            .map(|bytes| AttachmentRecord::decode(&bytes))
            .transpose()
    }

    pub fn save(&mut self, record: &AttachmentRecord) -> Result<(), StoreError> {
        debug!(peripheral = %record.peripheral_id, service = %record.service, "persisting attachment");
        self.store.save(&self.key, &record.encode()?)
    }

    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.store.remove(&self.key)
    }
}

impl std::fmt::Debug for AttachmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentStore")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
