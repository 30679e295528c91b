use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{strip_location, FileManager, StorageError};

const SCHEME: &str = "memory://";

/// Process-local object store, used for local runs and tests.
#[derive(Clone, Default)]
pub struct MemoryFileManager {
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryFileManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Location string for `key`, as [`FileManager::upload`] would return it.
    pub fn location(key: &str) -> String {
        format!("{}objects/{}", SCHEME, key)
    }

    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        // A panic while holding the lock cannot leave the map half-written.
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl FileManager for MemoryFileManager {
    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<String, StorageError> {
        self.objects().insert(key.to_string(), data);
        Ok(Self::location(key))
    }

    async fn download(&self, location: &str) -> Result<Vec<u8>, StorageError> {
        let key = self.object_key(location);
        self.objects()
            .get(&key)
            .cloned()
            .ok_or(StorageError::NotFound(key))
    }

    fn object_key(&self, location: &str) -> String {
        strip_location(location, SCHEME)
    }
}
