use std::{
    collections::HashMap,
    sync::Mutex,
};

use anyhow::{
    Result,
    bail,
};
use sha2::{
    Digest,
    Sha256,
};

use super::{
    ContentId,
    ObjectStore,
};

/// Keeps everything in memory.  Ids are the same SHA-256 roots that [`super::LocalStore`] hands
/// out, so a given fragment gets the same id from either.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<ContentId, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        Self::default()
    }

    /// number of distinct objects stored
    pub fn len(&self) -> usize {
        self.objects.lock().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        self.objects.lock().map(|objects| objects.contains_key(id)).unwrap_or(false)
    }
}

impl ObjectStore for MemoryStore {
    async fn put(&self, data: &[u8]) -> Result<ContentId> {
        let id = ContentId::root(&Sha256::digest(data).into());
        let Ok(mut objects) = self.objects.lock() else {
            bail!("Memory store lock poisoned");
        };
        objects.entry(id.clone()).or_insert_with(|| data.to_vec());
        Ok(id)
    }

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>> {
        let Ok(objects) = self.objects.lock() else {
            bail!("Memory store lock poisoned");
        };
        match objects.get(id) {
            Some(data) => Ok(data.clone()),
            None => bail!("No object {}", id),
        }
    }
}
