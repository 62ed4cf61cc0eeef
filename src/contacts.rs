use crate::{backend::BackendClient, error::Result};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tracing::info;

/// Cached view of the remote contact directory. Sessions snapshot the
/// resolved name at creation time; the cache is refreshed explicitly, never
/// mid-call.
pub struct ContactDirectory {
    backend: Arc<BackendClient>,
    entries: RwLock<HashMap<String, String>>,
}

impl ContactDirectory {
    pub fn new(backend: Arc<BackendClient>) -> Self {
        Self {
            backend,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the cache with the backend's current directory.
    pub async fn refresh(&self) -> Result<usize> {
        let contacts = self.backend.fetch_contacts().await?;
        let count = contacts.len();
        *self.entries.write().unwrap() = contacts;
        info!(count, "contact directory refreshed");
        Ok(count)
    }

    /// Seed the cache without a backend round trip.
    pub fn prime(&self, contacts: HashMap<String, String>) {
        *self.entries.write().unwrap() = contacts;
    }

    pub fn name_for(&self, number: &str) -> Option<String> {
        self.entries.read().unwrap().get(number).cloned()
    }

    pub async fn save(&self, number: &str, name: &str) -> Result<()> {
        self.backend.save_contact(number, name).await?;
        self.entries
            .write()
            .unwrap()
            .insert(number.to_string(), name.to_string());
        Ok(())
    }

    pub async fn remove(&self, number: &str) -> Result<()> {
        self.backend.delete_contact(number).await?;
        self.entries.write().unwrap().remove(number);
        Ok(())
    }
}
