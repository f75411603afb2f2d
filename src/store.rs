//! Keyed persistence of enrolled fingerprints.
//!
//! Implementations must keep two outcomes apart: an unknown camera is
//! `Ok(None)`, while anything that goes wrong in the backing medium is
//! [`Error::StorageFailure`](crate::Error::StorageFailure).

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::Result;
use crate::fingerprint::CameraFingerprint;

/// A camera-id to fingerprint mapping.
pub trait FingerprintStore: Send + Sync {
    /// Insert or replace the record for `fingerprint.camera_id()`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageFailure`](crate::Error::StorageFailure) if the
    /// record could not be written.
    fn save(&self, fingerprint: &CameraFingerprint) -> Result<()>;

    /// Fetch the record for `camera_id`, or `None` if it was never saved.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageFailure`](crate::Error::StorageFailure) if the
    /// record exists but cannot be read.
    fn load(&self, camera_id: &str) -> Result<Option<CameraFingerprint>>;

    /// Remove the record for `camera_id`. Removing an unknown id succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageFailure`](crate::Error::StorageFailure) if an
    /// existing record could not be removed.
    fn delete(&self, camera_id: &str) -> Result<()>;

    /// All stored camera ids, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageFailure`](crate::Error::StorageFailure) if the
    /// keyspace cannot be enumerated.
    fn list_ids(&self) -> Result<Vec<String>>;
}

/// In-process store. Contents are lost when it is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, CameraFingerprint>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FingerprintStore for MemoryStore {
    fn save(&self, fingerprint: &CameraFingerprint) -> Result<()> {
        self.records
            .write()
            .insert(fingerprint.camera_id().to_string(), fingerprint.clone());
        Ok(())
    }

    fn load(&self, camera_id: &str) -> Result<Option<CameraFingerprint>> {
        Ok(self.records.read().get(camera_id).cloned())
    }

    fn delete(&self, camera_id: &str) -> Result<()> {
        self.records.write().remove(camera_id);
        Ok(())
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.records.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, value: f32) -> CameraFingerprint {
        CameraFingerprint::new(id, vec![value, -value], 2, 1, 5, 10.0).unwrap()
    }

    #[test]
    fn save_is_an_upsert() {
        let store = MemoryStore::new();
        store.save(&record("a", 0.1)).unwrap();
        store.save(&record("a", 0.3)).unwrap();
        let loaded = store.load("a").unwrap().unwrap();
        assert!((loaded.data()[0] - 0.3).abs() < f32::EPSILON);
        assert_eq!(store.list_ids().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn unknown_and_deleted_ids_load_as_none() {
        let store = MemoryStore::new();
        assert!(store.load("missing").unwrap().is_none());
        store.delete("missing").unwrap();

        store.save(&record("b", 0.2)).unwrap();
        store.delete("b").unwrap();
        assert!(store.load("b").unwrap().is_none());
        store.delete("b").unwrap();
    }

    #[test]
    fn list_ids_is_sorted() {
        let store = MemoryStore::new();
        for id in ["zeta", "alpha", "mid"] {
            store.save(&record(id, 0.1)).unwrap();
        }
        assert_eq!(store.list_ids().unwrap(), vec!["alpha", "mid", "zeta"]);
    }
}
