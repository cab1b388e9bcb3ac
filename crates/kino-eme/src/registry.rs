//! Per-source key session registry
//!
//! Deduplicates sessions by init data fingerprint. Registration never
//! crosses an await point, so two signals carrying the same init data
//! cannot both pass the duplicate check.

use crate::cdm::MediaKeySession;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Record identifier, unique within a registry
pub type RecordId = u64;

struct SessionRecord {
    id: RecordId,
    /// Init data the session was created for; `None` for the legacy single session
    fingerprint: Option<Vec<u8>>,
    handle: Option<Arc<dyn MediaKeySession>>,
}

#[derive(Default)]
struct Records {
    next_id: RecordId,
    records: Vec<SessionRecord>,
}

impl Records {
    fn push(&mut self, fingerprint: Option<Vec<u8>>) -> RecordId {
        self.next_id += 1;
        let id = self.next_id;
        self.records.push(SessionRecord {
            id,
            fingerprint,
            handle: None,
        });
        id
    }
}

/// Session records of one source
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Records>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register init data; `None` if a record with equal bytes exists
    pub fn register(&self, fingerprint: &[u8]) -> Option<RecordId> {
        let mut records = self.lock();

        let duplicate = records
            .records
            .iter()
            .filter_map(|r| r.fingerprint.as_deref())
            .any(|existing| existing.len() == fingerprint.len() && existing == fingerprint);
        if duplicate {
            debug!(bytes = fingerprint.len(), "Duplicate init data, session already exists");
            return None;
        }

        Some(records.push(Some(fingerprint.to_vec())))
    }

    /// Register the single session of a single-session dialect
    pub fn register_single(&self) -> Option<RecordId> {
        let mut records = self.lock();
        if records.records.iter().any(|r| r.fingerprint.is_none()) {
            debug!("Single key session already exists");
            return None;
        }
        Some(records.push(None))
    }

    /// Attach the native session once it has been created
    pub fn attach(&self, id: RecordId, handle: Arc<dyn MediaKeySession>) -> bool {
        match self.lock().records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.handle = Some(handle);
                true
            }
            None => false,
        }
    }

    /// Remove the record for `fingerprint` so the same init data can register again
    pub fn remove(&self, fingerprint: &[u8]) -> bool {
        let mut records = self.lock();
        let before = records.records.len();
        records
            .records
            .retain(|r| r.fingerprint.as_deref() != Some(fingerprint));
        records.records.len() != before
    }

    pub fn remove_record(&self, id: RecordId) -> bool {
        let mut records = self.lock();
        let before = records.records.len();
        records.records.retain(|r| r.id != id);
        records.records.len() != before
    }

    /// Take every native session handle, clearing the registry
    pub fn drain_handles(&self) -> Vec<Arc<dyn MediaKeySession>> {
        self.lock()
            .records
            .drain(..)
            .filter_map(|r| r.handle)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_bytes_different_views() {
        let registry = SessionRegistry::new();
        let buffer = vec![0u8, 1, 2, 3, 4, 5, 6, 7];
        let copy = buffer[2..6].to_vec();

        assert!(registry.register(&buffer[2..6]).is_some());
        assert!(registry.register(&copy).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_prefix_is_not_a_duplicate() {
        let registry = SessionRegistry::new();
        assert!(registry.register(&[1, 2, 3]).is_some());
        assert!(registry.register(&[1, 2]).is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_allows_reregistration() {
        let registry = SessionRegistry::new();
        registry.register(b"init").unwrap();

        assert!(registry.remove(b"init"));
        assert!(!registry.remove(b"init"));
        assert!(registry.register(b"init").is_some());
    }

    #[test]
    fn test_single_session_ignores_fingerprints() {
        let registry = SessionRegistry::new();
        let id = registry.register_single().unwrap();

        assert!(registry.register_single().is_none());
        assert!(registry.register(b"other").is_some());
        assert!(registry.remove_record(id));
        assert!(registry.register_single().is_some());
    }
}
