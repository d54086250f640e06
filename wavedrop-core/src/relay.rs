//! Relay store: offer and answer tokens parked under an opaque id until the peer fetches them.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use tracing::debug;
use uuid::Uuid;

/// One stored token with its creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRecord {
    pub token: String,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("no record for id {0}")]
    NotFound(String),
    #[error("answer already stored for id {0}")]
    Duplicate(String),
}

/// Key-value capability the signaling flow uses.
pub trait RelayStore {
    /// Store an offer, returning a fresh id.
    fn put_offer(&mut self, token: String) -> String;
    fn get_offer(&self, id: &str) -> Result<RelayRecord, RelayError>;
    fn put_answer(&mut self, id: &str, token: String) -> Result<(), RelayError>;
    fn get_answer(&self, id: &str) -> Result<RelayRecord, RelayError>;
}

/// In-memory store with time-based expiry.
#[derive(Debug, Default)]
pub struct MemoryRelayStore {
    offers: HashMap<String, RelayRecord>,
    answers: HashMap<String, RelayRecord>,
}

impl MemoryRelayStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.offers.len() + self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop records created more than `ttl` before `now`. Returns how many were removed.
    pub fn purge_older_than(&mut self, ttl: Duration, now: SystemTime) -> usize {
        let before = self.len();
        let fresh = |r: &RelayRecord| {
            now.duration_since(r.created_at)
                .map(|age| age <= ttl)
                .unwrap_or(true)
        };
        self.offers.retain(|_, r| fresh(r));
        self.answers.retain(|_, r| fresh(r));
        let removed = before - self.len();
        if removed > 0 {
            debug!(removed, "purged expired relay records");
        }
        removed
    }

    fn record(token: String) -> RelayRecord {
        RelayRecord {
            token,
            created_at: SystemTime::now(),
        }
    }
}

impl RelayStore for MemoryRelayStore {
    fn put_offer(&mut self, token: String) -> String {
        let id = Uuid::new_v4().to_string();
        self.offers.insert(id.clone(), Self::record(token));
        id
    }

    fn get_offer(&self, id: &str) -> Result<RelayRecord, RelayError> {
        self.offers
            .get(id)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(id.to_string()))
    }

    fn put_answer(&mut self, id: &str, token: String) -> Result<(), RelayError> {
        if self.answers.contains_key(id) {
            return Err(RelayError::Duplicate(id.to_string()));
        }
        self.answers.insert(id.to_string(), Self::record(token));
        Ok(())
    }

    fn get_answer(&self, id: &str) -> Result<RelayRecord, RelayError> {
        self.answers
            .get(id)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_roundtrip() {
        let mut store = MemoryRelayStore::new();
        let id = store.put_offer("tok-offer".into());
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(store.get_offer(&id).unwrap().token, "tok-offer");
    }

    #[test]
    fn ids_are_unique() {
        let mut store = MemoryRelayStore::new();
        let a = store.put_offer("a".into());
        let b = store.put_offer("b".into());
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn unknown_id_not_found() {
        let store = MemoryRelayStore::new();
        assert_eq!(
            store.get_offer("nope"),
            Err(RelayError::NotFound("nope".into()))
        );
        assert!(matches!(
            store.get_answer("nope"),
            Err(RelayError::NotFound(_))
        ));
    }

    #[test]
    fn answer_stored_once() {
        let mut store = MemoryRelayStore::new();
        let id = store.put_offer("o".into());
        store.put_answer(&id, "a1".into()).unwrap();
        assert_eq!(
            store.put_answer(&id, "a2".into()),
            Err(RelayError::Duplicate(id.clone()))
        );
        assert_eq!(store.get_answer(&id).unwrap().token, "a1");
    }

    #[test]
    fn purge_drops_expired_only() {
        let mut store = MemoryRelayStore::new();
        let old = store.put_offer("old".into());
        let now = SystemTime::now() + Duration::from_secs(120);
        let fresh = store.put_offer("fresh".into());
        store.offers.get_mut(&fresh).unwrap().created_at = now;
        let removed = store.purge_older_than(Duration::from_secs(60), now);
        assert_eq!(removed, 1);
        assert!(store.get_offer(&old).is_err());
        assert!(store.get_offer(&fresh).is_ok());
    }
}
