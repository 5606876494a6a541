use std::collections::BTreeMap;

use tokio::sync::Mutex;

use crate::error::RegistryError;
use crate::protocol::PeerRecord;
use crate::MAX_PEERS;

/// Names the connection that created an entry, so that connection's cleanup
/// cannot remove a newer entry registered under the same username.
pub type OwnerId = u64;

struct Entry {
    record: PeerRecord,
    owner: Option<OwnerId>,
}

/// Discoverable peers known to the rendezvous server, keyed by username.
///
/// Every operation takes the lock for its own duration only and never does
/// I/O while holding it; callers get owned copies, never references.
pub struct PeerRegistry {
    peers: Mutex<BTreeMap<String, Entry>>,
    capacity: usize,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PEERS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            peers: Mutex::new(BTreeMap::new()),
            capacity,
        }
    }

    /// Inserts `record` unless its username is taken or the registry is
    /// full. On success returns every *other* entry for the immediate reply.
    pub async fn register(&self, record: PeerRecord) -> Result<Vec<PeerRecord>, RegistryError> {
        self.insert(record, None).await
    }

    /// Like [`register`](Self::register), but remembers `owner` for
    /// [`remove_owned`](Self::remove_owned).
    pub async fn register_owned(
        &self,
        record: PeerRecord,
        owner: OwnerId,
    ) -> Result<Vec<PeerRecord>, RegistryError> {
        self.insert(record, Some(owner)).await
    }

    async fn insert(
        &self,
        record: PeerRecord,
        owner: Option<OwnerId>,
    ) -> Result<Vec<PeerRecord>, RegistryError> {
        let mut peers = self.peers.lock().await;
        if peers.contains_key(&record.username) {
            return Err(RegistryError::UsernameTaken(record.username));
        }
        if peers.len() >= self.capacity {
            return Err(RegistryError::Full {
                capacity: self.capacity,
            });
        }
        let username = record.username.clone();
        peers.insert(username.clone(), Entry { record, owner });
        Ok(peers
            .values()
            .map(|entry| &entry.record)
            .filter(|peer| peer.username != username)
            .cloned()
            .collect())
    }

    /// Removing an absent username is a no-op. Returns whether an entry was removed.
    pub async fn remove(&self, username: &str) -> bool {
        self.peers.lock().await.remove(username).is_some()
    }

    /// Removes `username` only if `owner` registered the current entry.
    pub async fn remove_owned(&self, username: &str, owner: OwnerId) -> bool {
        let mut peers = self.peers.lock().await;
        let owned = peers
            .get(username)
            .is_some_and(|entry| entry.owner == Some(owner));
        if owned {
            peers.remove(username);
        }
        owned
    }

    /// Point-in-time copy of the registry, minus `exclude` if given.
    pub async fn snapshot(&self, exclude: Option<&str>) -> Vec<PeerRecord> {
        let peers = self.peers.lock().await;
        peers
            .values()
            .map(|entry| &entry.record)
            .filter(|peer| Some(peer.username.as_str()) != exclude)
            .cloned()
            .collect()
    }

    pub async fn exists(&self, username: &str) -> bool {
        self.peers.lock().await.contains_key(username)
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn record(name: &str, port: u16) -> PeerRecord {
        PeerRecord::new(name, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port)
    }

    #[tokio::test]
    async fn test_register_returns_others() {
        let registry = PeerRegistry::new();
        assert!(registry.register(record("alice", 6001)).await.unwrap().is_empty());
        let others = registry.register(record("bob", 6002)).await.unwrap();
        assert_eq!(others, vec![record("alice", 6001)]);
        assert!(registry.exists("alice").await);
        assert!(registry.exists("bob").await);
    }

    #[tokio::test]
    async fn test_duplicate_username_leaves_registry_unchanged() {
        let registry = PeerRegistry::new();
        registry.register(record("alice", 6001)).await.unwrap();
        let err = registry.register(record("alice", 7000)).await.unwrap_err();
        assert_eq!(err, RegistryError::UsernameTaken("alice".to_string()));
        assert_eq!(registry.snapshot(None).await, vec![record("alice", 6001)]);
    }

    #[tokio::test]
    async fn test_snapshot_excludes_requester() {
        let registry = PeerRegistry::new();
        for (name, port) in [("alice", 1), ("bob", 2), ("carol", 3)] {
            registry.register(record(name, port)).await.unwrap();
        }
        let snapshot = registry.snapshot(Some("bob")).await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|peer| peer.username != "bob"));
        assert_eq!(registry.snapshot(Some("nobody")).await.len(), 3);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = PeerRegistry::new();
        registry.register(record("alice", 6001)).await.unwrap();
        registry.register(record("bob", 6002)).await.unwrap();

        assert!(registry.remove("alice").await);
        let once = registry.snapshot(None).await;
        assert!(!registry.remove("alice").await);
        assert_eq!(registry.snapshot(None).await, once);
        assert!(!registry.remove("never-registered").await);
    }

    #[tokio::test]
    async fn test_remove_owned_spares_newer_entry() {
        let registry = PeerRegistry::new();
        registry.register_owned(record("alice", 6001), 1).await.unwrap();
        assert!(registry.remove("alice").await);
        registry.register_owned(record("alice", 7001), 2).await.unwrap();

        assert!(!registry.remove_owned("alice", 1).await);
        assert_eq!(registry.snapshot(None).await, vec![record("alice", 7001)]);
        assert!(registry.remove_owned("alice", 2).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let registry = PeerRegistry::with_capacity(2);
        registry.register(record("a", 1)).await.unwrap();
        registry.register(record("b", 2)).await.unwrap();
        assert_eq!(
            registry.register(record("c", 3)).await.unwrap_err(),
            RegistryError::Full { capacity: 2 }
        );
        assert_eq!(registry.len().await, 2);
        registry.remove("a").await;
        assert!(registry.register(record("c", 3)).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_registration_keeps_usernames_unique() {
        let registry = Arc::new(PeerRegistry::new());
        let mut handles = Vec::new();
        for i in 0..32u16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let name = format!("user{}", i % 4);
                registry.register(record(&name, 6000 + i)).await.is_ok()
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 4);
        assert_eq!(registry.len().await, 4);
    }
}
