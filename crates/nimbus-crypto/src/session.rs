//! Session key cache: session id → unwrapped user master key
//!
//! The only place a plaintext UMK lives beyond one request. Entries expire
//! after a TTL and are evicted explicitly on logout/lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::keys::UserMasterKey;

/// Whether a session can currently encrypt/decrypt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No master key cached
    Locked,
    /// Master key cached for this session
    Unlocked,
}

struct Entry {
    user_id: String,
    umk: Arc<UserMasterKey>,
    unlocked_at: Instant,
}

/// Thread-safe session → master key map with TTL-based expiry.
pub struct SessionKeyCache {
    entries: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
}

impl SessionKeyCache {
    pub fn new(ttl: Duration) -> Self {
        SessionKeyCache {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Cache `umk` for `session_id`, replacing any previous key in one assignment.
    pub fn insert(&self, session_id: &str, user_id: &str, umk: UserMasterKey) -> Arc<UserMasterKey> {
        let umk = Arc::new(umk);
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        map.insert(
            session_id.to_string(),
            Entry {
                user_id: user_id.to_string(),
                umk: umk.clone(),
                unlocked_at: Instant::now(),
            },
        );
        umk
    }

    /// The cached key for `session_id`, if present and not expired.
    pub fn get(&self, session_id: &str) -> Option<Arc<UserMasterKey>> {
        let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
        map.get(session_id)
            .filter(|entry| entry.unlocked_at.elapsed() < self.ttl)
            .map(|entry| entry.umk.clone())
    }

    /// The user a live session was unlocked for.
    pub fn owner(&self, session_id: &str) -> Option<String> {
        let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
        map.get(session_id)
            .filter(|entry| entry.unlocked_at.elapsed() < self.ttl)
            .map(|entry| entry.user_id.clone())
    }

    pub fn state(&self, session_id: &str) -> SessionState {
        if self.get(session_id).is_some() {
            SessionState::Unlocked
        } else {
            SessionState::Locked
        }
    }

    /// Evict one session (logout or explicit lock). Returns true if a key was cached.
    pub fn evict(&self, session_id: &str) -> bool {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        map.remove(session_id).is_some()
    }

    /// Evict every session of `user_id`, e.g. after a password change elsewhere.
    pub fn evict_user(&self, user_id: &str) -> usize {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, entry| entry.user_id != user_id);
        before - map.len()
    }

    /// Drop expired entries. Call periodically to bound memory.
    pub fn evict_expired(&self) -> usize {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, entry| entry.unlocked_at.elapsed() < self.ttl);
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_umk;
    use std::thread;

    #[test]
    fn insert_and_get() {
        let cache = SessionKeyCache::new(Duration::from_secs(30));
        assert_eq!(cache.state("s1"), SessionState::Locked);

        let umk = generate_umk();
        cache.insert("s1", "alice", umk.clone());

        assert_eq!(cache.state("s1"), SessionState::Unlocked);
        assert_eq!(*cache.get("s1").unwrap(), umk);
        assert_eq!(cache.owner("s1").as_deref(), Some("alice"));
        assert!(cache.get("s2").is_none());
    }

    #[test]
    fn evict_locks_session() {
        let cache = SessionKeyCache::new(Duration::from_secs(30));
        cache.insert("s1", "alice", generate_umk());

        assert!(cache.evict("s1"));
        assert!(!cache.evict("s1"));
        assert_eq!(cache.state("s1"), SessionState::Locked);
    }

    #[test]
    fn one_key_per_session() {
        let cache = SessionKeyCache::new(Duration::from_secs(30));
        cache.insert("s1", "alice", generate_umk());
        let second = generate_umk();
        cache.insert("s1", "alice", second.clone());

        assert_eq!(cache.len(), 1);
        assert_eq!(*cache.get("s1").unwrap(), second);
    }

    #[test]
    fn evict_user_sessions() {
        let cache = SessionKeyCache::new(Duration::from_secs(30));
        cache.insert("s1", "alice", generate_umk());
        cache.insert("s2", "alice", generate_umk());
        cache.insert("s3", "bob", generate_umk());

        assert_eq!(cache.evict_user("alice"), 2);
        assert_eq!(cache.state("s3"), SessionState::Unlocked);
    }

    #[test]
    fn ttl_expiry() {
        let cache = SessionKeyCache::new(Duration::from_millis(50));
        cache.insert("s1", "alice", generate_umk());
        assert_eq!(cache.state("s1"), SessionState::Unlocked);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(cache.state("s1"), SessionState::Locked);
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
    }
}
