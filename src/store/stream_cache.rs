//! Per-user stream tree cache
//!
//! Injected into the stream store. Entries are invalidated synchronously by
//! every mutating call for their user; a TTL additionally bounds how long a
//! tree written by another process may stay stale.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::types::Stream;

/// When cached trees expire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Kept until the next mutation for the user
    #[default]
    WriteThrough,
    /// Kept until the next mutation or until the duration elapses
    Ttl(Duration),
}

/// A user's streams as loaded from the backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserStreams {
    /// Live streams, as a forest with materialized children
    pub forest: Vec<Stream>,
    /// Tombstones
    pub deletions: Vec<Stream>,
}

#[derive(Debug)]
struct Entry {
    streams: Arc<UserStreams>,
    loaded_at: Instant,
}

/// Cache of stream trees keyed by user id
#[derive(Debug, Default)]
pub struct StreamTreeCache {
    policy: CachePolicy,
    entries: RwLock<HashMap<String, Entry>>,
}

impl StreamTreeCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Cached tree for a user, if present and fresh
    pub fn get(&self, user_id: &str) -> Option<Arc<UserStreams>> {
        let entries = self.entries.read();
        let entry = entries.get(user_id)?;
        if let CachePolicy::Ttl(ttl) = self.policy {
            if entry.loaded_at.elapsed() >= ttl {
                return None;
            }
        }
        Some(entry.streams.clone())
    }

    pub fn put(&self, user_id: &str, streams: Arc<UserStreams>) {
        self.entries.write().insert(
            user_id.to_string(),
            Entry {
                streams,
                loaded_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, user_id: &str) {
        self.entries.write().remove(user_id);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(name: &str) -> Arc<UserStreams> {
        Arc::new(UserStreams {
            forest: vec![Stream::new(name, name)],
            deletions: Vec::new(),
        })
    }

    #[test]
    fn test_write_through_keeps_until_invalidated() {
        let cache = StreamTreeCache::new(CachePolicy::WriteThrough);
        assert!(cache.get("u1").is_none());

        cache.put("u1", tree("a"));
        cache.put("u2", tree("b"));
        assert_eq!(cache.get("u1").unwrap().forest[0].id, "a");

        cache.invalidate("u1");
        assert!(cache.get("u1").is_none());
        assert!(cache.get("u2").is_some());
    }

    #[test]
    fn test_ttl_expires_entries() {
        let cache = StreamTreeCache::new(CachePolicy::Ttl(Duration::ZERO));
        cache.put("u1", tree("a"));
        assert!(cache.get("u1").is_none());

        let cache = StreamTreeCache::new(CachePolicy::Ttl(Duration::from_secs(60)));
        cache.put("u1", tree("a"));
        assert!(cache.get("u1").is_some());
    }
}
