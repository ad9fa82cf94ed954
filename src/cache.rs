//! In-process read cache for friend lists and per-friend expense lists.
//!
//! Entries live under deterministic keys and are removed whenever a mutation
//! touches the underlying records, forcing a refetch on the next read. No
//! TTL, no partial invalidation. The cache is a non-authoritative read
//! optimization: a failed put or invalidate is logged and swallowed.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;

pub fn friends_key(user_id: &str) -> String {
    format!("friends:{user_id}")
}

pub fn expenses_key(user_id: &str, friend_id: &str) -> String {
    format!("expenses:{user_id}:{friend_id}")
}

#[derive(Clone, Default)]
pub struct ReadCache {
    entries: Arc<RwLock<HashMap<String, serde_json::Value>>>,
}

impl ReadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entries = self.entries.read().await;
        let value = entries.get(key)?.clone();
        drop(entries);
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(err) => {
                tracing::debug!(key, %err, "cached value failed to decode, dropping it");
                self.invalidate(key).await;
                None
            }
        }
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.entries.write().await.insert(key.to_string(), v);
            }
            Err(err) => {
                tracing::debug!(key, %err, "failed to cache value, skipping");
            }
        }
    }

    pub async fn invalidate(&self, key: &str) {
        let removed = self.entries.write().await.remove(key).is_some();
        tracing::debug!(key, removed, "cache invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = ReadCache::new();
        cache.put(&friends_key("u1"), &vec!["a", "b"]).await;
        let hit: Option<Vec<String>> = cache.get(&friends_key("u1")).await;
        assert_eq!(hit, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[tokio::test]
    async fn invalidation_forces_a_miss() {
        let cache = ReadCache::new();
        let key = expenses_key("u1", "f1");
        cache.put(&key, &vec![1, 2, 3]).await;
        cache.invalidate(&key).await;
        let hit: Option<Vec<i32>> = cache.get(&key).await;
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn keys_are_deterministic_and_scoped() {
        assert_eq!(friends_key("u1"), "friends:u1");
        assert_eq!(expenses_key("u1", "f2"), "expenses:u1:f2");
        assert_ne!(expenses_key("u1", "f2"), expenses_key("u2", "f2"));
    }
}
