// User profile cache for the profile bootstrap call

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Cached user record
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub user: Value,
    pub fetched_at: DateTime<Utc>,
    fetched: Instant,
}

/// Thread-safe cache holding the last fetched user profile
#[derive(Clone)]
pub struct ProfileCache {
    entry: Arc<RwLock<Option<Profile>>>,

    cache_ttl: Duration,
}

impl ProfileCache {
    pub fn new(cache_ttl: u64) -> Self {
        Self {
            entry: Arc::new(RwLock::new(None)),
            cache_ttl: Duration::from_secs(cache_ttl),
        }
    }

    /// Cached user if younger than the TTL
    pub async fn fresh(&self) -> Option<Value> {
        let entry = self.entry.read().await;
        entry
            .as_ref()
            .filter(|p| p.fetched.elapsed() < self.cache_ttl)
            .map(|p| p.user.clone())
    }

    /// Cached user regardless of age
    pub async fn get(&self) -> Option<Profile> {
        self.entry.read().await.clone()
    }

    /// Merge `user` into the cached record and restart the TTL
    pub async fn merge(&self, user: Value) -> Value {
        let mut entry = self.entry.write().await;
        let merged = match entry.take() {
            Some(existing) => merge_objects(existing.user, user),
            None => user,
        };
        *entry = Some(Profile {
            user: merged.clone(),
            fetched_at: Utc::now(),
            fetched: Instant::now(),
        });
        tracing::debug!("Profile cache updated");
        merged
    }

    pub async fn clear(&self) {
        *self.entry.write().await = None;
    }

    /// Check if the cache is stale
    pub async fn is_stale(&self) -> bool {
        self.fresh().await.is_none()
    }
}

/// Pull the user record out of a profile or login response.
///
/// Accepts `{ "data": {...} }`, `{ "success": true, "data": {...} }` and a bare
/// user object.
pub fn extract_user(body: &Value) -> Option<Value> {
    match body.get("data") {
        Some(data @ Value::Object(_)) => Some(data.clone()),
        _ if body.is_object() => Some(body.clone()),
        _ => None,
    }
}

/// Shallow merge: keys from `update` win, keys only in `base` survive
fn merge_objects(base: Value, update: Value) -> Value {
    match (base, update) {
        (Value::Object(mut base), Value::Object(update)) => {
            for (key, value) in update {
                base.insert(key, value);
            }
            Value::Object(base)
        }
        (_, update) => update,
    }
}

impl Default for ProfileCache {
    fn default() -> Self {
        Self::new(300)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_user_shapes() {
        let user = json!({"id": 7, "email": "a@b.c", "role": "dealer"});

        assert_eq!(extract_user(&json!({"data": user})), Some(user.clone()));
        assert_eq!(
            extract_user(&json!({"success": true, "data": user})),
            Some(user.clone())
        );
        assert_eq!(extract_user(&user), Some(user.clone()));
        assert_eq!(extract_user(&json!("nope")), None);
        assert_eq!(extract_user(&Value::Null), None);
    }

    #[tokio::test]
    async fn test_merge_keeps_existing_fields() {
        let cache = ProfileCache::new(300);
        cache
            .merge(json!({"id": 1, "venue_name": "Riyadh Motors"}))
            .await;
        let merged = cache.merge(json!({"id": 1, "kyc_status": "approved"})).await;

        assert_eq!(merged["venue_name"], "Riyadh Motors");
        assert_eq!(merged["kyc_status"], "approved");
        assert_eq!(cache.fresh().await, Some(merged));
    }

    #[tokio::test]
    async fn test_zero_ttl_is_always_stale() {
        let cache = ProfileCache::new(0);
        cache.merge(json!({"id": 1})).await;
        assert!(cache.is_stale().await);
        assert!(cache.get().await.is_some());
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = ProfileCache::default();
        cache.merge(json!({"id": 1})).await;
        assert!(!cache.is_stale().await);

        cache.clear().await;
        assert!(cache.get().await.is_none());
    }
}
