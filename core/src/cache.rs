//! Key-value cache with TTL, used for inbound message hand-off between the
//! webhook and the worker, and for read-through bot lookups.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::db::Platform;
use crate::models::message::InboundMessage;

/// Processing locks outlive a normal dispatch but expire if a worker dies.
const LOCK_TTL_SECS: u64 = 60;

#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    /// Sets the key only if it does not exist. Returns whether it was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
}

impl RedisCache {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl KeyValueCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = self.conn.clone().get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let _: () = self.conn.clone().set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _: () = self.conn.clone().del(key).await?;
        Ok(())
    }
}

/// Upper bound on how long a memory cache entry lives.
const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn expiry(now: Instant, ttl_secs: u64) -> Instant {
    now.checked_add(Duration::from_secs(ttl_secs).min(MAX_TTL))
        .unwrap_or(now)
}

/// Process-local cache with lazy expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.get(key).await.ok().flatten().is_some()
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let expires = expiry(Instant::now(), ttl_secs);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if entries.get(key).is_some_and(|(_, expires)| *expires > now) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            (value.to_string(), expiry(now, ttl_secs)),
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

pub fn message_key(platform: Platform, binding_id: &str, message_id: &str) -> String {
    format!("chatflow:msg:{platform}:{binding_id}:{message_id}")
}

pub fn bot_key(bot_id: &str) -> String {
    format!("chatflow:bot:{bot_id}")
}

fn lock_key(message_key: &str) -> String {
    format!("{message_key}:lock")
}

pub async fn store_message(
    cache: &dyn KeyValueCache,
    key: &str,
    message: &InboundMessage,
    ttl_secs: u64,
) -> Result<()> {
    let payload = serde_json::to_string(message)?;
    cache.set_ex(key, &payload, ttl_secs).await
}

/// Takes the processing lock for a cached message and returns it.
///
/// Returns `None` when another worker holds the lock or the message is gone
/// (already processed or expired).
pub async fn claim_message(cache: &dyn KeyValueCache, key: &str) -> Result<Option<InboundMessage>> {
    let lock = lock_key(key);
    if !cache.set_nx_ex(&lock, "1", LOCK_TTL_SECS).await? {
        debug!(message_key = key, "Message already claimed");
        return Ok(None);
    }
    match cache.get(key).await? {
        Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
        None => {
            cache.delete(&lock).await?;
            debug!(message_key = key, "Message no longer cached");
            Ok(None)
        }
    }
}

/// Marks a claimed message as consumed.
pub async fn release_message(cache: &dyn KeyValueCache, key: &str) -> Result<()> {
    cache.delete(key).await?;
    cache.delete(&lock_key(key)).await
}

/// Gives up a claim without consuming the message, so a redelivery can retry.
pub async fn abandon_message(cache: &dyn KeyValueCache, key: &str) -> Result<()> {
    cache.delete(&lock_key(key)).await
}

/// Read-through lookup: returns the cached value or loads, caches and
/// returns it. Unreadable cache entries are reloaded.
pub async fn get_or_set<T, F, Fut>(
    cache: &dyn KeyValueCache,
    key: &str,
    ttl_secs: u64,
    load: F,
) -> Result<Option<T>>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    if let Some(cached) = cache.get(key).await? {
        match serde_json::from_str(&cached) {
            Ok(value) => return Ok(Some(value)),
            Err(e) => warn!(key = key, error = %e, "Discarding unreadable cache entry"),
        }
    }
    let loaded = load().await?;
    if let Some(value) = &loaded {
        cache.set_ex(key, &serde_json::to_string(value)?, ttl_secs).await?;
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::{ChatIdentity, ReplyTarget};
    use serde_json::json;

    fn message() -> InboundMessage {
        InboundMessage {
            id: "42".to_string(),
            platform: Platform::Telegram,
            command_text: "/start".to_string(),
            identity: ChatIdentity::new("100", Some("7".to_string())),
            reply_to: ReplyTarget::new("100", None),
            raw: json!({"text": "/start"}),
            envelope: json!({"update_id": 1}),
        }
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_abandoned() {
        let cache = MemoryCache::new();
        let key = message_key(Platform::Telegram, "b1", "42");
        store_message(&cache, &key, &message(), 300).await.unwrap();

        let first = claim_message(&cache, &key).await.unwrap();
        assert_eq!(first.unwrap().command_text, "/start");
        assert!(claim_message(&cache, &key).await.unwrap().is_none());

        abandon_message(&cache, &key).await.unwrap();
        assert!(claim_message(&cache, &key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn released_message_is_not_processed_again() {
        let cache = MemoryCache::new();
        let key = message_key(Platform::Kik, "b1", "m1");
        store_message(&cache, &key, &message(), 300).await.unwrap();

        assert!(claim_message(&cache, &key).await.unwrap().is_some());
        release_message(&cache, &key).await.unwrap();

        assert!(!cache.contains(&key).await);
        assert!(claim_message(&cache, &key).await.unwrap().is_none());
        assert!(!cache.contains(&lock_key(&key)).await);
    }

    #[tokio::test]
    async fn expired_entries_are_gone() {
        let cache = MemoryCache::new();
        cache.set_ex("k", "v", 0).await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.set_nx_ex("k", "v", 60).await.unwrap());
    }

    #[tokio::test]
    async fn get_or_set_loads_once() {
        let cache = MemoryCache::new();
        let first: Option<String> = get_or_set(&cache, "bot", 60, || async { Ok(Some("a".to_string())) })
            .await
            .unwrap();
        let second: Option<String> = get_or_set(&cache, "bot", 60, || async { Ok(Some("b".to_string())) })
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(second.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn huge_ttl_does_not_overflow() {
        let cache = MemoryCache::new();
        cache.set_ex("k", "v", u64::MAX).await.unwrap();
        assert!(cache.set_nx_ex("lock", "1", u64::MAX).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(!cache.set_nx_ex("lock", "1", u64::MAX).await.unwrap());
    }

    #[tokio::test]
    async fn missing_values_are_not_cached() {
        let cache = MemoryCache::new();
        let value: Option<String> = get_or_set(&cache, "bot", 60, || async { Ok(None) }).await.unwrap();
        assert!(value.is_none());
        assert!(!cache.contains("bot").await);
    }
}
