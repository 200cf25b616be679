//! InMemoryCache - TTL 付きのインメモリ KV キャッシュ
//!
//! 期限切れのエントリは読み出し時に捨てます（掃除ループは持たない）。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::domain::RelayError;
use crate::ports::Cache;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    default_ttl: Option<Duration>,
}

impl InMemoryCache {
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Entries currently stored, expired ones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(Some(DEFAULT_CACHE_TTL))
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, RelayError> {
        let mut entries = self.lock();
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some(entry) => entry.expires_at.is_some_and(|at| Instant::now() >= at),
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), RelayError> {
        let expires_at = ttl.or(self.default_ttl).map(|ttl| Instant::now() + ttl);
        self.lock()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }
}
