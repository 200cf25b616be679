//! Cache port - 参照のメモ化にだけ使う KV キャッシュ

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::RelayError;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, RelayError>;

    /// `ttl = None` uses the cache's default TTL.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), RelayError>;
}
