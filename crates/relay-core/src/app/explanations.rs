//! ExplanationResolver - 説明文の read-through キャッシュ
//!
//! キー: `explanation_version_{selector}_{scale}`（最新指定は `LATEST`）
//!
//! # 方針
//! - キャッシュが落ちていても処理は続ける（ミス扱いで DB から読む）
//! - `LATEST` で DB から読んだときは具体的なバージョンのキーにも書く
//! - 同時ミスで二重に書き込まれても値はバージョンごとに不変なので問題ない

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::{Explanation, ExplanationVersions, RelayError, TaskEnvelope, VersionSelector};
use crate::ports::{Cache, ExplanationStore};

pub fn cache_key(selector: VersionSelector, scale_name: &str) -> String {
    format!("explanation_version_{selector}_{scale_name}")
}

/// Explanations resolved for one task, keyed by scale name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedExplanations {
    pub by_scale: BTreeMap<String, Explanation>,
}

impl ResolvedExplanations {
    /// Concrete versions actually used.
    pub fn versions(&self) -> ExplanationVersions {
        self.by_scale
            .iter()
            .map(|(scale, explanation)| (scale.clone(), explanation.version_number))
            .collect()
    }
}

#[derive(Clone)]
pub struct ExplanationResolver {
    store: Arc<dyn ExplanationStore>,
    cache: Arc<dyn Cache>,
    ttl: Option<Duration>,
}

impl ExplanationResolver {
    pub fn new(store: Arc<dyn ExplanationStore>, cache: Arc<dyn Cache>) -> Self {
        Self {
            store,
            cache,
            ttl: None,
        }
    }

    /// `None` keeps the cache's own default.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Resolve every parameter of `task`; the first unknown scale aborts.
    pub async fn resolve_for(&self, task: &TaskEnvelope) -> Result<ResolvedExplanations, RelayError> {
        let mut resolved = ResolvedExplanations::default();
        for scale in task.parameters().keys() {
            let explanation = self.resolve(scale, task.selector_for(scale)).await?;
            resolved.by_scale.insert(scale.clone(), explanation);
        }
        Ok(resolved)
    }

    pub async fn resolve(
        &self,
        scale_name: &str,
        selector: VersionSelector,
    ) -> Result<Explanation, RelayError> {
        let key = cache_key(selector, scale_name);
        if let Some(explanation) = self.cached(&key).await {
            debug!(key = %key, "explanation cache hit");
            return Ok(explanation);
        }

        let explanation = self
            .store
            .load_explanation(scale_name, selector)
            .await?
            .ok_or_else(|| RelayError::UnknownExplanationVersion {
                scale: scale_name.to_string(),
                selector,
            })?;

        self.populate(&key, &explanation).await;
        if selector == VersionSelector::Latest {
            let pinned = cache_key(VersionSelector::Version(explanation.version_number), scale_name);
            self.populate(&pinned, &explanation).await;
        }
        Ok(explanation)
    }

    async fn cached(&self, key: &str) -> Option<Explanation> {
        let raw = match self.cache.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key, error = %e, "explanation cache read failed; falling back to store");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(explanation) => Some(explanation),
            Err(e) => {
                warn!(key, error = %e, "discarding undecodable cache entry");
                None
            }
        }
    }

    async fn populate(&self, key: &str, explanation: &Explanation) {
        let value = match serde_json::to_string(explanation) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "could not encode explanation for cache");
                return;
            }
        };
        if let Err(e) = self.cache.set(key, value, self.ttl).await {
            warn!(key, error = %e, "explanation cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::domain::RequestId;
    use crate::impls::{InMemoryCache, InMemoryStore};

    async fn fixture() -> (Arc<InMemoryStore>, Arc<InMemoryCache>, ExplanationResolver) {
        let store = Arc::new(InMemoryStore::new());
        store
            .register_explanation("casualness", "Controls how formal the tone is.", vec![])
            .await;
        store
            .register_explanation("casualness", "Controls how relaxed the tone is.", vec![])
            .await;
        let cache = Arc::new(InMemoryCache::default());
        let resolver = ExplanationResolver::new(store.clone(), cache.clone());
        (store, cache, resolver)
    }

    #[test]
    fn cache_keys_match_the_shared_format() {
        assert_eq!(
            cache_key(VersionSelector::Latest, "humor"),
            "explanation_version_LATEST_humor"
        );
        assert_eq!(
            cache_key(VersionSelector::Version(3), "humor"),
            "explanation_version_3_humor"
        );
    }

    #[tokio::test]
    async fn latest_miss_populates_both_keys() {
        let (_store, cache, resolver) = fixture().await;

        let explanation = resolver
            .resolve("casualness", VersionSelector::Latest)
            .await
            .unwrap();
        assert_eq!(explanation.version_number, 2);

        assert!(cache.contains_key("explanation_version_LATEST_casualness"));
        assert!(cache.contains_key("explanation_version_2_casualness"));
        assert!(!cache.contains_key("explanation_version_1_casualness"));
    }

    #[tokio::test]
    async fn cache_hit_skips_the_store() {
        let (store, _cache, resolver) = fixture().await;
        resolver
            .resolve("casualness", VersionSelector::Version(1))
            .await
            .unwrap();

        store.set_unavailable(true);
        let cached = resolver
            .resolve("casualness", VersionSelector::Version(1))
            .await
            .unwrap();
        assert_eq!(cached.version_number, 1);
    }

    #[tokio::test]
    async fn unknown_version_is_permanent() {
        let (_store, _cache, resolver) = fixture().await;
        let err = resolver
            .resolve("casualness", VersionSelector::Version(7))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::UnknownExplanationVersion { ref scale, selector: VersionSelector::Version(7) }
                if scale == "casualness"
        ));
        assert!(!err.is_transient());
    }

    struct BrokenCache;

    #[async_trait]
    impl Cache for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, RelayError> {
            Err(RelayError::Cache("connection refused".into()))
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Option<Duration>) -> Result<(), RelayError> {
            Err(RelayError::Cache("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn cache_outage_falls_back_to_store() {
        let (store, _cache, _) = fixture().await;
        let resolver = ExplanationResolver::new(store, Arc::new(BrokenCache));
        let explanation = resolver
            .resolve("casualness", VersionSelector::Latest)
            .await
            .unwrap();
        assert_eq!(explanation.version_number, 2);
    }

    #[tokio::test]
    async fn resolve_for_collects_versions_per_scale() {
        let (store, _cache, resolver) = fixture().await;
        store.register_explanation("humor", "Wit.", vec![]).await;

        let task = TaskEnvelope::new(RequestId::new(1), "Hello", "gpt-4o-mini")
            .with_parameter("humor", 4)
            .with_pinned_parameter("casualness", 8, VersionSelector::Version(1));
        let resolved = resolver.resolve_for(&task).await.unwrap();

        let versions = resolved.versions();
        assert_eq!(versions["casualness"], 1);
        assert_eq!(versions["humor"], 1);
    }
}
