//! InMemoryStore - リクエスト記録と説明文のインメモリ実装
//!
//! `RequestStore` と `ExplanationStore` の両方を実装します。
//! 説明文はスケールごとにバージョン番号（1 始まり）で保持し、`Latest` は最大番号を返します。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{
    Explanation, ExplanationVersions, Parameters, RelayError, RequestId, RequestRecord,
    VersionSelector,
};
use crate::ports::{ExplanationStore, RequestStore};

#[derive(Default)]
struct StoreState {
    requests: HashMap<RequestId, RequestRecord>,
    explanations: HashMap<String, BTreeMap<u32, Explanation>>,
    next_request_id: i64,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new explanation version for a scale; returns its number.
    pub async fn register_explanation(
        &self,
        scale_name: &str,
        description: &str,
        examples: Vec<String>,
    ) -> u32 {
        let mut state = self.state.write().await;
        let versions = state
            .explanations
            .entry(scale_name.to_string())
            .or_default();
        let version = versions.keys().next_back().map_or(1, |v| v + 1);
        versions.insert(
            version,
            Explanation::new(scale_name, description, version).with_examples(examples),
        );
        version
    }

    /// Make every call fail with `RelayError::Storage` (outage simulation).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RelayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RelayError::Storage("store is unavailable".into()))
        } else {
            Ok(())
        }
    }

    async fn update<F>(&self, request_id: RequestId, apply: F) -> Result<(), RelayError>
    where
        F: FnOnce(&mut RequestRecord) + Send,
    {
        self.check_available()?;
        let mut state = self.state.write().await;
        let record = state
            .requests
            .get_mut(&request_id)
            .ok_or_else(|| RelayError::Storage(format!("unknown request {request_id}")))?;
        apply(record);
        Ok(())
    }
}

#[async_trait]
impl RequestStore for InMemoryStore {
    async fn create_request(
        &self,
        input_text: &str,
        parameters: &Parameters,
        model_name: &str,
    ) -> Result<RequestId, RelayError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        state.next_request_id += 1;
        let request_id = RequestId::new(state.next_request_id);
        state.requests.insert(
            request_id,
            RequestRecord::new(request_id, input_text, parameters.clone(), model_name),
        );
        Ok(request_id)
    }

    async fn save_final_result(
        &self,
        request_id: RequestId,
        text: &str,
        explanation_versions: &ExplanationVersions,
    ) -> Result<(), RelayError> {
        let versions = explanation_versions.clone();
        self.update(request_id, move |record| {
            record.complete(text);
            record.explanation_versions = versions;
        })
        .await
    }

    async fn record_final_text(
        &self,
        request_id: RequestId,
        text: &str,
    ) -> Result<(), RelayError> {
        self.update(request_id, |record| record.complete(text)).await
    }

    async fn get_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<RequestRecord>, RelayError> {
        self.check_available()?;
        Ok(self.state.read().await.requests.get(&request_id).cloned())
    }
}

#[async_trait]
impl ExplanationStore for InMemoryStore {
    async fn load_explanation(
        &self,
        scale_name: &str,
        selector: VersionSelector,
    ) -> Result<Option<Explanation>, RelayError> {
        self.check_available()?;
        let state = self.state.read().await;
        let Some(versions) = state.explanations.get(scale_name) else {
            return Ok(None);
        };
        let found = match selector {
            VersionSelector::Latest => versions.values().next_back(),
            VersionSelector::Version(n) => versions.get(&n),
        };
        Ok(found.cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_resolves_to_highest_version() {
        let store = InMemoryStore::new();
        assert_eq!(store.register_explanation("casualness", "v1 text", vec![]).await, 1);
        assert_eq!(store.register_explanation("casualness", "v2 text", vec![]).await, 2);

        let latest = store
            .load_explanation("casualness", VersionSelector::Latest)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.version_number, 2);
        assert_eq!(latest.description, "v2 text");

        let pinned = store
            .load_explanation("casualness", VersionSelector::Version(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pinned.description, "v1 text");

        assert!(store
            .load_explanation("casualness", VersionSelector::Version(3))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .load_explanation("unknown", VersionSelector::Latest)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn request_lifecycle() {
        let store = InMemoryStore::new();
        let mut params = Parameters::new();
        params.insert("casualness".into(), 8);

        let id = store.create_request("Hello", &params, "gpt-4o-mini").await.unwrap();
        let record = store.get_request(id).await.unwrap().unwrap();
        assert!(!record.is_complete());

        let mut versions = ExplanationVersions::new();
        versions.insert("casualness".into(), 2);
        store.save_final_result(id, "Hey there", &versions).await.unwrap();

        let record = store.get_request(id).await.unwrap().unwrap();
        assert_eq!(record.final_text.as_deref(), Some("Hey there"));
        assert_eq!(record.explanation_versions["casualness"], 2);
        assert!(record.completed_at.is_some());

        // dispatcher-side write keeps versions
        store.record_final_text(id, "Hey there").await.unwrap();
        let record = store.get_request(id).await.unwrap().unwrap();
        assert_eq!(record.explanation_versions["casualness"], 2);
    }

    #[tokio::test]
    async fn ids_are_unique_and_increasing() {
        let store = InMemoryStore::new();
        let a = store.create_request("a", &Parameters::new(), "m").await.unwrap();
        let b = store.create_request("b", &Parameters::new(), "m").await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn outage_surfaces_storage_errors() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let err = store
            .create_request("a", &Parameters::new(), "m")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Storage(_)));
    }

    #[tokio::test]
    async fn saving_unknown_request_fails() {
        let store = InMemoryStore::new();
        let err = store
            .record_final_text(RequestId::new(99), "x")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("99"));
    }
}
