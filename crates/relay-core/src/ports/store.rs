//! Store ports - リクエスト記録と説明文（explanation）の永続化
//!
//! 本体はリレーショナル DB 上の CRUD で、このクレートでは扱いません。
//! コアが必要とする狭いインターフェースだけを定義します。

use async_trait::async_trait;

use crate::domain::{
    Explanation, ExplanationVersions, Parameters, RelayError, RequestId, RequestRecord,
    VersionSelector,
};

#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a new request and assign its id.
    async fn create_request(
        &self,
        input_text: &str,
        parameters: &Parameters,
        model_name: &str,
    ) -> Result<RequestId, RelayError>;

    /// Worker side: final text plus the explanation versions actually used.
    async fn save_final_result(
        &self,
        request_id: RequestId,
        text: &str,
        explanation_versions: &ExplanationVersions,
    ) -> Result<(), RelayError>;

    /// Dispatcher side: final text only; leaves recorded versions untouched.
    async fn record_final_text(&self, request_id: RequestId, text: &str)
    -> Result<(), RelayError>;

    async fn get_request(&self, request_id: RequestId)
    -> Result<Option<RequestRecord>, RelayError>;
}

#[async_trait]
pub trait ExplanationStore: Send + Sync {
    /// `Ok(None)` when no version matches the selector.
    async fn load_explanation(
        &self,
        scale_name: &str,
        selector: VersionSelector,
    ) -> Result<Option<Explanation>, RelayError>;
}
