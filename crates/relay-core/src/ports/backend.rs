//! GenerationBackend port - 外部のテキスト生成 API（ストリーミング）

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::domain::RelayError;

/// Fragments in arrival order. The stream ending is the completion signal.
pub type FragmentStream = BoxStream<'static, Result<String, RelayError>>;

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Fails with `BackendUnavailable` / `BackendRateLimited` when the call
    /// cannot be started; the same errors may also arrive mid-stream.
    async fn stream_completion(
        &self,
        model_name: &str,
        instruction: &str,
    ) -> Result<FragmentStream, RelayError>;
}
