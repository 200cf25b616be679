//! Errors - エラー型と分類
//!
//! すべての失敗は `RelayError` に集約し、`ErrorKind` で運用上の扱いを決めます。
//!
//! # 分類
//! - Transient: 一時的なエラー（バックオフ付きでリトライ）
//! - Permanent: 恒久的なエラー（そのタスクだけ中断、リトライしない）
//! - Infrastructure: 周辺システム（ストレージ・キャッシュ）の障害

use std::time::Duration;

use thiserror::Error;

use super::task::VersionSelector;

/// ErrorKind は実行エラーの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// RelayError はドメインエラー
///
/// sink に流しつつ呼び出し元にも返すため `Clone` を実装しています。
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("no explanation for scale '{scale}' matching version {selector}")]
    UnknownExplanationVersion {
        scale: String,
        selector: VersionSelector,
    },

    #[error("generation backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("generation backend rate limited: {0}")]
    BackendRateLimited(String),

    #[error("no result envelope received within {0:?}")]
    StreamTimeout(Duration),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("cache failure: {0}")]
    Cache(String),

    #[error("codec failure: {0}")]
    Codec(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("background task aborted: {0}")]
    Aborted(String),
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::BrokerUnavailable(_)
            | RelayError::BackendUnavailable(_)
            | RelayError::BackendRateLimited(_) => ErrorKind::Transient,
            RelayError::Storage(_) | RelayError::Cache(_) => ErrorKind::Infrastructure,
            RelayError::UnknownExplanationVersion { .. }
            | RelayError::StreamTimeout(_)
            | RelayError::InvalidTask(_)
            | RelayError::Codec(_)
            | RelayError::Config(_)
            | RelayError::Aborted(_) => ErrorKind::Permanent,
        }
    }

    /// Worth retrying at the call site?
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(RelayError::BrokerUnavailable("down".into()), ErrorKind::Transient)]
    #[case(RelayError::BackendUnavailable("502".into()), ErrorKind::Transient)]
    #[case(RelayError::BackendRateLimited("429".into()), ErrorKind::Transient)]
    #[case(RelayError::StreamTimeout(Duration::from_secs(1)), ErrorKind::Permanent)]
    #[case(RelayError::Storage("db".into()), ErrorKind::Infrastructure)]
    #[case(
        RelayError::UnknownExplanationVersion { scale: "casualness".into(), selector: VersionSelector::Version(9) },
        ErrorKind::Permanent
    )]
    fn errors_are_classified(#[case] err: RelayError, #[case] expected: ErrorKind) {
        assert_eq!(err.kind(), expected);
        assert_eq!(err.is_transient(), expected == ErrorKind::Transient);
    }

    #[test]
    fn unknown_version_message_names_scale_and_selector() {
        let err = RelayError::UnknownExplanationVersion {
            scale: "formality".into(),
            selector: VersionSelector::Latest,
        };
        let msg = err.to_string();
        assert!(msg.contains("formality"));
        assert!(msg.contains("LATEST"));
    }
}
