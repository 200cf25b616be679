//! ChannelNaming port - request_id から結果チャネル名への純関数
//!
//! テストではプレフィックスを差し替えて、同じブローカー上の別セッションと衝突しないようにします。

use crate::domain::RequestId;

/// Default prefix for per-request result queues.
pub const DEFAULT_RESULT_PREFIX: &str = "humanization_result_";

/// Default shared task queue.
pub const DEFAULT_TASK_QUEUE: &str = "humanization_task";

/// Maps a request id to its return channel. Must be deterministic and
/// injective over request ids.
pub trait ChannelNaming: Send + Sync {
    fn channel_for(&self, request_id: RequestId) -> String;
}

/// `{prefix}{request_id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixNaming {
    prefix: String,
}

impl PrefixNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for PrefixNaming {
    fn default() -> Self {
        Self::new(DEFAULT_RESULT_PREFIX)
    }
}

impl ChannelNaming for PrefixNaming {
    fn channel_for(&self, request_id: RequestId) -> String {
        format!("{}{}", self.prefix, request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_naming_matches_result_queue_convention() {
        let naming = PrefixNaming::default();
        assert_eq!(naming.channel_for(RequestId::new(17)), "humanization_result_17");
    }

    #[test]
    fn distinct_ids_get_distinct_channels() {
        let naming = PrefixNaming::new("r.");
        assert_ne!(
            naming.channel_for(RequestId::new(1)),
            naming.channel_for(RequestId::new(11))
        );
        assert_eq!(naming.channel_for(RequestId::new(-3)), "r.-3");
    }
}
