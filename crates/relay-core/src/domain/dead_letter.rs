//! DeadLetter - 失敗したタスクの退避先メッセージ
//!
//! ワーカーは失敗したタスクを自動で再投入しません。
//! リトライ上限に達した（または恒久的に失敗した）タスクは
//! `{task_queue}.dead` に理由付きで退避し、元メッセージは ack します。

use serde::{Deserialize, Serialize};

use super::errors::RelayError;
use super::task::TaskEnvelope;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub reason: String,
    pub transient: bool,

    /// The decoded task, when decoding succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskEnvelope>,

    /// Raw payload (lossy UTF-8) for messages that could not be decoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl DeadLetter {
    pub fn for_task(task: TaskEnvelope, error: &RelayError) -> Self {
        Self {
            reason: error.to_string(),
            transient: error.is_transient(),
            task: Some(task),
            raw: None,
        }
    }

    pub fn undecodable(payload: &[u8], error: &RelayError) -> Self {
        Self {
            reason: error.to_string(),
            transient: false,
            task: None,
            raw: Some(String::from_utf8_lossy(payload).into_owned()),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, RelayError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, RelayError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Dead-letter queue name for a task queue.
pub fn dead_letter_queue(task_queue: &str) -> String {
    format!("{task_queue}.dead")
}
