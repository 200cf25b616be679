//! Domain identifiers.
//!
//! `RequestId` は外部（リクエストの永続化層）が採番する整数 ID です。
//! 結果チャネル名はこの ID から決定的に導出されるため、
//! 同時に処理中のリクエスト間で ID が一意であることが前提になります。

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(i64);

impl RequestId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
