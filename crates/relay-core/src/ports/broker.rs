//! Broker port - 永続メッセージブローカーへの薄い操作
//!
//! タスクキュー（共有）と結果チャネル（リクエストごとの一時キュー）の両方がこの trait を通ります。
//!
//! # 設計原則
//! - `declare` / `delete` は冪等
//! - `publish` は永続（persistent）かつ at-least-once
//! - `consume` は無限の遅延シーケンス。各要素は処理後に ack が必要で、
//!   ack 前に consumer が切断されると再配送される
//! - `depth` は負荷シグナル用のベストエフォート値（正本ではない）
//! - `delete` は force delete。未消費メッセージは破棄される（実装側で warn ログ）

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::domain::RelayError;

/// A message handed out by [`Broker::consume`].
///
/// The consumer owns the delivery and must `ack` or `reject` it. Dropping it
/// without doing either makes the broker redeliver it.
#[async_trait]
pub trait Delivery: Send {
    fn payload(&self) -> &[u8];

    /// Processing succeeded; remove the message from the queue.
    async fn ack(self: Box<Self>) -> Result<(), RelayError>;

    /// Processing failed. `requeue = false` discards the message.
    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), RelayError>;
}

/// Lazy, unbounded sequence of deliveries from one queue.
///
/// An `Err` item means the connection is gone; the stream ends after it.
pub type DeliveryStream = BoxStream<'static, Result<Box<dyn Delivery>, RelayError>>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the queue if absent.
    async fn declare(&self, queue: &str) -> Result<(), RelayError>;

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), RelayError>;

    /// Start consuming. Declares the queue lazily.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, RelayError>;

    /// Best-effort count of ready messages.
    async fn depth(&self, queue: &str) -> Result<usize, RelayError>;

    /// Force-delete the queue. No-op when it does not exist.
    async fn delete(&self, queue: &str) -> Result<(), RelayError>;
}
