//! InMemoryBroker - プロセス内で完結するブローカー
//!
//! 開発・テスト用の `Broker` 実装です。本番用の AMQP クライアントは別クレートに置きます。
//!
//! # 実装詳細
//! - `HashMap<String, QueueState>` でキューごとに FIFO を管理
//! - 状態は std の Mutex（ロック区間に await を含めない）
//! - 待機中の consumer は `Notify` で起こす（`enable()` してから確認するので通知を取りこぼさない）
//! - ack されずに drop された delivery はキューの先頭に戻る（再配送）
//! - `disconnect()` で接続断を再現できる（以降の操作は `BrokerUnavailable`）

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::domain::RelayError;
use crate::ports::{Broker, Delivery, DeliveryStream};

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Vec<u8>>,
    /// Handed out but neither acked nor rejected yet.
    unacked: usize,
}

#[derive(Debug)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    connected: bool,
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_connected(&self) -> Result<(), RelayError> {
        if self.lock().connected {
            Ok(())
        } else {
            Err(disconnected())
        }
    }

    async fn next_delivery(shared: Arc<Shared>, queue: String) -> Result<InMemoryDelivery, RelayError> {
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = shared.lock();
                if !state.connected {
                    return Err(disconnected());
                }
                let q = state.queues.entry(queue.clone()).or_default();
                if let Some(payload) = q.ready.pop_front() {
                    q.unacked += 1;
                    return Ok(InMemoryDelivery {
                        shared: Arc::clone(&shared),
                        queue,
                        payload: Some(payload),
                    });
                }
            }

            notified.await;
        }
    }

    /// Close out one unacked delivery, optionally putting it back at the head.
    fn settle(&self, queue: &str, requeue: Option<Vec<u8>>) {
        let mut state = self.lock();
        let Some(q) = state.queues.get_mut(queue) else {
            // queue was deleted while the message was out
            return;
        };
        q.unacked = q.unacked.saturating_sub(1);
        if let Some(payload) = requeue {
            q.ready.push_front(payload);
            drop(state);
            self.notify.notify_waiters();
        }
    }
}

fn disconnected() -> RelayError {
    RelayError::BrokerUnavailable("in-memory broker is disconnected".into())
}

/// InMemoryBroker は開発用のブローカー
///
/// # 使用例
/// ```ignore
/// let broker = InMemoryBroker::new();
/// broker.publish("humanization_task", payload).await?;
/// let mut deliveries = broker.consume("humanization_task").await?;
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    queues: HashMap::new(),
                    connected: true,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Simulate a dropped connection.
    pub fn disconnect(&self) {
        self.shared.lock().connected = false;
        self.shared.notify.notify_waiters();
    }

    pub fn reconnect(&self) {
        self.shared.lock().connected = true;
        self.shared.notify.notify_waiters();
    }

    pub fn exists(&self, queue: &str) -> bool {
        self.shared.lock().queues.contains_key(queue)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Ready messages without consuming them.
    pub fn peek(&self, queue: &str) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn unacked(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare(&self, queue: &str) -> Result<(), RelayError> {
        let mut state = self.shared.lock();
        if !state.connected {
            return Err(disconnected());
        }
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), RelayError> {
        {
            let mut state = self.shared.lock();
            if !state.connected {
                return Err(disconnected());
            }
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .ready
                .push_back(payload);
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, RelayError> {
        self.declare(queue).await?;

        let cursor = Some((Arc::clone(&self.shared), queue.to_string()));
        let deliveries = stream::unfold(cursor, |cursor| async move {
            let (shared, queue) = cursor?;
            match Shared::next_delivery(Arc::clone(&shared), queue.clone()).await {
                Ok(delivery) => {
                    let delivery: Box<dyn Delivery> = Box::new(delivery);
                    Some((Ok(delivery), Some((shared, queue))))
                }
                // end the stream after reporting the connection loss
                Err(err) => Some((Err(err), None)),
            }
        });
        Ok(deliveries.boxed())
    }

    async fn depth(&self, queue: &str) -> Result<usize, RelayError> {
        let state = self.shared.lock();
        if !state.connected {
            return Err(disconnected());
        }
        Ok(state.queues.get(queue).map_or(0, |q| q.ready.len()))
    }

    async fn delete(&self, queue: &str) -> Result<(), RelayError> {
        let mut state = self.shared.lock();
        if !state.connected {
            return Err(disconnected());
        }
        match state.queues.remove(queue) {
            Some(q) if !q.ready.is_empty() || q.unacked > 0 => {
                warn!(
                    queue,
                    discarded = q.ready.len(),
                    unacked = q.unacked,
                    "force-deleted non-empty queue"
                );
            }
            Some(_) => debug!(queue, "deleted queue"),
            None => {}
        }
        Ok(())
    }
}

struct InMemoryDelivery {
    shared: Arc<Shared>,
    queue: String,
    payload: Option<Vec<u8>>,
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }

    async fn ack(self: Box<Self>) -> Result<(), RelayError> {
        let mut this = self;
        // on error the delivery is dropped and redelivered
        this.shared.check_connected()?;
        this.payload = None;
        this.shared.settle(&this.queue, None);
        Ok(())
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), RelayError> {
        let mut this = self;
        this.shared.check_connected()?;
        let payload = this.payload.take();
        this.shared
            .settle(&this.queue, if requeue { payload } else { None });
        Ok(())
    }
}

impl Drop for InMemoryDelivery {
    fn drop(&mut self) {
        if let Some(payload) = self.payload.take() {
            self.shared.settle(&self.queue, Some(payload));
        }
    }
}
