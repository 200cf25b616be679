//! Dispatcher - タスクを投入し、結果チャネルから断片を呼び出し元へ中継する
//!
//! # フロー
//! 1. request_id から結果チャネル名を導出して declare
//! 2. 宛先を書き込んだタスクを共有タスクキューへ publish
//! 3. 結果チャネルを consume し、非 final の断片を sink に流す
//! 4. final を受けたら最終テキストを保存して終了
//! 5. どの経路で抜けても結果チャネルを delete してから sink を閉じる（一時的な失敗はリトライ）
//!
//! # 失敗時
//! - 次の envelope が `stream_timeout` 以内に来なければ `StreamTimeout`
//! - ブローカー切断は `BrokerUnavailable`（途中で黙って打ち切らない）
//! - sink の受け手が消えても final まで読み切る（チャネルを残さないため）

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::retry::{RetryPolicy, retry_transient};
use crate::config::DEFAULT_STREAM_TIMEOUT;
use crate::domain::{RelayError, RequestId, ResultEnvelope, StreamEvent, TaskEnvelope};
use crate::ports::{Broker, ChannelNaming, DEFAULT_TASK_QUEUE, RequestStore};

/// Caller side of a stream: fragments, then one `Final` or one error.
pub type EventSink = mpsc::Sender<Result<StreamEvent, RelayError>>;

pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    requests: Arc<dyn RequestStore>,
    naming: Arc<dyn ChannelNaming>,
    task_queue: String,
    stream_timeout: Duration,
    broker_retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        requests: Arc<dyn RequestStore>,
        naming: Arc<dyn ChannelNaming>,
    ) -> Self {
        Self {
            broker,
            requests,
            naming,
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            broker_retry: RetryPolicy::default(),
        }
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn with_broker_retry(mut self, policy: RetryPolicy) -> Self {
        self.broker_retry = policy;
        self
    }

    pub fn channel_for(&self, request_id: RequestId) -> String {
        self.naming.channel_for(request_id)
    }

    /// Publish `task` and relay its result stream into `sink`.
    ///
    /// The sink receives every fragment in order, then exactly one
    /// `StreamEvent::Final` or one error, and is closed when this returns.
    /// The same outcome is returned to the caller.
    pub async fn submit_and_stream(
        &self,
        task: TaskEnvelope,
        sink: EventSink,
    ) -> Result<String, RelayError> {
        let request_id = task.request_id();
        let channel = self.naming.channel_for(request_id);

        let outcome = self.relay(task, &channel, &sink).await;

        let broker = &self.broker;
        let cleanup = retry_transient(&self.broker_retry, "delete result channel", |_| {
            let channel = channel.as_str();
            async move { broker.delete(channel).await }
        })
        .await;
        if let Err(e) = cleanup {
            warn!(request_id = %request_id, queue = %channel, error = %e, "failed to delete result channel");
        }

        let last = match &outcome {
            Ok(text) => Ok(StreamEvent::Final(text.clone())),
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "stream aborted");
                Err(e.clone())
            }
        };
        // receiver may be gone already
        let _ = sink.send(last).await;
        outcome
    }

    async fn relay(
        &self,
        task: TaskEnvelope,
        channel: &str,
        sink: &EventSink,
    ) -> Result<String, RelayError> {
        task.validate()?;
        let request_id = task.request_id();
        let broker = &self.broker;

        // declare before publishing so no result can arrive ahead of the queue
        retry_transient(&self.broker_retry, "declare result channel", |_| async move {
            broker.declare(channel).await
        })
        .await?;

        let payload = task.addressed_to(channel).to_payload()?;
        let task_queue = self.task_queue.as_str();
        retry_transient(&self.broker_retry, "publish task", |_| {
            let payload = payload.clone();
            async move { broker.publish(task_queue, payload).await }
        })
        .await?;
        info!(request_id = %request_id, queue = %channel, "task published");

        let mut deliveries = self.broker.consume(channel).await?;
        let mut listening = true;
        loop {
            let next = tokio::time::timeout(self.stream_timeout, deliveries.next())
                .await
                .map_err(|_| RelayError::StreamTimeout(self.stream_timeout))?;
            let delivery = match next {
                Some(delivery) => delivery?,
                None => {
                    return Err(RelayError::BrokerUnavailable(
                        "result stream ended before the final envelope".into(),
                    ));
                }
            };

            let envelope = match ResultEnvelope::from_payload(delivery.payload()) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "dropping malformed result envelope");
                    delivery.reject(false).await?;
                    continue;
                }
            };
            delivery.ack().await?;

            if envelope.is_final {
                if let Err(e) = self
                    .requests
                    .record_final_text(request_id, &envelope.final_text)
                    .await
                {
                    warn!(request_id = %request_id, error = %e, "could not persist final text");
                }
                debug!(request_id = %request_id, "final envelope received");
                return Ok(envelope.final_text);
            }

            if listening && !envelope.text_piece.is_empty() {
                let fragment = StreamEvent::Fragment(envelope.text_piece);
                if sink.send(Ok(fragment)).await.is_err() {
                    info!(request_id = %request_id, "caller went away; draining result channel");
                    listening = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::domain::Parameters;
    use crate::impls::{InMemoryBroker, InMemoryStore};
    use crate::ports::PrefixNaming;

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        store: Arc<InMemoryStore>,
        dispatcher: Arc<Dispatcher>,
    }

    fn fixture(timeout: Duration) -> Fixture {
        fixture_with_retry(timeout, RetryPolicy::no_retry())
    }

    fn fixture_with_retry(timeout: Duration, broker_retry: RetryPolicy) -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = Dispatcher::new(
            broker.clone(),
            store.clone(),
            Arc::new(PrefixNaming::default()),
        )
        .with_stream_timeout(timeout)
        .with_broker_retry(broker_retry);
        Fixture {
            broker,
            store,
            dispatcher: Arc::new(dispatcher),
        }
    }

    impl Fixture {
        async fn task(&self) -> TaskEnvelope {
            let id = self
                .store
                .create_request("Hello", &Parameters::new(), "m")
                .await
                .unwrap();
            TaskEnvelope::new(id, "Hello", "m")
        }

        async fn reply(&self, channel: &str, envelope: ResultEnvelope) {
            self.broker
                .publish(channel, envelope.to_payload().unwrap())
                .await
                .unwrap();
        }
    }

    async fn drain(mut rx: mpsc::Receiver<Result<StreamEvent, RelayError>>) -> Vec<Result<StreamEvent, RelayError>> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn relays_fragments_then_final_and_cleans_up() {
        let fx = fixture(Duration::from_secs(5));
        let task = fx.task().await;
        let channel = fx.dispatcher.channel_for(task.request_id());
        let (tx, rx) = mpsc::channel(16);

        let run = {
            let dispatcher = Arc::clone(&fx.dispatcher);
            tokio::spawn(async move { dispatcher.submit_and_stream(task, tx).await })
        };

        // act as the worker once the task shows up
        let mut tasks = fx.broker.consume(DEFAULT_TASK_QUEUE).await.unwrap();
        let delivery = tasks.next().await.unwrap().unwrap();
        let published = TaskEnvelope::from_payload(delivery.payload()).unwrap();
        delivery.ack().await.unwrap();
        assert_eq!(published.reply_to(), Some(channel.as_str()));

        fx.reply(&channel, ResultEnvelope::piece("Hel")).await;
        fx.reply(&channel, ResultEnvelope::piece("lo")).await;
        fx.reply(&channel, ResultEnvelope::complete("Hello")).await;

        assert_eq!(run.await.unwrap().unwrap(), "Hello");
        let events: Vec<_> = drain(rx).await.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::Fragment("Hel".into()),
                StreamEvent::Fragment("lo".into()),
                StreamEvent::Final("Hello".into()),
            ]
        );
        assert!(!fx.broker.exists(&channel));

        let record = fx.store.get_request(published.request_id()).await.unwrap().unwrap();
        assert_eq!(record.final_text.as_deref(), Some("Hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_and_still_deletes_channel() {
        let fx = fixture(Duration::from_secs(2));
        let task = fx.task().await;
        let channel = fx.dispatcher.channel_for(task.request_id());
        let (tx, rx) = mpsc::channel(4);

        let err = fx.dispatcher.submit_and_stream(task, tx).await.unwrap_err();
        assert!(matches!(err, RelayError::StreamTimeout(d) if d == Duration::from_secs(2)));
        assert!(!fx.broker.exists(&channel));

        let events = drain(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(RelayError::StreamTimeout(_))));
    }

    #[tokio::test]
    async fn invalid_task_is_rejected_before_publishing() {
        let fx = fixture(Duration::from_secs(1));
        let task = TaskEnvelope::new(RequestId::new(5), "   ", "m");
        let (tx, _rx) = mpsc::channel(4);

        let err = fx.dispatcher.submit_and_stream(task, tx).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidTask(_)));
        assert_eq!(fx.broker.depth(DEFAULT_TASK_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_envelope_is_skipped() {
        let fx = fixture(Duration::from_secs(5));
        let task = fx.task().await;
        let channel = fx.dispatcher.channel_for(task.request_id());
        fx.broker.declare(&channel).await.unwrap();
        fx.broker.publish(&channel, b"garbage".to_vec()).await.unwrap();
        fx.reply(&channel, ResultEnvelope::piece("ok")).await;
        fx.reply(&channel, ResultEnvelope::complete("ok")).await;

        let (tx, rx) = mpsc::channel(8);
        let text = fx.dispatcher.submit_and_stream(task, tx).await.unwrap();
        assert_eq!(text, "ok");
        assert_eq!(drain(rx).await.len(), 2);
    }

    #[tokio::test]
    async fn closed_sink_still_drains_to_final() {
        let fx = fixture(Duration::from_secs(5));
        let task = fx.task().await;
        let channel = fx.dispatcher.channel_for(task.request_id());
        fx.reply(&channel, ResultEnvelope::piece("a")).await;
        fx.reply(&channel, ResultEnvelope::piece("b")).await;
        fx.reply(&channel, ResultEnvelope::complete("ab")).await;

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let text = fx.dispatcher.submit_and_stream(task, tx).await.unwrap();
        assert_eq!(text, "ab");
        assert!(!fx.broker.exists(&channel));
        assert_eq!(fx.broker.unacked(&channel), 0);
    }

    #[tokio::test]
    async fn broker_drop_mid_stream_is_reported() {
        let fx = fixture(Duration::from_secs(5));
        let task = fx.task().await;
        let channel = fx.dispatcher.channel_for(task.request_id());
        let (tx, rx) = mpsc::channel(8);

        let run = {
            let dispatcher = Arc::clone(&fx.dispatcher);
            tokio::spawn(async move { dispatcher.submit_and_stream(task, tx).await })
        };
        fx.reply(&channel, ResultEnvelope::piece("partial")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.broker.disconnect();

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::BrokerUnavailable(_)));

        let events = drain(rx).await;
        assert_eq!(events.first().unwrap().as_ref().unwrap(), &StreamEvent::Fragment("partial".into()));
        assert!(events.last().unwrap().is_err());
    }

    #[tokio::test]
    async fn channel_delete_is_retried_after_a_broker_blip() {
        let fx = fixture_with_retry(
            Duration::from_secs(5),
            RetryPolicy::new(Duration::from_millis(50), 2.0, 3),
        );
        let task = fx.task().await;
        let channel = fx.dispatcher.channel_for(task.request_id());
        let (tx, rx) = mpsc::channel(8);

        let run = {
            let dispatcher = Arc::clone(&fx.dispatcher);
            tokio::spawn(async move { dispatcher.submit_and_stream(task, tx).await })
        };
        fx.reply(&channel, ResultEnvelope::piece("partial")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.broker.disconnect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        fx.broker.reconnect();

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::BrokerUnavailable(_)));
        assert!(!fx.broker.exists(&channel));
        assert!(drain(rx).await.last().unwrap().is_err());
    }
}
