//! WorkerLoop - 共有タスクキューからの取り込みループ
//!
//! # フロー
//! 1. AdmissionGate に空きが出るまで待つ（枠はまだ取らない）
//! 2. タスクキューから次の delivery を受け取る
//! 3. 枠を取り、枠ごと別タスクに渡して処理（取り込みはすぐ次へ進む）
//! 4. 処理が終わったら ack。失敗したタスクは dead-letter キューへ送ってから ack
//! 5. 枠は permit の drop で必ず返る
//!
//! 空きを確認してから受け取るので、待っている間に未 ack のメッセージを抱え込みません。
//! 待機中は in_flight に数えません。

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::app::gate::{AdmissionGate, AdmissionPermit};
use crate::app::pipeline::TaskProcessor;
use crate::app::retry::retry_transient;
use crate::domain::{DeadLetter, RelayError, TaskEnvelope, dead_letter_queue};
use crate::ports::{Broker, Delivery, DeliveryStream};

pub struct WorkerLoop {
    broker: Arc<dyn Broker>,
    processor: Arc<TaskProcessor>,
    gate: Arc<AdmissionGate>,
    task_queue: String,
    dead_letter_queue: String,
}

impl WorkerLoop {
    pub fn new(
        broker: Arc<dyn Broker>,
        processor: Arc<TaskProcessor>,
        gate: Arc<AdmissionGate>,
        task_queue: impl Into<String>,
    ) -> Self {
        let task_queue = task_queue.into();
        Self {
            broker,
            processor,
            gate,
            dead_letter_queue: dead_letter_queue(&task_queue),
            task_queue,
        }
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    /// Take tasks until shutdown, then wait for in-flight ones.
    ///
    /// Returns an error only when the broker stays unreachable after the
    /// retry policy is exhausted.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        let mut deliveries = self.subscribe().await?;
        let mut running = JoinSet::new();
        info!(queue = %self.task_queue, capacity = self.gate.capacity(), "worker loop started");

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    continue;
                }
                _ = self.gate.wait_for_slot() => {}
            }

            let next = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    continue;
                }
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!(error = %e, "task stream interrupted; resubscribing");
                    match self.subscribe().await {
                        Ok(stream) => {
                            deliveries = stream;
                            continue;
                        }
                        Err(e) => break Err(e),
                    }
                }
                None => {
                    warn!("task stream ended; resubscribing");
                    match self.subscribe().await {
                        Ok(stream) => {
                            deliveries = stream;
                            continue;
                        }
                        Err(e) => break Err(e),
                    }
                }
            };

            // a shrink may have taken the slot while the delivery was pending
            let permit = match AdmissionGate::try_acquire(&self.gate) {
                Some(permit) => permit,
                None => tokio::select! {
                    permit = AdmissionGate::admit(&self.gate) => permit,
                    _ = shutdown.changed() => {
                        if let Err(e) = delivery.reject(true).await {
                            warn!(error = %e, "could not requeue task on shutdown");
                        }
                        break Ok(());
                    }
                },
            };

            let this = Arc::clone(&self);
            running.spawn(async move { this.handle(delivery, permit).await });

            while let Some(joined) = running.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "task execution panicked");
                }
            }
        };

        info!(in_flight = running.len(), "worker loop stopping; waiting for in-flight tasks");
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "task execution panicked");
            }
        }
        result
    }

    async fn subscribe(&self) -> Result<DeliveryStream, RelayError> {
        let broker = &self.broker;
        let queue = self.task_queue.as_str();
        retry_transient(self.processor.broker_retry(), "consume task queue", |_| async move {
            broker.consume(queue).await
        })
        .await
    }

    async fn handle(&self, delivery: Box<dyn Delivery>, permit: AdmissionPermit) {
        let task = match TaskEnvelope::from_payload(delivery.payload()) {
            Ok(task) => task,
            Err(e) => {
                warn!(error = %e, "undecodable task");
                let letter = DeadLetter::undecodable(delivery.payload(), &e);
                self.bury(delivery, letter).await;
                return;
            }
        };

        let request_id = task.request_id();
        match self.processor.process(&task).await {
            Ok(report) => {
                info!(
                    request_id = %request_id,
                    fragments = report.fragments,
                    "task completed"
                );
                if let Err(e) = delivery.ack().await {
                    warn!(request_id = %request_id, error = %e, "ack failed; task may be redelivered");
                }
                permit.succeed();
            }
            Err(e) => {
                error!(request_id = %request_id, error = %e, transient = e.is_transient(), "task failed");
                let letter = DeadLetter::for_task(task, &e);
                self.bury(delivery, letter).await;
            }
        }
    }

    /// Dead-letter then ack; if the dead letter cannot be written, requeue.
    async fn bury(&self, delivery: Box<dyn Delivery>, letter: DeadLetter) {
        let published = match letter.to_payload() {
            Ok(payload) => self.broker.publish(&self.dead_letter_queue, payload).await,
            Err(e) => Err(e),
        };
        let settled = match published {
            Ok(()) => delivery.ack().await,
            Err(e) => {
                warn!(queue = %self.dead_letter_queue, error = %e, "dead letter not written; requeueing task");
                delivery.reject(true).await
            }
        };
        if let Err(e) = settled {
            warn!(error = %e, "could not settle failed task");
        }
    }
}
