//! TaskProcessor - 1 タスク分の処理
//!
//! # フロー
//! 1. 説明文を解決（キャッシュ → ストア）
//! 2. 指示文を組み立て
//! 3. 生成バックエンドをストリーミングで呼び、断片が届くたびに非 final の envelope を publish
//! 4. final envelope（全断片の連結）を publish
//! 5. 最終テキストと実際に使った説明文のバージョンを保存
//!
//! バックエンドのリトライは、まだ 1 断片も publish していないときだけ行います。
//! 途中まで流した断片は取り消しません。

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use crate::app::explanations::ExplanationResolver;
use crate::app::prompt::build_instruction;
use crate::app::retry::{RetryPolicy, retry_transient};
use crate::domain::{ExplanationVersions, RelayError, RequestId, ResultEnvelope, TaskEnvelope};
use crate::ports::{Broker, ChannelNaming, GenerationBackend, RequestStore};

/// What one successful task produced.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub request_id: RequestId,
    pub fragments: usize,
    pub final_text: String,
    pub explanation_versions: ExplanationVersions,
}

pub struct TaskProcessor {
    broker: Arc<dyn Broker>,
    requests: Arc<dyn RequestStore>,
    resolver: ExplanationResolver,
    backend: Arc<dyn GenerationBackend>,
    naming: Arc<dyn ChannelNaming>,
    backend_retry: RetryPolicy,
    broker_retry: RetryPolicy,
}

impl TaskProcessor {
    pub fn new(
        broker: Arc<dyn Broker>,
        requests: Arc<dyn RequestStore>,
        resolver: ExplanationResolver,
        backend: Arc<dyn GenerationBackend>,
        naming: Arc<dyn ChannelNaming>,
    ) -> Self {
        Self {
            broker,
            requests,
            resolver,
            backend,
            naming,
            backend_retry: RetryPolicy::default(),
            broker_retry: RetryPolicy::default(),
        }
    }

    pub fn with_backend_retry(mut self, policy: RetryPolicy) -> Self {
        self.backend_retry = policy;
        self
    }

    pub fn with_broker_retry(mut self, policy: RetryPolicy) -> Self {
        self.broker_retry = policy;
        self
    }

    pub fn broker_retry(&self) -> &RetryPolicy {
        &self.broker_retry
    }

    /// Return channel for a task: the address stamped by the dispatcher,
    /// or the one derived from its id.
    pub fn channel_for(&self, task: &TaskEnvelope) -> String {
        match task.reply_to() {
            Some(channel) => channel.to_string(),
            None => self.naming.channel_for(task.request_id()),
        }
    }

    pub async fn process(&self, task: &TaskEnvelope) -> Result<TaskReport, RelayError> {
        task.validate()?;
        let request_id = task.request_id();
        let channel = self.channel_for(task);

        let resolved = self.resolver.resolve_for(task).await?;
        let instruction = build_instruction(task.input_text(), task.parameters(), &resolved.by_scale);

        let mut text = String::new();
        let mut fragments = 0usize;
        let mut attempt = 1;
        loop {
            match self
                .stream_once(task, &instruction, &channel, &mut text, &mut fragments)
                .await
            {
                Ok(()) => break,
                Err(err)
                    if err.is_transient()
                        && fragments == 0
                        && attempt < self.backend_retry.max_attempts =>
                {
                    let delay = self.backend_retry.next_delay(attempt);
                    warn!(
                        request_id = %request_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "generation failed before first fragment, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }

        self.publish(&channel, &ResultEnvelope::complete(text.clone()))
            .await?;

        let explanation_versions = resolved.versions();
        self.requests
            .save_final_result(request_id, &text, &explanation_versions)
            .await?;

        debug!(request_id = %request_id, fragments, "task finished");
        Ok(TaskReport {
            request_id,
            fragments,
            final_text: text,
            explanation_versions,
        })
    }

    async fn stream_once(
        &self,
        task: &TaskEnvelope,
        instruction: &str,
        channel: &str,
        text: &mut String,
        fragments: &mut usize,
    ) -> Result<(), RelayError> {
        let mut stream = self
            .backend
            .stream_completion(task.model_name(), instruction)
            .await?;

        while let Some(fragment) = stream.next().await {
            let fragment = fragment?;
            if fragment.is_empty() {
                continue;
            }
            self.publish(channel, &ResultEnvelope::piece(fragment.as_str()))
                .await?;
            text.push_str(&fragment);
            *fragments += 1;
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, envelope: &ResultEnvelope) -> Result<(), RelayError> {
        let payload = envelope.to_payload()?;
        let broker = &self.broker;
        retry_transient(&self.broker_retry, "publish result", |_| {
            let payload = payload.clone();
            async move { broker.publish(channel, payload).await }
        })
        .await
    }
}
