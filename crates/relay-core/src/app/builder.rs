//! RelayBuilder - 部品のワイヤリング
//!
//! # Fail-fast 設計
//! - 必須の部品（broker / requests / explanations / cache / backend）が欠けていれば
//!   build() 時にまとめて BuildError を返す
//! - 設定は build() の前に検証する
//! - load sampler は任意（無ければコントローラを動かさない）

use std::sync::Arc;

use crate::app::controller::ConcurrencyController;
use crate::app::dispatcher::Dispatcher;
use crate::app::explanations::ExplanationResolver;
use crate::app::gate::AdmissionGate;
use crate::app::pipeline::TaskProcessor;
use crate::app::worker_group::WorkerGroup;
use crate::app::worker_loop::WorkerLoop;
use crate::config::RelayConfig;
use crate::domain::RelayError;
use crate::ports::{
    Broker, Cache, ChannelNaming, ExplanationStore, GenerationBackend, LoadSampler, PrefixNaming,
    RequestStore,
};

/// BuildError はワイヤリング時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing components: {0:?}. These must be provided before build().")]
    MissingComponents(Vec<&'static str>),

    #[error(transparent)]
    InvalidConfig(#[from] RelayError),
}

/// # 使用例
/// ```ignore
/// let relay = RelayBuilder::new(config)
///     .broker(broker)
///     .requests(store.clone())
///     .explanations(store)
///     .cache(cache)
///     .backend(backend)
///     .load_sampler(sampler)
///     .build()?;
/// let group = relay.start();
/// ```
pub struct RelayBuilder {
    config: RelayConfig,
    broker: Option<Arc<dyn Broker>>,
    requests: Option<Arc<dyn RequestStore>>,
    explanations: Option<Arc<dyn ExplanationStore>>,
    cache: Option<Arc<dyn Cache>>,
    backend: Option<Arc<dyn GenerationBackend>>,
    sampler: Option<Arc<dyn LoadSampler>>,
    naming: Option<Arc<dyn ChannelNaming>>,
}

impl RelayBuilder {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            broker: None,
            requests: None,
            explanations: None,
            cache: None,
            backend: None,
            sampler: None,
            naming: None,
        }
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn requests(mut self, requests: Arc<dyn RequestStore>) -> Self {
        self.requests = Some(requests);
        self
    }

    pub fn explanations(mut self, explanations: Arc<dyn ExplanationStore>) -> Self {
        self.explanations = Some(explanations);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn load_sampler(mut self, sampler: Arc<dyn LoadSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Defaults to `PrefixNaming` with the configured result prefix.
    pub fn naming(mut self, naming: Arc<dyn ChannelNaming>) -> Self {
        self.naming = Some(naming);
        self
    }

    pub fn build(self) -> Result<Relay, BuildError> {
        let mut missing = Vec::new();
        if self.broker.is_none() {
            missing.push("broker");
        }
        if self.requests.is_none() {
            missing.push("requests");
        }
        if self.explanations.is_none() {
            missing.push("explanations");
        }
        if self.cache.is_none() {
            missing.push("cache");
        }
        if self.backend.is_none() {
            missing.push("backend");
        }
        let (Some(broker), Some(requests), Some(explanations), Some(cache), Some(backend)) = (
            self.broker,
            self.requests,
            self.explanations,
            self.cache,
            self.backend,
        ) else {
            return Err(BuildError::MissingComponents(missing));
        };

        let config = self.config;
        config.validate()?;

        let naming = self.naming.unwrap_or_else(|| {
            Arc::new(PrefixNaming::new(config.queues.result_prefix.clone()))
        });
        let gate = Arc::new(AdmissionGate::new(
            config.concurrency.min,
            config.concurrency.max,
            config.concurrency.initial,
        )?);

        let resolver = ExplanationResolver::new(explanations, cache).with_ttl(config.cache_ttl);
        let processor = TaskProcessor::new(
            Arc::clone(&broker),
            Arc::clone(&requests),
            resolver,
            backend,
            Arc::clone(&naming),
        )
        .with_backend_retry(config.backend_retry.clone())
        .with_broker_retry(config.broker_retry.clone());

        let worker = Arc::new(WorkerLoop::new(
            Arc::clone(&broker),
            Arc::new(processor),
            Arc::clone(&gate),
            config.queues.task_queue.clone(),
        ));

        let controller = self.sampler.map(|sampler| {
            Arc::new(ConcurrencyController::new(
                Arc::clone(&gate),
                Arc::clone(&broker),
                sampler,
                config.queues.task_queue.clone(),
                config.controller.clone(),
            ))
        });

        let dispatcher = Arc::new(
            Dispatcher::new(Arc::clone(&broker), requests, naming)
                .with_task_queue(config.queues.task_queue.clone())
                .with_stream_timeout(config.stream_timeout)
                .with_broker_retry(config.broker_retry.clone()),
        );

        Ok(Relay {
            config,
            broker,
            gate,
            worker,
            controller,
            dispatcher,
        })
    }
}

/// Relay は 1 プロセス分の部品一式
pub struct Relay {
    pub config: RelayConfig,
    pub broker: Arc<dyn Broker>,
    pub gate: Arc<AdmissionGate>,
    pub worker: Arc<WorkerLoop>,
    pub controller: Option<Arc<ConcurrencyController>>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Relay {
    /// Spawn the worker loop (and controller, if any).
    pub fn start(&self) -> WorkerGroup {
        WorkerGroup::spawn(Arc::clone(&self.worker), self.controller.clone())
    }
}
