//! relay-core
//!
//! Broker-mediated streaming task relay with adaptive worker concurrency.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task / result envelopes, explanation, request, errors）
//! - **ports**: 抽象化レイヤー（Broker, RequestStore, ExplanationStore, Cache, GenerationBackend, LoadSampler, ChannelNaming）
//! - **app**: アプリケーションロジック（dispatcher, worker_loop, pipeline, gate, controller, builder）
//! - **impls**: 実装（InMemoryBroker など開発用、OpenAiBackend、SystemLoadSampler）
//! - **config**: 検証済みの実行時設定
//! - **observability**: ステータスのスナップショット

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;

pub use app::{Dispatcher, Relay, RelayBuilder, WorkerGroup};
pub use config::RelayConfig;
pub use domain::{RelayError, ResultEnvelope, StreamEvent, TaskEnvelope};
pub use observability::WorkerStatus;
