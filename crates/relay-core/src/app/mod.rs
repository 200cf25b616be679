//! App - アプリケーション層
//!
//! ports を組み合わせてリレーの振る舞いを実装します。
//!
//! # 主要コンポーネント
//! - **Dispatcher**: タスク投入と結果ストリームの中継（プロデューサ側）
//! - **WorkerLoop**: タスクキューからの取り込み（コンシューマ側）
//! - **TaskProcessor**: 1 タスク分の処理（説明文解決 → 指示文 → 生成 → 断片 publish → 保存）
//! - **AdmissionGate**: 同時実行数の上限
//! - **ConcurrencyController**: 負荷に応じた capacity の増減
//! - **WorkerGroup**: ループ群の起動と停止
//! - **RelayBuilder**: ワイヤリング

pub mod builder;
pub mod controller;
pub mod dispatcher;
pub mod explanations;
pub mod gate;
pub mod pipeline;
pub mod prompt;
pub mod retry;
pub mod worker_group;
pub mod worker_loop;

pub use self::builder::{BuildError, Relay, RelayBuilder};
pub use self::controller::{Adjustment, ConcurrencyController, ControllerSettings, decide};
pub use self::dispatcher::{Dispatcher, EventSink};
pub use self::explanations::{ExplanationResolver, ResolvedExplanations, cache_key};
pub use self::gate::{AdmissionGate, AdmissionPermit};
pub use self::pipeline::{TaskProcessor, TaskReport};
pub use self::prompt::build_instruction;
pub use self::retry::{MAX_RETRY_DELAY, RetryPolicy, retry_transient};
pub use self::worker_group::{WorkerGroup, wait_for_broker};
pub use self::worker_loop::WorkerLoop;
