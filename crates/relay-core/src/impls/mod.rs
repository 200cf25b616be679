//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryBroker**: プロセス内ブローカー（開発・テスト用）
//! - **InMemoryStore**: リクエスト記録と説明文の正本（開発・テスト用）
//! - **InMemoryCache**: TTL 付き KV キャッシュ
//! - **ScriptedBackend**: 台本どおりに断片を返す生成バックエンド
//! - **OpenAiBackend**: OpenAI 互換 API のストリーミング呼び出し
//! - **SystemLoadSampler**: sysinfo による CPU・メモリ使用率
//!
//! # 本番用実装
//! AMQP ブローカーや Postgres ストアは別クレートに配置します。

pub mod inmem_broker;
pub mod inmem_cache;
pub mod inmem_store;
pub mod openai_backend;
pub mod scripted_backend;
pub mod sysinfo_sampler;

pub use self::inmem_broker::InMemoryBroker;
pub use self::inmem_cache::{DEFAULT_CACHE_TTL, InMemoryCache};
pub use self::inmem_store::InMemoryStore;
pub use self::openai_backend::{DEFAULT_OPENAI_BASE_URL, OpenAiBackend};
pub use self::scripted_backend::{Script, ScriptedBackend};
pub use self::sysinfo_sampler::SystemLoadSampler;
