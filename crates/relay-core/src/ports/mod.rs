//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。
//! 各 trait は外部システム（メッセージブローカー、DB、キャッシュ、生成 API）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - ブローカーがワーカーとディスパッチャをつなぐ唯一の経路
//! - DB が正本（リクエスト記録・説明文のバージョン）
//! - キャッシュは説明文の参照をメモ化するだけ（消えても正しさに影響しない）

pub mod backend;
pub mod broker;
pub mod cache;
pub mod load;
pub mod naming;
pub mod store;

pub use self::backend::{FragmentStream, GenerationBackend};
pub use self::broker::{Broker, Delivery, DeliveryStream};
pub use self::cache::Cache;
pub use self::load::{LoadSample, LoadSampler};
pub use self::naming::{ChannelNaming, DEFAULT_RESULT_PREFIX, DEFAULT_TASK_QUEUE, PrefixNaming};
pub use self::store::{ExplanationStore, RequestStore};
