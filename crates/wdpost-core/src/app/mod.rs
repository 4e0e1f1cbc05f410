//! App - アプリケーション層
//!
//! ports を組み合わせてアプリケーションロジックを実装する。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: TaskEngine の構築とワイヤリング（起動時検証つき）
//! - **TaskEngine**: claim → handle → complete/retry/fail のポーリングループ
//! - **ChainScheduler**: chain head ごとの epoch 発火（reorg 対応）
//! - **RetryPolicy**: 指数バックオフ
//! - **status**: 件数ビュー

pub mod builder;
pub mod chainsched;
pub mod engine;
pub mod retry;
pub mod status;

pub use self::builder::{AppBuilder, BuildError};
pub use self::chainsched::{ChainScheduler, EpochCallback, SchedulerConfig, SchedulerError};
pub use self::engine::{EngineConfig, TaskEngine};
pub use self::retry::RetryPolicy;
