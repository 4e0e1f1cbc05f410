//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。外部システム（データベース、
//! full node、証明ライブラリ、ストレージ、アラート先）への窓口を trait で
//! 定義し、実装の詳細を隠す。
//!
//! # 設計原則
//! - データベースが task 所有権と outbox 状態の唯一の正本
//! - worker 同士は直接通信しない（すべて TaskStore / OutboxStore 経由）

pub mod actor_state;
pub mod alert_sink;
pub mod chain;
pub mod clock;
pub mod cursor_store;
pub mod id_generator;
pub mod outbox_store;
pub mod prover;
pub mod sector_storage;
pub mod task_store;

pub use self::actor_state::{
    ActorStateError, ActorsVersion, Allocation, AllocationId, Claim, ClaimId, DataCap,
    VerifiedRegistryState, VisitResult,
};
pub use self::alert_sink::AlertSink;
pub use self::chain::{ChainReader, MessagePool, WalletReader};
pub use self::clock::{Clock, FixedClock, SystemClock, after, to_chrono};
pub use self::cursor_store::CursorStore;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::outbox_store::OutboxStore;
pub use self::prover::ProofGenerator;
pub use self::sector_storage::SectorStorage;
pub use self::task_store::{TaskCounts, TaskStore};
