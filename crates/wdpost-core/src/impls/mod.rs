//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **MemoryTaskStore / MemoryOutbox / MemoryCursorStore**: 単一プロセス・テスト用の正本
//! - **TracingAlertSink / MemoryAlertSink**: アラートの出力先
//! - **SimChain / SimProver / SimSectorStorage**: full node・証明ライブラリ・ストレージの模擬
//! - **verifreg**: verified registry state のバージョン別アダプタ
//!
//! # 本番用実装
//! - `pg`: PostgreSQL（feature = "postgres"）

pub mod alert;
pub mod memory_cursor;
pub mod memory_outbox;
pub mod memory_task_store;
#[cfg(feature = "postgres")]
pub mod pg;
pub mod sim;
pub mod verifreg;

pub use self::alert::{MemoryAlertSink, TracingAlertSink};
pub use self::memory_cursor::MemoryCursorStore;
pub use self::memory_outbox::MemoryOutbox;
pub use self::memory_task_store::MemoryTaskStore;
pub use self::sim::{SimChain, SimProver, SimSectorStorage};
pub use self::verifreg::{
    RemoveDataCapProposal, StateV8, StateV10, VerifregV8, VerifregV10, load_verifreg,
};
