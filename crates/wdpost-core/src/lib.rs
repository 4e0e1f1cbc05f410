//! wdpost-core
//!
//! Window PoSt の証明・提出パイプラインの部品。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（chain, deadline, task, outbox, health, cursor, errors, alert）
//! - **ports**: 抽象化レイヤー（TaskStore, OutboxStore, CursorStore, ChainReader, ProofGenerator, など）
//! - **typed**: 型付き Task API（Task trait, Handler trait, TypedRegistry）
//! - **app**: TaskEngine, ChainScheduler, AppBuilder, status
//! - **wdpost**: compute / submit task, FaultTracker, AddressSelector
//! - **message**: outbox 経由の MessageSender
//! - **impls**: in-memory / simulated / PostgreSQL 実装
//! - **config**: TOML 設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod message;
pub mod ports;
pub mod typed;
pub mod wdpost;
