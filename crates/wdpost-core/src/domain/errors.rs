//! Errors - エラー型と分類
//!
//! 失敗は 4 種類に分類される（運用上の扱いが異なる）:
//! - Transient: 一時的（バックオフ付きでリトライ）
//! - SectorSpecific: 1 セクターだけの問題（除外して続行）
//! - Terminal: リトライしても結果が変わらない（失敗 + アラート）
//! - Fatal: インフラ障害（該当コンポーネントを停止）

use thiserror::Error;

use super::chain::{Address, ChainEpoch, TokenAmount};
use super::deadline::SectorId;
use super::ids::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    SectorSpecific,
    Terminal,
    Fatal,
}

/// Errors from a database-backed store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record encoding: {0}")]
    Codec(String),
}

/// Errors from the chain-state reader and message pool.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain api unavailable: {0}")]
    Unavailable(String),

    #[error("no block at epoch {0}")]
    NoBlock(ChainEpoch),

    #[error("broadcast rejected: {0}")]
    Broadcast(String),
}

/// Errors from the proof generator.
#[derive(Debug, Error)]
pub enum ProveError {
    /// Named sectors could not be proven; the rest may still be.
    #[error("sectors {sectors:?} failed proving: {reason}")]
    Sectors { sectors: Vec<SectorId>, reason: String },

    /// Not tied to any sector (resource exhaustion, GPU loss, ...).
    #[error("prover resources: {0}")]
    Resource(String),
}

/// Outcome of a task handler.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("no provable sectors remain for deadline {deadline} of {provider}")]
    NoProvableSectors { provider: Address, deadline: u64 },

    #[error("deadline {deadline} of {provider} closed at epoch {close}")]
    DeadlineExpired {
        provider: Address,
        deadline: u64,
        close: ChainEpoch,
    },

    #[error("fault declarations for deadline {deadline} of {provider} closed at epoch {cutoff}")]
    DeclarationCutoff {
        provider: Address,
        deadline: u64,
        cutoff: ChainEpoch,
    },

    #[error("no sender can pay fee {required} within ceiling {max_fee}")]
    Unaffordable {
        required: TokenAmount,
        max_fee: TokenAmount,
    },

    #[error("no sender address holds {required} for the fee")]
    InsufficientFunds { required: TokenAmount },

    #[error("invalid task params: {0}")]
    Params(String),

    #[error(transparent)]
    Prove(#[from] ProveError),

    #[error("proof failed verification for deadline {deadline}")]
    ProofRejected { deadline: u64 },

    #[error("message {0} failed: {1}")]
    MessageFailed(MessageId, String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::NoProvableSectors { .. }
            | TaskError::DeadlineExpired { .. }
            | TaskError::DeclarationCutoff { .. }
            | TaskError::Unaffordable { .. }
            | TaskError::InsufficientFunds { .. }
            | TaskError::Params(_) => ErrorKind::Terminal,
            TaskError::Prove(ProveError::Sectors { .. }) => ErrorKind::SectorSpecific,
            TaskError::Prove(ProveError::Resource(_))
            | TaskError::ProofRejected { .. }
            | TaskError::MessageFailed(..)
            | TaskError::Store(_)
            | TaskError::Chain(_) => ErrorKind::Transient,
        }
    }

    /// Terminal errors are decided by time or fact; everything else may
    /// succeed on another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::Terminal
    }
}
