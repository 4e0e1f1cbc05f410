//! Chain ports - chain-state reader, message pool, wallet.
//!
//! どれも外部の full node に対する読み取り専用 / 送信専用の窓口。

use async_trait::async_trait;

use crate::domain::{
    Address, BlockId, ChainEpoch, ChainError, DeadlineAssignment, Head, Receipt, SignedMessage,
    TokenAmount,
};

#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn current_head(&self) -> Result<Head, ChainError>;

    /// Block id of the canonical chain at `epoch`.
    async fn head_at(&self, epoch: ChainEpoch) -> Result<BlockId, ChainError>;

    /// The provider's deadline current at `epoch` and its partitions.
    async fn deadline_assignment(
        &self,
        provider: &Address,
        epoch: ChainEpoch,
    ) -> Result<DeadlineAssignment, ChainError>;
}

#[async_trait]
pub trait MessagePool: Send + Sync {
    /// Fee the payload needs at current chain conditions.
    async fn estimate_fee(&self, payload: &[u8]) -> Result<TokenAmount, ChainError>;

    /// Next nonce the chain expects from `from`.
    async fn next_nonce(&self, from: &Address) -> Result<u64, ChainError>;

    /// Re-broadcasting the same (from, nonce) is idempotent.
    async fn broadcast(&self, msg: &SignedMessage) -> Result<(), ChainError>;

    async fn lookup(&self, from: &Address, nonce: u64) -> Result<Option<Receipt>, ChainError>;
}

#[async_trait]
pub trait WalletReader: Send + Sync {
    async fn balance(&self, addr: &Address) -> Result<TokenAmount, ChainError>;
}
