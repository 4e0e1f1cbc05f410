//! ProofGenerator port - CPU bound な証明生成ライブラリ
//!
//! 実装は重い計算を `spawn_blocking` などで runtime の外に逃がすこと。

use async_trait::async_trait;

use crate::domain::{ProveError, Randomness, SectorId};

#[async_trait]
pub trait ProofGenerator: Send + Sync {
    async fn compute(&self, sectors: &[SectorId], seed: &Randomness) -> Result<Vec<u8>, ProveError>;

    async fn verify(&self, sectors: &[SectorId], seed: &Randomness, proof: &[u8]) -> bool;
}
