//! SectorStorage port - セクターの到達性チェック

use async_trait::async_trait;

use crate::domain::SectorId;

#[async_trait]
pub trait SectorStorage: Send + Sync {
    /// Reads enough of the sector (metadata, a challenge leaf) to tell it is
    /// there. `Err` carries the reason it is not.
    async fn check(&self, sector: SectorId) -> Result<(), String>;
}
