//! Address Selector - 手数料を払う sender アドレスの選択
//!
//! fee ceiling は絶対上限。超えるなら残高を見るまでもなく Unaffordable。

use std::sync::Arc;

use tracing::debug;

use crate::domain::{Address, TaskError, TokenAmount};
use crate::ports::WalletReader;

pub struct AddressSelector {
    wallet: Arc<dyn WalletReader>,
}

impl AddressSelector {
    pub fn new(wallet: Arc<dyn WalletReader>) -> Self {
        Self { wallet }
    }

    /// Picks the candidate with the largest balance that covers `fee`.
    ///
    /// - `fee > max_fee`: `Unaffordable` (terminal)
    /// - no candidate covers `fee`: `InsufficientFunds` (terminal as well)
    pub async fn select(
        &self,
        candidates: &[Address],
        fee: TokenAmount,
        max_fee: TokenAmount,
    ) -> Result<Address, TaskError> {
        if fee > max_fee {
            return Err(TaskError::Unaffordable {
                required: fee,
                max_fee,
            });
        }

        let mut best: Option<(TokenAmount, &Address)> = None;
        for addr in candidates {
            let balance = self.wallet.balance(addr).await?;
            debug!(address = %addr, balance, fee, "sender candidate");
            if balance >= fee && best.is_none_or(|(b, _)| balance > b) {
                best = Some((balance, addr));
            }
        }
        best.map(|(_, addr)| addr.clone())
            .ok_or(TaskError::InsufficientFunds { required: fee })
    }
}
