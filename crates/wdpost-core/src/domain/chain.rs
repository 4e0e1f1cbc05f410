//! Chain primitives: epochs, block ids, heads, addresses and randomness.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Chain height. Signed so that `height - lag` never underflows.
pub type ChainEpoch = i64;

/// Fee and balance amounts (smallest token unit).
pub type TokenAmount = u64;

/// Identifier of the block (tipset) at a given height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub [u8; 32]);

impl BlockId {
    /// Deterministic id for simulated chains: `sha256(fork || epoch)`.
    pub fn synthetic(fork: u64, epoch: ChainEpoch) -> Self {
        let mut h = Sha256::new();
        h.update(fork.to_be_bytes());
        h.update(epoch.to_be_bytes());
        Self(h.finalize().into())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..6]))
    }
}

/// A chain head as observed at `height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    pub height: ChainEpoch,
    pub block: BlockId,
}

impl Head {
    pub fn new(height: ChainEpoch, block: BlockId) -> Self {
        Self { height, block }
    }
}

/// An account address (`f01000`, `f3...`). Opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Challenge seed for one deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Randomness(pub [u8; 32]);

impl Randomness {
    /// Derives the seed from the block at the challenge epoch. A reorg that
    /// replaces that block changes the seed.
    pub fn derive(block: &BlockId, provider: &Address, epoch: ChainEpoch) -> Self {
        let mut h = Sha256::new();
        h.update(b"wdpost-challenge");
        h.update(block.0);
        h.update(provider.as_str().as_bytes());
        h.update(epoch.to_be_bytes());
        Self(h.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn randomness_follows_the_block() {
        let provider = Address::new("f01000");
        let a = Randomness::derive(&BlockId::synthetic(0, 10), &provider, 10);
        let b = Randomness::derive(&BlockId::synthetic(1, 10), &provider, 10);
        let again = Randomness::derive(&BlockId::synthetic(0, 10), &provider, 10);

        assert_ne!(a, b);
        assert_eq!(a, again);
    }

    #[test]
    fn address_serializes_as_plain_string() {
        let s = serde_json::to_string(&Address::new("f01000")).unwrap();
        assert_eq!(s, "\"f01000\"");
    }
}
