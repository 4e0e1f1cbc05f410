//! Simulated chain, prover and sector storage.
//!
//! 単一プロセスのデモ (`wdpost-cli run`) とテストで使う。状態はすべて
//! 手で操作できる（head を進める、reorg を起こす、fee を変える、
//! セクターを壊す）。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::{
    Address, BlockId, ChainEpoch, ChainError, DeadlineAssignment, Head, ProveError, Randomness,
    Receipt, SectorId, SignedMessage, TokenAmount,
};
use crate::ports::{ChainReader, MessagePool, ProofGenerator, SectorStorage, WalletReader};

struct SimChainState {
    height: ChainEpoch,
    fork: u64,
    blocks: BTreeMap<ChainEpoch, BlockId>,
    assignments: HashMap<Address, Vec<DeadlineAssignment>>,
    fee: TokenAmount,
    balances: HashMap<Address, TokenAmount>,
    /// Next nonce the chain expects per sender.
    nonces: HashMap<Address, u64>,
    receipts: HashMap<(Address, u64), Receipt>,
    mempool: Vec<SignedMessage>,
    broadcasts: Vec<SignedMessage>,
    auto_include: bool,
    failing_broadcasts: u32,
    subscribers: Vec<mpsc::Sender<Head>>,
}

impl SimChainState {
    fn head(&self) -> Head {
        let block = self
            .blocks
            .get(&self.height)
            .copied()
            .unwrap_or_else(|| BlockId::synthetic(self.fork, self.height));
        Head::new(self.height, block)
    }

    fn include(&mut self, msg: SignedMessage) {
        let next = self.nonces.entry(msg.from.clone()).or_insert(0);
        *next = (*next).max(msg.nonce + 1);
        self.receipts.insert(
            (msg.from, msg.nonce),
            Receipt {
                epoch: self.height,
                exit_code: 0,
            },
        );
    }

    fn publish(&mut self) {
        let head = self.head();
        // a full channel drops the head; subscribers catch up from the next one
        self.subscribers
            .retain(|tx| !matches!(tx.try_send(head), Err(mpsc::error::TrySendError::Closed(_))));
    }
}

/// Simulated full node: chain reader, message pool and wallet in one.
pub struct SimChain {
    state: Mutex<SimChainState>,
}

impl SimChain {
    /// Chain at `height` with blocks from epoch 0.
    pub fn new(height: ChainEpoch) -> Self {
        let blocks = (0..=height).map(|e| (e, BlockId::synthetic(0, e))).collect();
        Self {
            state: Mutex::new(SimChainState {
                height,
                fork: 0,
                blocks,
                assignments: HashMap::new(),
                fee: 0,
                balances: HashMap::new(),
                nonces: HashMap::new(),
                receipts: HashMap::new(),
                mempool: Vec::new(),
                broadcasts: Vec::new(),
                auto_include: true,
                failing_broadcasts: 0,
                subscribers: Vec::new(),
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SimChainState) -> R) -> R {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// New heads are pushed here as the chain advances or reorgs.
    pub fn subscribe(&self) -> mpsc::Receiver<Head> {
        let (tx, rx) = mpsc::channel(64);
        self.with_state(|s| s.subscribers.push(tx));
        rx
    }

    pub fn head(&self) -> Head {
        self.with_state(|s| s.head())
    }

    /// Appends `n` blocks on the current fork.
    pub fn advance(&self, n: ChainEpoch) -> Head {
        self.with_state(|s| {
            for _ in 0..n {
                s.height += 1;
                let block = BlockId::synthetic(s.fork, s.height);
                s.blocks.insert(s.height, block);
            }
            s.publish();
            s.head()
        })
    }

    /// Replaces every block from `from` up to the current height.
    pub fn reorg(&self, from: ChainEpoch) -> Head {
        self.with_state(|s| {
            s.fork += 1;
            debug!(from, fork = s.fork, "simulated reorg");
            for e in from..=s.height {
                s.blocks.insert(e, BlockId::synthetic(s.fork, e));
            }
            s.publish();
            s.head()
        })
    }

    pub fn add_assignment(&self, assignment: DeadlineAssignment) {
        self.with_state(|s| {
            s.assignments
                .entry(assignment.provider.clone())
                .or_default()
                .push(assignment)
        });
    }

    pub fn set_fee(&self, fee: TokenAmount) {
        self.with_state(|s| s.fee = fee);
    }

    pub fn set_balance(&self, addr: &Address, balance: TokenAmount) {
        self.with_state(|s| s.balances.insert(addr.clone(), balance));
    }

    pub fn set_next_nonce(&self, addr: &Address, nonce: u64) {
        self.with_state(|s| s.nonces.insert(addr.clone(), nonce));
    }

    /// With auto-include off, broadcasts wait in the mempool.
    pub fn set_auto_include(&self, on: bool) {
        self.with_state(|s| s.auto_include = on);
    }

    /// The next `n` broadcasts are rejected.
    pub fn fail_next_broadcasts(&self, n: u32) {
        self.with_state(|s| s.failing_broadcasts = n);
    }

    /// Includes everything waiting in the mempool at the current height.
    pub fn include_pending(&self) {
        self.with_state(|s| {
            for msg in std::mem::take(&mut s.mempool) {
                s.include(msg);
            }
        });
    }

    /// Every accepted broadcast, re-broadcasts included.
    pub fn broadcasts(&self) -> Vec<SignedMessage> {
        self.with_state(|s| s.broadcasts.clone())
    }
}

#[async_trait]
impl ChainReader for SimChain {
    async fn current_head(&self) -> Result<Head, ChainError> {
        Ok(self.head())
    }

    async fn head_at(&self, epoch: ChainEpoch) -> Result<BlockId, ChainError> {
        self.with_state(|s| {
            if epoch > s.height {
                return Err(ChainError::NoBlock(epoch));
            }
            s.blocks.get(&epoch).copied().ok_or(ChainError::NoBlock(epoch))
        })
    }

    async fn deadline_assignment(
        &self,
        provider: &Address,
        epoch: ChainEpoch,
    ) -> Result<DeadlineAssignment, ChainError> {
        self.with_state(|s| {
            let assignments = s
                .assignments
                .get(provider)
                .ok_or_else(|| ChainError::Unavailable(format!("unknown provider {provider}")))?;
            // current deadline, else the next one to open
            assignments
                .iter()
                .find(|a| a.deadline.is_challenge_open(epoch))
                .or_else(|| {
                    assignments
                        .iter()
                        .filter(|a| a.deadline.challenge > epoch)
                        .min_by_key(|a| a.deadline.challenge)
                })
                .cloned()
                .ok_or_else(|| {
                    ChainError::Unavailable(format!("no deadline for {provider} at {epoch}"))
                })
        })
    }
}

#[async_trait]
impl MessagePool for SimChain {
    async fn estimate_fee(&self, _payload: &[u8]) -> Result<TokenAmount, ChainError> {
        Ok(self.with_state(|s| s.fee))
    }

    async fn next_nonce(&self, from: &Address) -> Result<u64, ChainError> {
        Ok(self.with_state(|s| s.nonces.get(from).copied().unwrap_or(0)))
    }

    async fn broadcast(&self, msg: &SignedMessage) -> Result<(), ChainError> {
        self.with_state(|s| {
            if s.failing_broadcasts > 0 {
                s.failing_broadcasts -= 1;
                return Err(ChainError::Broadcast("simulated rejection".into()));
            }
            s.broadcasts.push(msg.clone());
            if s.receipts.contains_key(&(msg.from.clone(), msg.nonce)) {
                return Ok(());
            }
            if s.auto_include {
                s.include(msg.clone());
            } else if !s.mempool.iter().any(|m| m.from == msg.from && m.nonce == msg.nonce) {
                s.mempool.push(msg.clone());
            }
            Ok(())
        })
    }

    async fn lookup(&self, from: &Address, nonce: u64) -> Result<Option<Receipt>, ChainError> {
        Ok(self.with_state(|s| s.receipts.get(&(from.clone(), nonce)).copied()))
    }
}

#[async_trait]
impl WalletReader for SimChain {
    async fn balance(&self, addr: &Address) -> Result<TokenAmount, ChainError> {
        Ok(self.with_state(|s| s.balances.get(addr).copied().unwrap_or(0)))
    }
}

/// Proof generator whose proof is `sha256(seed || sector ids)`.
#[derive(Default)]
pub struct SimProver {
    failing: Mutex<HashSet<SectorId>>,
    resource_failures: AtomicUsize,
    computes: AtomicUsize,
}

impl SimProver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Proving any of these sectors reports them as failed.
    pub fn fail_sectors(&self, sectors: impl IntoIterator<Item = SectorId>) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.extend(sectors);
        }
    }

    /// The next `n` computes fail with a resource error.
    pub fn fail_resources(&self, n: usize) {
        self.resource_failures.store(n, Ordering::SeqCst);
    }

    pub fn computes(&self) -> usize {
        self.computes.load(Ordering::SeqCst)
    }

    fn digest(sectors: &[SectorId], seed: &Randomness) -> Vec<u8> {
        let mut h = Sha256::new();
        h.update(seed.0);
        for s in sectors {
            h.update(s.0.to_be_bytes());
        }
        h.finalize().to_vec()
    }
}

#[async_trait]
impl ProofGenerator for SimProver {
    async fn compute(&self, sectors: &[SectorId], seed: &Randomness) -> Result<Vec<u8>, ProveError> {
        self.computes.fetch_add(1, Ordering::SeqCst);
        let left = self.resource_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.resource_failures.store(left - 1, Ordering::SeqCst);
            return Err(ProveError::Resource("simulated out of memory".into()));
        }

        let bad: Vec<SectorId> = match self.failing.lock() {
            Ok(failing) => sectors.iter().filter(|s| failing.contains(s)).copied().collect(),
            Err(_) => Vec::new(),
        };
        if !bad.is_empty() {
            return Err(ProveError::Sectors {
                sectors: bad,
                reason: "simulated read failure".into(),
            });
        }

        let sectors = sectors.to_vec();
        let seed = *seed;
        tokio::task::spawn_blocking(move || Self::digest(&sectors, &seed))
            .await
            .map_err(|e| ProveError::Resource(e.to_string()))
    }

    async fn verify(&self, sectors: &[SectorId], seed: &Randomness, proof: &[u8]) -> bool {
        Self::digest(sectors, seed) == proof
    }
}

/// Sector storage with a configurable set of unreachable and hanging sectors.
#[derive(Default)]
pub struct SimSectorStorage {
    unreachable: Mutex<HashSet<SectorId>>,
    hanging: Mutex<HashSet<SectorId>>,
    probes: AtomicUsize,
}

impl SimSectorStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, sectors: impl IntoIterator<Item = SectorId>) {
        if let Ok(mut set) = self.unreachable.lock() {
            *set = sectors.into_iter().collect();
        }
    }

    /// Probes of these sectors never return.
    pub fn set_hanging(&self, sectors: impl IntoIterator<Item = SectorId>) {
        if let Ok(mut set) = self.hanging.lock() {
            *set = sectors.into_iter().collect();
        }
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn contains(set: &Mutex<HashSet<SectorId>>, sector: SectorId) -> bool {
        set.lock().map(|s| s.contains(&sector)).unwrap_or(false)
    }
}

#[async_trait]
impl SectorStorage for SimSectorStorage {
    async fn check(&self, sector: SectorId) -> Result<(), String> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if Self::contains(&self.hanging, sector) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if Self::contains(&self.unreachable, sector) {
            return Err(format!("{sector}: no such file"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reorg_replaces_blocks_from_the_fork_point() {
        let chain = SimChain::new(10);
        let before_9 = chain.head_at(9).await.unwrap();
        let before_10 = chain.head_at(10).await.unwrap();

        chain.reorg(10);
        assert_eq!(chain.head_at(9).await.unwrap(), before_9);
        assert_ne!(chain.head_at(10).await.unwrap(), before_10);
        assert!(matches!(chain.head_at(11).await, Err(ChainError::NoBlock(11))));
    }

    #[tokio::test]
    async fn subscribers_see_new_heads() {
        let chain = SimChain::new(0);
        let mut heads = chain.subscribe();
        chain.advance(2);
        let head = heads.recv().await.unwrap();
        assert_eq!(head.height, 2);
    }

    #[tokio::test]
    async fn held_broadcast_lands_on_include() {
        let chain = SimChain::new(5);
        chain.set_auto_include(false);
        let msg = SignedMessage {
            from: Address::new("f3a"),
            nonce: 0,
            payload: vec![1],
            max_fee: 10,
        };
        chain.broadcast(&msg).await.unwrap();
        assert!(chain.lookup(&msg.from, 0).await.unwrap().is_none());

        chain.include_pending();
        let receipt = chain.lookup(&msg.from, 0).await.unwrap().unwrap();
        assert!(receipt.is_success());
        assert_eq!(chain.next_nonce(&msg.from).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn prover_reports_failing_sectors() {
        let prover = SimProver::new();
        prover.fail_sectors([SectorId(3)]);
        let seed = Randomness([7; 32]);

        let err = prover
            .compute(&[SectorId(1), SectorId(3)], &seed)
            .await
            .unwrap_err();
        assert!(matches!(err, ProveError::Sectors { ref sectors, .. } if sectors == &[SectorId(3)]));

        let proof = prover.compute(&[SectorId(1)], &seed).await.unwrap();
        assert!(prover.verify(&[SectorId(1)], &seed, &proof).await);
        assert!(!prover.verify(&[SectorId(2)], &seed, &proof).await);
    }
}
