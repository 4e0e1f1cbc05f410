//! ChainScheduler - chain head 駆動で epoch ごとに callback を発火する
//!
//! - `step(cursor, head) -> cursor` は純粋に近い遷移関数（永続化は呼び出し側）
//! - finality lag を引いた高さまでの未発火 epoch を昇順に 1 回ずつ発火
//! - 記録済み lineage と chain が食い違ったら共通祖先まで巻き戻す
//! - 発火は同じ head ストリームにつき 1 プロセスだけ（CursorStore のリース）

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::domain::{
    BlockId, ChainEpoch, ChainError, EpochCursor, Head, StoreError, TaskError, WorkerId,
};
use crate::ports::{ChainReader, Clock, CursorStore, to_chrono};

/// Called once per finalized epoch with the head as of that epoch.
///
/// Must only enqueue work and return; re-fires after a reorg are expected,
/// so the callback has to be idempotent.
#[async_trait]
pub trait EpochCallback: Send + Sync {
    fn name(&self) -> &str;

    async fn on_epoch(&self, head: Head) -> Result<(), TaskError>;
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("chain reader: {0}")]
    Chain(#[from] ChainError),

    #[error("cursor store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Name of the cursor and of the leader lease.
    pub name: String,
    /// Epochs below the head before an epoch counts as final.
    pub finality_lag: ChainEpoch,
    pub lease_ttl: Duration,
    /// Fired epochs remembered for reorg detection.
    pub lineage_keep: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "chainsched".to_string(),
            finality_lag: 2,
            lease_ttl: Duration::from_secs(90),
            lineage_keep: 900,
        }
    }
}

pub struct ChainScheduler {
    owner: WorkerId,
    reader: Arc<dyn ChainReader>,
    cursors: Arc<dyn CursorStore>,
    clock: Arc<dyn Clock>,
    callbacks: Vec<Arc<dyn EpochCallback>>,
    config: SchedulerConfig,
}

impl ChainScheduler {
    pub fn new(
        owner: WorkerId,
        reader: Arc<dyn ChainReader>,
        cursors: Arc<dyn CursorStore>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            owner,
            reader,
            cursors,
            clock,
            callbacks: Vec::new(),
            config,
        }
    }

    pub fn register(&mut self, callback: Arc<dyn EpochCallback>) {
        info!(callback = callback.name(), "registered epoch callback");
        self.callbacks.push(callback);
    }

    async fn block_at(&self, epoch: ChainEpoch, head: &Head) -> Result<BlockId, ChainError> {
        if epoch == head.height {
            return Ok(head.block);
        }
        self.reader.head_at(epoch).await
    }

    /// Advances `cursor` to `head`: rewinds past a detected reorg, then fires
    /// every unfired epoch up to `head.height - finality_lag` in ascending
    /// order. A callback error is logged and does not stop firing; a reader
    /// error does.
    pub async fn step(
        &self,
        mut cursor: EpochCursor,
        head: Head,
    ) -> Result<EpochCursor, SchedulerError> {
        let recorded: Vec<_> = cursor.lineage_desc().collect();
        let mut diverged = false;
        let mut ancestor = None;
        for (epoch, block) in recorded {
            // recorded above the new head: those blocks are gone
            if epoch > head.height {
                diverged = true;
                continue;
            }
            if self.block_at(epoch, &head).await? == block {
                ancestor = Some(epoch);
                break;
            }
            diverged = true;
        }
        if diverged {
            warn!(
                head = head.height,
                common_ancestor = ?ancestor,
                last_fired = ?cursor.last_fired(),
                "reorg detected, unfiring epochs above common ancestor"
            );
            cursor.rewind_to(ancestor);
        }

        let finalized = head.height - self.config.finality_lag;
        let start = cursor.last_fired().map_or(finalized, |e| e + 1);
        for epoch in start.max(0)..=finalized {
            let at = Head::new(epoch, self.block_at(epoch, &head).await?);
            for callback in &self.callbacks {
                if let Err(e) = callback.on_epoch(at).await {
                    warn!(
                        callback = callback.name(),
                        epoch,
                        error = %e,
                        "epoch callback failed"
                    );
                }
            }
            debug!(epoch, block = %at.block, "epoch fired");
            cursor.record_fired(epoch, at.block);
        }

        cursor.prune(self.config.lineage_keep);
        Ok(cursor)
    }

    /// Steps on every head from `heads` while holding the leader lease.
    /// Returns on shutdown or when the head stream closes; reader and store
    /// errors are fatal.
    pub async fn run(
        &self,
        mut heads: mpsc::Receiver<Head>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SchedulerError> {
        let name = self.config.name.as_str();
        let ttl = to_chrono(self.config.lease_ttl);

        // an unreachable reader at startup is fatal
        let mut next = Some(self.reader.current_head().await?);
        info!(owner = %self.owner, lag = self.config.finality_lag, "chain scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut head = match next.take() {
                Some(head) => head,
                None => tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    head = heads.recv() => match head {
                        Some(head) => head,
                        None => break,
                    },
                },
            };
            // only the newest queued head matters
            while let Ok(newer) = heads.try_recv() {
                head = newer;
            }

            if !self
                .cursors
                .try_lead(name, &self.owner, self.clock.now(), ttl)
                .await?
            {
                debug!(owner = %self.owner, "not the scheduler leader, skipping head");
                continue;
            }

            let cursor = self.cursors.load(name).await?.unwrap_or_default();
            let cursor = self.step(cursor, head).await?;
            self.cursors.save(name, &cursor).await?;
        }

        info!(owner = %self.owner, "chain scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, DeadlineAssignment};
    use crate::impls::{MemoryCursorStore, SimChain};
    use crate::ports::SystemClock;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        fired: Mutex<Vec<Head>>,
        fail_on: Option<ChainEpoch>,
    }

    impl Recorder {
        fn epochs(&self) -> Vec<ChainEpoch> {
            self.fired.lock().unwrap().iter().map(|h| h.height).collect()
        }
    }

    #[async_trait]
    impl EpochCallback for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn on_epoch(&self, head: Head) -> Result<(), TaskError> {
            self.fired.lock().unwrap().push(head);
            if self.fail_on == Some(head.height) {
                return Err(TaskError::Params("boom".into()));
            }
            Ok(())
        }
    }

    fn scheduler(chain: Arc<SimChain>, lag: ChainEpoch, owner: &str) -> ChainScheduler {
        ChainScheduler::new(
            WorkerId::new(owner),
            chain,
            Arc::new(MemoryCursorStore::new()),
            Arc::new(SystemClock),
            SchedulerConfig {
                finality_lag: lag,
                ..SchedulerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn fires_in_order_and_refires_after_reorg() {
        let chain = Arc::new(SimChain::new(10));
        let recorder = Arc::new(Recorder::default());
        let mut sched = scheduler(chain.clone(), 0, "a");
        sched.register(recorder.clone());

        let mut cursor = EpochCursor::new();
        cursor = sched.step(cursor, chain.head()).await.unwrap();
        cursor = sched.step(cursor, chain.advance(1)).await.unwrap();
        cursor = sched.step(cursor, chain.advance(1)).await.unwrap();
        assert_eq!(recorder.epochs(), vec![10, 11, 12]);

        // same head again: nothing new
        cursor = sched.step(cursor, chain.head()).await.unwrap();
        assert_eq!(recorder.epochs(), vec![10, 11, 12]);

        let replaced = chain.reorg(11);
        cursor = sched.step(cursor, replaced).await.unwrap();
        assert_eq!(recorder.epochs(), vec![10, 11, 12, 11, 12]);
        assert_eq!(cursor.last_fired(), Some(12));

        // re-fired heads carry the new blocks
        let fired = recorder.fired.lock().unwrap().clone();
        assert_ne!(fired[1].block, fired[3].block);
        assert_eq!(fired[3].block, chain.head_at(11).await.unwrap());
    }

    #[tokio::test]
    async fn finality_lag_delays_firing_and_passes_the_old_head() {
        let chain = Arc::new(SimChain::new(12));
        let recorder = Arc::new(Recorder::default());
        let mut sched = scheduler(chain.clone(), 2, "a");
        sched.register(recorder.clone());

        let mut cursor = sched.step(EpochCursor::new(), chain.head()).await.unwrap();
        cursor = sched.step(cursor, chain.advance(2)).await.unwrap();
        assert_eq!(recorder.epochs(), vec![10, 11, 12]);

        let fired = recorder.fired.lock().unwrap().clone();
        for head in fired {
            assert_eq!(head.block, chain.head_at(head.height).await.unwrap());
        }
        assert_eq!(cursor.last_fired(), Some(12));
    }

    #[tokio::test]
    async fn callback_error_does_not_stop_firing() {
        let chain = Arc::new(SimChain::new(10));
        let failing = Arc::new(Recorder {
            fail_on: Some(11),
            ..Recorder::default()
        });
        let mut sched = scheduler(chain.clone(), 0, "a");
        sched.register(failing.clone());

        let cursor = sched.step(EpochCursor::new(), chain.head()).await.unwrap();
        chain.advance(2);
        sched.step(cursor, chain.head()).await.unwrap();
        assert_eq!(failing.epochs(), vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn reorg_deeper_than_lineage_restarts_from_lowest_record() {
        let chain = Arc::new(SimChain::new(10));
        let recorder = Arc::new(Recorder::default());
        let mut sched = scheduler(chain.clone(), 0, "a");
        sched.register(recorder.clone());

        let mut cursor = sched.step(EpochCursor::new(), chain.head()).await.unwrap();
        cursor = sched.step(cursor, chain.advance(1)).await.unwrap();
        cursor = sched.step(cursor, chain.reorg(5)).await.unwrap();
        assert_eq!(recorder.epochs(), vec![10, 11, 10, 11]);
        assert_eq!(cursor.last_fired(), Some(11));
    }

    struct DeadReader;

    #[async_trait]
    impl ChainReader for DeadReader {
        async fn current_head(&self) -> Result<Head, ChainError> {
            Err(ChainError::Unavailable("connection refused".into()))
        }

        async fn head_at(&self, _epoch: ChainEpoch) -> Result<BlockId, ChainError> {
            Err(ChainError::Unavailable("connection refused".into()))
        }

        async fn deadline_assignment(
            &self,
            _provider: &Address,
            _epoch: ChainEpoch,
        ) -> Result<DeadlineAssignment, ChainError> {
            Err(ChainError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn unreachable_reader_is_fatal() {
        let sched = ChainScheduler::new(
            WorkerId::new("a"),
            Arc::new(DeadReader),
            Arc::new(MemoryCursorStore::new()),
            Arc::new(SystemClock),
            SchedulerConfig::default(),
        );
        let (_heads_tx, heads) = mpsc::channel(1);
        let (_tx, shutdown) = watch::channel(false);
        let err = sched.run(heads, shutdown).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Chain(ChainError::Unavailable(_))));

        let mut cursor = EpochCursor::new();
        cursor.record_fired(5, BlockId::synthetic(0, 5));
        let err = sched
            .step(cursor, Head::new(7, BlockId::synthetic(0, 7)))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Chain(_)));
    }

    #[tokio::test]
    async fn restart_resumes_from_the_persisted_cursor() {
        let chain = Arc::new(SimChain::new(10));
        let cursors: Arc<dyn CursorStore> = Arc::new(MemoryCursorStore::new());
        let start = |recorder: Arc<Recorder>| {
            let mut s = ChainScheduler::new(
                WorkerId::new("a"),
                chain.clone(),
                cursors.clone(),
                Arc::new(SystemClock),
                SchedulerConfig {
                    finality_lag: 0,
                    ..SchedulerConfig::default()
                },
            );
            s.register(recorder);
            s
        };
        let (_stop, shutdown) = watch::channel(false);
        // each run steps on its startup head; the closed stream then ends it
        let run_once = |recorder: Arc<Recorder>| {
            let sched = start(recorder);
            let shutdown = shutdown.clone();
            async move {
                let (tx, heads) = mpsc::channel(1);
                drop(tx);
                sched.run(heads, shutdown).await.unwrap();
            }
        };

        let first = Arc::new(Recorder::default());
        run_once(first.clone()).await;
        chain.advance(2);
        run_once(first.clone()).await;
        assert_eq!(first.epochs(), vec![10, 11, 12]);

        chain.advance(3);
        let after = Arc::new(Recorder::default());
        run_once(after.clone()).await;

        assert_eq!(after.epochs(), vec![13, 14, 15]);
        assert_eq!(cursors.load("chainsched").await.unwrap().unwrap().last_fired(), Some(15));
    }

    #[tokio::test]
    async fn only_the_leader_fires() {
        let chain = Arc::new(SimChain::new(10));
        let cursors: Arc<dyn CursorStore> = Arc::new(MemoryCursorStore::new());
        let make = |owner: &str, recorder: Arc<Recorder>| {
            let mut s = ChainScheduler::new(
                WorkerId::new(owner),
                chain.clone(),
                cursors.clone(),
                Arc::new(SystemClock),
                SchedulerConfig {
                    finality_lag: 0,
                    ..SchedulerConfig::default()
                },
            );
            s.register(recorder);
            s
        };
        let ra = Arc::new(Recorder::default());
        let rb = Arc::new(Recorder::default());
        let a = make("a", ra.clone());
        let b = make("b", rb.clone());

        let (tx_a, heads_a) = mpsc::channel(8);
        let (tx_b, heads_b) = mpsc::channel(8);
        let (stop, shutdown) = watch::channel(false);
        let run_a = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { a.run(heads_a, shutdown).await }
        });
        // a grabs the lease with its startup head before b starts
        tokio::time::sleep(Duration::from_millis(50)).await;
        let run_b = tokio::spawn(async move { b.run(heads_b, shutdown).await });

        for _ in 0..2 {
            let head = chain.advance(1);
            tx_a.send(head).await.unwrap();
            tx_b.send(head).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.send(true).unwrap();
        run_a.await.unwrap().unwrap();
        run_b.await.unwrap().unwrap();

        assert_eq!(ra.epochs(), vec![10, 11, 12]);
        assert!(rb.epochs().is_empty());
        assert_eq!(cursors.load("chainsched").await.unwrap().unwrap().last_fired(), Some(12));
    }
}
