//! WdPost compute - deadline の証明を計算して submit task を作る
//!
//! # フロー
//! 1. deadline が閉じていないか確認
//! 2. challenge epoch のブロックから seed を導出（reorg 後も実行時に再導出）
//! 3. FaultTracker で unhealthy なセクターを fault として除外
//! 4. prover がセクター単位で失敗したら、そのセクターを外して再計算
//! 5. 計算後にもう一度 deadline を確認し、verify してから WdPostSubmit を作成

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::fault_tracker::FaultTracker;
use super::recover::WdPostRecover;
use super::submit::WdPostSubmit;
use crate::app::EpochCallback;
use crate::domain::{
    Address, AlertSubject, ChainEpoch, DeadlineInfo, Enqueued, Head, ProveError, Randomness,
    SectorId, TaskError,
};
use crate::ports::{ChainReader, Clock, ProofGenerator, TaskStore};
use crate::typed::{Handler, Task, TaskContext, new_task};

/// Proving work for a batch of partitions of one deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WdPost {
    pub provider: Address,
    pub deadline: DeadlineInfo,
    pub partitions: Vec<u64>,
    pub sectors: Vec<SectorId>,
}

impl Task for WdPost {
    const TYPE: &'static str = "wdpost.compute.v1";

    fn subject(&self) -> Option<AlertSubject> {
        Some(AlertSubject {
            provider: self.provider.clone(),
            deadline: self.deadline.index,
        })
    }
}

impl WdPost {
    /// Same provider, proving period, deadline and partitions: same task.
    pub fn dedupe_key(&self) -> String {
        format!(
            "wdpost.compute:{}:{}:{}:{}",
            self.provider,
            self.deadline.period_start,
            self.deadline.index,
            join(&self.partitions)
        )
    }
}

pub(crate) fn join(partitions: &[u64]) -> String {
    partitions
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputeConfig {
    /// Re-computations allowed after the prover rejects individual sectors.
    pub max_sector_retries: u32,
    pub partitions_per_task: usize,
    /// Epochs ahead of the head at which the next deadline's fault and
    /// recovery declaration is scheduled. 0 disables declarations.
    pub declare_lookahead: ChainEpoch,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            max_sector_retries: 5,
            partitions_per_task: 1,
            declare_lookahead: 60,
        }
    }
}

/// Epoch callback that enqueues a compute task per partition batch of every
/// deadline whose challenge window is open, and a declaration task for the
/// deadline `declare_lookahead` epochs ahead while its challenge is still
/// in the future.
pub struct WdPostScheduler {
    providers: Vec<Address>,
    reader: Arc<dyn ChainReader>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    config: ComputeConfig,
}

impl WdPostScheduler {
    pub fn new(
        providers: Vec<Address>,
        reader: Arc<dyn ChainReader>,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        config: ComputeConfig,
    ) -> Self {
        Self {
            providers,
            reader,
            store,
            clock,
            config,
        }
    }

    async fn schedule(&self, provider: &Address, epoch: ChainEpoch) -> Result<(), TaskError> {
        let assignment = self.reader.deadline_assignment(provider, epoch).await?;
        let deadline = assignment.deadline;
        if !deadline.is_challenge_open(epoch) {
            debug!(%provider, epoch, deadline = deadline.index, challenge = deadline.challenge, "deadline not open yet");
            return Ok(());
        }

        for partitions in assignment.partition_batches(self.config.partitions_per_task) {
            let task = WdPost {
                provider: provider.clone(),
                deadline,
                sectors: assignment.sectors_of(&partitions),
                partitions,
            };
            let new = new_task(&task)?.with_dedupe_key(task.dedupe_key());
            match self.store.create(new, self.clock.now()).await? {
                Enqueued::Created(id) => info!(
                    task_id = %id,
                    %provider,
                    deadline = deadline.index,
                    partitions = %join(&task.partitions),
                    epoch,
                    "window post scheduled"
                ),
                Enqueued::Existing(id) => {
                    debug!(task_id = %id, %provider, deadline = deadline.index, "window post already scheduled")
                }
            }
        }
        Ok(())
    }

    async fn schedule_declaration(
        &self,
        provider: &Address,
        epoch: ChainEpoch,
    ) -> Result<(), TaskError> {
        if self.config.declare_lookahead <= 0 {
            return Ok(());
        }
        let assignment = self
            .reader
            .deadline_assignment(provider, epoch + self.config.declare_lookahead)
            .await?;
        let deadline = assignment.deadline;
        // a declaration counts only if it lands before the challenge
        if deadline.challenge <= epoch {
            return Ok(());
        }

        let task = WdPostRecover {
            provider: provider.clone(),
            deadline,
            partitions: assignment.partitions,
        };
        let new = new_task(&task)?.with_dedupe_key(task.dedupe_key());
        match self.store.create(new, self.clock.now()).await? {
            Enqueued::Created(id) => info!(
                task_id = %id,
                %provider,
                deadline = deadline.index,
                challenge = deadline.challenge,
                epoch,
                "fault declaration scheduled"
            ),
            Enqueued::Existing(_) => {}
        }
        Ok(())
    }
}

#[async_trait]
impl EpochCallback for WdPostScheduler {
    fn name(&self) -> &str {
        "wdpost"
    }

    /// Every provider is tried; the last failure is returned.
    async fn on_epoch(&self, head: Head) -> Result<(), TaskError> {
        let mut result = Ok(());
        for provider in &self.providers {
            if let Err(e) = self.schedule(provider, head.height).await {
                warn!(%provider, epoch = head.height, error = %e, "scheduling window post failed");
                result = Err(e);
            }
            if let Err(e) = self.schedule_declaration(provider, head.height).await {
                warn!(%provider, epoch = head.height, error = %e, "scheduling fault declaration failed");
                result = Err(e);
            }
        }
        result
    }
}

pub struct WdPostComputeHandler {
    reader: Arc<dyn ChainReader>,
    prover: Arc<dyn ProofGenerator>,
    faults: Arc<FaultTracker>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    config: ComputeConfig,
}

impl WdPostComputeHandler {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        prover: Arc<dyn ProofGenerator>,
        faults: Arc<FaultTracker>,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        config: ComputeConfig,
    ) -> Self {
        Self {
            reader,
            prover,
            faults,
            store,
            clock,
            config,
        }
    }

    async fn ensure_open(&self, task: &WdPost) -> Result<(), TaskError> {
        let head = self.reader.current_head().await?;
        if task.deadline.has_elapsed(head.height) {
            return Err(TaskError::DeadlineExpired {
                provider: task.provider.clone(),
                deadline: task.deadline.index,
                close: task.deadline.close,
            });
        }
        Ok(())
    }

    /// Proves `sectors`, dropping the ones the prover rejects.
    /// Returns the proof and the sectors it covers.
    async fn prove(
        &self,
        task: &WdPost,
        mut sectors: Vec<SectorId>,
        faults: &mut Vec<SectorId>,
        seed: &Randomness,
    ) -> Result<(Vec<u8>, Vec<SectorId>), TaskError> {
        let mut attempt = 0;
        loop {
            if sectors.is_empty() {
                return Err(TaskError::NoProvableSectors {
                    provider: task.provider.clone(),
                    deadline: task.deadline.index,
                });
            }
            match self.prover.compute(&sectors, seed).await {
                Ok(proof) => return Ok((proof, sectors)),
                Err(ProveError::Sectors { sectors: bad, reason }) if attempt < self.config.max_sector_retries => {
                    attempt += 1;
                    warn!(
                        provider = %task.provider,
                        deadline = task.deadline.index,
                        sectors = ?bad,
                        reason = %reason,
                        attempt,
                        "excluding sectors that failed proving"
                    );
                    self.faults.mark_faulty(&bad);
                    sectors.retain(|s| !bad.contains(s));
                    faults.extend(bad);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl Handler<WdPost> for WdPostComputeHandler {
    async fn handle(&self, task: WdPost, ctx: &TaskContext) -> Result<(), TaskError> {
        self.ensure_open(&task).await?;

        let challenge = task.deadline.challenge;
        let block = self.reader.head_at(challenge).await?;
        let seed = Randomness::derive(&block, &task.provider, challenge);

        let health = self.faults.probe(&task.sectors).await;
        let (good, mut faults): (Vec<SectorId>, Vec<SectorId>) = task
            .sectors
            .iter()
            .copied()
            .partition(|s| health.get(s).copied().unwrap_or(false));
        if !faults.is_empty() {
            info!(
                task_id = %ctx.task_id,
                provider = %task.provider,
                deadline = task.deadline.index,
                faults = ?faults,
                "declaring unhealthy sectors faulty"
            );
        }

        let (proof, proven) = self.prove(&task, good, &mut faults, &seed).await?;

        // the proof took a while; a late one is worthless
        self.ensure_open(&task).await?;
        if !self.prover.verify(&proven, &seed, &proof).await {
            return Err(TaskError::ProofRejected {
                deadline: task.deadline.index,
            });
        }

        faults.sort();
        faults.dedup();
        let submit = WdPostSubmit {
            provider: task.provider.clone(),
            deadline: task.deadline,
            partitions: task.partitions.clone(),
            proof,
            proven,
            faults,
        };
        let new = new_task(&submit)?.with_dedupe_key(submit.dedupe_key());
        let enqueued = self.store.create(new, self.clock.now()).await?;
        info!(
            task_id = %ctx.task_id,
            submit_task = %enqueued.id(),
            provider = %task.provider,
            deadline = task.deadline.index,
            proven = submit.proven.len(),
            faults = submit.faults.len(),
            "window post computed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeadlineAssignment, ErrorKind, Partition, TaskId, WorkerId};
    use crate::impls::{MemoryTaskStore, SimChain, SimProver, SimSectorStorage};
    use crate::ports::SystemClock;
    use crate::wdpost::FaultTrackerConfig;
    use ulid::Ulid;

    fn provider() -> Address {
        Address::new("f01000")
    }

    fn deadline() -> DeadlineInfo {
        DeadlineInfo {
            index: 4,
            period_start: 0,
            challenge: 20,
            open: 40,
            close: 100,
        }
    }

    fn ids(ns: impl IntoIterator<Item = u64>) -> Vec<SectorId> {
        ns.into_iter().map(SectorId).collect()
    }

    fn task(sectors: Vec<SectorId>) -> WdPost {
        WdPost {
            provider: provider(),
            deadline: deadline(),
            partitions: vec![0],
            sectors,
        }
    }

    fn ctx() -> TaskContext {
        TaskContext {
            task_id: TaskId::from_ulid(Ulid::new()),
            worker: WorkerId::new("w"),
            retries: 0,
        }
    }

    struct Harness {
        chain: Arc<SimChain>,
        prover: Arc<SimProver>,
        storage: Arc<SimSectorStorage>,
        store: Arc<MemoryTaskStore>,
        handler: WdPostComputeHandler,
    }

    fn harness(height: ChainEpoch) -> Harness {
        let chain = Arc::new(SimChain::new(height));
        let prover = Arc::new(SimProver::new());
        let storage = Arc::new(SimSectorStorage::new());
        let store = Arc::new(MemoryTaskStore::new());
        let faults = Arc::new(FaultTracker::new(
            storage.clone(),
            Arc::new(SystemClock),
            FaultTrackerConfig::default(),
        ));
        let handler = WdPostComputeHandler::new(
            chain.clone(),
            prover.clone(),
            faults,
            store.clone(),
            Arc::new(SystemClock),
            ComputeConfig::default(),
        );
        Harness {
            chain,
            prover,
            storage,
            store,
            handler,
        }
    }

    impl Harness {
        async fn submit_task(&self) -> WdPostSubmit {
            let records = self.store.snapshot().await;
            let record = records
                .iter()
                .find(|r| r.task_type.as_str() == WdPostSubmit::TYPE)
                .expect("submit task created");
            serde_json::from_value(record.params.clone()).unwrap()
        }
    }

    #[tokio::test]
    async fn unhealthy_sectors_become_faults() {
        let h = harness(50);
        h.storage.set_unreachable([SectorId(3)]);

        h.handler.handle(task(ids(1..=5)), &ctx()).await.unwrap();

        let submit = h.submit_task().await;
        assert_eq!(submit.proven, ids([1, 2, 4, 5]));
        assert_eq!(submit.faults, ids([3]));

        let block = h.chain.head_at(20).await.unwrap();
        let seed = Randomness::derive(&block, &provider(), 20);
        assert!(h.prover.verify(&submit.proven, &seed, &submit.proof).await);
    }

    #[tokio::test]
    async fn sector_failing_mid_proof_is_excluded_and_retried() {
        let h = harness(50);
        h.storage.set_unreachable([SectorId(3)]);
        h.prover.fail_sectors([SectorId(4)]);

        h.handler.handle(task(ids(1..=5)), &ctx()).await.unwrap();

        let submit = h.submit_task().await;
        assert_eq!(submit.proven, ids([1, 2, 5]));
        assert_eq!(submit.faults, ids([3, 4]));
        assert_eq!(h.prover.computes(), 2);
    }

    #[tokio::test]
    async fn no_provable_sectors_is_terminal() {
        let h = harness(50);
        h.storage.set_unreachable(ids(1..=3));

        let err = h.handler.handle(task(ids(1..=3)), &ctx()).await.unwrap_err();
        assert!(matches!(err, TaskError::NoProvableSectors { deadline: 4, .. }));
        assert_eq!(err.kind(), ErrorKind::Terminal);
        assert_eq!(h.prover.computes(), 0);
    }

    #[tokio::test]
    async fn closed_deadline_is_not_proven() {
        let h = harness(100);

        let err = h.handler.handle(task(ids(1..=2)), &ctx()).await.unwrap_err();
        assert!(matches!(err, TaskError::DeadlineExpired { close: 100, .. }));
        assert_eq!(h.prover.computes(), 0);
        assert!(h.store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn prover_resource_failure_is_retryable() {
        let h = harness(50);
        h.prover.fail_resources(1);

        let err = h.handler.handle(task(ids(1..=2)), &ctx()).await.unwrap_err();
        assert!(matches!(err, TaskError::Prove(ProveError::Resource(_))));
        assert!(err.is_retryable());
        assert!(h.store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn rerun_does_not_duplicate_the_submit_task() {
        let h = harness(50);
        h.handler.handle(task(ids(1..=2)), &ctx()).await.unwrap();
        h.handler.handle(task(ids(1..=2)), &ctx()).await.unwrap();
        assert_eq!(h.store.snapshot().await.len(), 1);
    }

    fn assignment() -> DeadlineAssignment {
        DeadlineAssignment {
            provider: provider(),
            deadline: deadline(),
            partitions: vec![
                Partition { index: 0, sectors: ids([1, 2]), faulty: vec![] },
                Partition { index: 1, sectors: ids([3]), faulty: vec![] },
            ],
        }
    }

    fn scheduler(chain: Arc<SimChain>, store: Arc<MemoryTaskStore>) -> WdPostScheduler {
        WdPostScheduler::new(
            vec![provider()],
            chain,
            store,
            Arc::new(SystemClock),
            ComputeConfig::default(),
        )
    }

    #[tokio::test]
    async fn open_deadline_schedules_one_task_per_batch_once() {
        let chain = Arc::new(SimChain::new(30));
        chain.add_assignment(assignment());
        let store = Arc::new(MemoryTaskStore::new());
        let sched = scheduler(chain.clone(), store.clone());

        let head = chain.head();
        sched.on_epoch(head).await.unwrap();
        // re-fired epoch (reorg): nothing new
        sched.on_epoch(head).await.unwrap();

        let mut tasks: Vec<WdPost> = store
            .snapshot()
            .await
            .iter()
            .map(|r| serde_json::from_value(r.params.clone()).unwrap())
            .collect();
        tasks.sort_by_key(|t| t.partitions.clone());
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].sectors, ids([1, 2]));
        assert_eq!(tasks[1].sectors, ids([3]));
    }

    #[tokio::test]
    async fn nothing_is_scheduled_before_the_challenge() {
        let chain = Arc::new(SimChain::new(19));
        chain.add_assignment(assignment());
        let store = Arc::new(MemoryTaskStore::new());

        scheduler(chain.clone(), store.clone())
            .on_epoch(chain.head())
            .await
            .unwrap();
        let records = store.snapshot().await;
        assert!(records.iter().all(|r| r.task_type.as_str() != WdPost::TYPE));
    }

    #[tokio::test]
    async fn declaration_is_scheduled_once_before_the_challenge() {
        let chain = Arc::new(SimChain::new(5));
        chain.add_assignment(assignment());
        let store = Arc::new(MemoryTaskStore::new());
        let sched = scheduler(chain.clone(), store.clone());

        sched.on_epoch(chain.head()).await.unwrap();
        sched.on_epoch(chain.advance(1)).await.unwrap();

        let records = store.snapshot().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task_type.as_str(), WdPostRecover::TYPE);
        let task: WdPostRecover = serde_json::from_value(records[0].params.clone()).unwrap();
        assert_eq!(task.deadline.index, 4);
        assert_eq!(task.partitions.len(), 2);
    }

    #[tokio::test]
    async fn no_declaration_once_the_challenge_has_passed() {
        let chain = Arc::new(SimChain::new(30));
        chain.add_assignment(assignment());
        let store = Arc::new(MemoryTaskStore::new());

        scheduler(chain.clone(), store.clone())
            .on_epoch(chain.head())
            .await
            .unwrap();
        let records = store.snapshot().await;
        assert!(records.iter().all(|r| r.task_type.as_str() != WdPostRecover::TYPE));
    }
}
