//! WdPost recover - 次の deadline の fault / recovery を challenge 前に宣言する
//!
//! - 宣言済み fault で、いま到達できるセクター → recovery
//! - 未宣言で到達できないセクター → fault
//! - どちらも無ければメッセージは送らない
//!
//! challenge epoch を過ぎた宣言はその deadline に効かないので terminal。
//! 送信は submit と同じく MessageSender 経由で、宣言専用の outbox key を使う。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::address_selector::AddressSelector;
use super::fault_tracker::FaultTracker;
use super::submit::SubmitConfig;
use crate::domain::{
    Address, AlertSubject, DeadlineInfo, MessageId, MessageState, Partition, SectorId, TaskError,
};
use crate::message::MessageSender;
use crate::ports::{ChainReader, Clock, MessagePool, after};
use crate::typed::{Handler, Task, TaskContext};

/// Fault and recovery declaration for a deadline whose challenge is ahead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WdPostRecover {
    pub provider: Address,
    pub deadline: DeadlineInfo,
    /// Partitions as the chain knew them at scheduling, declared faults included.
    pub partitions: Vec<Partition>,
}

impl Task for WdPostRecover {
    const TYPE: &'static str = "wdpost.recover.v1";

    fn subject(&self) -> Option<AlertSubject> {
        Some(AlertSubject {
            provider: self.provider.clone(),
            deadline: self.deadline.index,
        })
    }
}

impl WdPostRecover {
    /// One declaration per provider, proving period and deadline.
    pub fn dedupe_key(&self) -> String {
        format!("wdpost.recover:{}", self.identity())
    }

    pub fn message_key(&self) -> String {
        format!("wdpost.declare:{}", self.identity())
    }

    fn identity(&self) -> String {
        format!(
            "{}:{}:{}",
            self.provider, self.deadline.period_start, self.deadline.index
        )
    }

    fn sectors(&self) -> Vec<SectorId> {
        self.partitions
            .iter()
            .flat_map(|p| p.sectors.iter().copied())
            .collect()
    }
}

/// Changes the chain has to learn about a deadline's sectors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Declaration {
    pub faults: Vec<SectorId>,
    pub recoveries: Vec<SectorId>,
}

impl Declaration {
    /// Sectors missing from `health` count as unhealthy.
    pub fn from_health(partitions: &[Partition], health: &BTreeMap<SectorId, bool>) -> Self {
        let mut declaration = Self::default();
        for partition in partitions {
            for &sector in &partition.sectors {
                let healthy = health.get(&sector).copied().unwrap_or(false);
                match (partition.faulty.contains(&sector), healthy) {
                    (false, false) => declaration.faults.push(sector),
                    (true, true) => declaration.recoveries.push(sector),
                    _ => {}
                }
            }
        }
        declaration.faults.sort();
        declaration.recoveries.sort();
        declaration
    }

    pub fn is_empty(&self) -> bool {
        self.faults.is_empty() && self.recoveries.is_empty()
    }
}

#[derive(Debug, Serialize)]
struct DeclarePayload<'a> {
    provider: &'a Address,
    deadline: u64,
    period_start: i64,
    faults: &'a [SectorId],
    recoveries: &'a [SectorId],
}

pub struct WdPostRecoverHandler {
    reader: Arc<dyn ChainReader>,
    pool: Arc<dyn MessagePool>,
    selector: AddressSelector,
    sender: Arc<MessageSender>,
    faults: Arc<FaultTracker>,
    clock: Arc<dyn Clock>,
    config: SubmitConfig,
}

impl WdPostRecoverHandler {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        pool: Arc<dyn MessagePool>,
        selector: AddressSelector,
        sender: Arc<MessageSender>,
        faults: Arc<FaultTracker>,
        clock: Arc<dyn Clock>,
        config: SubmitConfig,
    ) -> Self {
        Self {
            reader,
            pool,
            selector,
            sender,
            faults,
            clock,
            config,
        }
    }

    async fn past_cutoff(&self, task: &WdPostRecover) -> Result<bool, TaskError> {
        let head = self.reader.current_head().await?;
        Ok(head.height >= task.deadline.challenge)
    }

    fn cutoff_error(task: &WdPostRecover) -> TaskError {
        TaskError::DeclarationCutoff {
            provider: task.provider.clone(),
            deadline: task.deadline.index,
            cutoff: task.deadline.challenge,
        }
    }

    async fn await_confirmation(
        &self,
        task: &WdPostRecover,
        id: MessageId,
        ctx: &TaskContext,
    ) -> Result<(), TaskError> {
        loop {
            let message = self.sender.message(id).await?;
            match message.state {
                MessageState::Confirmed => {
                    info!(
                        task_id = %ctx.task_id,
                        message_id = %id,
                        provider = %task.provider,
                        deadline = task.deadline.index,
                        epoch = ?message.confirmed_epoch,
                        "fault declaration landed"
                    );
                    return Ok(());
                }
                MessageState::Failed => {
                    return Err(TaskError::MessageFailed(
                        id,
                        message.last_error.unwrap_or_default(),
                    ));
                }
                MessageState::Pending | MessageState::Sent => {
                    if self.past_cutoff(task).await? {
                        self.sender.abandon(id, "declaration cutoff passed").await?;
                        return Err(Self::cutoff_error(task));
                    }
                    debug!(message_id = %id, state = message.state.as_str(), "waiting for declaration");
                    tokio::time::sleep(self.config.confirm_poll_interval).await;
                }
            }
        }
    }
}

#[async_trait]
impl Handler<WdPostRecover> for WdPostRecoverHandler {
    async fn handle(&self, task: WdPostRecover, ctx: &TaskContext) -> Result<(), TaskError> {
        if self.past_cutoff(&task).await? {
            return Err(Self::cutoff_error(&task));
        }

        let health = self.faults.probe(&task.sectors()).await;
        let declaration = Declaration::from_health(&task.partitions, &health);
        if declaration.is_empty() {
            debug!(
                task_id = %ctx.task_id,
                provider = %task.provider,
                deadline = task.deadline.index,
                "nothing to declare"
            );
            return Ok(());
        }

        let payload = serde_json::to_vec(&DeclarePayload {
            provider: &task.provider,
            deadline: task.deadline.index,
            period_start: task.deadline.period_start,
            faults: &declaration.faults,
            recoveries: &declaration.recoveries,
        })
        .map_err(|e| TaskError::Params(format!("{}: {e}", WdPostRecover::TYPE)))?;
        let fee = self.pool.estimate_fee(&payload).await?;
        let from = self
            .selector
            .select(&self.config.senders, fee, self.config.max_fee)
            .await?;

        let hold_until = after(self.clock.now(), self.config.hold_timeout);
        let id = self
            .sender
            .submit(&from, payload, self.config.max_fee, &task.message_key(), hold_until)
            .await?;
        info!(
            task_id = %ctx.task_id,
            message_id = %id,
            provider = %task.provider,
            deadline = task.deadline.index,
            faults = ?declaration.faults,
            recoveries = ?declaration.recoveries,
            sender = %from,
            "fault declaration handed to outbox"
        );

        self.await_confirmation(&task, id, ctx).await
    }
}
