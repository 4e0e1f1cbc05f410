//! WdPost submit - 計算済みの証明をトランザクションにして確定まで見届ける
//!
//! - fee ceiling を超えるなら送らずに即 terminal（Unaffordable）
//! - 送信そのものは MessageSender（outbox）に任せ、ここは状態を poll するだけ
//! - 確定前に deadline が閉じたらメッセージを abandon して terminal
//!
//! 再実行されても outbox の dedupe key で同じメッセージに合流する。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::address_selector::AddressSelector;
use super::compute::join;
use crate::domain::{
    Address, AlertSubject, DeadlineInfo, MessageId, MessageState, SectorId, TaskError,
    TokenAmount,
};
use crate::message::MessageSender;
use crate::ports::{ChainReader, Clock, MessagePool, after};
use crate::typed::{Handler, Task, TaskContext};

/// A computed proof waiting to land on chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WdPostSubmit {
    pub provider: Address,
    pub deadline: DeadlineInfo,
    pub partitions: Vec<u64>,
    pub proof: Vec<u8>,
    /// Sectors the proof covers.
    pub proven: Vec<SectorId>,
    /// Sectors declared faulty for this deadline.
    pub faults: Vec<SectorId>,
}

impl Task for WdPostSubmit {
    const TYPE: &'static str = "wdpost.submit.v1";

    fn subject(&self) -> Option<AlertSubject> {
        Some(AlertSubject {
            provider: self.provider.clone(),
            deadline: self.deadline.index,
        })
    }
}

impl WdPostSubmit {
    pub fn dedupe_key(&self) -> String {
        format!("wdpost.submit:{}", self.identity())
    }

    /// Outbox key: one outstanding message per deadline and partition set.
    pub fn message_key(&self) -> String {
        format!("wdpost.msg:{}", self.identity())
    }

    fn identity(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.provider,
            self.deadline.period_start,
            self.deadline.index,
            join(&self.partitions)
        )
    }
}

/// Transaction body handed to the outbox.
#[derive(Debug, Serialize)]
struct SubmitPayload<'a> {
    provider: &'a Address,
    deadline: u64,
    period_start: i64,
    partitions: &'a [u64],
    proof: String,
    faults: &'a [SectorId],
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitConfig {
    /// Hard fee ceiling per submission.
    pub max_fee: TokenAmount,
    /// Payer candidates.
    pub senders: Vec<Address>,
    pub confirm_poll_interval: Duration,
    /// How long the outbox may hold a message whose fee is over the ceiling.
    pub hold_timeout: Duration,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            max_fee: 5_000_000_000,
            senders: Vec::new(),
            confirm_poll_interval: Duration::from_secs(2),
            hold_timeout: Duration::from_secs(600),
        }
    }
}

pub struct WdPostSubmitHandler {
    reader: Arc<dyn ChainReader>,
    pool: Arc<dyn MessagePool>,
    selector: AddressSelector,
    sender: Arc<MessageSender>,
    clock: Arc<dyn Clock>,
    config: SubmitConfig,
}

impl WdPostSubmitHandler {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        pool: Arc<dyn MessagePool>,
        selector: AddressSelector,
        sender: Arc<MessageSender>,
        clock: Arc<dyn Clock>,
        config: SubmitConfig,
    ) -> Self {
        Self {
            reader,
            pool,
            selector,
            sender,
            clock,
            config,
        }
    }

    async fn expired(&self, task: &WdPostSubmit) -> Result<bool, TaskError> {
        let head = self.reader.current_head().await?;
        Ok(task.deadline.has_elapsed(head.height))
    }

    fn expired_error(task: &WdPostSubmit) -> TaskError {
        TaskError::DeadlineExpired {
            provider: task.provider.clone(),
            deadline: task.deadline.index,
            close: task.deadline.close,
        }
    }

    fn payload(task: &WdPostSubmit) -> Result<Vec<u8>, TaskError> {
        serde_json::to_vec(&SubmitPayload {
            provider: &task.provider,
            deadline: task.deadline.index,
            period_start: task.deadline.period_start,
            partitions: &task.partitions,
            proof: hex::encode(&task.proof),
            faults: &task.faults,
        })
        .map_err(|e| TaskError::Params(format!("{}: {e}", WdPostSubmit::TYPE)))
    }

    /// Polls the outbox until the message settles or the deadline closes.
    async fn await_confirmation(
        &self,
        task: &WdPostSubmit,
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
                        "window post landed"
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
                    if self.expired(task).await? {
                        self.sender.abandon(id, "deadline expired").await?;
                        return Err(Self::expired_error(task));
                    }
                    debug!(message_id = %id, state = message.state.as_str(), "waiting for confirmation");
                    tokio::time::sleep(self.config.confirm_poll_interval).await;
                }
            }
        }
    }
}

#[async_trait]
impl Handler<WdPostSubmit> for WdPostSubmitHandler {
    async fn handle(&self, task: WdPostSubmit, ctx: &TaskContext) -> Result<(), TaskError> {
        if self.expired(&task).await? {
            return Err(Self::expired_error(&task));
        }

        let payload = Self::payload(&task)?;
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
            sender = %from,
            fee,
            "window post handed to outbox"
        );

        self.await_confirmation(&task, id, ctx).await
    }
}
