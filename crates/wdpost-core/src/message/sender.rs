//! MessageSender - 永続 outbox 経由のトランザクション送信
//!
//! - `submit`: 行を作って最初の broadcast を試みる。同じ dedupe key の
//!   未失敗メッセージがあればその id を返す（再送しても二重送信にならない）
//! - nonce は最初の broadcast 時に 1 度だけ予約（sender 単位でアトミック）
//! - fee が上限を超えている間は hold、`hold_until` を過ぎたら failed
//! - `tick`: sent の照合（confirmed / failed）と、一定間隔での同一 nonce 再送
//!
//! 確認待ちはこのループが行う。task handler は `status` を見るだけで、
//! DB トランザクションを開いたまま待たない。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::domain::{
    Address, ChainError, MessageId, MessageState, NewOutboxMessage, OutboxMessage, StoreError,
    TokenAmount,
};
use crate::ports::{Clock, MessagePool, OutboxStore, to_chrono};

#[derive(Debug, Clone, PartialEq)]
pub struct SenderConfig {
    pub poll_interval: Duration,
    /// A sent message not seen on chain is re-broadcast after this long.
    pub rebroadcast_interval: Duration,
    /// Failed first-broadcast attempts before the message is marked failed.
    /// Re-broadcast failures of a sent message never fail it.
    pub max_broadcast_retries: u32,
    /// Unsettled messages handled per tick.
    pub batch_size: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            rebroadcast_interval: Duration::from_secs(60),
            max_broadcast_retries: 10,
            batch_size: 100,
        }
    }
}

pub struct MessageSender {
    outbox: Arc<dyn OutboxStore>,
    pool: Arc<dyn MessagePool>,
    clock: Arc<dyn Clock>,
    config: SenderConfig,
}

impl MessageSender {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        pool: Arc<dyn MessagePool>,
        clock: Arc<dyn Clock>,
        config: SenderConfig,
    ) -> Self {
        Self {
            outbox,
            pool,
            clock,
            config,
        }
    }

    /// Queues `payload` from `sender` and tries the first broadcast.
    ///
    /// Idempotent on `dedupe_key`: while the latest message with that key is
    /// pending, sent or confirmed, its id is returned and nothing is queued.
    pub async fn submit(
        &self,
        sender: &Address,
        payload: Vec<u8>,
        max_fee: TokenAmount,
        dedupe_key: &str,
        hold_until: DateTime<Utc>,
    ) -> Result<MessageId, StoreError> {
        let outstanding = self
            .outbox
            .latest_by_key(dedupe_key)
            .await?
            .filter(|m| m.state != MessageState::Failed);
        if let Some(existing) = outstanding {
            debug!(
                message_id = %existing.id,
                state = existing.state.as_str(),
                dedupe_key,
                "reusing outstanding message"
            );
            return Ok(existing.id);
        }

        let message = self
            .outbox
            .insert(
                NewOutboxMessage {
                    sender: sender.clone(),
                    payload,
                    dedupe_key: dedupe_key.to_string(),
                    max_fee,
                    hold_until,
                },
                self.clock.now(),
            )
            .await?;
        info!(
            message_id = %message.id,
            sender = %message.sender,
            payload_hash = %message.payload_hash,
            max_fee,
            "message queued"
        );

        self.send_pending(&message).await?;
        Ok(message.id)
    }

    pub async fn message(&self, id: MessageId) -> Result<OutboxMessage, StoreError> {
        self.outbox
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub async fn status(&self, id: MessageId) -> Result<MessageState, StoreError> {
        Ok(self.message(id).await?.state)
    }

    /// Marks the message failed so it is never re-broadcast. No-op on a
    /// settled message.
    pub async fn abandon(&self, id: MessageId, reason: &str) -> Result<bool, StoreError> {
        let abandoned = self.outbox.mark_failed(id, reason, self.clock.now()).await?;
        if abandoned {
            warn!(message_id = %id, reason, "message abandoned");
        }
        Ok(abandoned)
    }

    /// One pass over unsettled messages.
    pub async fn tick(&self) -> Result<(), StoreError> {
        for message in self.outbox.list_unsettled(self.config.batch_size).await? {
            match message.state {
                MessageState::Pending => self.send_pending(&message).await?,
                MessageState::Sent => self.reconcile(&message).await?,
                MessageState::Confirmed | MessageState::Failed => {}
            }
        }
        Ok(())
    }

    /// Ticks every `poll_interval` until shutdown. A store error stops the
    /// loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("message sender started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "outbox store unavailable, stopping sender");
                        return Err(e);
                    }
                }
            }
        }
        info!("message sender stopped");
        Ok(())
    }

    /// First broadcast (or a retry of a failed one) of a pending message.
    async fn send_pending(&self, message: &OutboxMessage) -> Result<(), StoreError> {
        let now = self.clock.now();
        let fee = match self.pool.estimate_fee(&message.payload).await {
            Ok(fee) => fee,
            Err(e) => return self.broadcast_failed(message, &e).await,
        };

        if fee > message.max_fee {
            if now >= message.hold_until {
                let reason = format!(
                    "fee {fee} stayed above ceiling {} until the hold timeout",
                    message.max_fee
                );
                self.outbox.mark_failed(message.id, &reason, now).await?;
                warn!(message_id = %message.id, fee, max_fee = message.max_fee, "held message expired");
            } else {
                debug!(message_id = %message.id, fee, max_fee = message.max_fee, "fee above ceiling, holding");
            }
            return Ok(());
        }

        let nonce = match message.nonce {
            Some(nonce) => nonce,
            None => {
                let chain_next = match self.pool.next_nonce(&message.sender).await {
                    Ok(n) => n,
                    Err(e) => return self.broadcast_failed(message, &e).await,
                };
                self.outbox.assign_nonce(message.id, chain_next).await?
            }
        };
        self.broadcast(message, nonce).await
    }

    async fn broadcast(&self, message: &OutboxMessage, nonce: u64) -> Result<(), StoreError> {
        match self.pool.broadcast(&message.to_signed(nonce)).await {
            Ok(()) => {
                self.outbox.mark_sent(message.id, self.clock.now()).await?;
                info!(message_id = %message.id, sender = %message.sender, nonce, "message broadcast");
                Ok(())
            }
            Err(e) => self.broadcast_failed(message, &e).await,
        }
    }

    async fn broadcast_failed(
        &self,
        message: &OutboxMessage,
        err: &ChainError,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let retries = self
            .outbox
            .record_failure(message.id, &err.to_string(), now)
            .await?;
        if message.first_submitted_at.is_some() {
            // already in the pool under its nonce; only a receipt or abandon settles it
            warn!(message_id = %message.id, retries, error = %err, "re-broadcast failed");
        } else if retries >= self.config.max_broadcast_retries {
            self.outbox
                .mark_failed(message.id, &format!("broadcast retries exhausted: {err}"), now)
                .await?;
            warn!(message_id = %message.id, retries, error = %err, "message failed");
        } else {
            warn!(message_id = %message.id, retries, error = %err, "broadcast failed, will retry");
        }
        Ok(())
    }

    async fn reconcile(&self, message: &OutboxMessage) -> Result<(), StoreError> {
        let Some(nonce) = message.nonce else {
            return Ok(());
        };
        let now = self.clock.now();
        match self.pool.lookup(&message.sender, nonce).await {
            Ok(Some(receipt)) if receipt.is_success() => {
                self.outbox
                    .mark_confirmed(message.id, receipt.epoch, now)
                    .await?;
                info!(message_id = %message.id, epoch = receipt.epoch, "message confirmed");
            }
            Ok(Some(receipt)) => {
                let reason = format!("exit code {}", receipt.exit_code);
                self.outbox.mark_failed(message.id, &reason, now).await?;
                warn!(message_id = %message.id, exit_code = receipt.exit_code, "message reverted on chain");
            }
            Ok(None) => {
                let due = message
                    .last_broadcast_at
                    .is_none_or(|t| t + to_chrono(self.config.rebroadcast_interval) <= now);
                if due {
                    debug!(message_id = %message.id, nonce, "re-broadcasting");
                    self.broadcast(message, nonce).await?;
                }
            }
            Err(e) => warn!(message_id = %message.id, error = %e, "receipt lookup failed"),
        }
        Ok(())
    }
}
