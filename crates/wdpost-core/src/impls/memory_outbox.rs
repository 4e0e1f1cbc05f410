//! In-memory OutboxStore.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    Address, ChainEpoch, MessageId, MessageState, NewOutboxMessage, OutboxMessage, StoreError,
};
use crate::ports::{IdGenerator, OutboxStore, SystemClock, UlidGenerator};

#[derive(Default)]
struct MemoryOutboxState {
    messages: HashMap<MessageId, OutboxMessage>,
    /// Highest nonce reserved per sender.
    reserved: HashMap<Address, u64>,
}

impl MemoryOutboxState {
    fn message_mut(&mut self, id: MessageId) -> Result<&mut OutboxMessage, StoreError> {
        self.messages
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

pub struct MemoryOutbox {
    state: Mutex<MemoryOutboxState>,
    ids: Box<dyn IdGenerator>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::with_id_generator(UlidGenerator::new(SystemClock))
    }

    pub fn with_id_generator(ids: impl IdGenerator + 'static) -> Self {
        Self {
            state: Mutex::new(MemoryOutboxState::default()),
            ids: Box::new(ids),
        }
    }

    pub async fn snapshot(&self) -> Vec<OutboxMessage> {
        let state = self.state.lock().await;
        let mut messages: Vec<OutboxMessage> = state.messages.values().cloned().collect();
        messages.sort_by_key(|m| (m.created_at, m.id));
        messages
    }
}

impl Default for MemoryOutbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutbox {
    async fn insert(
        &self,
        msg: NewOutboxMessage,
        now: DateTime<Utc>,
    ) -> Result<OutboxMessage, StoreError> {
        let message = OutboxMessage::new(self.ids.message_id(), msg, now);
        self.state
            .lock()
            .await
            .messages
            .insert(message.id, message.clone());
        Ok(message)
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError> {
        Ok(self.state.lock().await.messages.get(&id).cloned())
    }

    async fn latest_by_key(&self, dedupe_key: &str) -> Result<Option<OutboxMessage>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .values()
            .filter(|m| m.dedupe_key == dedupe_key)
            .max_by_key(|m| (m.created_at, m.id))
            .cloned())
    }

    async fn assign_nonce(&self, id: MessageId, chain_next: u64) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let message = state.message_mut(id)?;
        if let Some(nonce) = message.nonce {
            return Ok(nonce);
        }
        let sender = message.sender.clone();

        let nonce = state
            .reserved
            .get(&sender)
            .map_or(chain_next, |highest| chain_next.max(highest + 1));
        state.reserved.insert(sender, nonce);
        state.message_mut(id)?.nonce = Some(nonce);
        Ok(nonce)
    }

    async fn mark_sent(&self, id: MessageId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let message = state.message_mut(id)?;
        if message.state.is_settled() {
            return Ok(());
        }
        message.state = MessageState::Sent;
        message.first_submitted_at.get_or_insert(now);
        message.last_broadcast_at = Some(now);
        message.updated_at = now;
        Ok(())
    }

    async fn record_failure(
        &self,
        id: MessageId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut state = self.state.lock().await;
        let message = state.message_mut(id)?;
        message.retries += 1;
        message.last_error = Some(error.to_string());
        message.last_broadcast_at = Some(now);
        message.updated_at = now;
        Ok(message.retries)
    }

    async fn mark_confirmed(
        &self,
        id: MessageId,
        epoch: ChainEpoch,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let message = state.message_mut(id)?;
        message.state = MessageState::Confirmed;
        message.confirmed_epoch = Some(epoch);
        message.updated_at = now;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: MessageId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let message = state.message_mut(id)?;
        if message.state.is_settled() {
            return Ok(false);
        }
        message.state = MessageState::Failed;
        message.last_error = Some(reason.to_string());
        message.updated_at = now;
        Ok(true)
    }

    async fn list_unsettled(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError> {
        let state = self.state.lock().await;
        let mut messages: Vec<OutboxMessage> = state
            .messages
            .values()
            .filter(|m| !m.state.is_settled())
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.created_at, m.id));
        messages.truncate(limit);
        Ok(messages)
    }
}
