//! Outbox Message: a transaction on its way to the chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::chain::{Address, ChainEpoch, TokenAmount};
use super::ids::MessageId;

/// Submission state.
///
/// - Pending: not yet broadcast (held under the fee ceiling, or broadcast failed)
/// - Sent: broadcast at least once, not yet observed on chain
/// - Confirmed / Failed: settled, no further work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Pending,
    Sent,
    Confirmed,
    Failed,
}

impl MessageState {
    pub fn is_settled(self) -> bool {
        matches!(self, MessageState::Confirmed | MessageState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageState::Pending => "pending",
            MessageState::Sent => "sent",
            MessageState::Confirmed => "confirmed",
            MessageState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageState::Pending),
            "sent" => Some(MessageState::Sent),
            "confirmed" => Some(MessageState::Confirmed),
            "failed" => Some(MessageState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub sender: Address,

    /// Assigned exactly once, at the first broadcast attempt.
    pub nonce: Option<u64>,

    pub payload: Vec<u8>,
    pub payload_hash: String,

    /// Logical identity of the payload; resubmits with the same key reuse
    /// the outstanding message.
    pub dedupe_key: String,

    pub state: MessageState,
    pub max_fee: TokenAmount,
    pub retries: u32,
    pub last_error: Option<String>,

    /// Held messages fail once this passes without a broadcast.
    pub hold_until: DateTime<Utc>,

    pub first_submitted_at: Option<DateTime<Utc>>,
    pub last_broadcast_at: Option<DateTime<Utc>>,
    pub confirmed_epoch: Option<ChainEpoch>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxMessage {
    pub fn new(id: MessageId, new: NewOutboxMessage, now: DateTime<Utc>) -> Self {
        let payload_hash = payload_hash(&new.payload);
        Self {
            id,
            sender: new.sender,
            nonce: None,
            payload: new.payload,
            payload_hash,
            dedupe_key: new.dedupe_key,
            state: MessageState::Pending,
            max_fee: new.max_fee,
            retries: 0,
            last_error: None,
            hold_until: new.hold_until,
            first_submitted_at: None,
            last_broadcast_at: None,
            confirmed_epoch: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn to_signed(&self, nonce: u64) -> SignedMessage {
        SignedMessage {
            from: self.sender.clone(),
            nonce,
            payload: self.payload.clone(),
            max_fee: self.max_fee,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub sender: Address,
    pub payload: Vec<u8>,
    pub dedupe_key: String,
    pub max_fee: TokenAmount,
    pub hold_until: DateTime<Utc>,
}

/// What is handed to the message pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub from: Address,
    pub nonce: u64,
    pub payload: Vec<u8>,
    pub max_fee: TokenAmount,
}

/// Inclusion result of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub epoch: ChainEpoch,
    pub exit_code: i64,
}

impl Receipt {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

pub fn payload_hash(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}
