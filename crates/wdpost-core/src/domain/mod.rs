//! Domain model: chain primitives, deadlines, task and outbox records,
//! sector health, errors and alerts.

pub mod alert;
pub mod chain;
pub mod cursor;
pub mod deadline;
pub mod errors;
pub mod health;
pub mod ids;
pub mod outbox;
pub mod task;

pub use alert::{Alert, AlertKind, AlertSubject};
pub use chain::{Address, BlockId, ChainEpoch, Head, Randomness, TokenAmount};
pub use cursor::EpochCursor;
pub use deadline::{DeadlineAssignment, DeadlineInfo, Partition, SectorId};
pub use errors::{ChainError, ErrorKind, ProveError, StoreError, TaskError};
pub use health::SectorHealth;
pub use ids::{MessageId, TaskId, WorkerId};
pub use outbox::{MessageState, NewOutboxMessage, OutboxMessage, Receipt, SignedMessage};
pub use task::{Enqueued, NewTask, TaskRecord, TaskStatus, TaskType};
