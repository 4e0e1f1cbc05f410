//! Domain identifiers (strongly-typed IDs).
//!
//! Task と Message の ID は ULID ベース。複数の worker プロセスが調整なしで
//! 生成でき、生成時刻順にソートできる。
//!
//! `Id<T>` の `T` は PhantomData のマーカー型で、`TaskId` と `MessageId` を
//! コンパイル時に区別する。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait providing the display prefix of an ID type.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Parses both the prefixed display form (`task-01H...`) and a bare ULID.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Message {}

impl IdMarker for Message {
    fn prefix() -> &'static str {
        "msg-"
    }
}

/// Identifier of a Task Record (one claimable unit of work).
pub type TaskId = Id<Task>;

/// Identifier of an Outbox Message.
pub type MessageId = Id<Message>;

/// Identity of a worker process, recorded as the owner of claimed tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// `{name}-{ulid}`: unique per process start, so a restarted worker never
    /// inherits claims of its previous incarnation.
    pub fn generate(name: &str) -> Self {
        Self(format!("{name}-{}", Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let task = TaskId::from_ulid(Ulid::new());
        let msg = MessageId::from_ulid(Ulid::new());

        assert!(task.to_string().starts_with("task-"));
        assert!(msg.to_string().starts_with("msg-"));
        // let _: TaskId = msg; // <- does not compile
    }

    #[test]
    fn display_form_parses_back() {
        let id = TaskId::from_ulid(Ulid::new());
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        let bare: TaskId = id.as_ulid().to_string().parse().unwrap();
        assert_eq!(bare, id);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<TaskId>(), size_of::<Ulid>());
        assert_eq!(size_of::<MessageId>(), 16);
    }

    #[test]
    fn generated_worker_ids_are_unique() {
        let a = WorkerId::generate("prover");
        let b = WorkerId::generate("prover");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("prover-"));
    }
}
