//! Message - 永続 outbox によるトランザクション送信
//!
//! 状態（nonce, 送信済みか, 確定したか）はすべて OutboxStore にあり、
//! どの worker の `MessageSender` ループでも同じメッセージを引き継げる。

pub mod sender;

pub use self::sender::{MessageSender, SenderConfig};
