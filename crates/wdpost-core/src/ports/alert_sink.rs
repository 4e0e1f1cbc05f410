//! AlertSink port - 運用者に見える通知先
//!
//! ログ / メトリクス / 外部アラートなど。握りつぶしてはいけない。

use async_trait::async_trait;

use crate::domain::Alert;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: Alert);
}
