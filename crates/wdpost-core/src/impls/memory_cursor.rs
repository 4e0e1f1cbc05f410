//! In-memory CursorStore with named leader leases.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::domain::{EpochCursor, StoreError, WorkerId};
use crate::ports::CursorStore;

struct Lease {
    owner: WorkerId,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryCursorState {
    cursors: HashMap<String, EpochCursor>,
    leases: HashMap<String, Lease>,
}

#[derive(Default)]
pub struct MemoryCursorStore {
    state: Mutex<MemoryCursorState>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, name: &str) -> Result<Option<EpochCursor>, StoreError> {
        Ok(self.state.lock().await.cursors.get(name).cloned())
    }

    async fn save(&self, name: &str, cursor: &EpochCursor) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .cursors
            .insert(name.to_string(), cursor.clone());
        Ok(())
    }

    async fn try_lead(
        &self,
        name: &str,
        owner: &WorkerId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let free = match state.leases.get(name) {
            None => true,
            Some(lease) => &lease.owner == owner || lease.expires_at <= now,
        };
        if free {
            state.leases.insert(
                name.to_string(),
                Lease {
                    owner: owner.clone(),
                    expires_at: now + ttl,
                },
            );
        }
        Ok(free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn lease_is_exclusive_until_it_expires() {
        let store = MemoryCursorStore::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let ttl = Duration::seconds(60);
        let a = WorkerId::new("a");
        let b = WorkerId::new("b");

        assert!(store.try_lead("chainsched", &a, t0, ttl).await.unwrap());
        assert!(!store.try_lead("chainsched", &b, t0 + Duration::seconds(30), ttl).await.unwrap());
        // renewal by the holder
        assert!(store.try_lead("chainsched", &a, t0 + Duration::seconds(30), ttl).await.unwrap());
        assert!(!store.try_lead("chainsched", &b, t0 + Duration::seconds(60), ttl).await.unwrap());
        assert!(store.try_lead("chainsched", &b, t0 + Duration::seconds(90), ttl).await.unwrap());
    }
}
