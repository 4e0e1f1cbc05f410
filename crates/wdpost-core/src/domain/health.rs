//! Sector Health Entry: cached outcome of a storage reachability probe.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorHealth {
    pub reachable: bool,
    pub checked_at: DateTime<Utc>,
}

impl SectorHealth {
    pub fn new(reachable: bool, checked_at: DateTime<Utc>) -> Self {
        Self {
            reachable,
            checked_at,
        }
    }

    /// `None` once the entry is older than `ttl`: a stale entry is unknown,
    /// neither healthy nor unhealthy.
    pub fn fresh(&self, now: DateTime<Utc>, ttl: Duration) -> Option<bool> {
        (now < self.checked_at + ttl).then_some(self.reachable)
    }
}
