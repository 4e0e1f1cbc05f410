//! Fault Tracker - セクター到達性の TTL キャッシュ
//!
//! - 新鮮なエントリは I/O なしで返す
//! - 古い / 無いエントリだけ並列に probe（`parallel_check_limit` で上限）
//! - 1 セクターのチェックは `single_check_timeout`、probe 全体は
//!   `partition_check_timeout` で打ち切る。タイムアウトも「unhealthy」として
//!   TTL の間キャッシュする

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::domain::{SectorHealth, SectorId};
use crate::ports::{Clock, SectorStorage, to_chrono};

#[derive(Debug, Clone, PartialEq)]
pub struct FaultTrackerConfig {
    pub parallel_check_limit: usize,
    pub single_check_timeout: Duration,
    pub partition_check_timeout: Duration,
    pub health_ttl: Duration,
}

impl Default for FaultTrackerConfig {
    fn default() -> Self {
        Self {
            parallel_check_limit: 32,
            single_check_timeout: Duration::from_secs(5),
            partition_check_timeout: Duration::from_secs(300),
            health_ttl: Duration::from_secs(600),
        }
    }
}

pub struct FaultTracker {
    storage: Arc<dyn SectorStorage>,
    clock: Arc<dyn Clock>,
    cache: Mutex<HashMap<SectorId, SectorHealth>>,
    checks: Arc<Semaphore>,
    config: FaultTrackerConfig,
}

impl FaultTracker {
    pub fn new(
        storage: Arc<dyn SectorStorage>,
        clock: Arc<dyn Clock>,
        config: FaultTrackerConfig,
    ) -> Self {
        Self {
            storage,
            clock,
            cache: Mutex::new(HashMap::new()),
            checks: Arc::new(Semaphore::new(config.parallel_check_limit.max(1))),
            config,
        }
    }

    // entries are plain values, so a poisoned map is still consistent
    fn cache(&self) -> MutexGuard<'_, HashMap<SectorId, SectorHealth>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached(&self, sector: SectorId) -> Option<bool> {
        let now = self.clock.now();
        let ttl = to_chrono(self.config.health_ttl);
        self.cache().get(&sector).and_then(|h| h.fresh(now, ttl))
    }

    fn record(&self, sector: SectorId, reachable: bool) {
        let entry = SectorHealth::new(reachable, self.clock.now());
        self.cache().insert(sector, entry);
    }

    /// Health of every requested sector. Fresh entries answer without I/O;
    /// the rest are checked now and cached.
    pub async fn probe(&self, sectors: &[SectorId]) -> BTreeMap<SectorId, bool> {
        let mut result = BTreeMap::new();
        let mut stale = Vec::new();
        for &sector in sectors {
            match self.cached(sector) {
                Some(healthy) => {
                    result.insert(sector, healthy);
                }
                None if !stale.contains(&sector) => stale.push(sector),
                None => {}
            }
        }
        if stale.is_empty() {
            return result;
        }
        debug!(cached = result.len(), checking = stale.len(), "probing sectors");

        let single = self.config.single_check_timeout;
        let mut checks: FuturesUnordered<_> = stale
            .iter()
            .map(|&sector| {
                let permits = Arc::clone(&self.checks);
                let storage = &self.storage;
                async move {
                    let outcome = match permits.acquire_owned().await {
                        Ok(_permit) => match tokio::time::timeout(single, storage.check(sector)).await {
                            Ok(Ok(())) => Ok(()),
                            Ok(Err(reason)) => Err(reason),
                            Err(_) => Err(format!("check timed out after {single:?}")),
                        },
                        Err(_) => Err("check limiter closed".to_string()),
                    };
                    (sector, outcome)
                }
            })
            .collect();

        let deadline = tokio::time::Instant::now() + self.config.partition_check_timeout;
        loop {
            match tokio::time::timeout_at(deadline, checks.next()).await {
                Ok(Some((sector, outcome))) => {
                    if let Err(reason) = &outcome {
                        warn!(sector = %sector, reason = %reason, "sector unreachable");
                    }
                    self.record(sector, outcome.is_ok());
                    result.insert(sector, outcome.is_ok());
                }
                Ok(None) => break,
                Err(_) => {
                    // whatever is still outstanding counts as unhealthy
                    for &sector in &stale {
                        if !result.contains_key(&sector) {
                            warn!(sector = %sector, "sector check exceeded the probe deadline");
                            self.record(sector, false);
                            result.insert(sector, false);
                        }
                    }
                    break;
                }
            }
        }
        result
    }

    /// Caches sectors the prover failed on as unhealthy.
    pub fn mark_faulty(&self, sectors: &[SectorId]) {
        for &sector in sectors {
            self.record(sector, false);
        }
    }
}
