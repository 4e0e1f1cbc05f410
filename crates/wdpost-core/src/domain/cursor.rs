//! Chain Epoch Cursor: the last epoch the scheduler fired, plus the block ids
//! it fired them on, so a restarted scheduler neither re-fires nor skips and a
//! reorg can be located.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::chain::{BlockId, ChainEpoch};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochCursor {
    last_fired: Option<ChainEpoch>,
    lineage: BTreeMap<ChainEpoch, BlockId>,
}

impl EpochCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_fired(&self) -> Option<ChainEpoch> {
        self.last_fired
    }

    /// Block ids of fired epochs, highest first.
    pub fn lineage_desc(&self) -> impl Iterator<Item = (ChainEpoch, BlockId)> + '_ {
        self.lineage.iter().rev().map(|(e, b)| (*e, *b))
    }

    pub fn block_at(&self, epoch: ChainEpoch) -> Option<BlockId> {
        self.lineage.get(&epoch).copied()
    }

    pub fn record_fired(&mut self, epoch: ChainEpoch, block: BlockId) {
        self.lineage.insert(epoch, block);
        self.last_fired = Some(self.last_fired.map_or(epoch, |e| e.max(epoch)));
    }

    /// Marks every epoch above `ancestor` as unfired. `None` means no
    /// recorded epoch survived: everything recorded is unfired.
    pub fn rewind_to(&mut self, ancestor: Option<ChainEpoch>) {
        match ancestor {
            Some(a) => {
                let _ = self.lineage.split_off(&(a + 1));
                self.last_fired = self.last_fired.map(|e| e.min(a));
            }
            None => {
                let lowest = self.lineage.keys().next().copied();
                self.lineage.clear();
                self.last_fired = lowest.map(|e| e - 1);
            }
        }
    }

    /// Keeps at most `keep` recorded epochs.
    pub fn prune(&mut self, keep: usize) {
        while self.lineage.len() > keep {
            let Some(first) = self.lineage.keys().next().copied() else {
                break;
            };
            self.lineage.remove(&first);
        }
    }
}
