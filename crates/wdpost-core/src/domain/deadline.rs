//! Deadline assignments: which sectors a provider must prove, and when.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::chain::{Address, ChainEpoch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectorId(pub u64);

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Timing of one proving deadline.
///
/// - `challenge`: epoch whose randomness seeds the proof (before `open`)
/// - `open` / `close`: the window in which the proof must land on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineInfo {
    pub index: u64,
    pub period_start: ChainEpoch,
    pub challenge: ChainEpoch,
    pub open: ChainEpoch,
    pub close: ChainEpoch,
}

impl DeadlineInfo {
    /// Proving work for this deadline may start at `epoch`.
    pub fn is_challenge_open(&self, epoch: ChainEpoch) -> bool {
        epoch >= self.challenge && epoch < self.close
    }

    /// A proof landing at or after `close` is worthless.
    pub fn has_elapsed(&self, epoch: ChainEpoch) -> bool {
        epoch >= self.close
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub index: u64,
    pub sectors: Vec<SectorId>,
    /// Sectors currently declared faulty on chain.
    #[serde(default)]
    pub faulty: Vec<SectorId>,
}

/// Sectors a provider must prove for the deadline current at some epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineAssignment {
    pub provider: Address,
    pub deadline: DeadlineInfo,
    pub partitions: Vec<Partition>,
}

impl DeadlineAssignment {
    /// Sectors of the selected partitions, in partition order.
    pub fn sectors_of(&self, partitions: &[u64]) -> Vec<SectorId> {
        self.partitions
            .iter()
            .filter(|p| partitions.contains(&p.index))
            .flat_map(|p| p.sectors.iter().copied())
            .collect()
    }

    /// Groups non-empty partitions into batches of at most `per_batch`.
    pub fn partition_batches(&self, per_batch: usize) -> Vec<Vec<u64>> {
        let indices: Vec<u64> = self
            .partitions
            .iter()
            .filter(|p| !p.sectors.is_empty())
            .map(|p| p.index)
            .collect();
        indices
            .chunks(per_batch.max(1))
            .map(|c| c.to_vec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn deadline() -> DeadlineInfo {
        DeadlineInfo {
            index: 3,
            period_start: 0,
            challenge: 80,
            open: 100,
            close: 160,
        }
    }

    #[rstest]
    #[case(79, false)]
    #[case(80, true)]
    #[case(159, true)]
    #[case(160, false)]
    fn challenge_window(#[case] epoch: ChainEpoch, #[case] open: bool) {
        assert_eq!(deadline().is_challenge_open(epoch), open);
    }

    #[test]
    fn batches_skip_empty_partitions() {
        let a = DeadlineAssignment {
            provider: Address::new("f01000"),
            deadline: deadline(),
            partitions: vec![
                Partition { index: 0, sectors: vec![SectorId(1)], faulty: vec![] },
                Partition { index: 1, sectors: vec![], faulty: vec![] },
                Partition { index: 2, sectors: vec![SectorId(2)], faulty: vec![] },
                Partition { index: 3, sectors: vec![SectorId(3)], faulty: vec![] },
            ],
        };

        assert_eq!(a.partition_batches(2), vec![vec![0, 2], vec![3]]);
        assert_eq!(a.sectors_of(&[0, 3]), vec![SectorId(1), SectorId(3)]);
    }
}
