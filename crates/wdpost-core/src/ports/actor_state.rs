//! Versioned verified-registry state accessor.
//!
//! The on-chain schema changes between actor versions; callers see one
//! capability set. An accessor with no equivalent in the active schema
//! returns `ActorStateError::Unsupported` instead of empty data.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::domain::{Address, ChainEpoch, SectorId};

pub type DataCap = u128;
pub type AllocationId = u64;
pub type ClaimId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActorsVersion {
    V8,
    V9,
    V10,
}

impl ActorsVersion {
    /// Registry schema in effect for an actors version number.
    pub fn from_number(n: u32) -> Option<Self> {
        match n {
            8 => Some(ActorsVersion::V8),
            9 => Some(ActorsVersion::V9),
            10 => Some(ActorsVersion::V10),
            _ => None,
        }
    }
}

impl fmt::Display for ActorsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            ActorsVersion::V8 => 8,
            ActorsVersion::V9 => 9,
            ActorsVersion::V10 => 10,
        };
        write!(f, "actors v{n}")
    }
}

#[derive(Debug, Error)]
pub enum ActorStateError {
    #[error("{accessor} unsupported in {version}")]
    Unsupported {
        accessor: &'static str,
        version: ActorsVersion,
    },

    #[error("actor state: {0}")]
    State(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub client: Address,
    pub provider: Address,
    pub data: String,
    pub size: u64,
    pub term_min: ChainEpoch,
    pub term_max: ChainEpoch,
    pub expiration: ChainEpoch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub provider: Address,
    pub client: Address,
    pub data: String,
    pub size: u64,
    pub term_min: ChainEpoch,
    pub term_max: ChainEpoch,
    pub term_start: ChainEpoch,
    pub sector: SectorId,
}

pub type VisitResult = Result<(), ActorStateError>;

pub trait VerifiedRegistryState: Send + Sync {
    fn version(&self) -> ActorsVersion;

    fn root_key(&self) -> Result<Address, ActorStateError>;

    fn get_allocation(
        &self,
        client: &Address,
        id: AllocationId,
    ) -> Result<Option<Allocation>, ActorStateError>;

    fn get_allocations(
        &self,
        client: &Address,
    ) -> Result<BTreeMap<AllocationId, Allocation>, ActorStateError>;

    fn get_claim(&self, provider: &Address, id: ClaimId) -> Result<Option<Claim>, ActorStateError>;

    fn get_claims(&self, provider: &Address) -> Result<BTreeMap<ClaimId, Claim>, ActorStateError>;

    fn verifier_data_cap(&self, verifier: &Address) -> Result<Option<DataCap>, ActorStateError>;

    fn verified_client_data_cap(
        &self,
        client: &Address,
    ) -> Result<Option<DataCap>, ActorStateError>;

    /// Last proposal id a verifier used to remove data cap from a client;
    /// `None` when the pair never had one.
    fn remove_data_cap_proposal_id(
        &self,
        verifier: &Address,
        client: &Address,
    ) -> Result<Option<u64>, ActorStateError>;

    fn for_each_verifier(
        &self,
        f: &mut dyn FnMut(&Address, DataCap) -> VisitResult,
    ) -> VisitResult;

    fn for_each_client(&self, f: &mut dyn FnMut(&Address, DataCap) -> VisitResult) -> VisitResult;
}
