//! Verified-registry state adapters per actors version.
//!
//! - v8: verifier と verified client の data cap を持つ。allocation / claim は無い
//! - v9 以降: client の data cap は datacap actor に移り、allocation / claim が増えた
//!
//! どちらも `VerifiedRegistryState` の同じ capability set を実装し、
//! 該当する概念が無い accessor は `Unsupported` を返す。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::Address;
use crate::ports::actor_state::{
    ActorStateError, ActorsVersion, Allocation, AllocationId, Claim, ClaimId, DataCap,
    VerifiedRegistryState, VisitResult,
};

/// Remove-data-cap proposal id recorded for a verifier / client pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveDataCapProposal {
    pub verifier: Address,
    pub client: Address,
    pub id: u64,
}

/// Decoded registry state of actors v8.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateV8 {
    pub root_key: Address,
    pub verifiers: BTreeMap<Address, DataCap>,
    pub verified_clients: BTreeMap<Address, DataCap>,
    #[serde(default)]
    pub remove_data_cap_proposal_ids: Vec<RemoveDataCapProposal>,
}

/// Decoded registry state of actors v9 and v10.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateV10 {
    pub root_key: Address,
    pub verifiers: BTreeMap<Address, DataCap>,
    /// Keyed by client.
    pub allocations: BTreeMap<Address, BTreeMap<AllocationId, Allocation>>,
    /// Keyed by provider.
    pub claims: BTreeMap<Address, BTreeMap<ClaimId, Claim>>,
    #[serde(default)]
    pub remove_data_cap_proposal_ids: Vec<RemoveDataCapProposal>,
}

fn proposal_id(
    proposals: &[RemoveDataCapProposal],
    verifier: &Address,
    client: &Address,
) -> Option<u64> {
    proposals
        .iter()
        .find(|p| &p.verifier == verifier && &p.client == client)
        .map(|p| p.id)
}

fn visit(
    entries: &BTreeMap<Address, DataCap>,
    f: &mut dyn FnMut(&Address, DataCap) -> VisitResult,
) -> VisitResult {
    for (addr, cap) in entries {
        f(addr, *cap)?;
    }
    Ok(())
}

pub struct VerifregV8 {
    state: StateV8,
}

impl VerifregV8 {
    pub fn new(state: StateV8) -> Self {
        Self { state }
    }

    fn unsupported(accessor: &'static str) -> ActorStateError {
        ActorStateError::Unsupported {
            accessor,
            version: ActorsVersion::V8,
        }
    }
}

impl VerifiedRegistryState for VerifregV8 {
    fn version(&self) -> ActorsVersion {
        ActorsVersion::V8
    }

    fn root_key(&self) -> Result<Address, ActorStateError> {
        Ok(self.state.root_key.clone())
    }

    fn get_allocation(
        &self,
        _client: &Address,
        _id: AllocationId,
    ) -> Result<Option<Allocation>, ActorStateError> {
        Err(Self::unsupported("get_allocation"))
    }

    fn get_allocations(
        &self,
        _client: &Address,
    ) -> Result<BTreeMap<AllocationId, Allocation>, ActorStateError> {
        Err(Self::unsupported("get_allocations"))
    }

    fn get_claim(&self, _provider: &Address, _id: ClaimId) -> Result<Option<Claim>, ActorStateError> {
        Err(Self::unsupported("get_claim"))
    }

    fn get_claims(&self, _provider: &Address) -> Result<BTreeMap<ClaimId, Claim>, ActorStateError> {
        Err(Self::unsupported("get_claims"))
    }

    fn verifier_data_cap(&self, verifier: &Address) -> Result<Option<DataCap>, ActorStateError> {
        Ok(self.state.verifiers.get(verifier).copied())
    }

    fn verified_client_data_cap(
        &self,
        client: &Address,
    ) -> Result<Option<DataCap>, ActorStateError> {
        Ok(self.state.verified_clients.get(client).copied())
    }

    fn remove_data_cap_proposal_id(
        &self,
        verifier: &Address,
        client: &Address,
    ) -> Result<Option<u64>, ActorStateError> {
        Ok(proposal_id(&self.state.remove_data_cap_proposal_ids, verifier, client))
    }

    fn for_each_verifier(
        &self,
        f: &mut dyn FnMut(&Address, DataCap) -> VisitResult,
    ) -> VisitResult {
        visit(&self.state.verifiers, f)
    }

    fn for_each_client(&self, f: &mut dyn FnMut(&Address, DataCap) -> VisitResult) -> VisitResult {
        visit(&self.state.verified_clients, f)
    }
}

pub struct VerifregV10 {
    version: ActorsVersion,
    state: StateV10,
}

impl VerifregV10 {
    pub fn new(version: ActorsVersion, state: StateV10) -> Self {
        Self { version, state }
    }

    fn unsupported(&self, accessor: &'static str) -> ActorStateError {
        ActorStateError::Unsupported {
            accessor,
            version: self.version,
        }
    }
}

impl VerifiedRegistryState for VerifregV10 {
    fn version(&self) -> ActorsVersion {
        self.version
    }

    fn root_key(&self) -> Result<Address, ActorStateError> {
        Ok(self.state.root_key.clone())
    }

    fn get_allocation(
        &self,
        client: &Address,
        id: AllocationId,
    ) -> Result<Option<Allocation>, ActorStateError> {
        Ok(self
            .state
            .allocations
            .get(client)
            .and_then(|m| m.get(&id))
            .cloned())
    }

    fn get_allocations(
        &self,
        client: &Address,
    ) -> Result<BTreeMap<AllocationId, Allocation>, ActorStateError> {
        Ok(self.state.allocations.get(client).cloned().unwrap_or_default())
    }

    fn get_claim(&self, provider: &Address, id: ClaimId) -> Result<Option<Claim>, ActorStateError> {
        Ok(self
            .state
            .claims
            .get(provider)
            .and_then(|m| m.get(&id))
            .cloned())
    }

    fn get_claims(&self, provider: &Address) -> Result<BTreeMap<ClaimId, Claim>, ActorStateError> {
        Ok(self.state.claims.get(provider).cloned().unwrap_or_default())
    }

    fn verifier_data_cap(&self, verifier: &Address) -> Result<Option<DataCap>, ActorStateError> {
        Ok(self.state.verifiers.get(verifier).copied())
    }

    /// Client caps live in the datacap actor from v9 on.
    fn verified_client_data_cap(
        &self,
        _client: &Address,
    ) -> Result<Option<DataCap>, ActorStateError> {
        Err(self.unsupported("verified_client_data_cap"))
    }

    fn remove_data_cap_proposal_id(
        &self,
        verifier: &Address,
        client: &Address,
    ) -> Result<Option<u64>, ActorStateError> {
        Ok(proposal_id(&self.state.remove_data_cap_proposal_ids, verifier, client))
    }

    fn for_each_verifier(
        &self,
        f: &mut dyn FnMut(&Address, DataCap) -> VisitResult,
    ) -> VisitResult {
        visit(&self.state.verifiers, f)
    }

    fn for_each_client(&self, _f: &mut dyn FnMut(&Address, DataCap) -> VisitResult) -> VisitResult {
        Err(self.unsupported("for_each_client"))
    }
}

/// Picks the adapter for `version` and decodes its JSON state snapshot.
pub fn load_verifreg(
    version: ActorsVersion,
    state: &[u8],
) -> Result<Box<dyn VerifiedRegistryState>, ActorStateError> {
    let decode_err = |e: serde_json::Error| ActorStateError::State(format!("{version}: {e}"));
    match version {
        ActorsVersion::V8 => {
            let state: StateV8 = serde_json::from_slice(state).map_err(decode_err)?;
            Ok(Box::new(VerifregV8::new(state)))
        }
        ActorsVersion::V9 | ActorsVersion::V10 => {
            let state: StateV10 = serde_json::from_slice(state).map_err(decode_err)?;
            Ok(Box::new(VerifregV10::new(version, state)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SectorId;
    use serde_json::json;

    fn v8_state() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "root_key": "f080",
            "verifiers": { "f0100": 1000, "f0101": 50 },
            "verified_clients": { "f0200": 300 },
        }))
        .unwrap()
    }

    fn v10_state() -> Vec<u8> {
        let claim = Claim {
            provider: Address::new("f01000"),
            client: Address::new("f0200"),
            data: "baga6ea4sea".into(),
            size: 2048,
            term_min: 100,
            term_max: 200,
            term_start: 10,
            sector: SectorId(7),
        };
        let state = StateV10 {
            root_key: Address::new("f080"),
            verifiers: BTreeMap::from([(Address::new("f0100"), 1000)]),
            allocations: BTreeMap::new(),
            claims: BTreeMap::from([(Address::new("f01000"), BTreeMap::from([(4, claim)]))]),
            remove_data_cap_proposal_ids: vec![RemoveDataCapProposal {
                verifier: Address::new("f0100"),
                client: Address::new("f0200"),
                id: 3,
            }],
        };
        serde_json::to_vec(&state).unwrap()
    }

    #[test]
    fn v8_has_clients_but_no_claims() {
        let reg = load_verifreg(ActorsVersion::V8, &v8_state()).unwrap();
        assert_eq!(
            reg.verified_client_data_cap(&Address::new("f0200")).unwrap(),
            Some(300)
        );
        let err = reg.get_claim(&Address::new("f01000"), 4).unwrap_err();
        assert!(matches!(
            err,
            ActorStateError::Unsupported { accessor: "get_claim", version: ActorsVersion::V8 }
        ));
    }

    #[test]
    fn v10_has_claims_but_no_clients() {
        let reg = load_verifreg(ActorsVersion::V10, &v10_state()).unwrap();
        let claim = reg.get_claim(&Address::new("f01000"), 4).unwrap().unwrap();
        assert_eq!(claim.sector, SectorId(7));
        assert!(reg.get_claim(&Address::new("f01000"), 5).unwrap().is_none());
        assert!(reg.get_allocations(&Address::new("f0200")).unwrap().is_empty());

        let err = reg.for_each_client(&mut |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, ActorStateError::Unsupported { version: ActorsVersion::V10, .. }));
    }

    #[test]
    fn for_each_verifier_works_in_every_version() {
        for (version, state) in [(ActorsVersion::V8, v8_state()), (ActorsVersion::V10, v10_state())] {
            let reg = load_verifreg(version, &state).unwrap();
            let mut total: DataCap = 0;
            reg.for_each_verifier(&mut |_, cap| {
                total += cap;
                Ok(())
            })
            .unwrap();
            assert!(total >= 1000, "{version}");
        }
    }

    #[test]
    fn remove_data_cap_proposal_ids_in_every_version() {
        let v8 = load_verifreg(ActorsVersion::V8, &v8_state()).unwrap();
        let v10 = load_verifreg(ActorsVersion::V10, &v10_state()).unwrap();
        let verifier = Address::new("f0100");
        let client = Address::new("f0200");

        // absent from the v8 snapshot: decodes as no proposals
        assert_eq!(v8.remove_data_cap_proposal_id(&verifier, &client).unwrap(), None);
        assert_eq!(v10.remove_data_cap_proposal_id(&verifier, &client).unwrap(), Some(3));
        assert_eq!(v10.remove_data_cap_proposal_id(&client, &verifier).unwrap(), None);
    }

    #[test]
    fn visitor_error_stops_iteration() {
        let reg = load_verifreg(ActorsVersion::V8, &v8_state()).unwrap();
        let mut seen = 0;
        let result = reg.for_each_verifier(&mut |_, _| {
            seen += 1;
            Err(ActorStateError::State("stop".into()))
        });
        assert!(result.is_err());
        assert_eq!(seen, 1);
    }

    #[test]
    fn garbage_state_is_a_state_error() {
        let err = load_verifreg(ActorsVersion::V9, b"not json").err().unwrap();
        assert!(matches!(err, ActorStateError::State(_)));
    }
}
