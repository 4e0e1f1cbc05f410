//! `wdpost verifreg`: verified registry の snapshot から provider の状況を出す
//!
//! その version に無い accessor（v8 の claim など）は省略して続ける。

use anyhow::Context;
use serde_json::{Value, json};
use tracing::{info, warn};
use wdpost_core::domain::Address;
use wdpost_core::impls::load_verifreg;
use wdpost_core::ports::{ActorStateError, ActorsVersion, DataCap, VerifiedRegistryState};

use crate::cli::VerifregCommand;

pub(crate) fn inspect(cmd: VerifregCommand) -> anyhow::Result<()> {
    let version = ActorsVersion::from_number(cmd.actors_version)
        .with_context(|| format!("unsupported actors version {}", cmd.actors_version))?;
    let raw = std::fs::read(&cmd.state)
        .with_context(|| format!("reading {}", cmd.state.display()))?;
    let registry = load_verifreg(version, &raw)?;

    let summary = summarize(registry.as_ref(), &Address::new(cmd.provider))?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn supported<T>(result: Result<T, ActorStateError>) -> Result<Option<T>, ActorStateError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e @ ActorStateError::Unsupported { .. }) => {
            warn!(error = %e, "skipping accessor");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn summarize(
    registry: &dyn VerifiedRegistryState,
    provider: &Address,
) -> Result<Value, ActorStateError> {
    let mut verifiers = 0usize;
    let mut total: DataCap = 0;
    registry.for_each_verifier(&mut |_, cap| {
        verifiers += 1;
        total = total.saturating_add(cap);
        Ok(())
    })?;
    let claims = supported(registry.get_claims(provider))?;
    info!(version = %registry.version(), verifiers, "verified registry loaded");

    Ok(json!({
        "version": registry.version().to_string(),
        "root_key": registry.root_key()?,
        "verifiers": verifiers,
        // u128 does not fit a JSON number
        "verifier_data_cap": total.to_string(),
        "provider": provider,
        "claims": claims.as_ref().map(|c| c.len()),
        "claimed_bytes": claims.as_ref().map(|c| c.values().map(|claim| claim.size).sum::<u64>()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v8_summary_omits_claims() {
        let state = serde_json::to_vec(&json!({
            "root_key": "f080",
            "verifiers": { "f0100": 1000, "f0101": 50 },
            "verified_clients": {},
        }))
        .unwrap();
        let registry = load_verifreg(ActorsVersion::V8, &state).unwrap();

        let summary = summarize(registry.as_ref(), &Address::new("f01000")).unwrap();
        assert_eq!(summary["verifiers"], 2);
        assert_eq!(summary["verifier_data_cap"], "1050");
        assert_eq!(summary["root_key"], "f080");
        assert!(summary["claims"].is_null());
    }

    #[test]
    fn unknown_actors_version_is_rejected() {
        assert!(ActorsVersion::from_number(7).is_none());
        assert_eq!(ActorsVersion::from_number(9), Some(ActorsVersion::V9));
    }
}
