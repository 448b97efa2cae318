//! Fingerprints of a release snapshot's services and secrets.
//!
//! Each entry is serialized to JSON, the entries are sorted, and the joined
//! text is hashed, so the signature depends only on content and never on the
//! order rows came back from storage.

use serde::Serialize;

use berth_state::{ReleaseSnapshot, SecretSnapshot, ServiceSnapshot, Signature};

use crate::error::Result;

fn fingerprint<T: Serialize>(entries: &[T]) -> Result<Signature> {
    let mut lines = entries
        .iter()
        .map(serde_json::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    lines.sort();
    Ok(Signature::from_bytes(lines.join("\n").as_bytes()))
}

pub fn services_signature(services: &[ServiceSnapshot]) -> Result<Signature> {
    fingerprint(services)
}

pub fn secrets_signature(secrets: &[SecretSnapshot]) -> Result<Signature> {
    fingerprint(secrets)
}

/// `(services, secrets)` signatures of a snapshot.
pub fn snapshot_signatures(snapshot: &ReleaseSnapshot) -> Result<(Signature, Signature)> {
    Ok((
        services_signature(&snapshot.services)?,
        secrets_signature(&snapshot.secrets)?,
    ))
}
