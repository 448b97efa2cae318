//! Dependent-environment gate.
//!
//! A release into the primary environment should be backed by a complete
//! release of the same feature (or a newer one) in the secondary
//! environment. The gate never blocks: a miss yields a warning that the
//! caller records and announces.

use tracing::debug;

use berth_state::{Datastore, Release};

use crate::config::GateConfig;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Pass,
    /// Carries the complaint sent to notification extensions.
    Warn(String),
}

pub fn complaint(primary_name: &str, secondary_name: &str) -> String {
    format!(
        "This feature was deployed directly to {primary_name} without prior testing in {secondary_name}."
    )
}

pub async fn evaluate_gate<S>(store: &S, config: &GateConfig, release: &Release) -> Result<GateVerdict>
where
    S: Datastore + ?Sized,
{
    let (Some(primary_key), Some(secondary_key)) = (
        config.primary_environment.as_deref(),
        config.secondary_environment.as_deref(),
    ) else {
        return Ok(GateVerdict::Pass);
    };

    let environment = store.get_environment(&release.environment_id).await?;
    if environment.key != primary_key {
        return Ok(GateVerdict::Pass);
    }

    let Some(secondary) = store.find_environment_by_key(secondary_key).await? else {
        debug!(secondary = %secondary_key, "gate secondary environment not found; passing");
        return Ok(GateVerdict::Pass);
    };

    let head = store.get_feature(&release.head_feature_id).await?;
    let mut candidates = vec![head.id];
    candidates.extend(
        store
            .list_features_since(&release.project_id, head.created_at)
            .await?
            .into_iter()
            .map(|f| f.id)
            .filter(|id| *id != head.id),
    );

    let backed = store
        .find_complete_release_for_features(&secondary.id, &candidates)
        .await?;
    match backed {
        Some(found) => {
            debug!(release_id = %release.id, backed_by = %found.id, "gate passed");
            Ok(GateVerdict::Pass)
        }
        None => Ok(GateVerdict::Warn(complaint(&environment.name, &secondary.name))),
    }
}
