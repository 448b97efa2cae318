//! Release snapshots and the release payload handed to workers.

use chrono::{DateTime, Utc};
use tracing::warn;

use berth_state::{
    CatalogStore, EnvironmentId, Feature, Listener, Project, ProjectId, Release, ReleaseSnapshot,
    SecretScope, SecretSnapshot, ServiceSnapshot, SpecSnapshot,
};

use crate::error::Result;
use crate::event::{FeatureRef, GitRef, ProjectRef, ReleasePayload};

/// Where a payload's services and secrets come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    /// The release's immutable snapshot.
    Snapshot,
    /// The catalog as it is now (queued releases).
    Live,
}

fn with_unit(value: &str, unit: &str) -> String {
    let value = value.trim();
    if value.is_empty() || value.ends_with(unit) {
        value.to_string()
    } else {
        format!("{value}{unit}")
    }
}

/// Services and secrets currently in effect for a project/environment.
///
/// Secrets are the project-scoped and global-scoped ones, each resolved to
/// its latest value; a secret without any value is skipped.
pub async fn capture_snapshot<S>(
    store: &S,
    project_id: &ProjectId,
    environment_id: &EnvironmentId,
) -> Result<ReleaseSnapshot>
where
    S: CatalogStore + ?Sized,
{
    let mut secrets = Vec::new();
    for scope in [SecretScope::Project, SecretScope::Global] {
        for secret in store.list_secrets(project_id, environment_id, scope).await? {
            match store.find_latest_secret_value(&secret.id).await? {
                Some(value) => secrets.push(SecretSnapshot {
                    key: secret.key,
                    value: value.value,
                    kind: secret.kind,
                }),
                None => warn!(
                    secret_id = %secret.id,
                    key = %secret.key,
                    "secret has no value; left out of snapshot"
                ),
            }
        }
    }

    let mut services = Vec::new();
    for service in store.list_services(project_id, environment_id).await? {
        let spec = store.get_service_spec(&service.spec_id).await?;
        services.push(ServiceSnapshot {
            id: service.id,
            name: service.name,
            command: service.command,
            kind: service.kind,
            replicas: service.replicas,
            spec: SpecSnapshot {
                cpu_request: with_unit(&spec.cpu_request, "m"),
                cpu_limit: with_unit(&spec.cpu_limit, "m"),
                memory_request: with_unit(&spec.memory_request, "Mi"),
                memory_limit: with_unit(&spec.memory_limit, "Mi"),
                termination_grace_period_seconds: spec.termination_grace_period_secs,
            },
            listeners: service
                .ports
                .into_iter()
                .map(|p| Listener {
                    port: p.port,
                    protocol: p.protocol,
                })
                .collect(),
        });
    }

    Ok(ReleaseSnapshot {
        services,
        secrets,
        taken_at: Utc::now(),
    })
}

/// Variables every deployment sees, appended after the release's secrets.
pub fn standard_env_vars(slug: &str, head: &Feature, now: DateTime<Utc>) -> Vec<SecretSnapshot> {
    let hash = head.short_hash().to_string();
    let created = now.to_rfc3339();
    vec![
        SecretSnapshot::env("BERTH_SLUG", slug),
        SecretSnapshot::env("BERTH_HASH", hash),
        SecretSnapshot::env("BERTH_CREATED_AT", created),
    ]
}

pub fn project_ref(project: &Project) -> ProjectRef {
    ProjectRef {
        id: project.id.to_string(),
        slug: project.slug.clone(),
        repository: project.repository.clone(),
    }
}

fn feature_ref(feature: &Feature) -> FeatureRef {
    FeatureRef {
        id: feature.id.to_string(),
        hash: feature.hash.clone(),
        parent_hash: feature.parent_hash.clone(),
        user: feature.user.clone(),
        message: feature.message.clone(),
        created: feature.created_at,
    }
}

/// Assemble the worker-facing payload for `release`.
pub async fn build_release_payload<S>(
    store: &S,
    release: &Release,
    source: PayloadSource,
    default_branch: &str,
) -> Result<ReleasePayload>
where
    S: CatalogStore + ?Sized,
{
    let project = store.get_project(&release.project_id).await?;
    let environment = store.get_environment(&release.environment_id).await?;
    let head = store.get_feature(&release.head_feature_id).await?;
    let tail = store.get_feature(&release.tail_feature_id).await?;

    let user = match store.find_user(&release.user_id).await? {
        Some(user) => user.email,
        None => {
            warn!(user_id = %release.user_id, release_id = %release.id, "release user not found");
            String::new()
        }
    };

    let branch = match store
        .find_project_settings(&release.project_id, &release.environment_id)
        .await?
    {
        Some(settings) if !settings.git_branch.is_empty() => settings.git_branch,
        _ => default_branch.to_string(),
    };

    let snapshot = match source {
        PayloadSource::Snapshot => release.snapshot.clone(),
        PayloadSource::Live => {
            capture_snapshot(store, &release.project_id, &release.environment_id).await?
        }
    };
    let mut secrets = snapshot.secrets;
    secrets.extend(standard_env_vars(&project.slug, &head, Utc::now()));

    Ok(ReleasePayload {
        id: release.id,
        project: project_ref(&project),
        git: GitRef {
            url: project.git_url.clone(),
            protocol: project.git_protocol.clone(),
            branch,
            head_hash: head.hash.clone(),
            rsa_private_key: project.rsa_private_key.clone(),
        },
        head_feature: feature_ref(&head),
        tail_feature: feature_ref(&tail),
        user,
        services: snapshot.services,
        secrets,
        environment: environment.key,
        is_rollback: release.is_rollback,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_state::FeatureId;

    #[test]
    fn units_are_appended_once() {
        assert_eq!(with_unit("100", "m"), "100m");
        assert_eq!(with_unit("100m", "m"), "100m");
        assert_eq!(with_unit("512", "Mi"), "512Mi");
        assert_eq!(with_unit("", "Mi"), "");
    }

    #[test]
    fn standard_vars_use_short_hash() {
        let head = Feature {
            id: FeatureId::new(),
            project_id: ProjectId::new(),
            hash: "abc123def456".to_string(),
            parent_hash: String::new(),
            git_ref: "refs/heads/master".to_string(),
            message: "init".to_string(),
            user: "dev".to_string(),
            created_at: Utc::now(),
        };
        let now = Utc::now();
        let vars = standard_env_vars("acme-web", &head, now);
        let keys: Vec<_> = vars.iter().map(|v| v.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["BERTH_SLUG", "BERTH_HASH", "BERTH_CREATED_AT"]
        );
        assert_eq!(vars[1].value, "abc123d");
        assert_eq!(vars[2].value, now.to_rfc3339());
    }
}
