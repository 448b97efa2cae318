//! Resolution of an installed extension's configuration into worker artifacts.

use tracing::warn;
use uuid::Uuid;

use berth_state::{Artifact, CatalogStore, Extension, ProjectExtension, SecretId};

use crate::error::Result;

/// Build the input artifacts for one project extension.
///
/// 1. Each entry of the extension's config schema, in order. The project
///    extension's value replaces the default when the entry allows overrides
///    and the project value is non-empty. A value that parses as a UUID is a
///    secret reference and resolves to that secret's latest value (empty,
///    with a warning, when the secret has no value).
/// 2. The project extension's stored artifacts.
/// 3. Custom config entries, sorted by key, as plain artifacts.
pub async fn resolve_artifacts<S>(
    store: &S,
    project_extension: &ProjectExtension,
    extension: &Extension,
) -> Result<Vec<Artifact>>
where
    S: CatalogStore + ?Sized,
{
    let mut artifacts = Vec::with_capacity(extension.config.len());

    for entry in &extension.config {
        let mut value = entry.value.clone();
        if entry.allow_override {
            if let Some(project_value) = project_extension
                .config
                .iter()
                .find(|pc| pc.key == entry.key && !pc.value.is_empty())
            {
                value = project_value.value.clone();
            }
        }

        if let Ok(id) = Uuid::parse_str(&value) {
            let secret_id = SecretId::from(id);
            value = match store.find_latest_secret_value(&secret_id).await? {
                Some(secret) => secret.value,
                None => {
                    warn!(
                        secret_id = %secret_id,
                        key = %entry.key,
                        project_extension_id = %project_extension.id,
                        "secret referenced by extension config has no value"
                    );
                    String::new()
                }
            };
        }

        artifacts.push(Artifact {
            source: None,
            key: entry.key.clone(),
            value: serde_json::Value::String(value),
            secret: entry.secret,
        });
    }

    artifacts.extend(project_extension.artifacts.iter().cloned());

    let mut custom: Vec<_> = project_extension.custom_config.iter().collect();
    custom.sort_by(|a, b| a.0.cmp(b.0));
    artifacts.extend(
        custom
            .into_iter()
            .map(|(key, value)| Artifact::new(key.clone(), value.clone())),
    );

    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_state::{
        EnvironmentId, ExtConfig, ExtensionId, ExtensionKind, MemoryStore, ProjectId, SecretValue,
        SecretValueId,
    };
    use chrono::Utc;
    use serde_json::json;

    fn extension(config: Vec<ExtConfig>) -> Extension {
        Extension {
            id: ExtensionId::new(),
            environment_id: EnvironmentId::new(),
            key: "dockerbuilder".to_string(),
            name: "Docker Builder".to_string(),
            kind: ExtensionKind::Workflow,
            component: String::new(),
            cacheable: true,
            config,
        }
    }

    #[tokio::test]
    async fn overrides_only_when_allowed_and_non_empty() {
        let store = MemoryStore::new();
        let ext = extension(vec![
            ExtConfig::new("ORG", "default-org").overridable(),
            ExtConfig::new("HOST", "registry.local"),
            ExtConfig::new("TAG", "latest").overridable(),
        ]);
        let mut pe = ProjectExtension::new(ProjectId::new(), ext.environment_id, &ext);
        pe.config = vec![
            ExtConfig::new("ORG", "acme"),
            ExtConfig::new("HOST", "evil.example"),
            ExtConfig::new("TAG", ""),
        ];

        let artifacts = resolve_artifacts(&store, &pe, &ext).await.unwrap();
        let values: Vec<_> = artifacts.iter().map(|a| a.value_string()).collect();
        assert_eq!(values, vec!["acme", "registry.local", "latest"]);
    }

    #[tokio::test]
    async fn uuid_values_resolve_to_latest_secret_value() {
        let store = MemoryStore::new();
        let secret_id = SecretId::new();
        for (i, value) in ["old", "new"].iter().enumerate() {
            store
                .add_secret_value(SecretValue {
                    id: SecretValueId::new(),
                    secret_id,
                    value: value.to_string(),
                    user_id: None,
                    created_at: Utc::now() + chrono::Duration::seconds(i as i64),
                })
                .await
                .unwrap();
        }
        let ext = extension(vec![
            ExtConfig::new("PASSWORD", secret_id.to_string()).secret(),
            ExtConfig::new("MISSING", SecretId::new().to_string()),
        ]);
        let pe = ProjectExtension::new(ProjectId::new(), ext.environment_id, &ext);

        let artifacts = resolve_artifacts(&store, &pe, &ext).await.unwrap();
        assert_eq!(artifacts[0].value_string(), "new");
        assert!(artifacts[0].secret);
        assert_eq!(artifacts[1].value_string(), "");
    }

    #[tokio::test]
    async fn stored_artifacts_then_sorted_custom_config() {
        let store = MemoryStore::new();
        let ext = extension(vec![ExtConfig::new("ORG", "acme")]);
        let mut pe = ProjectExtension::new(ProjectId::new(), ext.environment_id, &ext);
        pe.artifacts = vec![Artifact::new("DNS", "web.acme.dev")];
        pe.custom_config.insert("zeta".to_string(), json!(1));
        pe.custom_config.insert("alpha".to_string(), json!({"a": true}));

        let keys: Vec<_> = resolve_artifacts(&store, &pe, &ext)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.key)
            .collect();
        assert_eq!(keys, vec!["ORG", "DNS", "alpha", "zeta"]);
    }
}
