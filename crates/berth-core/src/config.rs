//! Orchestrator configuration.
//!
//! Loaded from an optional TOML file, then overridden from the environment:
//!
//! ```toml
//! [gate]
//! primary_environment = "production"
//! secondary_environment = "staging"
//!
//! [release]
//! default_branch = "master"
//!
//! [store]
//! endpoint = "ws://localhost:8000"
//! namespace = "berth"
//! database = "main"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Dependent-environment gate settings. The gate is active only when both
/// keys are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Environment whose releases are checked (e.g. `production`).
    pub primary_environment: Option<String>,
    /// Environment that must already hold a complete release.
    pub secondary_environment: Option<String>,
}

impl GateConfig {
    pub fn is_enabled(&self) -> bool {
        self.primary_environment.is_some() && self.secondary_environment.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    /// Branch used when a project has no settings for the environment.
    pub default_branch: String,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            default_branch: "master".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SurrealDB URL. `None` falls back to the `SURREALDB_*` environment chain.
    pub endpoint: Option<String>,
    pub namespace: String,
    pub database: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            namespace: berth_state::connect::DEFAULT_NAMESPACE.to_string(),
            database: berth_state::connect::DEFAULT_DATABASE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub gate: GateConfig,
    pub release: ReleaseConfig,
    pub store: StoreConfig,
}

impl OrchestratorConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read `path` (defaults when `None`) and apply process environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                debug!(path = %path.display(), "loading config file");
                Self::from_toml(&std::fs::read_to_string(path)?)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from `lookup`.
    ///
    /// `BERTH_GATE_PRIMARY` / `BERTH_GATE_SECONDARY` win over the file; the
    /// older `CHILD_ENVIRONMENT` / `PARENT_ENVIRONMENT` names are used only
    /// when neither the file nor the new names set a value.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(primary) = non_empty("BERTH_GATE_PRIMARY") {
            self.gate.primary_environment = Some(primary);
        } else if self.gate.primary_environment.is_none() {
            self.gate.primary_environment = non_empty("CHILD_ENVIRONMENT");
        }

        if let Some(secondary) = non_empty("BERTH_GATE_SECONDARY") {
            self.gate.secondary_environment = Some(secondary);
        } else if self.gate.secondary_environment.is_none() {
            self.gate.secondary_environment = non_empty("PARENT_ENVIRONMENT");
        }

        if let Some(branch) = non_empty("BERTH_DEFAULT_BRANCH") {
            self.release.default_branch = branch;
        }
        if let Some(endpoint) = non_empty("SURREALDB_URL") {
            self.store.endpoint = Some(endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_disable_gate() {
        let config = OrchestratorConfig::default();
        assert!(!config.gate.is_enabled());
        assert_eq!(config.release.default_branch, "master");
        assert_eq!(config.store.namespace, "berth");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = OrchestratorConfig::from_toml(
            r#"
            [gate]
            primary_environment = "production"
            secondary_environment = "staging"
            "#,
        )
        .unwrap();
        assert!(config.gate.is_enabled());
        assert_eq!(config.release.default_branch, "master");
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[release]\ndefault_branch = \"main\"").unwrap();
        let config = OrchestratorConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.release.default_branch, "main");
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let err = OrchestratorConfig::from_toml("[gate\n").unwrap_err();
        assert!(matches!(err, crate::error::BerthError::Config(_)));
    }

    #[test]
    fn new_env_names_override_file() {
        let mut config = OrchestratorConfig::from_toml(
            "[gate]\nprimary_environment = \"prod\"\nsecondary_environment = \"stage\"\n",
        )
        .unwrap();
        config.apply_env(env(&[
            ("BERTH_GATE_PRIMARY", "production"),
            ("PARENT_ENVIRONMENT", "ignored"),
        ]));
        assert_eq!(config.gate.primary_environment.as_deref(), Some("production"));
        assert_eq!(config.gate.secondary_environment.as_deref(), Some("stage"));
    }

    #[test]
    fn legacy_names_fill_gaps() {
        let mut config = OrchestratorConfig::default();
        config.apply_env(env(&[
            ("CHILD_ENVIRONMENT", "production"),
            ("PARENT_ENVIRONMENT", "staging"),
            ("BERTH_GATE_SECONDARY", ""),
        ]));
        assert_eq!(config.gate.primary_environment.as_deref(), Some("production"));
        assert_eq!(config.gate.secondary_environment.as_deref(), Some("staging"));
    }
}
