//! Persisted records of the release orchestration domain.
//!
//! Catalog records (`Project`, `Environment`, `Extension`, `Secret`, ...) are
//! written by the API collaborator and only read by the engine. `Release`,
//! `ReleaseExtension` and `ProjectExtension` are mutated by the engine and
//! carry a `version` counter used for compare-and-swap updates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;
use crate::ids::*;

// ---------------------------------------------------------------------------
// Shared vocabulary
// ---------------------------------------------------------------------------

/// Lifecycle state shared by releases, release extensions, project extensions
/// and bus events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Waiting,
    Running,
    Complete,
    Failed,
    Canceled,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Waiting => "waiting",
            State::Running => "running",
            State::Complete => "complete",
            State::Failed => "failed",
            State::Canceled => "canceled",
        }
    }

    /// `complete`, `failed` and `canceled` are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Complete | State::Failed | State::Canceled)
    }

    /// `waiting` and `running` releases occupy the project/environment queue.
    pub fn is_active(&self) -> bool {
        matches!(self, State::Waiting | State::Running)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(State::Waiting),
            "running" => Ok(State::Running),
            "complete" => Ok(State::Complete),
            "failed" => Ok(State::Failed),
            "canceled" => Ok(State::Canceled),
            other => Err(StorageError::Backend(format!("unknown state: {other}"))),
        }
    }
}

/// Verb requested of, or reported by, an extension worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
    Status,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Status => "status",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an extension does for a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionKind {
    /// Produces build-time artifacts (image builds and the like).
    Workflow,
    /// Performs the rollout.
    Deployment,
    /// Receives release outcome notifications.
    Notification,
    /// Provisioned once per project; never dispatched by releases.
    Once,
}

impl ExtensionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionKind::Workflow => "workflow",
            ExtensionKind::Deployment => "deployment",
            ExtensionKind::Notification => "notification",
            ExtensionKind::Once => "once",
        }
    }

    /// Kinds that get a `ReleaseExtension` work item per release.
    pub fn is_release_stage(&self) -> bool {
        matches!(self, ExtensionKind::Workflow | ExtensionKind::Deployment)
    }
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value substituted for secret artifact and secret values on unprivileged paths.
pub const REDACTED: &str = "********";

/// One key/value output or input of an extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Extension key that produced the artifact, when it was forwarded from
    /// another stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub secret: bool,
}

impl Artifact {
    pub fn new(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            source: None,
            key: key.into(),
            value: value.into(),
            secret: false,
        }
    }

    pub fn secret(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            secret: true,
            ..Self::new(key, value)
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Copy with the value masked when the artifact is secret.
    pub fn redacted(&self) -> Self {
        if self.secret {
            Self {
                value: serde_json::Value::String(REDACTED.to_string()),
                ..self.clone()
            }
        } else {
            self.clone()
        }
    }

    /// String form of the value (unquoted for JSON strings).
    pub fn value_string(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// One entry of an extension's configuration schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtConfig {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub secret: bool,
    #[serde(default)]
    pub allow_override: bool,
}

impl ExtConfig {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            secret: false,
            allow_override: false,
        }
    }

    pub fn overridable(mut self) -> Self {
        self.allow_override = true;
        self
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }
}

/// Stable SHA-256 fingerprint (hex) of an input set.
///
/// The inner field is private so a `Signature` is always 64 lowercase hex
/// characters, produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature(String);

impl Signature {
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        Signature(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for logs.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for Signature {
    type Error = StorageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidRecord {
                entity: "signature",
                id: s,
                reason: "expected 64 hex characters".to_string(),
            });
        }
        Ok(Signature(s.to_ascii_lowercase()))
    }
}

impl From<Signature> for String {
    fn from(sig: Signature) -> Self {
        sig.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Semantic checks applied to a record after it is decoded from storage.
pub trait Validate {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

fn validate_artifacts(artifacts: &[Artifact]) -> Result<(), String> {
    match artifacts.iter().position(|a| a.key.trim().is_empty()) {
        Some(idx) => Err(format!("artifact #{idx} has an empty key")),
        None => Ok(()),
    }
}

fn validate_config(config: &[ExtConfig]) -> Result<(), String> {
    let mut seen = std::collections::HashSet::new();
    for (idx, entry) in config.iter().enumerate() {
        if entry.key.trim().is_empty() {
            return Err(format!("config entry #{idx} has an empty key"));
        }
        if !seen.insert(entry.key.as_str()) {
            return Err(format!("config key {} appears more than once", entry.key));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Catalog records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub slug: String,
    pub repository: String,
    pub git_url: String,
    pub git_protocol: String,
    pub rsa_private_key: String,
    pub rsa_public_key: String,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, slug: impl Into<String>) -> Self {
        let slug = slug.into();
        Self {
            id: ProjectId::new(),
            name: name.into(),
            repository: slug.clone(),
            git_url: format!("git@github.com:{slug}.git"),
            git_protocol: "SSH".to_string(),
            slug,
            rsa_private_key: String::new(),
            rsa_public_key: String::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvironmentId,
    pub name: String,
    pub key: String,
    pub is_default: bool,
    pub color: String,
}

impl Environment {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: EnvironmentId::new(),
            name: name.into(),
            key: key.into(),
            is_default: false,
            color: "gray".to_string(),
        }
    }
}

/// Permission record: the project may release into the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectEnvironment {
    pub project_id: ProjectId,
    pub environment_id: EnvironmentId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSettings {
    pub project_id: ProjectId,
    pub environment_id: EnvironmentId,
    pub git_branch: String,
    pub continuous_deploy: bool,
}

/// One observed commit. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub project_id: ProjectId,
    pub hash: String,
    pub parent_hash: String,
    pub git_ref: String,
    pub message: String,
    pub user: String,
    pub created_at: DateTime<Utc>,
}

impl Feature {
    /// First seven characters of the commit hash.
    pub fn short_hash(&self) -> &str {
        let end = self
            .hash
            .char_indices()
            .nth(7)
            .map(|(idx, _)| idx)
            .unwrap_or(self.hash.len());
        &self.hash[..end]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
}

/// Catalog definition of a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extension {
    pub id: ExtensionId,
    pub environment_id: EnvironmentId,
    /// Bus channel key, e.g. `dockerbuilder` or `kubernetes:deployment`.
    pub key: String,
    pub name: String,
    pub kind: ExtensionKind,
    pub component: String,
    pub cacheable: bool,
    pub config: Vec<ExtConfig>,
}

impl Validate for Extension {
    fn validate(&self) -> Result<(), String> {
        if self.key.trim().is_empty() {
            return Err("extension key is empty".to_string());
        }
        validate_config(&self.config)
    }
}

/// One installation of an [`Extension`] into a project/environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectExtension {
    pub id: ProjectExtensionId,
    pub project_id: ProjectId,
    pub environment_id: EnvironmentId,
    pub extension_id: ExtensionId,
    pub state: State,
    pub state_message: String,
    pub config: Vec<ExtConfig>,
    #[serde(default)]
    pub custom_config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl ProjectExtension {
    pub fn new(project_id: ProjectId, environment_id: EnvironmentId, extension: &Extension) -> Self {
        Self {
            id: ProjectExtensionId::new(),
            project_id,
            environment_id,
            extension_id: extension.id,
            state: State::Complete,
            state_message: String::new(),
            config: Vec::new(),
            custom_config: serde_json::Map::new(),
            artifacts: Vec::new(),
            created_at: Utc::now(),
            version: 0,
        }
    }
}

impl Validate for ProjectExtension {
    fn validate(&self) -> Result<(), String> {
        validate_config(&self.config)?;
        validate_artifacts(&self.artifacts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretScope {
    Project,
    Extension,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecretKind {
    Env,
    File,
    ProtectedEnv,
    Build,
}

/// A versioned key. Its value is the newest [`SecretValue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub id: SecretId,
    pub key: String,
    pub kind: SecretKind,
    pub scope: SecretScope,
    /// `None` for global secrets.
    pub project_id: Option<ProjectId>,
    pub environment_id: EnvironmentId,
    pub is_secret: bool,
    pub created_at: DateTime<Utc>,
}

/// Append-only history entry of a [`Secret`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretValue {
    pub id: SecretValueId,
    pub secret_id: SecretId,
    pub value: String,
    pub user_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    General,
    OneShot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub port: u16,
    pub protocol: String,
}

/// Resource sizing. Cpu in millicores, memory in MiB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub id: ServiceSpecId,
    pub name: String,
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
    pub termination_grace_period_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub project_id: ProjectId,
    pub environment_id: EnvironmentId,
    pub name: String,
    pub command: String,
    pub kind: ServiceKind,
    pub replicas: u32,
    pub spec_id: ServiceSpecId,
    pub ports: Vec<ServicePort>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Release snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub port: u16,
    pub protocol: String,
}

/// Resource spec as handed to workers (`100m`, `128Mi`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecSnapshot {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
    pub termination_grace_period_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub id: ServiceId,
    pub name: String,
    pub command: String,
    pub kind: ServiceKind,
    pub replicas: u32,
    pub spec: SpecSnapshot,
    pub listeners: Vec<Listener>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSnapshot {
    pub key: String,
    pub value: String,
    pub kind: SecretKind,
}

impl SecretSnapshot {
    pub fn env(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            kind: SecretKind::Env,
        }
    }
}

/// Services and secrets in effect when a release was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseSnapshot {
    pub services: Vec<ServiceSnapshot>,
    pub secrets: Vec<SecretSnapshot>,
    pub taken_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Release & ReleaseExtension
// ---------------------------------------------------------------------------

/// One deployment attempt for a project/environment pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: ReleaseId,
    pub project_id: ProjectId,
    pub environment_id: EnvironmentId,
    pub user_id: UserId,
    pub head_feature_id: FeatureId,
    pub tail_feature_id: FeatureId,
    pub state: State,
    pub state_message: String,
    pub force_rebuild: bool,
    pub is_rollback: bool,
    /// Set when the dependent-environment gate found no prerequisite release.
    #[serde(default)]
    pub gate_warning: Option<String>,
    pub snapshot: ReleaseSnapshot,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl Release {
    /// Whether the dispatcher has already started this release.
    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }
}

impl Validate for Release {
    fn validate(&self) -> Result<(), String> {
        match self.snapshot.secrets.iter().position(|s| s.key.is_empty()) {
            Some(idx) => Err(format!("snapshot secret #{idx} has an empty key")),
            None => Ok(()),
        }
    }
}

/// One unit of release work: a release paired with a project extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseExtension {
    pub id: ReleaseExtensionId,
    pub release_id: ReleaseId,
    pub project_extension_id: ProjectExtensionId,
    pub extension_key: String,
    pub kind: ExtensionKind,
    pub feature_hash: String,
    pub services_signature: Signature,
    pub secrets_signature: Signature,
    pub state: State,
    pub state_message: String,
    pub action: Action,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl ReleaseExtension {
    pub fn cache_key(&self) -> CacheKey {
        CacheKey {
            project_extension_id: self.project_extension_id,
            feature_hash: self.feature_hash.clone(),
            services_signature: self.services_signature.clone(),
            secrets_signature: self.secrets_signature.clone(),
        }
    }
}

impl Validate for ReleaseExtension {
    fn validate(&self) -> Result<(), String> {
        validate_artifacts(&self.artifacts)
    }
}

/// Inputs that decide whether a completed release extension can be reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub project_extension_id: ProjectExtensionId,
    pub feature_hash: String,
    pub services_signature: Signature,
    pub secrets_signature: Signature,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.project_extension_id,
            self.feature_hash,
            self.services_signature,
            self.secrets_signature
        )
    }
}

impl Validate for Project {}
impl Validate for Environment {}
impl Validate for ProjectEnvironment {}
impl Validate for ProjectSettings {}
impl Validate for Feature {}
impl Validate for User {}
impl Validate for Secret {}
impl Validate for SecretValue {}
impl Validate for Service {}
impl Validate for ServiceSpec {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_terminality() {
        assert!(!State::Waiting.is_terminal());
        assert!(!State::Running.is_terminal());
        assert!(State::Complete.is_terminal());
        assert!(State::Failed.is_terminal());
        assert!(State::Canceled.is_terminal());
        assert!(State::Running.is_active());
    }

    #[test]
    fn state_parses_wire_names() {
        for state in [
            State::Waiting,
            State::Running,
            State::Complete,
            State::Failed,
            State::Canceled,
        ] {
            assert_eq!(state.as_str().parse::<State>().unwrap(), state);
        }
        assert!("done".parse::<State>().is_err());
    }

    #[test]
    fn secret_artifacts_are_redacted() {
        let plain = Artifact::new("image", "registry/app:abc");
        let hidden = Artifact::secret("token", "s3cr3t");
        assert_eq!(plain.redacted(), plain);
        assert_eq!(hidden.redacted().value, serde_json::json!(REDACTED));
        assert_eq!(hidden.redacted().key, "token");
    }

    #[test]
    fn ext_config_uses_camel_case_on_the_wire() {
        let cfg = ExtConfig::new("REPLICAS", "2").overridable();
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["allowOverride"], serde_json::json!(true));
        let back: ExtConfig = serde_json::from_value(serde_json::json!({"key": "K"})).unwrap();
        assert!(!back.allow_override);
        assert_eq!(back.value, "");
    }

    #[test]
    fn signature_rejects_non_hex() {
        assert!(Signature::try_from("xyz".to_string()).is_err());
        let sig = Signature::from_bytes(b"services");
        assert_eq!(sig.as_str().len(), 64);
        assert_eq!(Signature::try_from(sig.to_string()).unwrap(), sig);
    }

    #[test]
    fn short_hash_takes_seven_chars() {
        let feature = Feature {
            id: FeatureId::new(),
            project_id: ProjectId::new(),
            hash: "abc123def456".to_string(),
            parent_hash: String::new(),
            git_ref: "refs/heads/master".to_string(),
            message: "init".to_string(),
            user: "dev".to_string(),
            created_at: Utc::now(),
        };
        assert_eq!(feature.short_hash(), "abc123d");
    }

    #[test]
    fn duplicate_config_keys_fail_validation() {
        let ext = Extension {
            id: ExtensionId::new(),
            environment_id: EnvironmentId::new(),
            key: "dockerbuilder".to_string(),
            name: "Docker Builder".to_string(),
            kind: ExtensionKind::Workflow,
            component: String::new(),
            cacheable: true,
            config: vec![ExtConfig::new("USER", "a"), ExtConfig::new("USER", "b")],
        };
        assert!(ext.validate().unwrap_err().contains("USER"));
    }
}
