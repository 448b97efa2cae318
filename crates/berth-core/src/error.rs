//! Error taxonomy for the orchestration engine.

use berth_state::{EnvironmentId, FeatureId, ProjectId, ReleaseId, State, StorageError};

/// Berth engine errors.
#[derive(Debug, thiserror::Error)]
pub enum BerthError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid route pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Config(#[from] toml::de::Error),

    #[error("project {project} is not allowed to release into environment {environment}")]
    EnvironmentNotAllowed {
        project: ProjectId,
        environment: EnvironmentId,
    },

    #[error("no settings for project {project} in environment {environment}")]
    MissingProjectSettings {
        project: ProjectId,
        environment: EnvironmentId,
    },

    #[error("feature {feature} does not belong to project {project}")]
    ForeignFeature {
        feature: FeatureId,
        project: ProjectId,
    },

    #[error("a pending release {existing} already deploys the same feature, services and secrets")]
    DuplicateRelease { existing: ReleaseId },

    #[error("release {release} does not belong to project {project} in environment {environment}")]
    RollbackMismatch {
        release: ReleaseId,
        project: ProjectId,
        environment: EnvironmentId,
    },

    #[error("release {release} is already {state}")]
    ReleaseFinished { release: ReleaseId, state: State },

    #[error("event {event} carries an unexpected payload (wanted {expected})")]
    UnexpectedPayload {
        event: String,
        expected: &'static str,
    },

    #[error("invalid event name: {0}")]
    InvalidEventName(String),

    #[error("event bus error: {0}")]
    Bus(String),
}

impl BerthError {
    /// Whether the error is a missing-record lookup failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BerthError::Storage(e) if e.is_not_found())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, BerthError>;
