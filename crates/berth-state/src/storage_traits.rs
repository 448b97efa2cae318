//! Storage trait definitions for Berth
//!
//! - `CatalogStore`: projects, environments, features, extensions, secrets,
//!   services. Written by the API layer, read by the engine (project
//!   extensions are the one catalog record the engine mutates).
//! - `ReleaseStore`: releases and their release extensions.
//!
//! Lookup conventions:
//! - `get_*` returns `StorageError::NotFound` when the row is absent.
//! - `find_*` returns `Ok(None)` when the row is absent.
//! - `update_*` is compare-and-swap on the record's `version`: the stored
//!   version must equal the one passed in, and the returned record carries the
//!   incremented version. A mismatch yields `StorageError::VersionConflict`.
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::ids::*;
use crate::model::*;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// CatalogStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CatalogStore: Send + Sync {
    // -- projects & environments ------------------------------------------

    async fn put_project(&self, project: Project) -> StorageResult<()>;

    async fn get_project(&self, id: &ProjectId) -> StorageResult<Project>;

    async fn put_environment(&self, environment: Environment) -> StorageResult<()>;

    async fn get_environment(&self, id: &EnvironmentId) -> StorageResult<Environment>;

    async fn find_environment_by_key(&self, key: &str) -> StorageResult<Option<Environment>>;

    /// Grant the project permission to release into the environment.
    async fn put_project_environment(&self, grant: ProjectEnvironment) -> StorageResult<()>;

    async fn is_project_environment_allowed(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> StorageResult<bool>;

    async fn put_project_settings(&self, settings: ProjectSettings) -> StorageResult<()>;

    async fn find_project_settings(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> StorageResult<Option<ProjectSettings>>;

    async fn put_user(&self, user: User) -> StorageResult<()>;

    async fn find_user(&self, id: &UserId) -> StorageResult<Option<User>>;

    // -- features -----------------------------------------------------------

    async fn put_feature(&self, feature: Feature) -> StorageResult<()>;

    async fn get_feature(&self, id: &FeatureId) -> StorageResult<Feature>;

    /// The earliest-created feature of a project.
    async fn find_first_feature(&self, project_id: &ProjectId) -> StorageResult<Option<Feature>>;

    /// Features of a project created at or after `since`, oldest first.
    async fn list_features_since(
        &self,
        project_id: &ProjectId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<Feature>>;

    // -- extensions -----------------------------------------------------------

    async fn put_extension(&self, extension: Extension) -> StorageResult<()>;

    async fn get_extension(&self, id: &ExtensionId) -> StorageResult<Extension>;

    async fn put_project_extension(&self, project_extension: ProjectExtension)
        -> StorageResult<()>;

    async fn get_project_extension(
        &self,
        id: &ProjectExtensionId,
    ) -> StorageResult<ProjectExtension>;

    /// Installations for a project/environment, in creation order.
    async fn list_project_extensions(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> StorageResult<Vec<ProjectExtension>>;

    /// Compare-and-swap update.
    async fn update_project_extension(
        &self,
        project_extension: ProjectExtension,
    ) -> StorageResult<ProjectExtension>;

    // -- secrets -----------------------------------------------------------

    async fn put_secret(&self, secret: Secret) -> StorageResult<()>;

    /// Secrets of `scope` in the environment. Project and extension scoped
    /// secrets are filtered by `project_id`; global secrets ignore it.
    async fn list_secrets(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
        scope: SecretScope,
    ) -> StorageResult<Vec<Secret>>;

    async fn add_secret_value(&self, value: SecretValue) -> StorageResult<()>;

    /// Newest value of a secret.
    async fn find_latest_secret_value(
        &self,
        secret_id: &SecretId,
    ) -> StorageResult<Option<SecretValue>>;

    // -- services -----------------------------------------------------------

    async fn put_service_spec(&self, spec: ServiceSpec) -> StorageResult<()>;

    async fn get_service_spec(&self, id: &ServiceSpecId) -> StorageResult<ServiceSpec>;

    async fn put_service(&self, service: Service) -> StorageResult<()>;

    /// Services of a project/environment, in creation order.
    async fn list_services(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> StorageResult<Vec<Service>>;
}

// ---------------------------------------------------------------------------
// ReleaseStore
// ---------------------------------------------------------------------------

/// Release persistence.
///
/// Guarantees:
/// - Release listings are ordered by `created_at` (ties by insertion order).
/// - Release extensions are listed in creation order.
/// - Updates never lose a concurrent write (see module docs).
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    async fn insert_release(&self, release: Release) -> StorageResult<Release>;

    async fn get_release(&self, id: &ReleaseId) -> StorageResult<Release>;

    /// Compare-and-swap update.
    async fn update_release(&self, release: Release) -> StorageResult<Release>;

    /// All releases of a project/environment, oldest first.
    async fn list_releases(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> StorageResult<Vec<Release>>;

    /// Oldest release of the project/environment whose state is in `states`.
    async fn find_earliest_release(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
        states: &[State],
    ) -> StorageResult<Option<Release>>;

    /// Newest release of the project/environment whose state is in `states`.
    async fn find_latest_release(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
        states: &[State],
    ) -> StorageResult<Option<Release>>;

    /// Oldest `waiting` release of the same project/environment created
    /// strictly after `after`, excluding `after` itself.
    async fn find_next_waiting_release(&self, after: &Release) -> StorageResult<Option<Release>>;

    /// Any `complete` release in the environment whose head feature is one of
    /// `feature_ids`.
    async fn find_complete_release_for_features(
        &self,
        environment_id: &EnvironmentId,
        feature_ids: &[FeatureId],
    ) -> StorageResult<Option<Release>>;

    async fn insert_release_extension(
        &self,
        release_extension: ReleaseExtension,
    ) -> StorageResult<ReleaseExtension>;

    async fn get_release_extension(
        &self,
        id: &ReleaseExtensionId,
    ) -> StorageResult<ReleaseExtension>;

    /// Compare-and-swap update.
    async fn update_release_extension(
        &self,
        release_extension: ReleaseExtension,
    ) -> StorageResult<ReleaseExtension>;

    async fn list_release_extensions(
        &self,
        release_id: &ReleaseId,
    ) -> StorageResult<Vec<ReleaseExtension>>;

    /// Most recently created `complete` release extension matching `key`.
    async fn find_cached_release_extension(
        &self,
        key: &CacheKey,
    ) -> StorageResult<Option<ReleaseExtension>>;
}

/// Everything the orchestration engine needs from persistence.
pub trait Datastore: CatalogStore + ReleaseStore {}

impl<T: CatalogStore + ReleaseStore> Datastore for T {}
