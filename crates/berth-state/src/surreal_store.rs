//! SurrealDB-backed `CatalogStore` and `ReleaseStore`
//!
//! Records go through [`Document`] at the boundary: written as [`DocRow`]s,
//! decoded and validated on the way back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::connect;
use crate::error::StorageError;
use crate::ids::*;
use crate::model::*;
use crate::schema::{secret_lookup, DocRow, Document};
use crate::storage_traits::*;

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn state_list(states: &[State]) -> Vec<String> {
    states.iter().map(|s| s.to_string()).collect()
}

/// SurrealDB-backed implementation of the storage traits.
#[derive(Clone)]
pub struct SurrealStore {
    db: Surreal<Any>,
}

impl SurrealStore {
    /// Wrap an already connected and initialized database.
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let db = connect::connect_memory().await?;
        info!("SurrealStore connected (in-memory)");
        Ok(Self { db })
    }

    /// Create from environment variables (see [`connect::connect_from_env`]).
    pub async fn from_env() -> crate::Result<Self> {
        let db = connect::connect_from_env().await?;
        Ok(Self { db })
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch<T: Document>(&self, doc_id: String) -> StorageResult<Option<T>> {
        let sql = format!("SELECT * FROM {} WHERE doc_id = $doc_id", T::TABLE);
        let mut res = self
            .db
            .query(sql)
            .bind(("doc_id", doc_id))
            .await
            .map_err(backend)?;
        let rows: Vec<DocRow> = res.take(0).map_err(backend)?;
        rows.into_iter().next().map(T::from_row).transpose()
    }

    async fn fetch_required<T: Document>(&self, doc_id: String) -> StorageResult<T> {
        self.fetch::<T>(doc_id.clone())
            .await?
            .ok_or(StorageError::NotFound {
                entity: T::ENTITY,
                id: doc_id,
            })
    }

    /// `SELECT * FROM <table> WHERE <clause>` with `vars` bound as parameters.
    async fn select<T: Document>(
        &self,
        clause: &str,
        vars: serde_json::Value,
    ) -> StorageResult<Vec<T>> {
        let sql = format!("SELECT * FROM {} WHERE {}", T::TABLE, clause);
        let mut res = self.db.query(sql).bind(vars).await.map_err(backend)?;
        let rows: Vec<DocRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(T::from_row).collect()
    }

    async fn select_one<T: Document>(
        &self,
        clause: &str,
        vars: serde_json::Value,
    ) -> StorageResult<Option<T>> {
        Ok(self.select::<T>(clause, vars).await?.into_iter().next())
    }

    async fn insert<T: Document>(&self, record: &T) -> StorageResult<()> {
        if self.fetch::<T>(record.doc_id()).await?.is_some() {
            return Err(StorageError::Duplicate {
                entity: T::ENTITY,
                id: record.doc_id(),
            });
        }
        let row = record.to_row()?;
        debug!(table = T::TABLE, doc_id = %row.doc_id, "inserting document");
        let _created: Option<DocRow> = self
            .db
            .create(T::TABLE)
            .content(row)
            .await
            .map_err(backend)?;
        Ok(())
    }

    /// Replace the row with the same `doc_id`, or create it.
    async fn upsert<T: Document>(&self, record: &T) -> StorageResult<()> {
        let row = record.to_row()?;
        let doc_id = row.doc_id.clone();
        let sql = format!(
            "UPDATE {} CONTENT $row WHERE doc_id = $doc_id RETURN AFTER",
            T::TABLE
        );
        let mut res = self
            .db
            .query(sql)
            .bind(("row", row.clone()))
            .bind(("doc_id", doc_id))
            .await
            .map_err(backend)?;
        let updated: Vec<DocRow> = res.take(0).map_err(backend)?;
        if updated.is_empty() {
            let _created: Option<DocRow> = self
                .db
                .create(T::TABLE)
                .content(row)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    /// Compare-and-swap on `version`.
    async fn swap<T: Document + Clone>(&self, mut record: T) -> StorageResult<T> {
        let expected = record.version();
        record.set_version(expected + 1);
        let row = record.to_row()?;
        let doc_id = row.doc_id.clone();
        let sql = format!(
            "UPDATE {} CONTENT $row WHERE doc_id = $doc_id AND version = $expected RETURN AFTER",
            T::TABLE
        );
        let mut res = self
            .db
            .query(sql)
            .bind(("row", row))
            .bind(("doc_id", doc_id.clone()))
            .bind(("expected", expected))
            .await
            .map_err(backend)?;
        let updated: Vec<DocRow> = res.take(0).map_err(backend)?;
        if !updated.is_empty() {
            return Ok(record);
        }

        match self.fetch::<T>(doc_id.clone()).await? {
            None => Err(StorageError::NotFound {
                entity: T::ENTITY,
                id: doc_id,
            }),
            Some(current) => Err(StorageError::VersionConflict {
                entity: T::ENTITY,
                id: doc_id,
                expected,
                actual: current.version(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// CatalogStore
// ---------------------------------------------------------------------------

#[async_trait]
impl CatalogStore for SurrealStore {
    async fn put_project(&self, project: Project) -> StorageResult<()> {
        self.upsert(&project).await
    }

    async fn get_project(&self, id: &ProjectId) -> StorageResult<Project> {
        self.fetch_required(id.to_string()).await
    }

    async fn put_environment(&self, environment: Environment) -> StorageResult<()> {
        self.upsert(&environment).await
    }

    async fn get_environment(&self, id: &EnvironmentId) -> StorageResult<Environment> {
        self.fetch_required(id.to_string()).await
    }

    async fn find_environment_by_key(&self, key: &str) -> StorageResult<Option<Environment>> {
        self.select_one("lookup = $key LIMIT 1", json!({ "key": key }))
            .await
    }

    async fn put_project_environment(&self, grant: ProjectEnvironment) -> StorageResult<()> {
        self.upsert(&grant).await
    }

    async fn is_project_environment_allowed(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> StorageResult<bool> {
        let grant = self
            .fetch::<ProjectEnvironment>(format!("{}:{}", project_id, environment_id))
            .await?;
        Ok(grant.is_some())
    }

    async fn put_project_settings(&self, settings: ProjectSettings) -> StorageResult<()> {
        self.upsert(&settings).await
    }

    async fn find_project_settings(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> StorageResult<Option<ProjectSettings>> {
        self.fetch(format!("{}:{}", project_id, environment_id))
            .await
    }

    async fn put_user(&self, user: User) -> StorageResult<()> {
        self.upsert(&user).await
    }

    async fn find_user(&self, id: &UserId) -> StorageResult<Option<User>> {
        self.fetch(id.to_string()).await
    }

    async fn put_feature(&self, feature: Feature) -> StorageResult<()> {
        self.insert(&feature).await
    }

    async fn get_feature(&self, id: &FeatureId) -> StorageResult<Feature> {
        self.fetch_required(id.to_string()).await
    }

    async fn find_first_feature(&self, project_id: &ProjectId) -> StorageResult<Option<Feature>> {
        self.select_one(
            "project_id = $project_id ORDER BY created_at ASC LIMIT 1",
            json!({ "project_id": project_id.to_string() }),
        )
        .await
    }

    async fn list_features_since(
        &self,
        project_id: &ProjectId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<Feature>> {
        self.select(
            "project_id = $project_id AND created_at >= <datetime> $since ORDER BY created_at ASC",
            json!({
                "project_id": project_id.to_string(),
                "since": since.to_rfc3339(),
            }),
        )
        .await
    }

    async fn put_extension(&self, extension: Extension) -> StorageResult<()> {
        self.upsert(&extension).await
    }

    async fn get_extension(&self, id: &ExtensionId) -> StorageResult<Extension> {
        self.fetch_required(id.to_string()).await
    }

    async fn put_project_extension(
        &self,
        project_extension: ProjectExtension,
    ) -> StorageResult<()> {
        self.upsert(&project_extension).await
    }

    async fn get_project_extension(
        &self,
        id: &ProjectExtensionId,
    ) -> StorageResult<ProjectExtension> {
        self.fetch_required(id.to_string()).await
    }

    async fn list_project_extensions(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> StorageResult<Vec<ProjectExtension>> {
        self.select(
            "project_id = $project_id AND environment_id = $environment_id ORDER BY created_at ASC",
            json!({
                "project_id": project_id.to_string(),
                "environment_id": environment_id.to_string(),
            }),
        )
        .await
    }

    async fn update_project_extension(
        &self,
        project_extension: ProjectExtension,
    ) -> StorageResult<ProjectExtension> {
        self.swap(project_extension).await
    }

    async fn put_secret(&self, secret: Secret) -> StorageResult<()> {
        self.upsert(&secret).await
    }

    async fn list_secrets(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
        scope: SecretScope,
    ) -> StorageResult<Vec<Secret>> {
        self.select(
            "environment_id = $environment_id AND lookup = $lookup ORDER BY created_at ASC",
            json!({
                "environment_id": environment_id.to_string(),
                "lookup": secret_lookup(scope, Some(project_id)),
            }),
        )
        .await
    }

    async fn add_secret_value(&self, value: SecretValue) -> StorageResult<()> {
        self.insert(&value).await
    }

    async fn find_latest_secret_value(
        &self,
        secret_id: &SecretId,
    ) -> StorageResult<Option<SecretValue>> {
        self.select_one(
            "lookup = $secret_id ORDER BY created_at DESC LIMIT 1",
            json!({ "secret_id": secret_id.to_string() }),
        )
        .await
    }

    async fn put_service_spec(&self, spec: ServiceSpec) -> StorageResult<()> {
        self.upsert(&spec).await
    }

    async fn get_service_spec(&self, id: &ServiceSpecId) -> StorageResult<ServiceSpec> {
        self.fetch_required(id.to_string()).await
    }

    async fn put_service(&self, service: Service) -> StorageResult<()> {
        self.upsert(&service).await
    }

    async fn list_services(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> StorageResult<Vec<Service>> {
        self.select(
            "project_id = $project_id AND environment_id = $environment_id ORDER BY created_at ASC",
            json!({
                "project_id": project_id.to_string(),
                "environment_id": environment_id.to_string(),
            }),
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// ReleaseStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ReleaseStore for SurrealStore {
    async fn insert_release(&self, release: Release) -> StorageResult<Release> {
        self.insert(&release).await?;
        Ok(release)
    }

    async fn get_release(&self, id: &ReleaseId) -> StorageResult<Release> {
        self.fetch_required(id.to_string()).await
    }

    async fn update_release(&self, release: Release) -> StorageResult<Release> {
        self.swap(release).await
    }

    async fn list_releases(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> StorageResult<Vec<Release>> {
        self.select(
            "project_id = $project_id AND environment_id = $environment_id ORDER BY created_at ASC",
            json!({
                "project_id": project_id.to_string(),
                "environment_id": environment_id.to_string(),
            }),
        )
        .await
    }

    async fn find_earliest_release(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
        states: &[State],
    ) -> StorageResult<Option<Release>> {
        self.select_one(
            "project_id = $project_id AND environment_id = $environment_id \
             AND state IN $states ORDER BY created_at ASC LIMIT 1",
            json!({
                "project_id": project_id.to_string(),
                "environment_id": environment_id.to_string(),
                "states": state_list(states),
            }),
        )
        .await
    }

    async fn find_latest_release(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
        states: &[State],
    ) -> StorageResult<Option<Release>> {
        self.select_one(
            "project_id = $project_id AND environment_id = $environment_id \
             AND state IN $states ORDER BY created_at DESC LIMIT 1",
            json!({
                "project_id": project_id.to_string(),
                "environment_id": environment_id.to_string(),
                "states": state_list(states),
            }),
        )
        .await
    }

    async fn find_next_waiting_release(&self, after: &Release) -> StorageResult<Option<Release>> {
        self.select_one(
            "project_id = $project_id AND environment_id = $environment_id \
             AND state = 'waiting' AND doc_id != $doc_id \
             AND created_at > <datetime> $after ORDER BY created_at ASC LIMIT 1",
            json!({
                "project_id": after.project_id.to_string(),
                "environment_id": after.environment_id.to_string(),
                "doc_id": after.id.to_string(),
                "after": after.created_at.to_rfc3339(),
            }),
        )
        .await
    }

    async fn find_complete_release_for_features(
        &self,
        environment_id: &EnvironmentId,
        feature_ids: &[FeatureId],
    ) -> StorageResult<Option<Release>> {
        let features: Vec<String> = feature_ids.iter().map(|f| f.to_string()).collect();
        self.select_one(
            "environment_id = $environment_id AND state = 'complete' \
             AND lookup IN $features LIMIT 1",
            json!({
                "environment_id": environment_id.to_string(),
                "features": features,
            }),
        )
        .await
    }

    async fn insert_release_extension(
        &self,
        release_extension: ReleaseExtension,
    ) -> StorageResult<ReleaseExtension> {
        self.insert(&release_extension).await?;
        Ok(release_extension)
    }

    async fn get_release_extension(
        &self,
        id: &ReleaseExtensionId,
    ) -> StorageResult<ReleaseExtension> {
        self.fetch_required(id.to_string()).await
    }

    async fn update_release_extension(
        &self,
        release_extension: ReleaseExtension,
    ) -> StorageResult<ReleaseExtension> {
        self.swap(release_extension).await
    }

    async fn list_release_extensions(
        &self,
        release_id: &ReleaseId,
    ) -> StorageResult<Vec<ReleaseExtension>> {
        self.select(
            "parent_id = $release_id ORDER BY created_at ASC",
            json!({ "release_id": release_id.to_string() }),
        )
        .await
    }

    async fn find_cached_release_extension(
        &self,
        key: &CacheKey,
    ) -> StorageResult<Option<ReleaseExtension>> {
        self.select_one(
            "lookup = $key AND state = 'complete' ORDER BY created_at DESC LIMIT 1",
            json!({ "key": key.to_string() }),
        )
        .await
    }
}
