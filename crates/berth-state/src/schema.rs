//! SurrealDB document layout.
//!
//! Every record is stored as a [`DocRow`]: a handful of indexed lookup
//! columns plus the record's JSON in `doc`. The `schema` column versions the
//! JSON layout; rows are checked against [`DOC_SCHEMA_VERSION`] and the
//! record's [`Validate`] rules when they are read back, so a row that merely
//! deserializes is not trusted blindly.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::model::*;
use crate::storage_traits::StorageResult;

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Current layout of the `doc` column.
pub const DOC_SCHEMA_VERSION: u32 = 1;

/// Lookup columns extracted from a record.
#[derive(Debug, Clone, Default)]
pub struct DocIndex {
    pub project_id: Option<String>,
    pub environment_id: Option<String>,
    pub state: Option<String>,
    /// Owning record (release id for release extensions).
    pub parent_id: Option<String>,
    /// Secondary key: environment key, secret id, cache key, ...
    pub lookup: Option<String>,
}

/// One stored row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocRow {
    pub doc_id: String,
    pub schema: u32,
    pub project_id: Option<String>,
    pub environment_id: Option<String>,
    pub state: Option<String>,
    pub parent_id: Option<String>,
    pub lookup: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    pub version: u64,
    pub doc: serde_json::Value,
}

/// A record type that can be stored as a [`DocRow`].
pub trait Document: Serialize + DeserializeOwned + Validate + Send + Sync + 'static {
    const TABLE: &'static str;
    const ENTITY: &'static str;

    fn doc_id(&self) -> String;

    fn created_at(&self) -> DateTime<Utc>;

    fn version(&self) -> u64 {
        0
    }

    fn set_version(&mut self, _version: u64) {}

    fn index(&self) -> DocIndex {
        DocIndex::default()
    }

    fn to_row(&self) -> StorageResult<DocRow> {
        let index = self.index();
        Ok(DocRow {
            doc_id: self.doc_id(),
            schema: DOC_SCHEMA_VERSION,
            project_id: index.project_id,
            environment_id: index.environment_id,
            state: index.state,
            parent_id: index.parent_id,
            lookup: index.lookup,
            created_at: self.created_at(),
            version: self.version(),
            doc: serde_json::to_value(self)?,
        })
    }

    /// Decode and validate a stored row.
    fn from_row(row: DocRow) -> StorageResult<Self> {
        if row.schema != DOC_SCHEMA_VERSION {
            return Err(StorageError::SchemaVersion {
                entity: Self::ENTITY,
                id: row.doc_id,
                found: row.schema,
                supported: DOC_SCHEMA_VERSION,
            });
        }
        let record: Self = serde_json::from_value(row.doc).map_err(|e| {
            StorageError::InvalidRecord {
                entity: Self::ENTITY,
                id: row.doc_id.clone(),
                reason: e.to_string(),
            }
        })?;
        record
            .validate()
            .map_err(|reason| StorageError::InvalidRecord {
                entity: Self::ENTITY,
                id: row.doc_id,
                reason,
            })?;
        Ok(record)
    }
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl Document for Project {
    const TABLE: &'static str = "projects";
    const ENTITY: &'static str = "project";

    fn doc_id(&self) -> String {
        self.id.to_string()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn index(&self) -> DocIndex {
        DocIndex {
            lookup: Some(self.slug.clone()),
            ..Default::default()
        }
    }
}

impl Document for Environment {
    const TABLE: &'static str = "environments";
    const ENTITY: &'static str = "environment";

    fn doc_id(&self) -> String {
        self.id.to_string()
    }

    fn created_at(&self) -> DateTime<Utc> {
        epoch()
    }

    fn index(&self) -> DocIndex {
        DocIndex {
            lookup: Some(self.key.clone()),
            ..Default::default()
        }
    }
}

impl Document for ProjectEnvironment {
    const TABLE: &'static str = "project_environments";
    const ENTITY: &'static str = "project_environment";

    fn doc_id(&self) -> String {
        format!("{}:{}", self.project_id, self.environment_id)
    }

    fn created_at(&self) -> DateTime<Utc> {
        epoch()
    }

    fn index(&self) -> DocIndex {
        DocIndex {
            project_id: Some(self.project_id.to_string()),
            environment_id: Some(self.environment_id.to_string()),
            ..Default::default()
        }
    }
}

impl Document for ProjectSettings {
    const TABLE: &'static str = "project_settings";
    const ENTITY: &'static str = "project_settings";

    fn doc_id(&self) -> String {
        format!("{}:{}", self.project_id, self.environment_id)
    }

    fn created_at(&self) -> DateTime<Utc> {
        epoch()
    }

    fn index(&self) -> DocIndex {
        DocIndex {
            project_id: Some(self.project_id.to_string()),
            environment_id: Some(self.environment_id.to_string()),
            ..Default::default()
        }
    }
}

impl Document for User {
    const TABLE: &'static str = "users";
    const ENTITY: &'static str = "user";

    fn doc_id(&self) -> String {
        self.id.to_string()
    }

    fn created_at(&self) -> DateTime<Utc> {
        epoch()
    }
}

impl Document for Feature {
    const TABLE: &'static str = "features";
    const ENTITY: &'static str = "feature";

    fn doc_id(&self) -> String {
        self.id.to_string()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn index(&self) -> DocIndex {
        DocIndex {
            project_id: Some(self.project_id.to_string()),
            lookup: Some(self.hash.clone()),
            ..Default::default()
        }
    }
}

impl Document for Extension {
    const TABLE: &'static str = "extensions";
    const ENTITY: &'static str = "extension";

    fn doc_id(&self) -> String {
        self.id.to_string()
    }

    fn created_at(&self) -> DateTime<Utc> {
        epoch()
    }

    fn index(&self) -> DocIndex {
        DocIndex {
            environment_id: Some(self.environment_id.to_string()),
            lookup: Some(self.key.clone()),
            ..Default::default()
        }
    }
}

impl Document for ProjectExtension {
    const TABLE: &'static str = "project_extensions";
    const ENTITY: &'static str = "project_extension";

    fn doc_id(&self) -> String {
        self.id.to_string()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn index(&self) -> DocIndex {
        DocIndex {
            project_id: Some(self.project_id.to_string()),
            environment_id: Some(self.environment_id.to_string()),
            state: Some(self.state.to_string()),
            lookup: Some(self.extension_id.to_string()),
            ..Default::default()
        }
    }
}

fn scope_str(scope: SecretScope) -> &'static str {
    match scope {
        SecretScope::Project => "project",
        SecretScope::Extension => "extension",
        SecretScope::Global => "global",
    }
}

/// Lookup value stored for a secret: `<scope>` or `<scope>:<project>`.
pub(crate) fn secret_lookup(scope: SecretScope, project_id: Option<&crate::ProjectId>) -> String {
    match (scope, project_id) {
        (SecretScope::Global, _) | (_, None) => scope_str(scope).to_string(),
        (_, Some(pid)) => format!("{}:{}", scope_str(scope), pid),
    }
}

impl Document for Secret {
    const TABLE: &'static str = "secrets";
    const ENTITY: &'static str = "secret";

    fn doc_id(&self) -> String {
        self.id.to_string()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn index(&self) -> DocIndex {
        DocIndex {
            project_id: self.project_id.map(|p| p.to_string()),
            environment_id: Some(self.environment_id.to_string()),
            lookup: Some(secret_lookup(self.scope, self.project_id.as_ref())),
            ..Default::default()
        }
    }
}

impl Document for SecretValue {
    const TABLE: &'static str = "secret_values";
    const ENTITY: &'static str = "secret_value";

    fn doc_id(&self) -> String {
        self.id.to_string()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn index(&self) -> DocIndex {
        DocIndex {
            lookup: Some(self.secret_id.to_string()),
            ..Default::default()
        }
    }
}

impl Document for ServiceSpec {
    const TABLE: &'static str = "service_specs";
    const ENTITY: &'static str = "service_spec";

    fn doc_id(&self) -> String {
        self.id.to_string()
    }

    fn created_at(&self) -> DateTime<Utc> {
        epoch()
    }
}

impl Document for Service {
    const TABLE: &'static str = "services";
    const ENTITY: &'static str = "service";

    fn doc_id(&self) -> String {
        self.id.to_string()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn index(&self) -> DocIndex {
        DocIndex {
            project_id: Some(self.project_id.to_string()),
            environment_id: Some(self.environment_id.to_string()),
            ..Default::default()
        }
    }
}

impl Document for Release {
    const TABLE: &'static str = "releases";
    const ENTITY: &'static str = "release";

    fn doc_id(&self) -> String {
        self.id.to_string()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn index(&self) -> DocIndex {
        DocIndex {
            project_id: Some(self.project_id.to_string()),
            environment_id: Some(self.environment_id.to_string()),
            state: Some(self.state.to_string()),
            lookup: Some(self.head_feature_id.to_string()),
            ..Default::default()
        }
    }
}

impl Document for ReleaseExtension {
    const TABLE: &'static str = "release_extensions";
    const ENTITY: &'static str = "release_extension";

    fn doc_id(&self) -> String {
        self.id.to_string()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn index(&self) -> DocIndex {
        DocIndex {
            parent_id: Some(self.release_id.to_string()),
            state: Some(self.state.to_string()),
            lookup: Some(self.cache_key().to_string()),
            ..Default::default()
        }
    }
}
