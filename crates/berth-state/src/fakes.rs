//! In-memory fakes for storage traits (testing and `--in-memory` daemons)
//!
//! `MemoryStore` satisfies both `CatalogStore` and `ReleaseStore` without any
//! external dependency, with the same ordering and compare-and-swap
//! guarantees as the SurrealDB store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::ids::*;
use crate::model::*;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct Catalog {
    projects: HashMap<ProjectId, Project>,
    environments: HashMap<EnvironmentId, Environment>,
    grants: Vec<ProjectEnvironment>,
    settings: Vec<ProjectSettings>,
    users: HashMap<UserId, User>,
    features: Vec<Feature>,
    extensions: HashMap<ExtensionId, Extension>,
    project_extensions: Vec<ProjectExtension>,
    secrets: Vec<Secret>,
    secret_values: Vec<SecretValue>,
    service_specs: HashMap<ServiceSpecId, ServiceSpec>,
    services: Vec<Service>,
}

#[derive(Debug, Default)]
struct Ledger {
    releases: Vec<Release>,
    release_extensions: Vec<ReleaseExtension>,
}

/// In-memory datastore backed by vectors and hash maps behind `Mutex`es.
#[derive(Debug, Default)]
pub struct MemoryStore {
    catalog: Mutex<Catalog>,
    ledger: Mutex<Ledger>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn upsert<T, K: PartialEq>(rows: &mut Vec<T>, row: T, key: impl Fn(&T) -> K) {
    let k = key(&row);
    match rows.iter_mut().find(|r| key(r) == k) {
        Some(slot) => *slot = row,
        None => rows.push(row),
    }
}

/// Stable sort by creation time so equal timestamps keep insertion order.
fn by_created<T: Clone>(rows: impl Iterator<Item = T>, created: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
    let mut out: Vec<T> = rows.collect();
    out.sort_by_key(|r| created(r));
    out
}

fn check_version(
    entity: &'static str,
    id: impl ToString,
    stored: u64,
    incoming: u64,
) -> StorageResult<()> {
    if stored != incoming {
        return Err(StorageError::VersionConflict {
            entity,
            id: id.to_string(),
            expected: incoming,
            actual: stored,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CatalogStore
// ---------------------------------------------------------------------------

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn put_project(&self, project: Project) -> StorageResult<()> {
        let mut catalog = self.catalog.lock().unwrap();
        catalog.projects.insert(project.id, project);
        Ok(())
    }

    async fn get_project(&self, id: &ProjectId) -> StorageResult<Project> {
        let catalog = self.catalog.lock().unwrap();
        catalog
            .projects
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("project", id))
    }

    async fn put_environment(&self, environment: Environment) -> StorageResult<()> {
        let mut catalog = self.catalog.lock().unwrap();
        catalog.environments.insert(environment.id, environment);
        Ok(())
    }

    async fn get_environment(&self, id: &EnvironmentId) -> StorageResult<Environment> {
        let catalog = self.catalog.lock().unwrap();
        catalog
            .environments
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("environment", id))
    }

    async fn find_environment_by_key(&self, key: &str) -> StorageResult<Option<Environment>> {
        let catalog = self.catalog.lock().unwrap();
        Ok(catalog.environments.values().find(|e| e.key == key).cloned())
    }

    async fn put_project_environment(&self, grant: ProjectEnvironment) -> StorageResult<()> {
        let mut catalog = self.catalog.lock().unwrap();
        upsert(&mut catalog.grants, grant, |g| (g.project_id, g.environment_id));
        Ok(())
    }

    async fn is_project_environment_allowed(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> StorageResult<bool> {
        let catalog = self.catalog.lock().unwrap();
        Ok(catalog
            .grants
            .iter()
            .any(|g| &g.project_id == project_id && &g.environment_id == environment_id))
    }

    async fn put_project_settings(&self, settings: ProjectSettings) -> StorageResult<()> {
        let mut catalog = self.catalog.lock().unwrap();
        upsert(&mut catalog.settings, settings, |s| (s.project_id, s.environment_id));
        Ok(())
    }

    async fn find_project_settings(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> StorageResult<Option<ProjectSettings>> {
        let catalog = self.catalog.lock().unwrap();
        Ok(catalog
            .settings
            .iter()
            .find(|s| &s.project_id == project_id && &s.environment_id == environment_id)
            .cloned())
    }

    async fn put_user(&self, user: User) -> StorageResult<()> {
        let mut catalog = self.catalog.lock().unwrap();
        catalog.users.insert(user.id, user);
        Ok(())
    }

    async fn find_user(&self, id: &UserId) -> StorageResult<Option<User>> {
        let catalog = self.catalog.lock().unwrap();
        Ok(catalog.users.get(id).cloned())
    }

    async fn put_feature(&self, feature: Feature) -> StorageResult<()> {
        let mut catalog = self.catalog.lock().unwrap();
        if catalog.features.iter().any(|f| f.id == feature.id) {
            return Err(StorageError::Duplicate {
                entity: "feature",
                id: feature.id.to_string(),
            });
        }
        catalog.features.push(feature);
        Ok(())
    }

    async fn get_feature(&self, id: &FeatureId) -> StorageResult<Feature> {
        let catalog = self.catalog.lock().unwrap();
        catalog
            .features
            .iter()
            .find(|f| &f.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("feature", id))
    }

    async fn find_first_feature(&self, project_id: &ProjectId) -> StorageResult<Option<Feature>> {
        let catalog = self.catalog.lock().unwrap();
        let features = by_created(
            catalog.features.iter().filter(|f| &f.project_id == project_id).cloned(),
            |f| f.created_at,
        );
        Ok(features.into_iter().next())
    }

    async fn list_features_since(
        &self,
        project_id: &ProjectId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<Feature>> {
        let catalog = self.catalog.lock().unwrap();
        Ok(by_created(
            catalog
                .features
                .iter()
                .filter(|f| &f.project_id == project_id && f.created_at >= since)
                .cloned(),
            |f| f.created_at,
        ))
    }

    async fn put_extension(&self, extension: Extension) -> StorageResult<()> {
        let mut catalog = self.catalog.lock().unwrap();
        catalog.extensions.insert(extension.id, extension);
        Ok(())
    }

    async fn get_extension(&self, id: &ExtensionId) -> StorageResult<Extension> {
        let catalog = self.catalog.lock().unwrap();
        catalog
            .extensions
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("extension", id))
    }

    async fn put_project_extension(
        &self,
        project_extension: ProjectExtension,
    ) -> StorageResult<()> {
        let mut catalog = self.catalog.lock().unwrap();
        upsert(&mut catalog.project_extensions, project_extension, |pe| pe.id);
        Ok(())
    }

    async fn get_project_extension(
        &self,
        id: &ProjectExtensionId,
    ) -> StorageResult<ProjectExtension> {
        let catalog = self.catalog.lock().unwrap();
        catalog
            .project_extensions
            .iter()
            .find(|pe| &pe.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("project_extension", id))
    }

    async fn list_project_extensions(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> StorageResult<Vec<ProjectExtension>> {
        let catalog = self.catalog.lock().unwrap();
        Ok(by_created(
            catalog
                .project_extensions
                .iter()
                .filter(|pe| &pe.project_id == project_id && &pe.environment_id == environment_id)
                .cloned(),
            |pe| pe.created_at,
        ))
    }

    async fn update_project_extension(
        &self,
        mut project_extension: ProjectExtension,
    ) -> StorageResult<ProjectExtension> {
        let mut catalog = self.catalog.lock().unwrap();
        let slot = catalog
            .project_extensions
            .iter_mut()
            .find(|pe| pe.id == project_extension.id)
            .ok_or_else(|| StorageError::not_found("project_extension", project_extension.id))?;
        check_version(
            "project_extension",
            project_extension.id,
            slot.version,
            project_extension.version,
        )?;
        project_extension.version += 1;
        *slot = project_extension.clone();
        Ok(project_extension)
    }

    async fn put_secret(&self, secret: Secret) -> StorageResult<()> {
        let mut catalog = self.catalog.lock().unwrap();
        upsert(&mut catalog.secrets, secret, |s| s.id);
        Ok(())
    }

    async fn list_secrets(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
        scope: SecretScope,
    ) -> StorageResult<Vec<Secret>> {
        let catalog = self.catalog.lock().unwrap();
        Ok(by_created(
            catalog
                .secrets
                .iter()
                .filter(|s| {
                    s.scope == scope
                        && &s.environment_id == environment_id
                        && (scope == SecretScope::Global || s.project_id.as_ref() == Some(project_id))
                })
                .cloned(),
            |s| s.created_at,
        ))
    }

    async fn add_secret_value(&self, value: SecretValue) -> StorageResult<()> {
        let mut catalog = self.catalog.lock().unwrap();
        catalog.secret_values.push(value);
        Ok(())
    }

    async fn find_latest_secret_value(
        &self,
        secret_id: &SecretId,
    ) -> StorageResult<Option<SecretValue>> {
        let catalog = self.catalog.lock().unwrap();
        let values = by_created(
            catalog
                .secret_values
                .iter()
                .filter(|v| &v.secret_id == secret_id)
                .cloned(),
            |v| v.created_at,
        );
        Ok(values.into_iter().last())
    }

    async fn put_service_spec(&self, spec: ServiceSpec) -> StorageResult<()> {
        let mut catalog = self.catalog.lock().unwrap();
        catalog.service_specs.insert(spec.id, spec);
        Ok(())
    }

    async fn get_service_spec(&self, id: &ServiceSpecId) -> StorageResult<ServiceSpec> {
        let catalog = self.catalog.lock().unwrap();
        catalog
            .service_specs
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("service_spec", id))
    }

    async fn put_service(&self, service: Service) -> StorageResult<()> {
        let mut catalog = self.catalog.lock().unwrap();
        upsert(&mut catalog.services, service, |s| s.id);
        Ok(())
    }

    async fn list_services(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> StorageResult<Vec<Service>> {
        let catalog = self.catalog.lock().unwrap();
        Ok(by_created(
            catalog
                .services
                .iter()
                .filter(|s| &s.project_id == project_id && &s.environment_id == environment_id)
                .cloned(),
            |s| s.created_at,
        ))
    }
}

// ---------------------------------------------------------------------------
// ReleaseStore
// ---------------------------------------------------------------------------

impl Ledger {
    fn releases_of(&self, project_id: &ProjectId, environment_id: &EnvironmentId) -> Vec<Release> {
        by_created(
            self.releases
                .iter()
                .filter(|r| &r.project_id == project_id && &r.environment_id == environment_id)
                .cloned(),
            |r| r.created_at,
        )
    }
}

#[async_trait]
impl ReleaseStore for MemoryStore {
    async fn insert_release(&self, release: Release) -> StorageResult<Release> {
        let mut ledger = self.ledger.lock().unwrap();
        if ledger.releases.iter().any(|r| r.id == release.id) {
            return Err(StorageError::Duplicate {
                entity: "release",
                id: release.id.to_string(),
            });
        }
        ledger.releases.push(release.clone());
        Ok(release)
    }

    async fn get_release(&self, id: &ReleaseId) -> StorageResult<Release> {
        let ledger = self.ledger.lock().unwrap();
        ledger
            .releases
            .iter()
            .find(|r| &r.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("release", id))
    }

    async fn update_release(&self, mut release: Release) -> StorageResult<Release> {
        let mut ledger = self.ledger.lock().unwrap();
        let slot = ledger
            .releases
            .iter_mut()
            .find(|r| r.id == release.id)
            .ok_or_else(|| StorageError::not_found("release", release.id))?;
        check_version("release", release.id, slot.version, release.version)?;
        release.version += 1;
        *slot = release.clone();
        Ok(release)
    }

    async fn list_releases(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> StorageResult<Vec<Release>> {
        let ledger = self.ledger.lock().unwrap();
        Ok(ledger.releases_of(project_id, environment_id))
    }

    async fn find_earliest_release(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
        states: &[State],
    ) -> StorageResult<Option<Release>> {
        let ledger = self.ledger.lock().unwrap();
        Ok(ledger
            .releases_of(project_id, environment_id)
            .into_iter()
            .find(|r| states.contains(&r.state)))
    }

    async fn find_latest_release(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
        states: &[State],
    ) -> StorageResult<Option<Release>> {
        let ledger = self.ledger.lock().unwrap();
        Ok(ledger
            .releases_of(project_id, environment_id)
            .into_iter()
            .rev()
            .find(|r| states.contains(&r.state)))
    }

    async fn find_next_waiting_release(&self, after: &Release) -> StorageResult<Option<Release>> {
        let ledger = self.ledger.lock().unwrap();
        let releases = ledger.releases_of(&after.project_id, &after.environment_id);
        // Equal timestamps keep insertion order, so position decides "after".
        Ok(match releases.iter().position(|r| r.id == after.id) {
            Some(at) => releases
                .into_iter()
                .skip(at + 1)
                .find(|r| r.state == State::Waiting),
            None => releases
                .into_iter()
                .find(|r| r.state == State::Waiting && r.created_at > after.created_at),
        })
    }

    async fn find_complete_release_for_features(
        &self,
        environment_id: &EnvironmentId,
        feature_ids: &[FeatureId],
    ) -> StorageResult<Option<Release>> {
        let ledger = self.ledger.lock().unwrap();
        Ok(ledger
            .releases
            .iter()
            .find(|r| {
                r.state == State::Complete
                    && &r.environment_id == environment_id
                    && feature_ids.contains(&r.head_feature_id)
            })
            .cloned())
    }

    async fn insert_release_extension(
        &self,
        release_extension: ReleaseExtension,
    ) -> StorageResult<ReleaseExtension> {
        let mut ledger = self.ledger.lock().unwrap();
        if ledger
            .release_extensions
            .iter()
            .any(|re| re.id == release_extension.id)
        {
            return Err(StorageError::Duplicate {
                entity: "release_extension",
                id: release_extension.id.to_string(),
            });
        }
        ledger.release_extensions.push(release_extension.clone());
        Ok(release_extension)
    }

    async fn get_release_extension(
        &self,
        id: &ReleaseExtensionId,
    ) -> StorageResult<ReleaseExtension> {
        let ledger = self.ledger.lock().unwrap();
        ledger
            .release_extensions
            .iter()
            .find(|re| &re.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("release_extension", id))
    }

    async fn update_release_extension(
        &self,
        mut release_extension: ReleaseExtension,
    ) -> StorageResult<ReleaseExtension> {
        let mut ledger = self.ledger.lock().unwrap();
        let slot = ledger
            .release_extensions
            .iter_mut()
            .find(|re| re.id == release_extension.id)
            .ok_or_else(|| StorageError::not_found("release_extension", release_extension.id))?;
        check_version(
            "release_extension",
            release_extension.id,
            slot.version,
            release_extension.version,
        )?;
        release_extension.version += 1;
        *slot = release_extension.clone();
        Ok(release_extension)
    }

    async fn list_release_extensions(
        &self,
        release_id: &ReleaseId,
    ) -> StorageResult<Vec<ReleaseExtension>> {
        let ledger = self.ledger.lock().unwrap();
        Ok(by_created(
            ledger
                .release_extensions
                .iter()
                .filter(|re| &re.release_id == release_id)
                .cloned(),
            |re| re.created_at,
        ))
    }

    async fn find_cached_release_extension(
        &self,
        key: &CacheKey,
    ) -> StorageResult<Option<ReleaseExtension>> {
        let ledger = self.ledger.lock().unwrap();
        let matches = by_created(
            ledger
                .release_extensions
                .iter()
                .filter(|re| re.state == State::Complete && &re.cache_key() == key)
                .cloned(),
            |re| re.created_at,
        );
        Ok(matches.into_iter().last())
    }
}
