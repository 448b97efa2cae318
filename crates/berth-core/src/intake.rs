//! Release intake: create, rollback and cancel.
//!
//! These are the operations an API layer calls on behalf of a user. Create
//! and rollback publish `release:create`; the dispatcher takes it from there.

use chrono::Utc;
use tracing::{debug, Instrument};

use berth_state::{
    Action, Datastore, EnvironmentId, Feature, FeatureId, ProjectId, Release, ReleaseId, State,
    UserId,
};

use crate::bus::EventBus;
use crate::error::{BerthError, Result};
use crate::event::{Event, EventName, Payload, ReleaseExtensionPayload};
use crate::obs;
use crate::orchestrator::Orchestrator;
use crate::payload::{build_release_payload, capture_snapshot, project_ref, PayloadSource};
use crate::signature::snapshot_signatures;

pub const RELEASE_CREATED: &str = "Release created";

/// Request to release `head_feature_id` into a project/environment.
#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub project_id: ProjectId,
    pub environment_id: EnvironmentId,
    pub head_feature_id: FeatureId,
    pub user_id: UserId,
    /// Skip the release extension cache.
    pub force_rebuild: bool,
}

/// Request to re-release what an earlier release shipped.
#[derive(Debug, Clone)]
pub struct RollbackRequest {
    pub project_id: ProjectId,
    pub environment_id: EnvironmentId,
    pub release_id: ReleaseId,
    pub user_id: UserId,
}

impl<S, B> Orchestrator<S, B>
where
    S: Datastore + ?Sized,
    B: EventBus + ?Sized,
{
    /// Create a waiting release of the current services and secrets.
    pub async fn create_release(&self, request: ReleaseRequest) -> Result<Release> {
        let store = self.store();
        let scope_key = (request.project_id, request.environment_id);
        let _queue = self.queue_locks.lock(&scope_key).await;

        self.check_allowed(&request.project_id, &request.environment_id)
            .await?;
        let head = store.get_feature(&request.head_feature_id).await?;
        if head.project_id != request.project_id {
            return Err(BerthError::ForeignFeature {
                feature: head.id,
                project: request.project_id,
            });
        }
        if store
            .find_project_settings(&request.project_id, &request.environment_id)
            .await?
            .is_none()
        {
            return Err(BerthError::MissingProjectSettings {
                project: request.project_id,
                environment: request.environment_id,
            });
        }

        let snapshot =
            capture_snapshot(store, &request.project_id, &request.environment_id).await?;
        let release = Release {
            id: ReleaseId::new(),
            project_id: request.project_id,
            environment_id: request.environment_id,
            user_id: request.user_id,
            head_feature_id: head.id,
            tail_feature_id: head.id,
            state: State::Waiting,
            state_message: RELEASE_CREATED.to_string(),
            force_rebuild: request.force_rebuild,
            is_rollback: false,
            gate_warning: None,
            snapshot,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            version: 0,
        };
        self.admit(release, &head).await
    }

    /// Create a release that ships `request.release_id`'s head feature with
    /// its original services and secrets.
    pub async fn rollback_release(&self, request: RollbackRequest) -> Result<Release> {
        let store = self.store();
        let scope_key = (request.project_id, request.environment_id);
        let _queue = self.queue_locks.lock(&scope_key).await;

        self.check_allowed(&request.project_id, &request.environment_id)
            .await?;
        let prior = store.get_release(&request.release_id).await?;
        if prior.project_id != request.project_id || prior.environment_id != request.environment_id
        {
            return Err(BerthError::RollbackMismatch {
                release: prior.id,
                project: request.project_id,
                environment: request.environment_id,
            });
        }
        let head = store.get_feature(&prior.head_feature_id).await?;

        let release = Release {
            id: ReleaseId::new(),
            project_id: prior.project_id,
            environment_id: prior.environment_id,
            user_id: request.user_id,
            head_feature_id: head.id,
            tail_feature_id: head.id,
            state: State::Waiting,
            state_message: RELEASE_CREATED.to_string(),
            force_rebuild: false,
            is_rollback: true,
            gate_warning: None,
            snapshot: prior.snapshot.clone(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            version: 0,
        };
        self.admit(release, &head).await
    }

    /// Cancel an unfinished release and stop its waiting release extensions.
    ///
    /// Workers already running keep going; their reports finish the release
    /// and run the queue. Only a release with nothing in flight (typically
    /// one promoted by the queue but not yet started) hands the
    /// project/environment to the next release right away.
    pub async fn cancel_release(&self, release_id: &ReleaseId, user_id: &UserId) -> Result<Release> {
        let (canceled, in_flight) = async {
            let _release = self.release_locks.lock(release_id).await;
            let store = self.store();
            let mut release = store.get_release(release_id).await?;
            if release.state.is_terminal() {
                return Err(BerthError::ReleaseFinished {
                    release: release.id,
                    state: release.state,
                });
            }

            let email = match store.find_user(user_id).await? {
                Some(user) => user.email,
                None => user_id.to_string(),
            };
            release.state = State::Canceled;
            release.state_message = format!("Release canceled by {email}");
            release.finished_at = Some(Utc::now());
            let release = store.update_release(release).await?;

            let (project, environment) = self.scope(&release).await?;
            let items = store.list_release_extensions(&release.id).await?;
            let in_flight = items.iter().filter(|i| i.state == State::Running).count();
            let waiting: Vec<_> = items
                .into_iter()
                .filter(|i| i.state == State::Waiting)
                .collect();
            if !waiting.is_empty() {
                let payload = build_release_payload(
                    store,
                    &release,
                    PayloadSource::Snapshot,
                    &self.config().release.default_branch,
                )
                .await?;
                for mut item in waiting {
                    let message = format!("Deployment Stopped By User {email}");
                    if in_flight == 0 {
                        // No worker report will come back to settle it.
                        item.state = State::Canceled;
                        item.action = Action::Status;
                        item.state_message = message.clone();
                        item.finished_at = Some(Utc::now());
                        store.update_release_extension(item.clone()).await?;
                    }
                    let event = Event::new(
                        EventName::release(&item.extension_key),
                        Action::Create,
                        Payload::ReleaseExtension(ReleaseExtensionPayload {
                            id: item.id,
                            project: project_ref(&project),
                            release: payload.clone(),
                            environment: environment.key.clone(),
                        }),
                    )
                    .with_state(State::Canceled, message);
                    self.bus().publish(event).await?;
                }
            }

            self.publish_release_update(&release, &project, &environment, "releases")
                .await;
            debug!(release_id = %release.id, by = %email, in_flight, "release canceled");
            Ok::<_, BerthError>((release, in_flight))
        }
        .instrument(obs::release_span(release_id))
        .await?;

        if in_flight == 0 {
            self.run_queued_releases(&canceled).await?;
        }
        Ok(canceled)
    }

    async fn check_allowed(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> Result<()> {
        if self
            .store()
            .is_project_environment_allowed(project_id, environment_id)
            .await?
        {
            Ok(())
        } else {
            Err(BerthError::EnvironmentNotAllowed {
                project: *project_id,
                environment: *environment_id,
            })
        }
    }

    /// Reject duplicates, pick the tail feature, persist and announce.
    /// Caller holds the project/environment lock.
    async fn admit(&self, mut release: Release, head: &Feature) -> Result<Release> {
        let store = self.store();

        if let Some(pending) = store
            .find_latest_release(
                &release.project_id,
                &release.environment_id,
                &[State::Running, State::Waiting],
            )
            .await?
        {
            let pending_head = store.get_feature(&pending.head_feature_id).await?;
            if pending_head.hash == head.hash
                && snapshot_signatures(&pending.snapshot)? == snapshot_signatures(&release.snapshot)?
            {
                return Err(BerthError::DuplicateRelease {
                    existing: pending.id,
                });
            }
        }

        release.tail_feature_id = match store
            .find_latest_release(
                &release.project_id,
                &release.environment_id,
                &[State::Complete],
            )
            .await?
        {
            Some(last) => last.head_feature_id,
            None => match store.find_first_feature(&release.project_id).await? {
                Some(first) => first.id,
                None => head.id,
            },
        };

        let release = store.insert_release(release).await?;
        obs::emit_release_created(&release.id, &head.hash, release.is_rollback);

        let payload = build_release_payload(
            store,
            &release,
            PayloadSource::Snapshot,
            &self.config().release.default_branch,
        )
        .await?;
        self.bus()
            .publish(Event::new(
                EventName::ReleaseCreate,
                Action::Create,
                Payload::Release(payload),
            ))
            .await?;
        Ok(release)
    }
}
