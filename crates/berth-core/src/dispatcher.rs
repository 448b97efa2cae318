//! Release dispatcher: starts the startable release of a project/environment.

use chrono::Utc;
use tracing::{debug, warn, Instrument};

use berth_state::{
    Action, Datastore, Extension, ExtensionKind, ProjectExtension, Release, ReleaseExtension,
    ReleaseExtensionId, State,
};

use crate::artifacts::resolve_artifacts;
use crate::bus::EventBus;
use crate::cache::{cached_message, resolve_cache, CacheDecision};
use crate::error::Result;
use crate::event::{Event, EventName, Payload, ReleaseExtensionPayload, ReleasePayload};
use crate::gate::{evaluate_gate, GateVerdict};
use crate::metrics::METRICS;
use crate::obs;
use crate::orchestrator::Orchestrator;
use crate::payload::{build_release_payload, project_ref, PayloadSource};
use crate::signature::snapshot_signatures;

pub const RUNNING_RELEASE: &str = "Running Release";
pub const EXTENSION_STARTED: &str = "Release Extension Started";

impl<S, B> Orchestrator<S, B>
where
    S: Datastore + ?Sized,
    B: EventBus + ?Sized,
{
    /// `release:create`
    pub(crate) async fn on_release_created(&self, event: &Event) -> Result<()> {
        let payload = event.release_payload()?;
        let named = self.store().get_release(&payload.id).await?;
        let finished = self
            .start_release(&named, Some(payload))
            .instrument(obs::release_span(&named.id))
            .await?;
        if let Some(finished) = finished {
            self.run_queued_releases(&finished).await?;
        }
        Ok(())
    }

    /// Start the earliest active release of `named`'s project/environment,
    /// which need not be `named` itself.
    ///
    /// Does nothing when that release has already started. `payload` is used
    /// as-is only when it describes the started release; otherwise a payload
    /// is rebuilt from live state. Returns the release when it finished while
    /// starting (every workflow item served from cache and no deployment
    /// items), so the caller can run the queue.
    pub async fn start_release(
        &self,
        named: &Release,
        payload: Option<&ReleasePayload>,
    ) -> Result<Option<Release>> {
        let store = self.store();
        let scope_key = (named.project_id, named.environment_id);
        let _queue = self.queue_locks.lock(&scope_key).await;

        let Some(startable) = store
            .find_earliest_release(
                &named.project_id,
                &named.environment_id,
                &[State::Running, State::Waiting],
            )
            .await?
        else {
            debug!(release_id = %named.id, "no startable release");
            return Ok(None);
        };
        if startable.is_started() {
            debug!(release_id = %startable.id, "startable release already started");
            return Ok(None);
        }

        let _release = self.release_locks.lock(&startable.id).await;
        let mut release = store.get_release(&startable.id).await?;
        if release.is_started() || release.state.is_terminal() {
            debug!(release_id = %release.id, state = %release.state, "release no longer startable");
            return Ok(None);
        }

        let default_branch = &self.config().release.default_branch;
        let payload = match payload {
            Some(p) if p.id == release.id => p.clone(),
            _ => {
                debug!(release_id = %release.id, "rebuilding payload from live state");
                build_release_payload(store, &release, PayloadSource::Live, default_branch).await?
            }
        };

        let (project, environment) = self.scope(&release).await?;
        let head = store.get_feature(&release.head_feature_id).await?;
        let (services_signature, secrets_signature) = snapshot_signatures(&release.snapshot)?;

        let mut workflow: Vec<(ReleaseExtension, ProjectExtension, Extension)> = Vec::new();
        let mut deployment = 0usize;
        let now = Utc::now();
        for project_extension in store
            .list_project_extensions(&release.project_id, &release.environment_id)
            .await?
        {
            let extension = store.get_extension(&project_extension.extension_id).await?;
            if !extension.kind.is_release_stage() {
                continue;
            }
            let item = store
                .insert_release_extension(ReleaseExtension {
                    id: ReleaseExtensionId::new(),
                    release_id: release.id,
                    project_extension_id: project_extension.id,
                    extension_key: extension.key.clone(),
                    kind: extension.kind,
                    feature_hash: head.hash.clone(),
                    services_signature: services_signature.clone(),
                    secrets_signature: secrets_signature.clone(),
                    state: State::Waiting,
                    state_message: String::new(),
                    action: Action::Create,
                    artifacts: Vec::new(),
                    created_at: now,
                    started_at: None,
                    finished_at: None,
                    version: 0,
                })
                .await?;
            match extension.kind {
                ExtensionKind::Workflow => workflow.push((item, project_extension, extension)),
                _ => deployment += 1,
            }
        }

        release.started_at = Some(now);
        release.state = State::Running;
        release.state_message = RUNNING_RELEASE.to_string();
        match evaluate_gate(store, &self.config().gate, &release).await {
            Ok(GateVerdict::Pass) => {}
            Ok(GateVerdict::Warn(complaint)) => {
                obs::emit_gate_warning(&release.id, &complaint);
                release.gate_warning = Some(complaint);
            }
            Err(e) => warn!(release_id = %release.id, error = %e, "gate check failed; skipped"),
        }
        let release = store.update_release(release).await?;
        obs::emit_release_started(&release.id, workflow.len(), deployment);

        if let Some(complaint) = &release.gate_warning {
            self.send_notifications(complaint, &release, &project, &environment)
                .await;
        }
        self.publish_release_update(&release, &project, &environment, "releases")
            .await;

        if workflow.is_empty() {
            return self.workflow_completed(&release.id).await;
        }

        let mut finished = None;
        for (item, project_extension, extension) in workflow {
            match resolve_cache(store, &item, release.force_rebuild, extension.cacheable).await? {
                CacheDecision::Hit(previous) => {
                    obs::emit_release_extension_cached(&item.id, &previous.id);
                    METRICS.inc_cache_hits();
                    let outcome = self
                        .apply_status(
                            &release.id,
                            &item.id,
                            State::Complete,
                            Action::Status,
                            cached_message(&previous),
                            previous.artifacts.clone(),
                        )
                        .await?;
                    if outcome.is_some() {
                        finished = outcome;
                    }
                }
                CacheDecision::Miss => {
                    let artifacts = resolve_artifacts(store, &project_extension, &extension).await?;
                    let mut item = item;
                    item.state = State::Running;
                    item.state_message = EXTENSION_STARTED.to_string();
                    item.started_at = Some(Utc::now());
                    let item = store.update_release_extension(item).await?;

                    let event = Event::new(
                        EventName::release(&extension.key),
                        Action::Create,
                        Payload::ReleaseExtension(ReleaseExtensionPayload {
                            id: item.id,
                            project: project_ref(&project),
                            release: payload.clone(),
                            environment: environment.key.clone(),
                        }),
                    )
                    .with_artifacts(artifacts);
                    self.bus().publish(event).await?;
                    obs::emit_release_extension_dispatched(&item.id, &item.extension_key);
                    METRICS.inc_dispatches();
                }
            }
        }
        Ok(finished)
    }
}
