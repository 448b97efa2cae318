//! Workflow to deployment transition.

use chrono::Utc;
use tracing::debug;

use berth_state::{Action, Artifact, Datastore, ExtensionKind, Release, ReleaseId, State};

use crate::artifacts::resolve_artifacts;
use crate::bus::EventBus;
use crate::dispatcher::EXTENSION_STARTED;
use crate::error::Result;
use crate::event::{Event, EventName, Payload, ReleaseExtensionPayload};
use crate::metrics::METRICS;
use crate::obs;
use crate::orchestrator::Orchestrator;
use crate::payload::{build_release_payload, project_ref, PayloadSource};

impl<S, B> Orchestrator<S, B>
where
    S: Datastore + ?Sized,
    B: EventBus + ?Sized,
{
    /// Dispatch the deployment stage once every workflow item completed.
    ///
    /// Each waiting deployment item receives the workflow artifacts (tagged
    /// with the producing extension's key) followed by its own resolved
    /// config. Items already past `waiting` are left alone, so a repeated
    /// transition dispatches nothing twice. When the release already failed
    /// or was canceled, waiting items take the release's state instead.
    ///
    /// Completes the release directly when it has no deployment items.
    pub(crate) async fn workflow_completed(&self, release_id: &ReleaseId) -> Result<Option<Release>> {
        let store = self.store();
        let release = store.get_release(release_id).await?;
        let items = store.list_release_extensions(&release.id).await?;

        let workflow_artifacts: Vec<Artifact> = items
            .iter()
            .filter(|i| i.kind == ExtensionKind::Workflow)
            .flat_map(|i| {
                i.artifacts
                    .iter()
                    .map(move |a| a.clone().with_source(i.extension_key.clone()))
            })
            .collect();

        let deployments: Vec<_> = items
            .into_iter()
            .filter(|i| i.kind == ExtensionKind::Deployment)
            .collect();
        if deployments.is_empty() {
            debug!(release_id = %release.id, "no deployment items");
            return self.complete_release(&release.id).await;
        }

        let (project, environment) = self.scope(&release).await?;
        let stopped = matches!(release.state, State::Failed | State::Canceled);
        let payload = if stopped {
            None
        } else {
            Some(
                build_release_payload(
                    store,
                    &release,
                    PayloadSource::Snapshot,
                    &self.config().release.default_branch,
                )
                .await?,
            )
        };

        let mut in_flight = 0usize;
        for mut item in deployments {
            if item.state != State::Waiting {
                debug!(release_extension_id = %item.id, state = %item.state, "deployment already dispatched");
                in_flight += 1;
                continue;
            }

            let Some(payload) = &payload else {
                item.state = release.state;
                item.action = Action::Status;
                item.state_message = release.state_message.clone();
                item.finished_at = Some(Utc::now());
                store.update_release_extension(item).await?;
                continue;
            };

            let project_extension = store
                .get_project_extension(&item.project_extension_id)
                .await?;
            let extension = store.get_extension(&project_extension.extension_id).await?;
            let mut artifacts = workflow_artifacts.clone();
            artifacts.extend(resolve_artifacts(store, &project_extension, &extension).await?);

            item.state = State::Running;
            item.action = Action::Create;
            item.state_message = EXTENSION_STARTED.to_string();
            item.started_at = Some(Utc::now());
            let item = store.update_release_extension(item).await?;

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
            .with_artifacts(artifacts);
            self.bus().publish(event).await?;
            obs::emit_release_extension_dispatched(&item.id, &item.extension_key);
            METRICS.inc_dispatches();
            in_flight += 1;
        }

        if stopped && in_flight == 0 {
            return self.complete_release(&release.id).await;
        }
        Ok(None)
    }
}
