//! Outbound announcements: release outcome notifications for notification
//! extensions and websocket updates for UI clients.

use serde::Serialize;
use tracing::{debug, warn};

use berth_state::{Action, Datastore, Environment, ExtensionKind, Project, Release, REDACTED};

use crate::bus::EventBus;
use crate::error::Result;
use crate::event::{Event, EventName, NotificationPayload, Payload};
use crate::orchestrator::Orchestrator;
use crate::payload::{build_release_payload, project_ref, PayloadSource};

pub const SUCCESS: &str = "SUCCESS";
pub const FAILED: &str = "FAILED";
pub const CANCELED: &str = "CANCELED";

/// Websocket channel `projects/<slug>/<environment key>/<resource>`.
pub fn channel(project_slug: &str, environment_key: &str, resource: &str) -> String {
    format!("projects/{project_slug}/{environment_key}/{resource}")
}

/// Release as shown to UI clients: snapshot secret values are masked.
pub fn release_view(release: &Release) -> Release {
    let mut view = release.clone();
    for secret in &mut view.snapshot.secrets {
        secret.value = REDACTED.to_string();
    }
    view
}

/// Project extension fields relayed on the `extensions` channel.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectExtensionView<'a> {
    id: String,
    state: &'a str,
    state_message: &'a str,
}

impl<S, B> Orchestrator<S, B>
where
    S: Datastore + ?Sized,
    B: EventBus + ?Sized,
{
    pub(crate) async fn publish_websocket(
        &self,
        channel: String,
        entity: &impl Serialize,
    ) -> Result<()> {
        let entity = serde_json::to_value(entity)?;
        self.bus().publish(Event::websocket(channel, entity)).await
    }

    /// Publish `release` on `projects/<slug>/<env>/<resource>`.
    ///
    /// Best effort: by the time an update goes out the release is already
    /// stored, so a failed publish is logged and the caller carries on.
    pub(crate) async fn publish_release_update(
        &self,
        release: &Release,
        project: &Project,
        environment: &Environment,
        resource: &str,
    ) {
        let channel = channel(&project.slug, &environment.key, resource);
        if let Err(e) = self.publish_websocket(channel.clone(), &release_view(release)).await {
            warn!(release_id = %release.id, channel = %channel, error = %e, "websocket update not sent");
        }
    }

    pub(crate) async fn publish_project_extension_update(
        &self,
        project_extension: &berth_state::ProjectExtension,
        project: &Project,
        environment: &Environment,
    ) -> Result<()> {
        let view = ProjectExtensionView {
            id: project_extension.id.to_string(),
            state: project_extension.state.as_str(),
            state_message: &project_extension.state_message,
        };
        self.publish_websocket(channel(&project.slug, &environment.key, "extensions"), &view)
            .await
    }

    /// Tell every notification extension of the release's
    /// project/environment about `message`. Failures are logged, never
    /// propagated: a missed notification must not change the release outcome.
    pub(crate) async fn send_notifications(
        &self,
        message: &str,
        release: &Release,
        project: &Project,
        environment: &Environment,
    ) {
        match self
            .try_send_notifications(message, release, project, environment)
            .await
        {
            Ok(sent) => debug!(release_id = %release.id, outcome = message, sent, "notifications sent"),
            Err(e) => warn!(release_id = %release.id, outcome = message, error = %e, "notifications not sent"),
        }
    }

    async fn try_send_notifications(
        &self,
        message: &str,
        release: &Release,
        project: &Project,
        environment: &Environment,
    ) -> Result<usize> {
        let store = self.store();
        let mut targets = Vec::new();
        for project_extension in store
            .list_project_extensions(&release.project_id, &release.environment_id)
            .await?
        {
            let extension = store.get_extension(&project_extension.extension_id).await?;
            if extension.kind == ExtensionKind::Notification {
                targets.push((project_extension, extension));
            }
        }
        if targets.is_empty() {
            return Ok(0);
        }

        let payload = build_release_payload(
            store,
            release,
            PayloadSource::Snapshot,
            &self.config().release.default_branch,
        )
        .await?;

        for (project_extension, extension) in &targets {
            let artifacts =
                crate::artifacts::resolve_artifacts(store, project_extension, extension).await?;
            let event = Event::new(
                EventName::release(&extension.key),
                Action::Create,
                Payload::Notification(NotificationPayload {
                    id: project_extension.id,
                    project: project_ref(project),
                    release: payload.clone(),
                    environment: environment.key.clone(),
                }),
            )
            .with_state(release.state, message)
            .with_artifacts(artifacts);
            self.bus().publish(event).await?;
        }

        self.publish_release_update(release, project, environment, "releases")
            .await;
        Ok(targets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_state::{ReleaseSnapshot, SecretSnapshot};
    use chrono::Utc;

    #[test]
    fn channel_layout() {
        assert_eq!(
            channel("acme-web", "production", "releases/reCompleted"),
            "projects/acme-web/production/releases/reCompleted"
        );
    }

    #[test]
    fn release_view_masks_snapshot_secrets() {
        let release = Release {
            id: Default::default(),
            project_id: Default::default(),
            environment_id: Default::default(),
            user_id: Default::default(),
            head_feature_id: Default::default(),
            tail_feature_id: Default::default(),
            state: berth_state::State::Waiting,
            state_message: String::new(),
            force_rebuild: false,
            is_rollback: false,
            gate_warning: None,
            snapshot: ReleaseSnapshot {
                services: Vec::new(),
                secrets: vec![SecretSnapshot::env("DB_PASSWORD", "hunter2")],
                taken_at: Utc::now(),
            },
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            version: 0,
        };
        let view = release_view(&release);
        assert_eq!(view.snapshot.secrets[0].value, REDACTED);
        assert_eq!(release.snapshot.secrets[0].value, "hunter2");
    }
}
