//! Release extension status reports and completion counting.

use chrono::Utc;
use tracing::{debug, Instrument};

use berth_state::{
    Action, Artifact, Datastore, ExtensionKind, Release, ReleaseExtension, ReleaseExtensionId,
    ReleaseId, State, StorageError,
};

use crate::bus::EventBus;
use crate::error::Result;
use crate::event::Event;
use crate::obs;
use crate::orchestrator::Orchestrator;

impl<S, B> Orchestrator<S, B>
where
    S: Datastore + ?Sized,
    B: EventBus + ?Sized,
{
    /// `release:<key>:status`
    pub(crate) async fn on_release_extension_status(&self, event: &Event) -> Result<()> {
        let payload = event.release_extension_payload()?;
        let release_id = payload.release.id;
        let finished = {
            let _release = self.release_locks.lock(&release_id).await;
            self.apply_status(
                &release_id,
                &payload.id,
                event.state,
                event.action,
                event.state_message.clone(),
                event.artifacts.clone(),
            )
            .instrument(obs::release_span(&release_id))
            .await?
        };
        if let Some(finished) = finished {
            self.run_queued_releases(&finished).await?;
        }
        Ok(())
    }

    /// Record a status on one release extension and advance the release.
    ///
    /// A report repeating the item's stored terminal state is a redelivery
    /// and is dropped, as is a `waiting`/`running` report on a finished item. Reports on a release that already completed or failed
    /// are recorded without further effect. Returns the release when it
    /// reached its end state. Caller holds the release lock.
    pub(crate) async fn apply_status(
        &self,
        release_id: &ReleaseId,
        item_id: &ReleaseExtensionId,
        state: State,
        action: Action,
        message: String,
        artifacts: Vec<Artifact>,
    ) -> Result<Option<Release>> {
        let store = self.store();
        let release = store.get_release(release_id).await?;
        let mut item = store.get_release_extension(item_id).await?;
        if item.release_id != release.id {
            return Err(StorageError::not_found("release_extension", item_id).into());
        }

        if item.state.is_terminal() && item.state == state {
            debug!(release_extension_id = %item.id, state = %state, "duplicate status dropped");
            return Ok(None);
        }
        // Items never leave a terminal state for waiting/running.
        if item.state.is_terminal() && !state.is_terminal() {
            debug!(
                release_extension_id = %item.id,
                stored = %item.state,
                reported = %state,
                "stale status dropped"
            );
            return Ok(None);
        }

        item.state = state;
        item.state_message = message;
        item.artifacts = artifacts;
        item.action = action;
        if matches!(state, State::Complete | State::Failed) {
            item.finished_at = Some(Utc::now());
        }
        let item = store.update_release_extension(item).await?;
        obs::emit_release_extension_status(&item.id, item.state, &item.state_message);

        if matches!(release.state, State::Complete | State::Failed) {
            debug!(release_id = %release.id, state = %release.state, "release finished; status recorded only");
            return Ok(None);
        }

        match item.state {
            State::Complete => self.release_extension_completed(&release, &item).await,
            State::Failed => self.fail_release(&release.id, &item.state_message).await,
            _ => Ok(None),
        }
    }

    /// Count completions of `item`'s kind and advance when the whole stage
    /// is complete.
    async fn release_extension_completed(
        &self,
        release: &Release,
        item: &ReleaseExtension,
    ) -> Result<Option<Release>> {
        let items = self.store().list_release_extensions(&release.id).await?;
        let stage_done = items
            .iter()
            .filter(|i| i.kind == item.kind)
            .all(|i| i.state == State::Complete);

        let (project, environment) = self.scope(release).await?;
        self.publish_release_update(release, &project, &environment, "releases/reCompleted")
            .await;

        if !stage_done {
            return Ok(None);
        }
        match item.kind {
            ExtensionKind::Workflow => self.workflow_completed(&release.id).await,
            ExtensionKind::Deployment => self.complete_release(&release.id).await,
            _ => Ok(None),
        }
    }
}
