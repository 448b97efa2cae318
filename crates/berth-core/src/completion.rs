//! Release end states: completion and failure.

use chrono::Utc;
use tracing::debug;

use berth_state::{Datastore, Release, ReleaseId, State};

use crate::bus::EventBus;
use crate::error::Result;
use crate::metrics::METRICS;
use crate::notify::{CANCELED, FAILED, SUCCESS};
use crate::obs;
use crate::orchestrator::Orchestrator;

pub const COMPLETED: &str = "Completed";

impl<S, B> Orchestrator<S, B>
where
    S: Datastore + ?Sized,
    B: EventBus + ?Sized,
{
    /// Mark the release complete and announce it.
    ///
    /// A canceled release keeps its state and is announced as canceled. A
    /// release that already completed or failed is left untouched and
    /// `None` is returned; otherwise the finished release is returned so the
    /// caller can run the queue. No success notification goes out when the
    /// release carries a gate warning.
    pub(crate) async fn complete_release(&self, release_id: &ReleaseId) -> Result<Option<Release>> {
        let store = self.store();
        let mut release = store.get_release(release_id).await?;
        if matches!(release.state, State::Complete | State::Failed) {
            debug!(release_id = %release.id, state = %release.state, "release already finished");
            return Ok(None);
        }
        let (project, environment) = self.scope(&release).await?;

        if release.state == State::Canceled {
            self.send_notifications(CANCELED, &release, &project, &environment)
                .await;
        } else {
            let now = Utc::now();
            release.state = State::Complete;
            release.state_message = COMPLETED.to_string();
            release.finished_at = Some(now);
            release = store.update_release(release).await?;

            let duration_ms = release
                .started_at
                .map(|started| (now - started).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            obs::emit_release_completed(&release.id, release.state, duration_ms);
            METRICS.inc_releases_completed();

            if release.gate_warning.is_none() {
                self.send_notifications(SUCCESS, &release, &project, &environment)
                    .await;
            }
        }

        self.publish_release_update(&release, &project, &environment, "releases")
            .await;
        Ok(Some(release))
    }

    /// Fail the release with `message` and fail its unfinished items.
    ///
    /// A canceled release keeps its state and message, but its unfinished
    /// items are still failed. Returns `None` when the release already
    /// completed or failed.
    pub(crate) async fn fail_release(
        &self,
        release_id: &ReleaseId,
        message: &str,
    ) -> Result<Option<Release>> {
        let store = self.store();
        let mut release = store.get_release(release_id).await?;
        if matches!(release.state, State::Complete | State::Failed) {
            debug!(release_id = %release.id, state = %release.state, "release already finished");
            return Ok(None);
        }

        let canceled = release.state == State::Canceled;
        let now = Utc::now();
        if !canceled {
            release.state = State::Failed;
            release.state_message = message.to_string();
            release.finished_at = Some(now);
            release = store.update_release(release).await?;
            obs::emit_release_failed(&release.id, message);
            METRICS.inc_releases_failed();
        }

        for mut item in store.list_release_extensions(&release.id).await? {
            if item.state.is_terminal() {
                continue;
            }
            item.state = State::Failed;
            item.finished_at.get_or_insert(now);
            store.update_release_extension(item).await?;
        }

        let (project, environment) = self.scope(&release).await?;
        if !canceled {
            self.send_notifications(FAILED, &release, &project, &environment)
                .await;
        }
        self.publish_release_update(&release, &project, &environment, "releases")
            .await;
        Ok(Some(release))
    }
}
