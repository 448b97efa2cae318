//! Per project/environment FIFO of releases.

use tracing::{debug, Instrument};

use berth_state::{Action, Datastore, Release, ReleaseId, State};

use crate::bus::EventBus;
use crate::dispatcher::RUNNING_RELEASE;
use crate::error::{BerthError, Result};
use crate::event::{Event, EventName, Payload};
use crate::obs;
use crate::orchestrator::Orchestrator;
use crate::payload::{build_release_payload, PayloadSource};

impl<S, B> Orchestrator<S, B>
where
    S: Datastore + ?Sized,
    B: EventBus + ?Sized,
{
    /// Promote the next waiting release after `finished` ended.
    ///
    /// Stays idle while any release of the project/environment is running.
    /// The promoted release is marked running (but not started) and a
    /// `release:create` carrying a payload built from live state is
    /// published for it. Returns the promoted release's id.
    pub async fn run_queued_releases(&self, finished: &Release) -> Result<Option<ReleaseId>> {
        let store = self.store();
        let scope_key = (finished.project_id, finished.environment_id);
        let _queue = self.queue_locks.lock(&scope_key).await;

        if let Some(running) = store
            .find_earliest_release(
                &finished.project_id,
                &finished.environment_id,
                &[State::Running],
            )
            .await?
        {
            debug!(running = %running.id, "release still running; queue idle");
            return Ok(None);
        }

        let Some(next) = store.find_next_waiting_release(finished).await? else {
            debug!(after = %finished.id, "queue empty");
            return Ok(None);
        };

        let _release = self.release_locks.lock(&next.id).await;
        async {
            let mut next = store.get_release(&next.id).await?;
            if next.state != State::Waiting {
                debug!(release_id = %next.id, state = %next.state, "queued release no longer waiting");
                return Ok(None);
            }

            let payload = build_release_payload(
                store,
                &next,
                PayloadSource::Live,
                &self.config().release.default_branch,
            )
            .await?;
            next.state = State::Running;
            next.state_message = RUNNING_RELEASE.to_string();
            let next = store.update_release(next).await?;
            obs::emit_release_queued(&next.id, &finished.id);

            self.bus()
                .publish(Event::new(
                    EventName::ReleaseCreate,
                    Action::Create,
                    Payload::Release(payload),
                ))
                .await?;
            Ok::<_, BerthError>(Some(next.id))
        }
        .instrument(obs::release_span(&next.id))
        .await
    }
}
