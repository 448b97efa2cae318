//! Project extension status reports (`project:<key>:status`).

use tracing::debug;

use berth_state::{Datastore, State};

use crate::bus::EventBus;
use crate::error::Result;
use crate::event::Event;
use crate::orchestrator::Orchestrator;

impl<S, B> Orchestrator<S, B>
where
    S: Datastore + ?Sized,
    B: EventBus + ?Sized,
{
    /// Record a worker's report on a project extension.
    ///
    /// State and message are always overwritten. Artifacts are replaced only
    /// by a `complete` report that carries some.
    pub(crate) async fn on_project_extension_status(&self, event: &Event) -> Result<()> {
        let payload = event.project_extension_payload()?;
        let store = self.store();
        let mut project_extension = store.get_project_extension(&payload.id).await?;
        let project = store.get_project(&project_extension.project_id).await?;
        let environment = store.get_environment(&project_extension.environment_id).await?;

        project_extension.state = event.state;
        project_extension.state_message = event.state_message.clone();
        if event.state == State::Complete && !event.artifacts.is_empty() {
            project_extension.artifacts = event.artifacts.clone();
        }
        let project_extension = store.update_project_extension(project_extension).await?;
        debug!(
            project_extension_id = %project_extension.id,
            state = %project_extension.state,
            "project extension status recorded"
        );

        self.publish_project_extension_update(&project_extension, &project, &environment)
            .await
    }
}
