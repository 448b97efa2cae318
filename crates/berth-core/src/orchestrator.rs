//! Release orchestration engine.
//!
//! The [`Orchestrator`] consumes routed bus events and drives releases
//! through their lifecycle. Its components live in sibling modules as
//! `impl` blocks on the same type:
//!
//! | event / call                 | module              |
//! |------------------------------|---------------------|
//! | `release:create`             | `dispatcher`        |
//! | `release:<key>:status`       | `aggregator`        |
//! | workflow stage finished      | `transition`        |
//! | release finished / failed    | `completion`        |
//! | next waiting release         | `queue`             |
//! | create / rollback / cancel   | `intake`            |
//! | `project:<key>:status`       | `project_extension` |
//!
//! Concurrency: every read-modify-write of a release happens under that
//! release's lock; queue decisions happen under the project/environment
//! lock. The project/environment lock is always taken first. Internal
//! steps take no locks; entry points hold them and run the queue only after
//! dropping the release lock.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use berth_state::{Datastore, Environment, EnvironmentId, Project, ProjectId, Release, ReleaseId};

use crate::bus::{EventBus, EventStream};
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::event::Event;
use crate::locks::KeyedLocks;
use crate::metrics::METRICS;
use crate::obs;
use crate::routing::{Route, RoutingTable};

pub struct Orchestrator<S: ?Sized, B: ?Sized> {
    store: Arc<S>,
    bus: Arc<B>,
    routes: RoutingTable,
    config: OrchestratorConfig,
    pub(crate) release_locks: KeyedLocks<ReleaseId>,
    pub(crate) queue_locks: KeyedLocks<(ProjectId, EnvironmentId)>,
}

impl<S, B> Orchestrator<S, B>
where
    S: Datastore + ?Sized,
    B: EventBus + ?Sized,
{
    pub fn new(store: Arc<S>, bus: Arc<B>, config: OrchestratorConfig) -> Result<Self> {
        Ok(Self {
            store,
            bus,
            routes: RoutingTable::standard()?,
            config,
            release_locks: KeyedLocks::new(),
            queue_locks: KeyedLocks::new(),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    // -----------------------------------------------------------------------
    // Event entry point
    // -----------------------------------------------------------------------

    /// Handle one bus event. Events with no route are ignored.
    pub async fn handle(&self, event: &Event) -> Result<()> {
        METRICS.inc_events_handled();
        let Some(route) = self.routes.route(&event.name) else {
            debug!(event = %event.name, "no route; ignored");
            return Ok(());
        };
        debug!(event = %event.name, route = route.as_str(), state = %event.state, "routing");
        match route {
            Route::ReleaseCreated => self.on_release_created(event).await,
            Route::ReleaseExtensionStatus => self.on_release_extension_status(event).await,
            Route::ProjectExtensionStatus => self.on_project_extension_status(event).await,
        }
    }

    /// [`handle`](Self::handle), logging instead of returning errors. The
    /// event is dropped on error; at-least-once redelivery is the bus's job.
    pub async fn handle_logged(&self, event: Event) {
        if let Err(e) = self.handle(&event).await {
            let redacted = event.redacted();
            obs::emit_handler_error(&redacted.name.to_string(), &e);
            debug!(event = ?redacted, "dropped event");
        }
    }

    // -----------------------------------------------------------------------
    // Shared lookups
    // -----------------------------------------------------------------------

    pub(crate) async fn scope(&self, release: &Release) -> Result<(Project, Environment)> {
        let project = self.store.get_project(&release.project_id).await?;
        let environment = self.store.get_environment(&release.environment_id).await?;
        Ok((project, environment))
    }
}

impl<S, B> Orchestrator<S, B>
where
    S: Datastore + ?Sized + 'static,
    B: EventBus + ?Sized + 'static,
{
    /// Consume `stream` until it closes or `shutdown` resolves, handling each
    /// event on its own task.
    pub async fn run(self: Arc<Self>, mut stream: EventStream, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("orchestrator shutting down");
                    break;
                }
                next = stream.next() => match next {
                    Some(event) => {
                        if self.routes.route(&event.name).is_none() {
                            debug!(event = %event.name, "not subscribed");
                            continue;
                        }
                        let engine = Arc::clone(&self);
                        tokio::spawn(async move { engine.handle_logged(event).await });
                    }
                    None => {
                        debug!("event stream closed");
                        break;
                    }
                },
            }
        }
    }
}
