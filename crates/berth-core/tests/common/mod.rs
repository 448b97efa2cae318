//! Shared fixture for orchestrator integration tests.
//!
//! Seeds a [`MemoryStore`] with one project in one environment, runs an
//! [`Orchestrator`] over a [`RecordingBus`] and plays the extension workers:
//! routed events go back into the orchestrator, worker-bound events are
//! kept in an outbox until a test answers them.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};

use berth_core::{
    Event, EventName, Orchestrator, OrchestratorConfig, Payload, RecordingBus, ReleaseRequest,
};
use berth_state::{
    Action, Artifact, CatalogStore, Environment, ExtConfig, Extension, ExtensionId, ExtensionKind,
    Feature, FeatureId, MemoryStore, Project, ProjectEnvironment, ProjectExtension,
    ProjectSettings, Release, ReleaseStore, Secret, SecretId, SecretKind, SecretScope,
    SecretValue, SecretValueId, Service, ServiceId, ServiceKind, ServicePort, ServiceSpec,
    ServiceSpecId, State, User, UserId,
};

pub type Engine = Orchestrator<MemoryStore, RecordingBus>;

/// Extensions installed on the fixture project.
#[derive(Debug, Clone)]
pub struct Layout {
    pub workflow: Vec<&'static str>,
    pub deployment: Vec<&'static str>,
    pub notification: bool,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            workflow: vec!["dockerbuilder"],
            deployment: vec!["kubernetes:deployment"],
            notification: true,
        }
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub bus: Arc<RecordingBus>,
    pub engine: Arc<Engine>,
    pub project: Project,
    pub environment: Environment,
    pub user: User,
    pub features: Vec<Feature>,
    pub extensions: Vec<(ProjectExtension, Extension)>,
    outbox: Mutex<Vec<Event>>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(Layout::default(), OrchestratorConfig::default()).await
    }

    pub async fn with(layout: Layout, config: OrchestratorConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(RecordingBus::new());
        let engine = Arc::new(
            Orchestrator::new(Arc::clone(&store), Arc::clone(&bus), config).expect("engine"),
        );

        let project = Project::new("Acme Web", "acme-web");
        let environment = Environment::new("Production", "production");
        let user = User {
            id: UserId::new(),
            email: "dev@acme.test".to_string(),
        };
        store.put_project(project.clone()).await.unwrap();
        store.put_environment(environment.clone()).await.unwrap();
        store.put_user(user.clone()).await.unwrap();
        store
            .put_project_environment(ProjectEnvironment {
                project_id: project.id,
                environment_id: environment.id,
            })
            .await
            .unwrap();
        store
            .put_project_settings(ProjectSettings {
                project_id: project.id,
                environment_id: environment.id,
                git_branch: "main".to_string(),
                continuous_deploy: false,
            })
            .await
            .unwrap();

        let base = Utc::now() - Duration::hours(1);
        let mut features = Vec::new();
        for (i, hash) in ["a1b2c3d4e5f6", "b2c3d4e5f6a1", "c3d4e5f6a1b2"].iter().enumerate() {
            let feature = Feature {
                id: FeatureId::new(),
                project_id: project.id,
                hash: hash.to_string(),
                parent_hash: features
                    .last()
                    .map(|f: &Feature| f.hash.clone())
                    .unwrap_or_default(),
                git_ref: "refs/heads/main".to_string(),
                message: format!("change {i}"),
                user: "dev".to_string(),
                created_at: base + Duration::minutes(i as i64),
            };
            store.put_feature(feature.clone()).await.unwrap();
            features.push(feature);
        }

        let spec = ServiceSpec {
            id: ServiceSpecId::new(),
            name: "default".to_string(),
            cpu_request: "100".to_string(),
            cpu_limit: "500".to_string(),
            memory_request: "128".to_string(),
            memory_limit: "512".to_string(),
            termination_grace_period_secs: 30,
        };
        store.put_service_spec(spec.clone()).await.unwrap();
        store
            .put_service(Service {
                id: ServiceId::new(),
                project_id: project.id,
                environment_id: environment.id,
                name: "web".to_string(),
                command: "npm start".to_string(),
                kind: ServiceKind::General,
                replicas: 2,
                spec_id: spec.id,
                ports: vec![ServicePort {
                    port: 80,
                    protocol: "HTTP".to_string(),
                }],
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let mut harness = Self {
            store,
            bus,
            engine,
            project,
            environment,
            user,
            features,
            extensions: Vec::new(),
            outbox: Mutex::new(Vec::new()),
        };
        harness.set_secret("DATABASE_URL", "postgres://db/acme").await;
        for key in &layout.workflow {
            harness.install(key, ExtensionKind::Workflow).await;
        }
        for key in &layout.deployment {
            harness.install(key, ExtensionKind::Deployment).await;
        }
        if layout.notification {
            harness.install("slack", ExtensionKind::Notification).await;
        }
        harness
    }

    async fn install(&mut self, key: &str, kind: ExtensionKind) {
        let extension = Extension {
            id: ExtensionId::new(),
            environment_id: self.environment.id,
            key: key.to_string(),
            name: key.to_string(),
            kind,
            component: String::new(),
            cacheable: kind == ExtensionKind::Workflow,
            config: vec![ExtConfig::new("REGION", "us-east-1").overridable()],
        };
        self.store.put_extension(extension.clone()).await.unwrap();
        let project_extension =
            ProjectExtension::new(self.project.id, self.environment.id, &extension);
        self.store
            .put_project_extension(project_extension.clone())
            .await
            .unwrap();
        self.extensions.push((project_extension, extension));
    }

    /// Add a project secret, or a new value for an existing key.
    pub async fn set_secret(&self, key: &str, value: &str) {
        let existing = self
            .store
            .list_secrets(&self.project.id, &self.environment.id, SecretScope::Project)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.key == key);
        let secret_id = match existing {
            Some(secret) => secret.id,
            None => {
                let secret = Secret {
                    id: SecretId::new(),
                    key: key.to_string(),
                    kind: SecretKind::Env,
                    scope: SecretScope::Project,
                    project_id: Some(self.project.id),
                    environment_id: self.environment.id,
                    is_secret: true,
                    created_at: Utc::now(),
                };
                self.store.put_secret(secret.clone()).await.unwrap();
                secret.id
            }
        };
        self.store
            .add_secret_value(SecretValue {
                id: SecretValueId::new(),
                secret_id,
                value: value.to_string(),
                user_id: Some(self.user.id),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    pub fn request(&self, feature: usize) -> ReleaseRequest {
        ReleaseRequest {
            project_id: self.project.id,
            environment_id: self.environment.id,
            head_feature_id: self.features[feature].id,
            user_id: self.user.id,
            force_rebuild: false,
        }
    }

    /// Create a release of `features[feature]` and let the orchestrator
    /// react until only worker-bound events remain.
    pub async fn release(&self, feature: usize) -> Release {
        let release = self
            .engine
            .create_release(self.request(feature))
            .await
            .expect("create release");
        self.pump().await;
        release
    }

    /// Feed routed events back into the orchestrator until none are left.
    /// Everything else goes to the outbox.
    pub async fn pump(&self) {
        loop {
            let events = self.bus.drain();
            if events.is_empty() {
                return;
            }
            for event in events {
                if self.engine.routes().route(&event.name).is_some() {
                    self.engine.handle(&event).await.expect("handle");
                } else {
                    self.outbox.lock().unwrap().push(event);
                }
            }
        }
    }

    /// Worker-bound `release:<key>` events published so far.
    pub fn outbox(&self) -> Vec<Event> {
        self.outbox.lock().unwrap().clone()
    }

    /// Take the pending work dispatched to `key` (`create` events addressed
    /// to release extensions, excluding cancellations).
    pub fn take_dispatches(&self, key: &str) -> Vec<Event> {
        let name = EventName::release(key);
        let mut outbox = self.outbox.lock().unwrap();
        let (taken, kept): (Vec<_>, Vec<_>) = outbox.drain(..).partition(|e| {
            e.name == name
                && e.state == State::Waiting
                && matches!(e.payload, Payload::ReleaseExtension(_))
        });
        *outbox = kept;
        taken
    }

    /// Notifications published so far, as `(extension key, message)`.
    pub fn notifications(&self) -> Vec<(String, String)> {
        self.outbox
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e.payload, Payload::Notification(_)))
            .map(|e| {
                (
                    e.name.extension_key().unwrap_or_default().to_string(),
                    e.state_message.clone(),
                )
            })
            .collect()
    }

    /// Websocket channels published so far, in order.
    pub fn websocket_channels(&self) -> Vec<String> {
        self.outbox
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match &e.payload {
                Payload::Websocket(msg) => Some(msg.event.clone()),
                _ => None,
            })
            .collect()
    }

    /// The worker's reply to `dispatch`.
    pub fn reply(dispatch: &Event, state: State, message: &str, artifacts: Vec<Artifact>) -> Event {
        let key = dispatch.name.extension_key().expect("extension key");
        Event::new(
            EventName::release_status(key),
            Action::Status,
            dispatch.payload.clone(),
        )
        .with_state(state, message)
        .with_artifacts(artifacts)
        .with_parent(dispatch)
    }

    /// Reply to `dispatch` and process the consequences.
    pub async fn answer(&self, dispatch: &Event, state: State, artifacts: Vec<Artifact>) {
        let message = match state {
            State::Complete => "done",
            State::Failed => "worker failed",
            _ => "working",
        };
        let reply = Self::reply(dispatch, state, message, artifacts);
        self.engine.handle(&reply).await.expect("handle reply");
        self.pump().await;
    }

    /// Complete every pending dispatch to `key`.
    pub async fn complete_all(&self, key: &str) -> usize {
        let dispatches = self.take_dispatches(key);
        for dispatch in &dispatches {
            self.answer(
                dispatch,
                State::Complete,
                vec![Artifact::new("IMAGE", format!("registry/acme-web:{key}"))],
            )
            .await;
        }
        dispatches.len()
    }

    pub async fn reload(&self, release: &Release) -> Release {
        self.store.get_release(&release.id).await.unwrap()
    }
}
