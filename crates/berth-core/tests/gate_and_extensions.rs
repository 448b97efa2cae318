mod common;

use chrono::Utc;

use berth_core::payload::project_ref;
use berth_core::{
    Event, EventName, GateConfig, OrchestratorConfig, Payload, ProjectExtensionPayload,
};
use berth_state::{
    Action, Artifact, CatalogStore, Environment, ExtensionKind, Release, ReleaseId,
    ReleaseSnapshot, ReleaseStore, State,
};
use common::{Harness, Layout};

// ---------------------------------------------------------------------------
// Dependent-environment gate
// ---------------------------------------------------------------------------

fn gated() -> OrchestratorConfig {
    OrchestratorConfig {
        gate: GateConfig {
            primary_environment: Some("production".to_string()),
            secondary_environment: Some("staging".to_string()),
        },
        ..Default::default()
    }
}

/// Add a staging environment holding a complete release of `features[feature]`.
async fn staged(h: &Harness, feature: Option<usize>) {
    let staging = Environment::new("Staging", "staging");
    h.store.put_environment(staging.clone()).await.unwrap();
    let Some(feature) = feature else { return };
    let now = Utc::now();
    h.store
        .insert_release(Release {
            id: ReleaseId::new(),
            project_id: h.project.id,
            environment_id: staging.id,
            user_id: h.user.id,
            head_feature_id: h.features[feature].id,
            tail_feature_id: h.features[0].id,
            state: State::Complete,
            state_message: "Completed".to_string(),
            force_rebuild: false,
            is_rollback: false,
            gate_warning: None,
            snapshot: ReleaseSnapshot {
                services: Vec::new(),
                secrets: Vec::new(),
                taken_at: now,
            },
            created_at: now,
            started_at: Some(now),
            finished_at: Some(now),
            version: 0,
        })
        .await
        .unwrap();
}

async fn run_to_end(h: &Harness, release: &Release) -> Release {
    h.complete_all("dockerbuilder").await;
    h.complete_all("kubernetes:deployment").await;
    h.reload(release).await
}

#[tokio::test]
async fn untested_feature_warns_but_still_releases() {
    let h = Harness::with(Layout::default(), gated()).await;
    staged(&h, None).await;

    let release = h.release(0).await;
    let complaint =
        "This feature was deployed directly to Production without prior testing in Staging.";
    assert_eq!(h.reload(&release).await.gate_warning.as_deref(), Some(complaint));
    assert_eq!(
        h.notifications(),
        vec![("slack".to_string(), complaint.to_string())]
    );

    let done = run_to_end(&h, &release).await;
    assert_eq!(done.state, State::Complete);
    // The complaint replaces the success notification.
    assert_eq!(h.notifications().len(), 1);
}

#[tokio::test]
async fn feature_released_in_secondary_passes_gate() {
    let h = Harness::with(Layout::default(), gated()).await;
    staged(&h, Some(0)).await;

    let release = h.release(0).await;
    assert!(h.reload(&release).await.gate_warning.is_none());
    run_to_end(&h, &release).await;
    assert_eq!(
        h.notifications(),
        vec![("slack".to_string(), "SUCCESS".to_string())]
    );
}

#[tokio::test]
async fn newer_feature_in_secondary_passes_gate() {
    let h = Harness::with(Layout::default(), gated()).await;
    staged(&h, Some(2)).await;

    let release = h.release(0).await;
    assert!(h.reload(&release).await.gate_warning.is_none());
}

#[tokio::test]
async fn gate_ignores_other_environments() {
    let mut config = gated();
    config.gate.primary_environment = Some("canary".to_string());
    let h = Harness::with(Layout::default(), config).await;
    staged(&h, None).await;

    let release = h.release(0).await;
    assert!(h.reload(&release).await.gate_warning.is_none());
    assert!(h.notifications().is_empty());
}

// ---------------------------------------------------------------------------
// Project extension status
// ---------------------------------------------------------------------------

fn project_status(h: &Harness, key: &str, state: State, artifacts: Vec<Artifact>) -> Event {
    let (project_extension, _) = h
        .extensions
        .iter()
        .find(|(_, e)| e.key == key)
        .expect("installed extension");
    Event::new(
        EventName::project_status(key),
        Action::Status,
        Payload::ProjectExtension(ProjectExtensionPayload {
            id: project_extension.id,
            project: project_ref(&h.project),
            environment: h.environment.key.clone(),
        }),
    )
    .with_state(state, format!("{key} is {state}"))
    .with_artifacts(artifacts)
}

#[tokio::test]
async fn project_extension_status_updates_state_and_artifacts() {
    let h = Harness::new().await;
    let (slack, _) = h
        .extensions
        .iter()
        .find(|(_, e)| e.kind == ExtensionKind::Notification)
        .cloned()
        .unwrap();

    let webhook = vec![Artifact::secret("WEBHOOK_URL", "https://hooks.example/abc")];
    h.engine
        .handle(&project_status(&h, "slack", State::Complete, webhook.clone()))
        .await
        .unwrap();
    let stored = h.store.get_project_extension(&slack.id).await.unwrap();
    assert_eq!(stored.state, State::Complete);
    assert_eq!(stored.state_message, "slack is complete");
    assert_eq!(stored.artifacts, webhook);

    // A failure report keeps the artifacts.
    h.engine
        .handle(&project_status(
            &h,
            "slack",
            State::Failed,
            vec![Artifact::new("ignored", "x")],
        ))
        .await
        .unwrap();
    let stored = h.store.get_project_extension(&slack.id).await.unwrap();
    assert_eq!(stored.state, State::Failed);
    assert_eq!(stored.artifacts, webhook);

    // So does a completion without artifacts.
    h.engine
        .handle(&project_status(&h, "slack", State::Complete, Vec::new()))
        .await
        .unwrap();
    let stored = h.store.get_project_extension(&slack.id).await.unwrap();
    assert_eq!(stored.state, State::Complete);
    assert_eq!(stored.artifacts, webhook);

    let channels: Vec<_> = h
        .bus
        .events()
        .into_iter()
        .filter_map(|e| match e.payload {
            Payload::Websocket(msg) => Some(msg.event),
            _ => None,
        })
        .collect();
    assert_eq!(channels.len(), 3);
    assert!(channels
        .iter()
        .all(|c| c == "projects/acme-web/production/extensions"));
}

#[tokio::test]
async fn project_extension_status_for_unknown_extension_fails() {
    let h = Harness::new().await;
    let mut event = project_status(&h, "slack", State::Complete, Vec::new());
    if let Payload::ProjectExtension(p) = &mut event.payload {
        p.id = Default::default();
    }
    let err = h.engine.handle(&event).await.unwrap_err();
    assert!(err.is_not_found());
}
