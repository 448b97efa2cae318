mod common;

use std::sync::Arc;

use berth_core::{EventName, OrchestratorConfig, Payload};
use berth_state::{Artifact, ExtensionKind, Release, ReleaseExtension, ReleaseStore, State};
use common::{Harness, Layout};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn layout(workflow: &[&'static str], deployment: &[&'static str]) -> Layout {
    Layout {
        workflow: workflow.to_vec(),
        deployment: deployment.to_vec(),
        notification: true,
    }
}

async fn items_of(h: &Harness, release: &Release, kind: ExtensionKind) -> Vec<ReleaseExtension> {
    h.store
        .list_release_extensions(&release.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|i| i.kind == kind)
        .collect()
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn release_runs_workflow_then_deployment_then_completes() {
    let h = Harness::new().await;
    let release = h.release(0).await;

    let started = h.reload(&release).await;
    assert_eq!(started.state, State::Running);
    assert_eq!(started.state_message, "Running Release");
    assert!(started.is_started());
    assert_eq!(started.tail_feature_id, h.features[0].id);

    // Deployment waits for the workflow stage.
    assert!(h.take_dispatches("kubernetes:deployment").is_empty());
    let builds = h.take_dispatches("dockerbuilder");
    assert_eq!(builds.len(), 1);
    let build = &builds[0];
    assert_eq!(build.action, berth_state::Action::Create);
    assert_eq!(
        build.artifact("REGION").map(|a| a.value_string()),
        Some("us-east-1".to_string())
    );
    match &build.payload {
        Payload::ReleaseExtension(p) => {
            assert_eq!(p.release.id, release.id);
            assert_eq!(p.release.git.branch, "main");
            assert_eq!(p.environment, "production");
            assert!(p
                .release
                .secrets
                .iter()
                .any(|s| s.key == "BERTH_HASH" && s.value == "a1b2c3d"));
        }
        other => panic!("unexpected payload {other:?}"),
    }

    h.answer(
        build,
        State::Complete,
        vec![Artifact::new("IMAGE", "registry/acme-web:a1b2c3d")],
    )
    .await;

    let deploys = h.take_dispatches("kubernetes:deployment");
    assert_eq!(deploys.len(), 1);
    let image = deploys[0].artifact("IMAGE").expect("workflow artifact forwarded");
    assert_eq!(image.source.as_deref(), Some("dockerbuilder"));
    assert_eq!(image.value_string(), "registry/acme-web:a1b2c3d");
    assert!(deploys[0].artifact("REGION").is_some());

    h.answer(&deploys[0], State::Complete, Vec::new()).await;

    let done = h.reload(&release).await;
    assert_eq!(done.state, State::Complete);
    assert_eq!(done.state_message, "Completed");
    assert!(done.finished_at.is_some());
    assert_eq!(
        h.notifications(),
        vec![("slack".to_string(), "SUCCESS".to_string())]
    );

    let channels = h.websocket_channels();
    assert!(channels.contains(&"projects/acme-web/production/releases".to_string()));
    assert!(channels.contains(&"projects/acme-web/production/releases/reCompleted".to_string()));
}

#[tokio::test]
async fn websocket_releases_hide_secret_values() {
    let h = Harness::new().await;
    h.release(0).await;

    let leaked = h.outbox().into_iter().any(|e| match &e.payload {
        Payload::Websocket(msg) => msg.payload.to_string().contains("postgres://db/acme"),
        _ => false,
    });
    assert!(!leaked);
}

// ---------------------------------------------------------------------------
// Stage shortcuts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn release_without_deployments_completes_after_workflow() {
    let h = Harness::with(layout(&["dockerbuilder"], &[]), OrchestratorConfig::default()).await;
    let release = h.release(0).await;

    assert_eq!(h.complete_all("dockerbuilder").await, 1);
    assert_eq!(h.reload(&release).await.state, State::Complete);
    assert_eq!(h.notifications().len(), 1);
}

#[tokio::test]
async fn release_without_workflow_dispatches_deployments_at_start() {
    let h = Harness::with(
        layout(&[], &["kubernetes:deployment"]),
        OrchestratorConfig::default(),
    )
    .await;
    let release = h.release(0).await;

    let deploys = h.take_dispatches("kubernetes:deployment");
    assert_eq!(deploys.len(), 1);
    assert!(deploys[0].artifact("IMAGE").is_none());

    h.answer(&deploys[0], State::Complete, Vec::new()).await;
    assert_eq!(h.reload(&release).await.state, State::Complete);
}

#[tokio::test]
async fn release_without_extensions_completes_immediately() {
    let h = Harness::with(layout(&[], &[]), OrchestratorConfig::default()).await;
    let release = h.release(0).await;

    let done = h.reload(&release).await;
    assert_eq!(done.state, State::Complete);
    assert!(h.store.list_release_extensions(&release.id).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Completion barrier
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_and_repeated_reports_transition_once() {
    let h = Harness::with(
        layout(&["dockerbuilder", "assets"], &["kubernetes:deployment"]),
        OrchestratorConfig::default(),
    )
    .await;
    let release = h.release(0).await;

    let mut replies = Vec::new();
    for key in ["dockerbuilder", "assets"] {
        for dispatch in h.take_dispatches(key) {
            let reply = Harness::reply(&dispatch, State::Complete, "done", Vec::new());
            replies.push(reply.clone());
            replies.push(reply);
        }
    }
    assert_eq!(replies.len(), 4);

    let handles: Vec<_> = replies
        .into_iter()
        .map(|reply| {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.handle(&reply).await })
        })
        .collect();
    for result in futures::future::join_all(handles).await {
        result.unwrap().unwrap();
    }
    h.pump().await;

    let deploys = h.take_dispatches("kubernetes:deployment");
    assert_eq!(deploys.len(), 1);

    // Deployment reported twice: the release completes and notifies once.
    let reply = Harness::reply(&deploys[0], State::Complete, "rolled out", Vec::new());
    let (a, b) = tokio::join!(h.engine.handle(&reply), h.engine.handle(&reply));
    a.unwrap();
    b.unwrap();
    h.pump().await;

    assert_eq!(h.reload(&release).await.state, State::Complete);
    assert_eq!(h.notifications().len(), 1);
}

#[tokio::test]
async fn partial_workflow_does_not_start_deployment() {
    let h = Harness::with(
        layout(&["dockerbuilder", "assets"], &["kubernetes:deployment"]),
        OrchestratorConfig::default(),
    )
    .await;
    let release = h.release(0).await;

    assert_eq!(h.complete_all("dockerbuilder").await, 1);
    assert!(h.take_dispatches("kubernetes:deployment").is_empty());
    let deployment = items_of(&h, &release, ExtensionKind::Deployment).await;
    assert_eq!(deployment[0].state, State::Waiting);

    assert_eq!(h.complete_all("assets").await, 1);
    assert_eq!(h.take_dispatches("kubernetes:deployment").len(), 1);
}

#[tokio::test]
async fn stale_running_report_does_not_reopen_finished_item() {
    let h = Harness::with(
        layout(&["dockerbuilder", "assets"], &["kubernetes:deployment"]),
        OrchestratorConfig::default(),
    )
    .await;
    let release = h.release(0).await;

    let builds = h.take_dispatches("dockerbuilder");
    h.answer(&builds[0], State::Complete, Vec::new()).await;
    // A "running" report that arrives after the completion is dropped.
    h.answer(&builds[0], State::Running, Vec::new()).await;

    let build = items_of(&h, &release, ExtensionKind::Workflow)
        .await
        .into_iter()
        .find(|i| i.extension_key == "dockerbuilder")
        .unwrap();
    assert_eq!(build.state, State::Complete);
    assert_eq!(build.state_message, "done");

    assert_eq!(h.complete_all("assets").await, 1);
    let deploys = h.take_dispatches("kubernetes:deployment");
    assert_eq!(deploys.len(), 1);
    h.answer(&deploys[0], State::Complete, Vec::new()).await;
    assert_eq!(h.reload(&release).await.state, State::Complete);
    assert!(h.take_dispatches("kubernetes:deployment").is_empty());
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn workflow_failure_fails_release_and_starts_next_once() {
    let h = Harness::new().await;
    let first = h.release(0).await;
    let second = h.release(1).await;
    assert_eq!(h.reload(&second).await.state, State::Waiting);

    let builds = h.take_dispatches("dockerbuilder");
    assert_eq!(builds.len(), 1);
    h.answer(&builds[0], State::Failed, Vec::new()).await;

    let failed = h.reload(&first).await;
    assert_eq!(failed.state, State::Failed);
    assert_eq!(failed.state_message, "worker failed");
    assert!(failed.finished_at.is_some());
    for item in h.store.list_release_extensions(&first.id).await.unwrap() {
        assert_eq!(item.state, State::Failed);
    }
    assert!(h
        .notifications()
        .contains(&("slack".to_string(), "FAILED".to_string())));

    // The queue promoted and started the next release.
    let next = h.reload(&second).await;
    assert_eq!(next.state, State::Running);
    assert!(next.is_started());
    assert_eq!(h.take_dispatches("dockerbuilder").len(), 1);

    // A redelivered failure changes nothing.
    h.answer(&builds[0], State::Failed, Vec::new()).await;
    assert!(h.take_dispatches("dockerbuilder").is_empty());
    assert_eq!(h.reload(&second).await.version, next.version);
}

#[tokio::test]
async fn one_failed_deployment_fails_its_siblings_and_starts_next_once() {
    let h = Harness::with(
        layout(&["dockerbuilder"], &["kubernetes:deployment", "route53"]),
        OrchestratorConfig::default(),
    )
    .await;
    let first = h.release(0).await;
    let second = h.release(1).await;

    assert_eq!(h.complete_all("dockerbuilder").await, 1);
    let kubernetes = h.take_dispatches("kubernetes:deployment");
    assert_eq!(kubernetes.len(), 1);
    assert_eq!(h.take_dispatches("route53").len(), 1);

    h.answer(&kubernetes[0], State::Failed, Vec::new()).await;

    assert_eq!(h.reload(&first).await.state, State::Failed);
    let deployments = items_of(&h, &first, ExtensionKind::Deployment).await;
    assert_eq!(deployments.len(), 2);
    for item in &deployments {
        assert_eq!(item.state, State::Failed, "{}", item.extension_key);
    }

    let next = h.reload(&second).await;
    assert_eq!(next.state, State::Running);
    assert!(next.is_started());
    assert_eq!(h.take_dispatches("dockerbuilder").len(), 1);

    // Redelivery of the failure changes nothing.
    h.answer(&kubernetes[0], State::Failed, Vec::new()).await;
    assert!(h.take_dispatches("dockerbuilder").is_empty());
    assert!(h.take_dispatches("route53").is_empty());
    assert_eq!(h.reload(&second).await.version, next.version);
    let failed = h
        .notifications()
        .into_iter()
        .filter(|(_, msg)| msg == "FAILED")
        .count();
    assert_eq!(failed, 1);
}

#[tokio::test]
async fn websocket_outage_does_not_hold_up_the_queue() {
    let h = Harness::new().await;
    let first = h.release(0).await;
    let second = h.release(1).await;
    h.bus.reject(EventName::Websocket);

    assert_eq!(h.complete_all("dockerbuilder").await, 1);
    assert_eq!(h.complete_all("kubernetes:deployment").await, 1);

    assert_eq!(h.reload(&first).await.state, State::Complete);
    let next = h.reload(&second).await;
    assert_eq!(next.state, State::Running);
    assert!(next.is_started());
    assert_eq!(h.take_dispatches("dockerbuilder").len(), 1);
    assert!(h
        .notifications()
        .contains(&("slack".to_string(), "SUCCESS".to_string())));
}

#[tokio::test]
async fn late_report_on_finished_release_is_recorded_only() {
    let h = Harness::new().await;
    let release = h.release(0).await;
    let builds = h.take_dispatches("dockerbuilder");
    h.answer(&builds[0], State::Complete, Vec::new()).await;
    h.complete_all("kubernetes:deployment").await;
    assert_eq!(h.reload(&release).await.state, State::Complete);

    h.answer(&builds[0], State::Failed, Vec::new()).await;

    let release = h.reload(&release).await;
    assert_eq!(release.state, State::Complete);
    let workflow = items_of(&h, &release, ExtensionKind::Workflow).await;
    assert_eq!(workflow[0].state, State::Failed);
    assert_eq!(
        h.notifications(),
        vec![("slack".to_string(), "SUCCESS".to_string())]
    );
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn routed_event_with_wrong_payload_is_rejected() {
    let h = Harness::new().await;
    let release = h.release(0).await;

    // The first outbox event is the websocket update from the start.
    let mut stray = h.outbox()[0].clone();
    stray.name = EventName::ReleaseCreate;
    let err = h.engine.handle(&stray).await.unwrap_err();
    assert!(matches!(err, berth_core::BerthError::UnexpectedPayload { .. }));

    // Unsubscribed names are ignored.
    stray.name = EventName::release("dockerbuilder");
    h.engine.handle(&stray).await.unwrap();
    assert_eq!(h.reload(&release).await.state, State::Running);
}
