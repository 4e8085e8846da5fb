//! End-to-end tests driving the HTTP control-plane surface against a real
//! Runner, Storage and ArtifactCollector. No TCP port is bound; requests go
//! through the axum `Router` via `tower::ServiceExt::oneshot`.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{Request, StatusCode};
use base64::Engine as _;
use http_body_util::BodyExt;
use lightci_core::{ArtifactPolicy, ArtifactRecord, DeploymentPolicy, Id, RunLocation, RunStatus, Step, StepStatus, TriggerConfig};
use lightci_daemon::artifacts::ArtifactCollector;
use lightci_daemon::deployer::Deployer;
use lightci_daemon::events::EventBus;
use lightci_daemon::provisioner::{FakeCloudProvider, Provisioner};
use lightci_daemon::runner::Runner;
use lightci_daemon::scheduler::Scheduler;
use lightci_daemon::server::{create_router, AppState};
use lightci_daemon::ssh_keys::SshKeyStore;
use lightci_daemon::storage::Storage;
use lightci_daemon::webhook::{RunTrigger, WebhookAdapter};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

struct Harness {
    router: axum::Router,
    workspace_root: TempDir,
    artifacts_root: TempDir,
}

async fn build_harness() -> Harness {
    let db_dir = TempDir::new().unwrap();
    let workspace_root = TempDir::new().unwrap();
    let artifacts_root = TempDir::new().unwrap();

    let storage = Arc::new(Storage::new(&db_dir.path().join("lightci.db")).await.unwrap());
    storage.migrate_embedded().await.unwrap();
    std::mem::forget(db_dir);

    let events = EventBus::new();
    let ssh_keys = Arc::new(SshKeyStore::new(Arc::clone(&storage)));
    let provisioner = Arc::new(Provisioner::new(Box::new(FakeCloudProvider::default())));
    let deployer = Arc::new(Deployer::new(Arc::clone(&storage), ssh_keys, provisioner, events.clone()));
    let artifacts = Arc::new(ArtifactCollector::new(Arc::clone(&storage), artifacts_root.path().to_path_buf()));

    let runner = Arc::new(Runner::new(
        Arc::clone(&storage),
        Arc::clone(&deployer),
        Arc::clone(&artifacts),
        events.clone(),
        workspace_root.path().to_path_buf(),
        artifacts_root.path().to_path_buf(),
        Duration::from_secs(30),
    ));
    let runner_trigger: Arc<dyn RunTrigger> = Arc::clone(&runner) as Arc<dyn RunTrigger>;

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&storage),
        Arc::clone(&runner_trigger),
        Arc::clone(&artifacts),
        Arc::clone(&deployer),
        Duration::from_secs(3600),
    ));
    let webhook = Arc::new(WebhookAdapter::new(Arc::clone(&storage), Arc::clone(&runner_trigger)));

    let state = Arc::new(AppState {
        storage,
        runner: runner_trigger,
        scheduler,
        artifacts_root: artifacts_root.path().to_path_buf(),
        webhook,
        auth_token: None,
    });

    Harness { router: create_router(state), workspace_root, artifacts_root }
}

/// A throwaway local git repository checked out at `main`, usable as a
/// pipeline's `repository_url` without reaching the network.
fn init_local_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    let run = |args: &[&str]| {
        let status = Command::new("git").args(args).current_dir(dir.path()).status().unwrap();
        assert!(status.success(), "git {:?} failed", args);
    };
    run(&["init", "-q", "-b", "main"]);
    run(&["config", "user.email", "ci@example.com"]);
    run(&["config", "user.name", "ci"]);
    std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
    run(&["add", "."]);
    run(&["commit", "-q", "-m", "initial"]);
    dir
}

fn step(name: &str, command: &str) -> Step {
    Step {
        id: Id::new(),
        name: name.to_string(),
        command: command.to_string(),
        env: HashMap::new(),
        timeout_secs: None,
        run_location: RunLocation::Local,
        is_deploy_step: false,
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn create_pipeline(router: &axum::Router, repo: &TempDir, steps: Vec<Step>, patterns: Vec<String>) -> Value {
    let req = json!({
        "name": "demo",
        "repository_url": repo.path().to_string_lossy(),
        "default_branch": "main",
        "steps": steps,
        "trigger": TriggerConfig::default(),
        "artifact_policy": ArtifactPolicy { enabled: true, patterns, retention_days: 30 },
        "deployment_policy": DeploymentPolicy::default(),
        "owner_id": Id::new(),
    });

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/pipelines")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(serde_json::to_vec(&req).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await
}

async fn trigger_run(router: &axum::Router, pipeline_id: &str) -> String {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/pipelines/{pipeline_id}/runs"))
                .header("content-type", "application/json")
                .body(axum::body::Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    body_json(response).await["run_id"].as_str().unwrap().to_string()
}

/// Polls `/runs/{id}` until the run leaves *running*, or panics after a
/// generous deadline. Run execution happens on a spawned background task,
/// so there is no other way to observe completion through the HTTP surface.
async fn await_terminal(router: &axum::Router, run_id: &str) -> Value {
    for _ in 0..200 {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(format!("/runs/{run_id}")).body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let run = body_json(response).await;
        let status = run["status"].as_str().unwrap();
        if status != RunStatus::Running.as_str() {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("run {run_id} did not reach a terminal status in time");
}

#[tokio::test]
async fn full_pipeline_run_collects_and_serves_an_artifact() {
    let harness = build_harness().await;
    let repo = init_local_repo();
    let steps = vec![step("Source", ""), step("Build", "echo hi > out.txt")];

    let pipeline = create_pipeline(&harness.router, &repo, steps, vec!["*.txt".to_string()]).await;
    let pipeline_id = pipeline["id"].as_str().unwrap().to_string();

    let run_id = trigger_run(&harness.router, &pipeline_id).await;
    let run = await_terminal(&harness.router, &run_id).await;

    assert_eq!(run["status"].as_str().unwrap(), RunStatus::Completed.as_str());
    assert_eq!(run["artifact_summary"]["count"].as_u64().unwrap(), 1);
    assert!(run["commit"].as_str().is_some_and(|c| !c.is_empty()), "run.commit should be backfilled from the checkout");

    let response = harness
        .router
        .clone()
        .oneshot(Request::builder().uri(format!("/runs/{run_id}/artifacts")).body(axum::body::Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let artifacts: Vec<ArtifactRecord> =
        serde_json::from_slice(&response.into_body().collect().await.unwrap().to_bytes()).unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].relative_path, "out.txt");

    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/runs/{run_id}/artifacts/{}/download", artifacts[0].id))
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let downloaded = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&downloaded[..], b"hi\n");

    assert!(harness.artifacts_root.path().join(&run_id).join("out.txt").exists());
    assert!(!harness.workspace_root.path().join(&run_id).exists());
}

#[tokio::test]
async fn a_failing_step_leaves_the_remaining_steps_pending() {
    let harness = build_harness().await;
    let repo = init_local_repo();
    let steps = vec![step("Source", ""), step("Test", "exit 3"), step("Deploy-check", "echo unreachable")];

    let pipeline = create_pipeline(&harness.router, &repo, steps, vec![]).await;
    let pipeline_id = pipeline["id"].as_str().unwrap().to_string();

    let run_id = trigger_run(&harness.router, &pipeline_id).await;
    let run = await_terminal(&harness.router, &run_id).await;

    assert_eq!(run["status"].as_str().unwrap(), RunStatus::Failed.as_str());
    let step_results = run["step_results"].as_array().unwrap();
    assert_eq!(step_results[0]["status"].as_str().unwrap(), StepStatus::Completed.as_str());
    assert_eq!(step_results[1]["status"].as_str().unwrap(), StepStatus::Failed.as_str());
    assert!(step_results[1]["error"].as_str().is_some());
    assert_eq!(step_results[2]["status"].as_str().unwrap(), StepStatus::Pending.as_str());

    assert!(!harness.workspace_root.path().join(&run_id).exists());
}

#[tokio::test]
async fn upload_is_rejected_when_it_does_not_match_the_artifact_policy() {
    let harness = build_harness().await;
    let repo = init_local_repo();
    let steps = vec![step("Source", "")];

    let pipeline = create_pipeline(&harness.router, &repo, steps, vec!["**/*.txt".to_string()]).await;
    let pipeline_id = pipeline["id"].as_str().unwrap().to_string();
    let run_id = trigger_run(&harness.router, &pipeline_id).await;
    await_terminal(&harness.router, &run_id).await;

    let req = json!({
        "relative_path": "evil.exe",
        "content_base64": base64::engine::general_purpose::STANDARD.encode(b"malicious"),
    });
    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/runs/{run_id}/artifacts/upload"))
                .header("content-type", "application/json")
                .body(axum::body::Body::from(serde_json::to_vec(&req).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("pattern"));

    let response = harness
        .router
        .clone()
        .oneshot(Request::builder().uri(format!("/runs/{run_id}/artifacts")).body(axum::body::Body::empty()).unwrap())
        .await
        .unwrap();
    let artifacts: Vec<ArtifactRecord> =
        serde_json::from_slice(&response.into_body().collect().await.unwrap().to_bytes()).unwrap();
    assert!(artifacts.iter().all(|a| a.relative_path != "evil.exe"));
}
