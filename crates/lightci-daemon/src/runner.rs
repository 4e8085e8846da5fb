//! Pipeline Runner (Section 4.1): the `runPipeline` entry point, the run
//! state machine, and the per-step execution algorithm.

use chrono::Utc;
use lightci_core::events::{Event, EventType, RunCreatedPayload, RunTerminalPayload, StepFinishedPayload, StepStartedPayload};
use lightci_core::{Id, Pipeline, PipelineRun, RunLocation, RunStatus, StepStatus};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::artifacts::ArtifactCollector;
use crate::deployer::{Deployer, DeployerError};
use crate::events::EventBus;
use crate::executor::{self, ExecutorError};
use crate::git::{self, GitError};
use crate::storage::{Storage, StorageError};
use std::sync::Arc;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pipeline {0} already has an active run")]
    AlreadyRunning(Id),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Outcome of a single step's command resolution and execution (step 2-4
/// of the per-step algorithm). `error` mirrors the executor's contract:
/// set whenever the step should be treated as failed.
struct StepOutcome {
    output: String,
    error: Option<String>,
}

/// Drives runs from creation through completion. Cheap to clone: every
/// field is an `Arc` or otherwise shared, so each run is executed on its
/// own cloned handle inside a spawned task.
#[derive(Clone)]
pub struct Runner {
    storage: Arc<Storage>,
    deployer: Arc<Deployer>,
    artifacts: Arc<ArtifactCollector>,
    events: EventBus,
    workspace_root: PathBuf,
    artifacts_root: PathBuf,
    run_soft_timeout: Duration,
    /// Serializes the has-active-run check and the run insert so two
    /// concurrent callers (manual trigger, webhook, scheduler) can't both
    /// observe "no active run" and both insert one (Section 5 "at most one
    /// active run per pipeline").
    claim_lock: Arc<Mutex<()>>,
}

impl Runner {
    pub fn new(
        storage: Arc<Storage>,
        deployer: Arc<Deployer>,
        artifacts: Arc<ArtifactCollector>,
        events: EventBus,
        workspace_root: PathBuf,
        artifacts_root: PathBuf,
        run_soft_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            deployer,
            artifacts,
            events,
            workspace_root,
            artifacts_root,
            run_soft_timeout,
            claim_lock: Arc::new(Mutex::new(())),
        }
    }

    /// `runPipeline(pipelineId, branch, commitOpt, triggeredBy) -> runId`.
    /// Creates the run in status *running* with every step pending,
    /// persists it, and spawns background execution. Returns immediately.
    ///
    /// Every producer (manual HTTP trigger, webhook, scheduler tick) calls
    /// through here, so the claim lock held across the check-then-insert is
    /// the single place the "at most one active run" guard is enforced.
    pub async fn run_pipeline(
        &self,
        pipeline_id: &Id,
        branch: String,
        commit: Option<String>,
        triggered_by: String,
    ) -> Result<Id> {
        let _claim = self.claim_lock.lock().await;

        let pipeline = self.storage.get_pipeline(pipeline_id).await?;
        if self.storage.has_active_run(pipeline_id).await? {
            return Err(RunnerError::AlreadyRunning(pipeline_id.clone()));
        }
        let run = PipelineRun::new(&pipeline, branch, commit, triggered_by);
        self.storage.insert_run(&run).await?;
        drop(_claim);
        let run_id = run.id.clone();

        self.events.emit(Event::new(
            EventType::RunCreated,
            RunCreatedPayload {
                run_id: run_id.clone(),
                pipeline_id: pipeline.id.clone(),
                branch: run.branch.clone(),
                triggered_by: run.triggered_by.clone(),
            },
        ));

        let runner = self.clone();
        tokio::spawn(async move {
            runner.execute(pipeline, run).await;
        });

        Ok(run_id)
    }

    /// Races the full run against the soft wall-clock deadline (Section 5:
    /// "Cancellation and timeouts"). On timeout the run is force-marked
    /// *failed* and the workspace is released even though `execute_inner`
    /// never got to do so itself.
    async fn execute(&self, pipeline: Pipeline, run: PipelineRun) {
        let run_id = run.id.clone();
        let workspace_path = self.workspace_root.join(run_id.to_string());

        let outcome = tokio::time::timeout(
            self.run_soft_timeout,
            self.execute_inner(&pipeline, run, &workspace_path),
        )
        .await;

        if outcome.is_err() {
            warn!(run_id = %run_id, "run exceeded soft timeout");
            if let Ok(mut current) = self.storage.get_run(&run_id).await {
                if current.status == RunStatus::Running {
                    current.status = RunStatus::Failed;
                    current.error = Some("timeout".to_string());
                    current.completion_time = Some(Utc::now());
                    if let Err(e) = self.storage.update_run(&current).await {
                        error!(run_id = %run_id, error = %e, "failed to persist timeout transition");
                    }
                    self.events.emit(Event::new(
                        EventType::RunFailed,
                        RunTerminalPayload {
                            run_id: run_id.clone(),
                            status: RunStatus::Failed.as_str().to_string(),
                            error: current.error.clone(),
                        },
                    ));
                }
            }
            release_workspace(&workspace_path);
        }
    }

    /// The per-step algorithm (Section 4.1), run in pipeline order.
    async fn execute_inner(&self, pipeline: &Pipeline, mut run: PipelineRun, workspace_path: &Path) {
        if let Err(e) = std::fs::create_dir_all(workspace_path) {
            self.fail_run(&mut run, format!("failed to create workspace: {e}")).await;
            return;
        }

        self.events.emit(Event::new(
            EventType::RunStarted,
            RunCreatedPayload {
                run_id: run.id.clone(),
                pipeline_id: pipeline.id.clone(),
                branch: run.branch.clone(),
                triggered_by: run.triggered_by.clone(),
            },
        ));

        let mut deployment_completed = false;

        for step in &pipeline.steps {
            match self.storage.get_run(&run.id).await {
                Ok(current) if current.status == RunStatus::Cancelled => {
                    info!(run_id = %run.id, "run cancelled; stopping before next step");
                    self.events.emit(Event::new(
                        EventType::RunCancelled,
                        RunTerminalPayload {
                            run_id: run.id.clone(),
                            status: RunStatus::Cancelled.as_str().to_string(),
                            error: None,
                        },
                    ));
                    release_workspace(workspace_path);
                    return;
                }
                Ok(current) if current.status != RunStatus::Running => {
                    // Already terminal through some other path; nothing left to do.
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(run_id = %run.id, error = %e, "failed to re-read run status");
                    return;
                }
            }

            let Some(idx) = run.step_results.iter().position(|s| s.id == step.id) else {
                continue;
            };

            run.step_results[idx].status = StepStatus::Running;
            run.step_results[idx].start_time = Some(Utc::now());
            if let Err(e) = self.storage.update_run(&run).await {
                error!(run_id = %run.id, error = %e, "failed to persist step start");
                return;
            }
            self.events.emit(Event::new(
                EventType::StepStarted,
                StepStartedPayload {
                    run_id: run.id.clone(),
                    step_id: step.id.clone(),
                    name: step.name.clone(),
                },
            ));

            let outcome = self
                .run_step(pipeline, &run, step, workspace_path, &mut deployment_completed)
                .await;

            run.step_results[idx].end_time = Some(Utc::now());
            run.step_results[idx].output = outcome.output;

            if let Some(step_error) = outcome.error {
                run.step_results[idx].status = StepStatus::Failed;
                run.step_results[idx].error = Some(step_error.clone());
                let duration_ms = step_duration_ms(&run.step_results[idx]);
                self.events.emit(Event::new(
                    EventType::StepFinished,
                    StepFinishedPayload {
                        run_id: run.id.clone(),
                        step_id: step.id.clone(),
                        status: StepStatus::Failed.as_str().to_string(),
                        duration_ms,
                    },
                ));
                self.fail_run(&mut run, step_error).await;
                release_workspace(workspace_path);
                return;
            }

            if step.is_source() && run.commit.is_none() {
                if let Some(sha) = git::current_commit(workspace_path) {
                    run.commit = Some(sha);
                }
            }

            if step.is_build() {
                if let Err(e) = self.artifacts.collect(&mut run, pipeline, workspace_path).await {
                    // Section 4.4 / 7: pattern-layer errors land on the run's
                    // error field but don't flip a completed run to failed.
                    run.error = Some(format!("artifact collection failed: {e}"));
                }
            }

            run.step_results[idx].status = StepStatus::Completed;
            let duration_ms = step_duration_ms(&run.step_results[idx]);
            if let Err(e) = self.storage.update_run(&run).await {
                error!(run_id = %run.id, error = %e, "failed to persist step completion");
                return;
            }
            self.events.emit(Event::new(
                EventType::StepFinished,
                StepFinishedPayload {
                    run_id: run.id.clone(),
                    step_id: step.id.clone(),
                    status: StepStatus::Completed.as_str().to_string(),
                    duration_ms,
                },
            ));
        }

        if let Err(e) = self.artifacts.collect(&mut run, pipeline, workspace_path).await {
            run.error = Some(format!("artifact collection failed: {e}"));
        }

        run.status = RunStatus::Completed;
        run.completion_time = Some(Utc::now());
        if let Err(e) = self.storage.update_run(&run).await {
            error!(run_id = %run.id, error = %e, "failed to persist run completion");
        }
        self.events.emit(Event::new(
            EventType::RunCompleted,
            RunTerminalPayload {
                run_id: run.id.clone(),
                status: RunStatus::Completed.as_str().to_string(),
                error: run.error.clone(),
            },
        ));

        release_workspace(workspace_path);
    }

    /// Step 2-3 of the per-step algorithm: resolve the command and pick the
    /// execution site.
    async fn run_step(
        &self,
        pipeline: &Pipeline,
        run: &PipelineRun,
        step: &lightci_core::Step,
        workspace_path: &Path,
        deployment_completed: &mut bool,
    ) -> StepOutcome {
        if step.is_source() {
            return match git::clone_and_checkout(&pipeline.repository_url, &run.branch, workspace_path) {
                Ok(output) => StepOutcome { output, error: None },
                Err(GitError::CommandFailed(msg)) => StepOutcome { output: String::new(), error: Some(msg) },
                Err(e) => StepOutcome { output: String::new(), error: Some(e.to_string()) },
            };
        }

        if step.is_deploy_step {
            let artifacts_dir = self.artifacts_root.join(run.id.to_string());
            return match self.deployer.deploy(run, pipeline, &artifacts_dir).await {
                Ok(outcome) => {
                    *deployment_completed = outcome.success;
                    StepOutcome {
                        output: outcome.logs,
                        error: if outcome.success { None } else { Some(outcome.message) },
                    }
                }
                Err(DeployerError::Io(e)) => StepOutcome { output: String::new(), error: Some(e.to_string()) },
                Err(e) => StepOutcome { output: String::new(), error: Some(e.to_string()) },
            };
        }

        let run_remotely = *deployment_completed
            && (step.run_location == RunLocation::Deployed || pipeline.deployment_policy.enabled);

        if run_remotely {
            match self.deployer.resolve_remote_target(pipeline, run).await {
                Ok((remote, key_material)) => match crate::ssh_keys::TempKeyFile::write(&key_material) {
                    Ok(key_file) => {
                        let result = executor::execute_remote(&step.command, &remote, key_file.path(), &step.env).await;
                        drop(key_file);
                        to_outcome(result)
                    }
                    Err(e) => StepOutcome { output: String::new(), error: Some(e.to_string()) },
                },
                Err(e) => StepOutcome { output: String::new(), error: Some(e.to_string()) },
            }
        } else {
            to_outcome(executor::execute(&step.command, workspace_path, &step.env).await)
        }
    }

    async fn fail_run(&self, run: &mut PipelineRun, error: String) {
        run.status = RunStatus::Failed;
        run.error = Some(error.clone());
        run.completion_time = Some(Utc::now());
        if let Err(e) = self.storage.update_run(run).await {
            error!(run_id = %run.id, error = %e, "failed to persist run failure");
        }
        self.events.emit(Event::new(
            EventType::RunFailed,
            RunTerminalPayload {
                run_id: run.id.clone(),
                status: RunStatus::Failed.as_str().to_string(),
                error: Some(error),
            },
        ));
    }

    /// Crash recovery (Section 4.1): on daemon start, any run left *running*
    /// means the process died mid-run. Transition each to *failed* and
    /// release its workspace, mirroring the ordinary failure path.
    pub async fn recover_interrupted_runs(&self) -> Result<usize> {
        let running = self.storage.list_running_runs().await?;
        let mut recovered = 0;
        for mut run in running {
            run.status = RunStatus::Failed;
            run.error = Some("interrupted by daemon restart".to_string());
            run.completion_time = Some(Utc::now());
            if let Err(e) = self.storage.update_run(&run).await {
                error!(run_id = %run.id, error = %e, "failed to persist crash recovery transition");
                continue;
            }
            release_workspace(&self.workspace_root.join(run.id.to_string()));
            recovered += 1;
        }
        Ok(recovered)
    }
}

fn to_outcome(result: std::result::Result<executor::ExecResult, ExecutorError>) -> StepOutcome {
    match result {
        Ok(r) => StepOutcome { output: r.output, error: r.error },
        Err(e) => StepOutcome { output: String::new(), error: Some(e.to_string()) },
    }
}

fn step_duration_ms(step: &lightci_core::StepResult) -> u64 {
    match (step.start_time, step.end_time) {
        (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
        _ => 0,
    }
}

/// Workspace deletion on every exit path (Section 5). Errors are logged and
/// swallowed (Section 7: "Cleanup errors ... logged, swallowed").
fn release_workspace(workspace_path: &Path) {
    if workspace_path.exists() {
        if let Err(e) = std::fs::remove_dir_all(workspace_path) {
            warn!(path = %workspace_path.display(), error = %e, "failed to release workspace");
        }
    }
}

#[async_trait::async_trait]
impl crate::webhook::RunTrigger for Runner {
    async fn trigger_run(
        &self,
        pipeline: &Pipeline,
        branch: String,
        commit: Option<String>,
        triggered_by: String,
    ) -> std::result::Result<Id, String> {
        self.run_pipeline(&pipeline.id, branch, commit, triggered_by)
            .await
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lightci_core::{ArtifactPolicy, DeploymentPolicy, Step, TriggerConfig};
    use tempfile::TempDir;

    async fn test_storage() -> Arc<Storage> {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("db.sqlite")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        std::mem::forget(dir);
        Arc::new(storage)
    }

    fn test_pipeline() -> Pipeline {
        Pipeline {
            id: Id::new(),
            name: "demo".to_string(),
            repository_url: "https://example.com/demo.git".to_string(),
            default_branch: "main".to_string(),
            steps: vec![Step {
                id: Id::new(),
                name: "Test".to_string(),
                command: "echo hi".to_string(),
                env: HashMap::new(),
                timeout_secs: None,
                run_location: RunLocation::Local,
                is_deploy_step: false,
            }],
            trigger: TriggerConfig::default(),
            artifact_policy: ArtifactPolicy::default(),
            deployment_policy: DeploymentPolicy::default(),
            owner_id: Id::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn test_runner(storage: Arc<Storage>, workspace_root: PathBuf, artifacts_root: PathBuf) -> Runner {
        let ssh_keys = Arc::new(crate::ssh_keys::SshKeyStore::new(Arc::clone(&storage)));
        let provisioner = Arc::new(crate::provisioner::Provisioner::new(Box::new(
            crate::provisioner::FakeCloudProvider::default(),
        )));
        let events = EventBus::new();
        let deployer = Arc::new(Deployer::new(Arc::clone(&storage), ssh_keys, provisioner, events.clone()));
        let artifacts = Arc::new(ArtifactCollector::new(Arc::clone(&storage), artifacts_root.clone()));
        Runner::new(
            storage,
            deployer,
            artifacts,
            events,
            workspace_root,
            artifacts_root,
            Duration::from_secs(2 * 60 * 60),
        )
    }

    #[tokio::test]
    async fn run_pipeline_creates_a_running_run_with_pending_steps() {
        let storage = test_storage().await;
        let pipeline = test_pipeline();
        storage.insert_pipeline(&pipeline).await.unwrap();
        let workspace_root = TempDir::new().unwrap();
        let artifacts_root = TempDir::new().unwrap();
        let runner = test_runner(
            Arc::clone(&storage),
            workspace_root.path().to_path_buf(),
            artifacts_root.path().to_path_buf(),
        )
        .await;

        let run_id = runner
            .run_pipeline(&pipeline.id, "main".to_string(), None, "manual".to_string())
            .await
            .unwrap();

        let run = storage.get_run(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.step_results.len(), 1);
        assert_eq!(run.step_results[0].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn run_pipeline_rejects_a_second_trigger_while_one_is_active() {
        let storage = test_storage().await;
        let pipeline = test_pipeline();
        storage.insert_pipeline(&pipeline).await.unwrap();
        let workspace_root = TempDir::new().unwrap();
        let artifacts_root = TempDir::new().unwrap();
        let runner = test_runner(
            Arc::clone(&storage),
            workspace_root.path().to_path_buf(),
            artifacts_root.path().to_path_buf(),
        )
        .await;

        let mut already_running = PipelineRun::new(&pipeline, "main".to_string(), None, "manual".to_string());
        already_running.status = RunStatus::Running;
        storage.insert_run(&already_running).await.unwrap();

        let result = runner
            .run_pipeline(&pipeline.id, "main".to_string(), None, "manual".to_string())
            .await;

        assert!(matches!(result, Err(RunnerError::AlreadyRunning(id)) if id == pipeline.id));
    }

    #[tokio::test]
    async fn recover_interrupted_runs_marks_running_runs_failed() {
        let storage = test_storage().await;
        let pipeline = test_pipeline();
        storage.insert_pipeline(&pipeline).await.unwrap();
        let mut run = PipelineRun::new(&pipeline, "main".to_string(), None, "manual".to_string());
        run.status = RunStatus::Running;
        storage.insert_run(&run).await.unwrap();

        let workspace_root = TempDir::new().unwrap();
        let artifacts_root = TempDir::new().unwrap();
        let runner = test_runner(
            Arc::clone(&storage),
            workspace_root.path().to_path_buf(),
            artifacts_root.path().to_path_buf(),
        )
        .await;

        let recovered = runner.recover_interrupted_runs().await.unwrap();
        assert_eq!(recovered, 1);
        let reloaded = storage.get_run(&run.id).await.unwrap();
        assert_eq!(reloaded.status, RunStatus::Failed);
        assert_eq!(reloaded.error.as_deref(), Some("interrupted by daemon restart"));
    }
}
