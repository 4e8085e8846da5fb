//! Scheduler (Section 4.6): cron-driven pipeline triggering plus the
//! single background tick loop that also drives artifact retention and
//! AutoDeployment health revalidation.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::artifacts::ArtifactCollector;
use crate::deployer::Deployer;
use crate::storage::{Storage, StorageError};
use crate::webhook::RunTrigger;
use lightci_core::{Id, Pipeline};

pub const DEFAULT_TICK_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

struct ScheduledJob {
    schedule: Schedule,
    timezone: Tz,
}

fn parse_job(pipeline: &Pipeline) -> Result<Option<ScheduledJob>> {
    let Some(cron_expr) = pipeline.trigger.cron.as_ref().filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let schedule = Schedule::from_str(cron_expr).map_err(|e| SchedulerError::InvalidCron(e.to_string()))?;
    let timezone = match &pipeline.trigger.timezone {
        Some(tz) if !tz.is_empty() => Tz::from_str(tz).map_err(|_| SchedulerError::InvalidTimezone(tz.clone()))?,
        _ => Tz::UTC,
    };
    Ok(Some(ScheduledJob { schedule, timezone }))
}

/// Owns the process-wide cron registry (Section 5: "a single task owning
/// the registry") and the background tick loop that evaluates it.
pub struct Scheduler {
    storage: Arc<Storage>,
    runner: Arc<dyn RunTrigger>,
    artifacts: Arc<ArtifactCollector>,
    deployer: Arc<Deployer>,
    jobs: Mutex<HashMap<Id, ScheduledJob>>,
    tick_interval: Duration,
    shutdown: std::sync::atomic::AtomicBool,
}

impl Scheduler {
    pub fn new(
        storage: Arc<Storage>,
        runner: Arc<dyn RunTrigger>,
        artifacts: Arc<ArtifactCollector>,
        deployer: Arc<Deployer>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            storage,
            runner,
            artifacts,
            deployer,
            jobs: Mutex::new(HashMap::new()),
            tick_interval,
            shutdown: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Enumerate every pipeline with a non-null schedule and register it.
    /// Call once at startup.
    pub async fn load_all(&self) -> Result<()> {
        let pipelines = self.storage.list_scheduled_pipelines().await?;
        let mut jobs = self.jobs.lock().await;
        jobs.clear();
        for pipeline in pipelines {
            match parse_job(&pipeline) {
                Ok(Some(job)) => {
                    jobs.insert(pipeline.id.clone(), job);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(pipeline_id = %pipeline.id, error = %e, "dropping invalid cron schedule at startup");
                }
            }
        }
        Ok(())
    }

    /// Reconcile a single pipeline's registration after a create/update.
    /// An invalid cron expression is rejected and the pipeline keeps
    /// whatever registration (or lack of one) it already had.
    pub async fn reconcile(&self, pipeline: &Pipeline) -> Result<()> {
        match parse_job(pipeline) {
            Ok(Some(job)) => {
                self.jobs.lock().await.insert(pipeline.id.clone(), job);
                Ok(())
            }
            Ok(None) => {
                self.jobs.lock().await.remove(&pipeline.id);
                Ok(())
            }
            Err(e) => {
                warn!(pipeline_id = %pipeline.id, error = %e, "rejected cron schedule, keeping previous registration");
                Err(e)
            }
        }
    }

    /// Drop a pipeline's registration after a delete.
    pub async fn remove(&self, pipeline_id: &Id) {
        self.jobs.lock().await.remove(pipeline_id);
    }

    /// One tick: fire any job due in `(since, now]`, sweep expired
    /// artifacts, and revalidate active deployments' health.
    pub async fn tick(&self, since: DateTime<Utc>, now: DateTime<Utc>) {
        let due: Vec<Id> = {
            let jobs = self.jobs.lock().await;
            jobs.iter()
                .filter(|(_, job)| is_due(job, since, now))
                .map(|(id, _)| id.clone())
                .collect()
        };

        for pipeline_id in due {
            self.fire(&pipeline_id).await;
        }

        if let Err(e) = self.artifacts.sweep_expired(now).await {
            warn!(error = %e, "artifact retention sweep failed");
        }

        self.revalidate_deployments().await;
    }

    async fn fire(&self, pipeline_id: &Id) {
        let pipeline = match self.storage.get_pipeline(pipeline_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(pipeline_id = %pipeline_id, error = %e, "scheduled pipeline disappeared");
                return;
            }
        };

        match self.storage.has_active_run(pipeline_id).await {
            Ok(true) => {
                info!(pipeline_id = %pipeline_id, "scheduled trigger dropped: run already active");
                let reason = "run already active";
                if let Err(e) = self.storage.record_dropped_trigger(pipeline_id, Utc::now(), reason).await {
                    warn!(pipeline_id = %pipeline_id, error = %e, "failed to record dropped trigger");
                }
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(pipeline_id = %pipeline_id, error = %e, "failed to check for an active run");
                return;
            }
        }

        let branch = pipeline.default_branch.clone();
        if let Err(e) = self
            .runner
            .trigger_run(&pipeline, branch, None, "system".to_string())
            .await
        {
            warn!(pipeline_id = %pipeline_id, error = %e, "scheduled trigger failed");
        }
    }

    async fn revalidate_deployments(&self) {
        let deployments = match self.storage.list_active_deployments().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "failed to list active deployments");
                return;
            }
        };

        for deployment in deployments {
            let pipeline = match self.storage.get_pipeline(&deployment.pipeline_id).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(pipeline_id = %deployment.pipeline_id, error = %e, "deployment's pipeline disappeared");
                    continue;
                }
            };
            if let Err(e) = self.deployer.revalidate_health(&pipeline, &deployment).await {
                warn!(pipeline_id = %deployment.pipeline_id, error = %e, "deployment health revalidation failed");
            }
        }
    }

    /// Run the tick loop forever. Intended to be spawned as its own task;
    /// the caller aborts it on shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        let mut last_tick = Utc::now();
        loop {
            interval.tick().await;
            if self.is_shutdown() {
                info!("scheduler stopping: shutdown requested");
                return;
            }
            let now = Utc::now();
            self.tick(last_tick, now).await;
            last_tick = now;
        }
    }
}

fn is_due(job: &ScheduledJob, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let since_tz = since.with_timezone(&job.timezone);
    let now_tz = now.with_timezone(&job.timezone);
    job.schedule.after(&since_tz).take_while(|t| *t <= now_tz).next().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lightci_core::{ArtifactPolicy, DeploymentPolicy, TriggerConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingRunner {
        count: AtomicUsize,
    }

    #[async_trait]
    impl RunTrigger for CountingRunner {
        async fn trigger_run(
            &self,
            _pipeline: &Pipeline,
            _branch: String,
            _commit: Option<String>,
            _triggered_by: String,
        ) -> std::result::Result<Id, String> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(Id::new())
        }
    }

    async fn test_storage() -> Arc<Storage> {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("db.sqlite")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        std::mem::forget(dir);
        Arc::new(storage)
    }

    fn test_pipeline(cron: Option<&str>) -> Pipeline {
        Pipeline {
            id: Id::new(),
            name: "demo".to_string(),
            repository_url: "https://example.com/demo.git".to_string(),
            default_branch: "main".to_string(),
            steps: vec![],
            trigger: TriggerConfig {
                cron: cron.map(|s| s.to_string()),
                timezone: None,
                events: vec![],
                branches: vec![],
            },
            artifact_policy: ArtifactPolicy::default(),
            deployment_policy: DeploymentPolicy::default(),
            owner_id: Id::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn test_scheduler(storage: Arc<Storage>, runner: Arc<dyn RunTrigger>) -> Scheduler {
        let ssh_keys = Arc::new(crate::ssh_keys::SshKeyStore::new(Arc::clone(&storage)));
        let provisioner = Arc::new(crate::provisioner::Provisioner::new(Box::new(
            crate::provisioner::FakeCloudProvider::default(),
        )));
        let events = crate::events::EventBus::new();
        let deployer = Arc::new(Deployer::new(Arc::clone(&storage), ssh_keys, provisioner, events));
        let artifacts_root = TempDir::new().unwrap();
        let artifacts_path = artifacts_root.path().to_path_buf();
        std::mem::forget(artifacts_root);
        let artifacts = Arc::new(ArtifactCollector::new(Arc::clone(&storage), artifacts_path));
        Scheduler::new(storage, runner, artifacts, deployer, Duration::from_secs(DEFAULT_TICK_SECS))
    }

    #[tokio::test]
    async fn reconcile_rejects_an_invalid_expression_and_keeps_no_registration() {
        let storage = test_storage().await;
        let runner: Arc<dyn RunTrigger> = Arc::new(CountingRunner { count: AtomicUsize::new(0) });
        let scheduler = test_scheduler(storage, runner).await;
        let pipeline = test_pipeline(Some("not a cron expression"));
        let result = scheduler.reconcile(&pipeline).await;
        assert!(result.is_err());
        assert!(!scheduler.jobs.lock().await.contains_key(&pipeline.id));
    }

    #[tokio::test]
    async fn due_job_fires_exactly_once_for_a_missed_window() {
        let storage = test_storage().await;
        let runner = Arc::new(CountingRunner { count: AtomicUsize::new(0) });
        let pipeline = test_pipeline(Some("0 * * * * * *"));
        storage.insert_pipeline(&pipeline).await.unwrap();
        let scheduler = test_scheduler(Arc::clone(&storage), runner.clone()).await;
        scheduler.reconcile(&pipeline).await.unwrap();

        let now = Utc::now();
        let since = now - chrono::Duration::minutes(5);
        scheduler.tick(since, now).await;

        assert_eq!(runner.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn active_run_drops_the_scheduled_trigger() {
        let storage = test_storage().await;
        let runner = Arc::new(CountingRunner { count: AtomicUsize::new(0) });
        let pipeline = test_pipeline(Some("0 * * * * * *"));
        storage.insert_pipeline(&pipeline).await.unwrap();
        let mut run = lightci_core::PipelineRun::new(&pipeline, "main".to_string(), None, "manual".to_string());
        run.status = lightci_core::RunStatus::Running;
        storage.insert_run(&run).await.unwrap();

        let scheduler = test_scheduler(Arc::clone(&storage), runner.clone()).await;
        scheduler.reconcile(&pipeline).await.unwrap();

        let now = Utc::now();
        let since = now - chrono::Duration::minutes(5);
        scheduler.tick(since, now).await;

        assert_eq!(runner.count.load(Ordering::SeqCst), 0);
        assert_eq!(storage.count_dropped_triggers(&pipeline.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_the_tick_loop() {
        let storage = test_storage().await;
        let runner = Arc::new(CountingRunner { count: AtomicUsize::new(0) });
        let mut scheduler = test_scheduler(storage, runner).await;
        scheduler.tick_interval = Duration::from_millis(5);
        let scheduler = Arc::new(scheduler);

        assert!(!scheduler.is_shutdown());
        scheduler.shutdown();

        let handle = tokio::spawn(Arc::clone(&scheduler).run());
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run() should return promptly once shutdown is signaled")
            .unwrap();
    }
}
