//! SQLite persistence gateway.
//!
//! Implements the Persistence (collaborator) interface from Section 6:
//! pipelines, pipeline runs, artifact records, auto-deployments, ssh keys.
//! Dynamic JSON columns (steps, triggers, policies, stepResults, metadata)
//! are stored as TEXT and parsed at the boundary (Section 9 "Dynamic JSON
//! fields").

use chrono::{DateTime, Utc};
use lightci_core::{
    ArtifactPolicy, ArtifactRecord, ArtifactSummary, AutoDeployment, DeploymentPolicy,
    DeploymentStatus, Id, Pipeline, PipelineRun, RunStatus, SshKey, Step, StepResult,
    TriggerConfig,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

const PIPELINES_COLUMNS: &str = "id, name, repository_url, default_branch, steps_json, \
    trigger_json, artifact_policy_json, deployment_policy_json, owner_id, created_at, updated_at";

const RUNS_COLUMNS: &str = "id, pipeline_id, branch, commit_hash, status, triggered_by, \
    start_time, completion_time, step_results_json, log_buffer_json, error, artifact_summary_json";

const DEPLOYMENTS_COLUMNS: &str = "id, pipeline_id, owner_id, instance_id, region, status, \
    ssh_key_id, metadata_json, created_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),
    #[error("auto-deployment not found: {0}")]
    DeploymentNotFound(String),
    #[error("ssh key not found: {0}")]
    SshKeyNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations. Statements are split and executed one at a
    /// time so that re-running against an already-migrated database is a
    /// no-op rather than an error (mirrors the agent loop daemon's tolerant
    /// re-apply behavior).
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match sqlx::query(trimmed).execute(&self.pool).await {
                    Ok(_) => {}
                    Err(e) => {
                        let msg = e.to_string();
                        if !msg.contains("duplicate column") && !msg.contains("already exists") {
                            return Err(e.into());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- Pipeline operations ---

    pub async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let steps_json = serde_json::to_string(&pipeline.steps)?;
        let trigger_json = serde_json::to_string(&pipeline.trigger)?;
        let artifact_policy_json = serde_json::to_string(&pipeline.artifact_policy)?;
        let deployment_policy_json = serde_json::to_string(&pipeline.deployment_policy)?;

        sqlx::query(
            "INSERT INTO pipelines (id, name, repository_url, default_branch, steps_json, \
             trigger_json, artifact_policy_json, deployment_policy_json, owner_id, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(pipeline.id.as_ref())
        .bind(&pipeline.name)
        .bind(&pipeline.repository_url)
        .bind(&pipeline.default_branch)
        .bind(steps_json)
        .bind(trigger_json)
        .bind(artifact_policy_json)
        .bind(deployment_policy_json)
        .bind(pipeline.owner_id.as_ref())
        .bind(pipeline.created_at.timestamp_millis())
        .bind(pipeline.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let steps_json = serde_json::to_string(&pipeline.steps)?;
        let trigger_json = serde_json::to_string(&pipeline.trigger)?;
        let artifact_policy_json = serde_json::to_string(&pipeline.artifact_policy)?;
        let deployment_policy_json = serde_json::to_string(&pipeline.deployment_policy)?;
        let now = Utc::now();

        let result = sqlx::query(
            "UPDATE pipelines SET name = ?1, repository_url = ?2, default_branch = ?3, \
             steps_json = ?4, trigger_json = ?5, artifact_policy_json = ?6, \
             deployment_policy_json = ?7, updated_at = ?8 WHERE id = ?9",
        )
        .bind(&pipeline.name)
        .bind(&pipeline.repository_url)
        .bind(&pipeline.default_branch)
        .bind(steps_json)
        .bind(trigger_json)
        .bind(artifact_policy_json)
        .bind(deployment_policy_json)
        .bind(now.timestamp_millis())
        .bind(pipeline.id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::PipelineNotFound(pipeline.id.to_string()));
        }
        Ok(())
    }

    pub async fn delete_pipeline(&self, id: &Id) -> Result<()> {
        let result = sqlx::query("DELETE FROM pipelines WHERE id = ?1")
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::PipelineNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn get_pipeline(&self, id: &Id) -> Result<Pipeline> {
        let query = format!("SELECT {PIPELINES_COLUMNS} FROM pipelines WHERE id = ?1");
        let row = sqlx::query_as::<_, PipelineRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::PipelineNotFound(id.to_string()))?;
        row.into_pipeline()
    }

    pub async fn list_pipelines(&self) -> Result<Vec<Pipeline>> {
        let query = format!("SELECT {PIPELINES_COLUMNS} FROM pipelines ORDER BY created_at DESC");
        let rows = sqlx::query_as::<_, PipelineRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|r| r.into_pipeline()).collect()
    }

    /// List pipelines with a non-null cron schedule (Section 4.6 startup enumeration).
    pub async fn list_scheduled_pipelines(&self) -> Result<Vec<Pipeline>> {
        Ok(self
            .list_pipelines()
            .await?
            .into_iter()
            .filter(|p| p.trigger.cron.is_some())
            .collect())
    }

    pub async fn find_pipeline_by_repository_url(&self, url: &str) -> Result<Option<Pipeline>> {
        Ok(self
            .list_pipelines()
            .await?
            .into_iter()
            .find(|p| p.repository_url == url))
    }

    // --- Pipeline run operations ---

    pub async fn insert_run(&self, run: &PipelineRun) -> Result<()> {
        let step_results_json = serde_json::to_string(&run.step_results)?;
        let log_buffer_json = serde_json::to_string(&run.log_buffer)?;
        let artifact_summary_json = serde_json::to_string(&run.artifact_summary)?;

        sqlx::query(
            "INSERT INTO pipeline_runs (id, pipeline_id, branch, commit_hash, status, \
             triggered_by, start_time, completion_time, step_results_json, log_buffer_json, \
             error, artifact_summary_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(run.id.as_ref())
        .bind(run.pipeline_id.as_ref())
        .bind(&run.branch)
        .bind(&run.commit)
        .bind(run.status.as_str())
        .bind(&run.triggered_by)
        .bind(run.start_time.timestamp_millis())
        .bind(run.completion_time.map(|t| t.timestamp_millis()))
        .bind(step_results_json)
        .bind(log_buffer_json)
        .bind(&run.error)
        .bind(artifact_summary_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist the full run row. The Runner calls this at each step
    /// transition and at run completion (Section 4.1).
    pub async fn update_run(&self, run: &PipelineRun) -> Result<()> {
        let step_results_json = serde_json::to_string(&run.step_results)?;
        let log_buffer_json = serde_json::to_string(&run.log_buffer)?;
        let artifact_summary_json = serde_json::to_string(&run.artifact_summary)?;

        let result = sqlx::query(
            "UPDATE pipeline_runs SET status = ?1, completion_time = ?2, step_results_json = ?3, \
             log_buffer_json = ?4, error = ?5, artifact_summary_json = ?6 WHERE id = ?7",
        )
        .bind(run.status.as_str())
        .bind(run.completion_time.map(|t| t.timestamp_millis()))
        .bind(step_results_json)
        .bind(log_buffer_json)
        .bind(&run.error)
        .bind(artifact_summary_json)
        .bind(run.id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(run.id.to_string()));
        }
        Ok(())
    }

    pub async fn get_run(&self, id: &Id) -> Result<PipelineRun> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM pipeline_runs WHERE id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;
        row.into_run()
    }

    pub async fn list_runs_for_pipeline(&self, pipeline_id: &Id) -> Result<Vec<PipelineRun>> {
        let query = format!(
            "SELECT {RUNS_COLUMNS} FROM pipeline_runs WHERE pipeline_id = ?1 ORDER BY start_time DESC"
        );
        let rows = sqlx::query_as::<_, RunRow>(&query)
            .bind(pipeline_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|r| r.into_run()).collect()
    }

    pub async fn list_all_runs(&self) -> Result<Vec<PipelineRun>> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM pipeline_runs ORDER BY start_time DESC");
        let rows = sqlx::query_as::<_, RunRow>(&query).fetch_all(&self.pool).await?;
        rows.into_iter().map(|r| r.into_run()).collect()
    }

    /// True if a pipeline has a run currently in RUNNING status (Section 8
    /// invariant 3; enforced by the Runner's claim lock).
    pub async fn has_active_run(&self, pipeline_id: &Id) -> Result<bool> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pipeline_runs WHERE pipeline_id = ?1 AND status = 'RUNNING'",
        )
        .bind(pipeline_id.as_ref())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 > 0)
    }

    /// Persist a scheduled trigger the Scheduler dropped because a run was
    /// already active (Section 4.6 "the trigger is dropped and recorded").
    pub async fn record_dropped_trigger(&self, pipeline_id: &Id, fired_at: DateTime<Utc>, reason: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO scheduler_trigger_log (id, pipeline_id, fired_at, dropped, reason) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(Id::new().as_ref())
        .bind(pipeline_id.as_ref())
        .bind(fired_at.timestamp_millis())
        .bind(true)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn count_dropped_triggers(&self, pipeline_id: &Id) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM scheduler_trigger_log WHERE pipeline_id = ?1 AND dropped = 1")
                .bind(pipeline_id.as_ref())
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }

    /// Runs left in RUNNING status across a daemon restart (crash recovery,
    /// Section 4.1).
    pub async fn list_running_runs(&self) -> Result<Vec<PipelineRun>> {
        let query = format!(
            "SELECT {RUNS_COLUMNS} FROM pipeline_runs WHERE status = 'RUNNING' ORDER BY start_time ASC"
        );
        let rows = sqlx::query_as::<_, RunRow>(&query).fetch_all(&self.pool).await?;
        rows.into_iter().map(|r| r.into_run()).collect()
    }

    // --- Artifact record operations ---

    pub async fn insert_artifact_record(&self, artifact: &ArtifactRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO artifact_records (id, run_id, name, relative_path, size, content_type, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&artifact.id)
        .bind(artifact.run_id.as_ref())
        .bind(&artifact.name)
        .bind(&artifact.relative_path)
        .bind(artifact.size as i64)
        .bind(&artifact.content_type)
        .bind(artifact.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_artifact_records_for_run(&self, run_id: &Id) -> Result<Vec<ArtifactRecord>> {
        let rows = sqlx::query_as::<_, ArtifactRecordRow>(
            "SELECT id, run_id, name, relative_path, size, content_type, created_at \
             FROM artifact_records WHERE run_id = ?1 ORDER BY created_at ASC",
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.into_artifact()).collect())
    }

    pub async fn get_artifact_record(&self, id: &str) -> Result<ArtifactRecord> {
        let row = sqlx::query_as::<_, ArtifactRecordRow>(
            "SELECT id, run_id, name, relative_path, size, content_type, created_at \
             FROM artifact_records WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::ArtifactNotFound(id.to_string()))?;
        Ok(row.into_artifact())
    }

    /// Runs whose artifact summary expiry has passed (Section 4.4 retention sweep).
    pub async fn list_expired_artifact_runs(&self, now: DateTime<Utc>) -> Result<Vec<PipelineRun>> {
        let runs = self.list_all_runs().await?;
        Ok(runs
            .into_iter()
            .filter(|r| {
                r.artifact_summary.collected
                    && r.artifact_summary
                        .expiry
                        .is_some_and(|expiry| expiry <= now)
            })
            .collect())
    }

    pub async fn delete_artifact_records_for_run(&self, run_id: &Id) -> Result<()> {
        sqlx::query("DELETE FROM artifact_records WHERE run_id = ?1")
            .bind(run_id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- AutoDeployment operations ---

    pub async fn insert_deployment(&self, deployment: &AutoDeployment) -> Result<()> {
        let metadata_json = serde_json::to_string(&deployment.metadata)?;
        sqlx::query(
            "INSERT INTO auto_deployments (id, pipeline_id, owner_id, instance_id, region, \
             status, ssh_key_id, metadata_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(deployment.id.as_ref())
        .bind(deployment.pipeline_id.as_ref())
        .bind(deployment.owner_id.as_ref())
        .bind(&deployment.instance_id)
        .bind(&deployment.region)
        .bind(deployment.status.as_str())
        .bind(deployment.ssh_key_id.as_ref().map(AsRef::as_ref))
        .bind(metadata_json)
        .bind(deployment.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_deployment(&self, deployment: &AutoDeployment) -> Result<()> {
        let metadata_json = serde_json::to_string(&deployment.metadata)?;
        let result = sqlx::query(
            "UPDATE auto_deployments SET status = ?1, ssh_key_id = ?2, metadata_json = ?3 WHERE id = ?4",
        )
        .bind(deployment.status.as_str())
        .bind(deployment.ssh_key_id.as_ref().map(AsRef::as_ref))
        .bind(metadata_json)
        .bind(deployment.id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::DeploymentNotFound(deployment.id.to_string()));
        }
        Ok(())
    }

    /// Newest AutoDeployment with status=ACTIVE for a pipeline (Section 4.3
    /// automatic instance selection step 1).
    pub async fn find_active_deployment(&self, pipeline_id: &Id) -> Result<Option<AutoDeployment>> {
        let query = format!(
            "SELECT {DEPLOYMENTS_COLUMNS} FROM auto_deployments \
             WHERE pipeline_id = ?1 AND status = 'ACTIVE' ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, DeploymentRow>(&query)
            .bind(pipeline_id.as_ref())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.into_deployment()).transpose()
    }

    pub async fn get_deployment(&self, id: &Id) -> Result<AutoDeployment> {
        let query = format!("SELECT {DEPLOYMENTS_COLUMNS} FROM auto_deployments WHERE id = ?1");
        let row = sqlx::query_as::<_, DeploymentRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::DeploymentNotFound(id.to_string()))?;
        row.into_deployment()
    }

    /// Every AutoDeployment currently ACTIVE, across all pipelines. Used by
    /// the Scheduler's tick loop to revalidate instance health.
    pub async fn list_active_deployments(&self) -> Result<Vec<AutoDeployment>> {
        let query = format!("SELECT {DEPLOYMENTS_COLUMNS} FROM auto_deployments WHERE status = 'ACTIVE'");
        let rows = sqlx::query_as::<_, DeploymentRow>(&query).fetch_all(&self.pool).await?;
        rows.into_iter().map(|r| r.into_deployment()).collect()
    }

    // --- SshKey operations ---

    pub async fn insert_ssh_key(&self, key: &SshKey) -> Result<()> {
        sqlx::query(
            "INSERT INTO ssh_keys (id, name, cloud_key_name, private_key, owner_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(key.id.as_ref())
        .bind(&key.name)
        .bind(&key.cloud_key_name)
        .bind(&key.private_key)
        .bind(key.owner_id.as_ref())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch key material by id. Only the Deployer should call this
    /// (Section 3 invariant: "only the Deployer may request it by id").
    pub async fn get_ssh_key(&self, id: &Id) -> Result<SshKey> {
        let row = sqlx::query_as::<_, SshKeyRow>(
            "SELECT id, name, cloud_key_name, private_key, owner_id FROM ssh_keys WHERE id = ?1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::SshKeyNotFound(id.to_string()))?;
        Ok(row.into_key())
    }

    /// List keys without private material (Section 3 invariant: "private
    /// key material is never returned by list operations").
    pub async fn list_ssh_key_summaries(&self) -> Result<Vec<lightci_core::SshKeySummary>> {
        let rows = sqlx::query_as::<_, SshKeyRow>(
            "SELECT id, name, cloud_key_name, private_key, owner_id FROM ssh_keys ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (&r.into_key()).into())
            .collect())
    }

    /// Resolve a key by its cloud key-pair name (Section 4.3.1 resolution
    /// step (c): "key pair name found in the AutoDeployment's metadata").
    pub async fn get_ssh_key_by_cloud_key_name(&self, cloud_key_name: &str) -> Result<SshKey> {
        let row = sqlx::query_as::<_, SshKeyRow>(
            "SELECT id, name, cloud_key_name, private_key, owner_id FROM ssh_keys WHERE cloud_key_name = ?1",
        )
        .bind(cloud_key_name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::SshKeyNotFound(cloud_key_name.to_string()))?;
        Ok(row.into_key())
    }
}

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: String,
    name: String,
    repository_url: String,
    default_branch: String,
    steps_json: String,
    trigger_json: String,
    artifact_policy_json: String,
    deployment_policy_json: String,
    owner_id: String,
    created_at: i64,
    updated_at: i64,
}

impl PipelineRow {
    fn into_pipeline(self) -> Result<Pipeline> {
        let steps: Vec<Step> = serde_json::from_str(&self.steps_json)?;
        let trigger: TriggerConfig = serde_json::from_str(&self.trigger_json)?;
        let artifact_policy: ArtifactPolicy = serde_json::from_str(&self.artifact_policy_json)?;
        let deployment_policy: DeploymentPolicy =
            serde_json::from_str(&self.deployment_policy_json)?;
        Ok(Pipeline {
            id: Id::from_string(self.id),
            name: self.name,
            repository_url: self.repository_url,
            default_branch: self.default_branch,
            steps,
            trigger,
            artifact_policy,
            deployment_policy,
            owner_id: Id::from_string(self.owner_id),
            created_at: millis_to_datetime(self.created_at),
            updated_at: millis_to_datetime(self.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    pipeline_id: String,
    branch: String,
    commit_hash: Option<String>,
    status: String,
    triggered_by: String,
    start_time: i64,
    completion_time: Option<i64>,
    step_results_json: String,
    log_buffer_json: String,
    error: Option<String>,
    artifact_summary_json: String,
}

impl RunRow {
    fn into_run(self) -> Result<PipelineRun> {
        let step_results: Vec<StepResult> = serde_json::from_str(&self.step_results_json)?;
        let log_buffer: Vec<String> = serde_json::from_str(&self.log_buffer_json)?;
        let artifact_summary: ArtifactSummary = serde_json::from_str(&self.artifact_summary_json)?;
        let status: RunStatus = self
            .status
            .parse()
            .map_err(|_| StorageError::RunNotFound(self.id.clone()))?;
        Ok(PipelineRun {
            id: Id::from_string(self.id),
            pipeline_id: Id::from_string(self.pipeline_id),
            branch: self.branch,
            commit: self.commit_hash,
            status,
            triggered_by: self.triggered_by,
            start_time: millis_to_datetime(self.start_time),
            completion_time: self.completion_time.map(millis_to_datetime),
            step_results,
            log_buffer,
            error: self.error,
            artifact_summary,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ArtifactRecordRow {
    id: String,
    run_id: String,
    name: String,
    relative_path: String,
    size: i64,
    content_type: String,
    created_at: i64,
}

impl ArtifactRecordRow {
    fn into_artifact(self) -> ArtifactRecord {
        ArtifactRecord {
            id: self.id,
            run_id: Id::from_string(self.run_id),
            name: self.name,
            relative_path: self.relative_path,
            size: self.size as u64,
            content_type: self.content_type,
            created_at: millis_to_datetime(self.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    id: String,
    pipeline_id: String,
    owner_id: String,
    instance_id: String,
    region: String,
    status: String,
    ssh_key_id: Option<String>,
    metadata_json: String,
    created_at: i64,
}

impl DeploymentRow {
    fn into_deployment(self) -> Result<AutoDeployment> {
        let metadata: HashMap<String, String> = serde_json::from_str(&self.metadata_json)?;
        let status: DeploymentStatus = self
            .status
            .parse()
            .map_err(|_| StorageError::DeploymentNotFound(self.id.clone()))?;
        Ok(AutoDeployment {
            id: Id::from_string(self.id),
            pipeline_id: Id::from_string(self.pipeline_id),
            owner_id: Id::from_string(self.owner_id),
            instance_id: self.instance_id,
            region: self.region,
            status,
            ssh_key_id: self.ssh_key_id.map(Id::from_string),
            metadata,
            created_at: millis_to_datetime(self.created_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct SshKeyRow {
    id: String,
    name: String,
    cloud_key_name: String,
    private_key: String,
    owner_id: String,
}

impl SshKeyRow {
    fn into_key(self) -> SshKey {
        SshKey {
            id: Id::from_string(self.id),
            name: self.name,
            cloud_key_name: self.cloud_key_name,
            private_key: self.private_key,
            owner_id: Id::from_string(self.owner_id),
        }
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lightci_core::{ArtifactPolicy, DeploymentPolicy, RunLocation};

    async fn test_storage() -> Storage {
        let storage = Storage::new(Path::new(":memory:")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        storage
    }

    fn sample_pipeline() -> Pipeline {
        Pipeline {
            id: Id::new(),
            name: "demo".into(),
            repository_url: "https://example.com/repo.git".into(),
            default_branch: "main".into(),
            steps: vec![Step {
                id: Id::new(),
                name: "Source".into(),
                command: String::new(),
                env: Default::default(),
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

    #[tokio::test]
    async fn migrate_embedded_is_idempotent() {
        let storage = Storage::new(Path::new(":memory:")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        storage.migrate_embedded().await.unwrap();
    }

    #[tokio::test]
    async fn insert_and_get_pipeline_round_trips() {
        let storage = test_storage().await;
        let pipeline = sample_pipeline();
        storage.insert_pipeline(&pipeline).await.unwrap();
        let fetched = storage.get_pipeline(&pipeline.id).await.unwrap();
        assert_eq!(fetched.name, "demo");
        assert_eq!(fetched.steps.len(), 1);
    }

    #[tokio::test]
    async fn insert_and_get_run_round_trips() {
        let storage = test_storage().await;
        let pipeline = sample_pipeline();
        storage.insert_pipeline(&pipeline).await.unwrap();
        let run = PipelineRun::new(&pipeline, "main".into(), None, "manual".into());
        storage.insert_run(&run).await.unwrap();
        let fetched = storage.get_run(&run.id).await.unwrap();
        assert_eq!(fetched.status, RunStatus::Running);
        assert_eq!(fetched.step_results.len(), 1);
    }

    #[tokio::test]
    async fn has_active_run_reflects_running_status() {
        let storage = test_storage().await;
        let pipeline = sample_pipeline();
        storage.insert_pipeline(&pipeline).await.unwrap();
        assert!(!storage.has_active_run(&pipeline.id).await.unwrap());
        let run = PipelineRun::new(&pipeline, "main".into(), None, "manual".into());
        storage.insert_run(&run).await.unwrap();
        assert!(storage.has_active_run(&pipeline.id).await.unwrap());
    }

    #[tokio::test]
    async fn find_active_deployment_returns_newest() {
        let storage = test_storage().await;
        let pipeline = sample_pipeline();
        storage.insert_pipeline(&pipeline).await.unwrap();

        let first = AutoDeployment {
            id: Id::new(),
            pipeline_id: pipeline.id.clone(),
            owner_id: pipeline.owner_id.clone(),
            instance_id: "i-1".into(),
            region: "us-east-1".into(),
            status: DeploymentStatus::Terminated,
            ssh_key_id: None,
            metadata: Default::default(),
            created_at: Utc::now(),
        };
        storage.insert_deployment(&first).await.unwrap();

        let second = AutoDeployment {
            id: Id::new(),
            status: DeploymentStatus::Active,
            instance_id: "i-2".into(),
            created_at: Utc::now(),
            ..first.clone()
        };
        storage.insert_deployment(&second).await.unwrap();

        let active = storage
            .find_active_deployment(&pipeline.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.instance_id, "i-2");
    }

    #[tokio::test]
    async fn ssh_key_summaries_omit_private_material() {
        let storage = test_storage().await;
        let key = SshKey {
            id: Id::new(),
            name: "prod".into(),
            cloud_key_name: "prod-kp".into(),
            private_key: "secret-material".into(),
            owner_id: Id::new(),
        };
        storage.insert_ssh_key(&key).await.unwrap();
        let summaries = storage.list_ssh_key_summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, "prod");

        let fetched = storage.get_ssh_key(&key.id).await.unwrap();
        assert_eq!(fetched.material(), "secret-material");
    }
}
