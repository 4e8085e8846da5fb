//! Deployer (Section 4.3): ships a run's artifacts onto a cloud VM over SSH
//! and starts the application under a process supervisor.

use lightci_core::events::{DeploymentEventPayload, Event, EventType};
use lightci_core::{AutoDeployment, DeployMode, DeploymentStatus, Pipeline, PipelineRun, ReleaseStrategy};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::events::EventBus;
use crate::executor::{self, ExecutorError, RemoteTarget};
use crate::provisioner::{Provisioner, ProvisionerError};
use crate::ssh_keys::{SshKeyError, SshKeyStore, TempKeyFile};
use crate::storage::{Storage, StorageError};
use std::sync::Arc;

const CONNECT_TIMEOUT_SECS: u32 = 10;
const BLUE_GREEN_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_APP_PORT: u16 = 3000;

#[derive(Debug, Error)]
pub enum DeployerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("ssh key error: {0}")]
    SshKey(#[from] SshKeyError),
    #[error("provisioner error: {0}")]
    Provisioner(#[from] ProvisionerError),
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeployerError>;

#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub success: bool,
    pub message: String,
    pub logs: String,
    pub details: Option<serde_json::Value>,
}

impl DeployOutcome {
    fn not_implemented() -> Self {
        Self {
            success: false,
            message: "not yet implemented".to_string(),
            logs: String::new(),
            details: None,
        }
    }

    fn failed(message: impl Into<String>, logs: String) -> Self {
        Self {
            success: false,
            message: message.into(),
            logs,
            details: None,
        }
    }

}

struct ResolvedTarget {
    instance_id: String,
    public_dns: String,
    username: String,
    deploy_path: String,
    key_material: String,
}

pub struct Deployer {
    storage: Arc<Storage>,
    ssh_keys: Arc<SshKeyStore>,
    provisioner: Arc<Provisioner>,
    events: EventBus,
}

impl Deployer {
    pub fn new(storage: Arc<Storage>, ssh_keys: Arc<SshKeyStore>, provisioner: Arc<Provisioner>, events: EventBus) -> Self {
        Self {
            storage,
            ssh_keys,
            provisioner,
            events,
        }
    }

    /// `deploy(runId, config) → {success, message, logs, details?}`. Idempotent
    /// with respect to active AutoDeployments: reuses a healthy one instead of
    /// provisioning a duplicate.
    pub async fn deploy(&self, run: &PipelineRun, pipeline: &Pipeline, artifacts_path: &Path) -> Result<DeployOutcome> {
        self.emit_start(run, pipeline);

        let platform = normalize_platform(&pipeline.deployment_policy.platform);
        if platform != "aws_ec2" {
            let outcome = DeployOutcome::not_implemented();
            self.emit_complete(run, pipeline, &outcome);
            return Ok(outcome);
        }

        let target = match self.resolve_target(pipeline, run).await {
            Ok(t) => t,
            Err(e) => {
                let outcome = DeployOutcome::failed(e.to_string(), String::new());
                self.emit_error(run, pipeline, &e.to_string());
                return Ok(outcome);
            }
        };

        let config = &pipeline.deployment_policy.config;
        let release = match config.strategy {
            ReleaseStrategy::Standard => self.release_standard(&target, artifacts_path, config).await,
            ReleaseStrategy::BlueGreen => self.release_blue_green(&target, artifacts_path, config).await,
        };

        let outcome = match release {
            Ok(outcome) => outcome,
            Err(e) => DeployOutcome::failed(e.to_string(), String::new()),
        };
        self.emit_complete(run, pipeline, &outcome);
        Ok(outcome)
    }

    /// Resolve the remote execution target bound to this pipeline's active
    /// deployment, for steps that run after the deploy handoff (Section 4.1
    /// step 3: `runLocation=deployed`). Reuses the same resolution logic the
    /// deploy step itself used, so a healthy instance is never re-provisioned.
    pub async fn resolve_remote_target(&self, pipeline: &Pipeline, run: &PipelineRun) -> Result<(RemoteTarget, String)> {
        let target = self.resolve_target(pipeline, run).await?;
        Ok((
            RemoteTarget {
                host: target.public_dns,
                user: target.username,
                deploy_path: target.deploy_path,
                connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            },
            target.key_material,
        ))
    }

    /// Revalidate one ACTIVE AutoDeployment's health (Section 4.6 tick
    /// model). Mirrors the reuse-or-reprovision check in `resolve_target`,
    /// but only observes; it never reprovisions on failure, it just marks
    /// the deployment terminated so the next run provisions fresh.
    pub async fn revalidate_health(&self, pipeline: &Pipeline, deployment: &AutoDeployment) -> Result<bool> {
        let app_port = pipeline.deployment_policy.config.production_port.unwrap_or(DEFAULT_APP_PORT);
        let public_dns = deployment.metadata.get("publicDns").cloned().unwrap_or_default();
        let healthy = self
            .provisioner
            .health_check(&deployment.instance_id, &public_dns, app_port)
            .await
            .unwrap_or(false);

        if !healthy {
            let mut terminated = deployment.clone();
            terminated.status = DeploymentStatus::Terminated;
            self.storage.update_deployment(&terminated).await?;
        }

        Ok(healthy)
    }

    async fn resolve_target(&self, pipeline: &Pipeline, _run: &PipelineRun) -> Result<ResolvedTarget> {
        let config = &pipeline.deployment_policy.config;

        if pipeline.deployment_policy.mode == DeployMode::Manual {
            let instance_id = config.instance_id.clone().unwrap_or_default();
            let key_material = match &config.ssh_key_id {
                Some(id) => self.ssh_keys.material_by_id(id).await?,
                None => return Err(DeployerError::SshKey(SshKeyError::NoKeyFound)),
            };
            return Ok(ResolvedTarget {
                public_dns: instance_id.clone(),
                instance_id,
                username: config.username.clone().unwrap_or_else(|| "ubuntu".to_string()),
                deploy_path: config.deploy_path.clone().unwrap_or_else(|| "/opt/lightci-app".to_string()),
                key_material,
            });
        }

        let existing = self.storage.find_active_deployment(&pipeline.id).await?;
        let app_port = config.production_port.unwrap_or(DEFAULT_APP_PORT);

        let (deployment, reused) = match existing {
            Some(dep) => {
                let metadata_dns = dep.metadata.get("publicDns").cloned().unwrap_or_default();
                let healthy = self
                    .provisioner
                    .health_check(&dep.instance_id, &metadata_dns, app_port)
                    .await
                    .unwrap_or(false);
                if healthy {
                    (dep, true)
                } else {
                    self.provisioner.terminate(&dep).await?;
                    let mut terminated = dep;
                    terminated.status = DeploymentStatus::Terminated;
                    self.storage.update_deployment(&terminated).await?;
                    (self.provisioner.provision(&pipeline.owner_id, &pipeline.id).await?, false)
                }
            }
            None => (self.provisioner.provision(&pipeline.owner_id, &pipeline.id).await?, false),
        };

        if !reused {
            self.storage.insert_deployment(&deployment).await?;
        }

        let public_dns = deployment.metadata.get("publicDns").cloned().unwrap_or_default();
        let username = config.username.clone().unwrap_or_else(|| "ubuntu".to_string());
        let deploy_path = config.deploy_path.clone().unwrap_or_else(|| "/opt/lightci-app".to_string());
        let probe_target = RemoteTarget {
            host: public_dns.clone(),
            user: username.clone(),
            deploy_path: deploy_path.clone(),
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
        };

        let key_material = self.resolve_key_material(config, &deployment, &probe_target).await?;

        Ok(ResolvedTarget {
            instance_id: deployment.instance_id.clone(),
            public_dns,
            username,
            deploy_path,
            key_material,
        })
    }

    /// Section 4.3.1 resolution order: config id, deployment id, cloud
    /// key-pair name (falling back to a previously recovered key before
    /// giving up on that candidate), then a last-resort filesystem scan.
    /// Each candidate is probed with an echo-back before being trusted, so a
    /// stale or rotated key falls through to the next rather than failing
    /// the deploy outright.
    async fn resolve_key_material(
        &self,
        config: &lightci_core::DeploymentConfig,
        deployment: &AutoDeployment,
        probe_target: &RemoteTarget,
    ) -> Result<String> {
        let mut candidates: Vec<String> = Vec::new();

        if let Some(id) = &config.ssh_key_id {
            if let Ok(material) = self.ssh_keys.material_by_id(id).await {
                candidates.push(material);
            }
        }
        if let Some(id) = &deployment.ssh_key_id {
            if let Ok(material) = self.ssh_keys.material_by_id(id).await {
                candidates.push(material);
            }
        }
        if let Some(cloud_key_name) = deployment.metadata.get("keyPairName") {
            if let Ok(key) = self.storage.get_ssh_key_by_cloud_key_name(cloud_key_name).await {
                candidates.push(key.material().to_string());
            } else if let Some(recovered) = deployment.metadata.get("recoveredKeyMaterial") {
                candidates.push(recovered.clone());
            }
        }

        for material in &candidates {
            if self.probe_key(probe_target, material).await {
                return Ok(material.clone());
            }
        }

        if let Some(material) = SshKeyStore::recover_from_filesystem() {
            if self.probe_key(probe_target, &material).await {
                let mut updated = deployment.clone();
                updated
                    .metadata
                    .insert("recoveredKeyMaterial".to_string(), material.clone());
                let _ = self.storage.update_deployment(&updated).await;
                return Ok(material);
            }
        }

        Err(DeployerError::SshKey(SshKeyError::NoKeyFound))
    }

    /// Writes `material` to a guaranteed-cleanup temp file and probes it
    /// against `target` before the caller trusts it.
    async fn probe_key(&self, target: &RemoteTarget, material: &str) -> bool {
        match TempKeyFile::write(material) {
            Ok(key_file) => self.verify_ssh(target, key_file.path()).await,
            Err(_) => false,
        }
    }

    async fn verify_ssh(&self, target: &RemoteTarget, key_path: &Path) -> bool {
        executor::execute_remote("echo lightci-probe", target, key_path, &HashMap::new())
            .await
            .map(|r| r.error.is_none() && r.output.contains("lightci-probe"))
            .unwrap_or(false)
    }

    async fn release_standard(
        &self,
        target: &ResolvedTarget,
        artifacts_path: &Path,
        config: &lightci_core::DeploymentConfig,
    ) -> Result<DeployOutcome> {
        let key_file = TempKeyFile::write(&target.key_material)?;
        let outcome = self.release_standard_inner(target, artifacts_path, &key_file, config).await;
        drop(key_file);
        outcome
    }

    async fn release_standard_inner(
        &self,
        target: &ResolvedTarget,
        artifacts_path: &Path,
        key_file: &TempKeyFile,
        config: &lightci_core::DeploymentConfig,
    ) -> Result<DeployOutcome> {
        let remote = RemoteTarget {
            host: target.public_dns.clone(),
            user: target.username.clone(),
            deploy_path: target.deploy_path.clone(),
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
        };

        if !self.verify_ssh(&remote, key_file.path()).await {
            return Ok(DeployOutcome::failed(
                "SSH key authentication failed and recovery attempts were unsuccessful",
                String::new(),
            ));
        }

        let mut logs = String::new();
        let empty_env = HashMap::new();

        let prepare = executor::execute_remote(
            &format!("mkdir -p {} && rm -rf {}/*", remote.deploy_path, remote.deploy_path),
            &remote,
            key_file.path(),
            &empty_env,
        )
        .await?;
        logs.push_str(&prepare.output);

        let ensure_runtime = executor::execute_remote(
            "command -v node >/dev/null 2>&1 || (curl -fsSL https://deb.nodesource.com/setup_lts.x | bash - && apt-get install -y nodejs); command -v pm2 >/dev/null 2>&1 || npm install -g pm2",
            &remote,
            key_file.path(),
            &empty_env,
        )
        .await?;
        logs.push_str(&ensure_runtime.output);

        let archive_path = artifacts_path.join("deploy.tar.gz");
        let tar = tokio::process::Command::new("tar")
            .args(["czf", &archive_path.to_string_lossy(), "-C", &artifacts_path.to_string_lossy(), "."])
            .output()
            .await?;
        logs.push_str(&String::from_utf8_lossy(&tar.stderr));

        let upload = executor::scp_upload(&archive_path, &remote, key_file.path()).await?;
        logs.push_str(&upload.output);
        if upload.error.is_some() {
            return Ok(DeployOutcome::failed("artifact upload failed", logs));
        }

        let extract = executor::execute_remote(
            &format!("cd {} && tar xzf deploy.tar.gz", remote.deploy_path),
            &remote,
            key_file.path(),
            &empty_env,
        )
        .await?;
        logs.push_str(&extract.output);

        let install_cmd = config.install_cmd.clone().unwrap_or_else(|| "npm install --production".to_string());
        let install = executor::execute_remote(
            &format!("cd {} && {install_cmd}", remote.deploy_path),
            &remote,
            key_file.path(),
            &empty_env,
        )
        .await?;
        logs.push_str(&install.output);

        let start = executor::execute_remote(
            "pm2 delete all || true && pm2 start npm --name lightci-app -- start && pm2 save",
            &remote,
            key_file.path(),
            &empty_env,
        )
        .await?;
        logs.push_str(&start.output);

        if let Ok(post_deploy) = std::env::var("POST_DEPLOY_COMMAND") {
            if !post_deploy.is_empty() {
                let post = executor::execute_remote(&post_deploy, &remote, key_file.path(), &empty_env).await?;
                logs.push_str(&post.output);
            }
        }

        Ok(DeployOutcome {
            success: true,
            message: "deployment succeeded".to_string(),
            logs,
            details: Some(serde_json::json!({ "instanceId": target.instance_id })),
        })
    }

    async fn release_blue_green(
        &self,
        target: &ResolvedTarget,
        artifacts_path: &Path,
        config: &lightci_core::DeploymentConfig,
    ) -> Result<DeployOutcome> {
        let (production_port, staging_port, health_path, timeout_secs) = (
            config.production_port.unwrap_or(DEFAULT_APP_PORT),
            config.staging_port.unwrap_or(DEFAULT_APP_PORT + 1),
            config.health_check_path.clone().unwrap_or_else(|| "/health".to_string()),
            config.health_check_timeout_secs.unwrap_or(60),
        );

        let key_file = TempKeyFile::write(&target.key_material)?;
        let remote = RemoteTarget {
            host: target.public_dns.clone(),
            user: target.username.clone(),
            deploy_path: target.deploy_path.clone(),
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
        };

        if !self.verify_ssh(&remote, key_file.path()).await {
            return Ok(DeployOutcome::failed(
                "SSH key authentication failed and recovery attempts were unsuccessful",
                String::new(),
            ));
        }

        let current_color = self.probe_current_color(&remote, key_file.path(), production_port).await;
        let target_color = if current_color == "blue" { "green" } else { "blue" };

        let mut logs = String::new();
        let empty_env = HashMap::new();
        let color_path = format!("{}/{}", remote.deploy_path, target_color);

        let prepare = executor::execute_remote(
            &format!("mkdir -p {color_path} && rm -rf {color_path}/*"),
            &remote,
            key_file.path(),
            &empty_env,
        )
        .await?;
        logs.push_str(&prepare.output);

        let archive_path = artifacts_path.join("deploy.tar.gz");
        let tar = tokio::process::Command::new("tar")
            .args(["czf", &archive_path.to_string_lossy(), "-C", &artifacts_path.to_string_lossy(), "."])
            .output()
            .await?;
        logs.push_str(&String::from_utf8_lossy(&tar.stderr));

        let upload = executor::scp_upload(&archive_path, &remote, key_file.path()).await?;
        logs.push_str(&upload.output);

        let install_cmd = config.install_cmd.clone().unwrap_or_else(|| "npm install --production".to_string());
        let extract_and_install = executor::execute_remote(
            &format!("tar xzf {}/deploy.tar.gz -C {color_path} && cd {color_path} && {install_cmd}", remote.deploy_path),
            &remote,
            key_file.path(),
            &empty_env,
        )
        .await?;
        logs.push_str(&extract_and_install.output);

        let supervisor_name = format!("lightci-app-{target_color}");
        let start_remote_cmd = format!(
            "cd {color_path} && PORT={staging_port} pm2 delete {supervisor_name} || true && PORT={staging_port} pm2 start npm --name {supervisor_name} -- start && pm2 save"
        );
        let start = executor::execute_remote(&start_remote_cmd, &remote, key_file.path(), &empty_env).await?;
        logs.push_str(&start.output);

        let health_url = format!("http://localhost:{staging_port}{health_path}");
        let healthy = self
            .poll_health(&remote, key_file.path(), &health_url, timeout_secs)
            .await;

        if !healthy {
            let _ = executor::execute_remote(
                &format!("pm2 delete {supervisor_name} || true"),
                &remote,
                key_file.path(),
                &empty_env,
            )
            .await;
            if config.rollback_on_failure {
                return Ok(DeployOutcome::failed("Health check failed, rolled back", logs));
            }
            return Ok(DeployOutcome::failed("Health check failed", logs));
        }

        let repoint = executor::execute_remote(
            &format!(
                "iptables -t nat -R PREROUTING 1 -p tcp --dport {production_port} -j REDIRECT --to-port {staging_port} 2>/dev/null || \
                 iptables -t nat -A PREROUTING -p tcp --dport {production_port} -j REDIRECT --to-port {staging_port}"
            ),
            &remote,
            key_file.path(),
            &empty_env,
        )
        .await?;
        logs.push_str(&repoint.output);

        let old_supervisor_name = format!("lightci-app-{current_color}");
        let stop_old = executor::execute_remote(
            &format!("pm2 delete {old_supervisor_name} || true"),
            &remote,
            key_file.path(),
            &empty_env,
        )
        .await?;
        logs.push_str(&stop_old.output);

        Ok(DeployOutcome {
            success: true,
            message: format!("cut over to {target_color}"),
            logs,
            details: Some(serde_json::json!({ "instanceId": target.instance_id, "color": target_color })),
        })
    }

    async fn probe_current_color(&self, remote: &RemoteTarget, key_path: &Path, production_port: u16) -> String {
        let probe = executor::execute_remote(
            &format!("pm2 describe lightci-app-blue >/dev/null 2>&1 && fuser {production_port}/tcp >/dev/null 2>&1 && echo blue || echo none"),
            remote,
            key_path,
            &HashMap::new(),
        )
        .await;
        match probe {
            Ok(r) if r.output.trim().ends_with("blue") => "blue".to_string(),
            _ => "green".to_string(),
        }
    }

    async fn poll_health(&self, remote: &RemoteTarget, key_path: &Path, url: &str, timeout_secs: u64) -> bool {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(timeout_secs);
        loop {
            let check = executor::execute_remote(
                &format!("curl -s -o /dev/null -w '%{{http_code}}' {url}"),
                remote,
                key_path,
                &HashMap::new(),
            )
            .await;
            if let Ok(result) = check {
                if let Ok(code) = result.output.trim().parse::<u16>() {
                    if (200..300).contains(&code) {
                        return true;
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_secs(BLUE_GREEN_POLL_INTERVAL_SECS)).await;
        }
    }

    fn emit_start(&self, run: &PipelineRun, pipeline: &Pipeline) {
        self.events.emit(Event::new(
            EventType::DeploymentStart,
            DeploymentEventPayload {
                run_id: run.id.clone(),
                pipeline_id: pipeline.id.clone(),
                success: None,
                message: None,
                error: None,
            },
        ));
    }

    fn emit_complete(&self, run: &PipelineRun, pipeline: &Pipeline, outcome: &DeployOutcome) {
        self.events.emit(Event::new(
            EventType::DeploymentComplete,
            DeploymentEventPayload {
                run_id: run.id.clone(),
                pipeline_id: pipeline.id.clone(),
                success: Some(outcome.success),
                message: Some(outcome.message.clone()),
                error: None,
            },
        ));
    }

    fn emit_error(&self, run: &PipelineRun, pipeline: &Pipeline, error: &str) {
        self.events.emit(Event::new(
            EventType::DeploymentError,
            DeploymentEventPayload {
                run_id: run.id.clone(),
                pipeline_id: pipeline.id.clone(),
                success: Some(false),
                message: None,
                error: Some(error.to_string()),
            },
        ));
    }
}

/// Platform normalization (Section 4.3): "aws" + "ec2" collapses to "aws_ec2".
fn normalize_platform(platform: &str) -> String {
    let lower = platform.to_lowercase();
    if lower.contains("aws") && lower.contains("ec2") {
        "aws_ec2".to_string()
    } else {
        lower
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_platform_collapses_aws_and_ec2() {
        assert_eq!(normalize_platform("aws+ec2"), "aws_ec2");
        assert_eq!(normalize_platform("AWS EC2"), "aws_ec2");
        assert_eq!(normalize_platform("aws_ec2"), "aws_ec2");
    }

    #[test]
    fn normalize_platform_leaves_unknown_platforms_alone() {
        assert_eq!(normalize_platform("gcp"), "gcp");
        assert_eq!(normalize_platform("azure"), "azure");
    }
}
