//! lightci - CI/CD pipeline execution core.
//!
//! Library components for the daemon process: the Pipeline Runner,
//! Scheduler, Deployer, Instance Provisioner, and their HTTP/webhook
//! front doors.

pub mod artifacts;
pub mod deployer;
pub mod events;
pub mod executor;
pub mod git;
pub mod provisioner;
pub mod runner;
pub mod scheduler;
pub mod server;
pub mod ssh_keys;
pub mod storage;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

pub use lightci_core::Config as DaemonConfig;

use crate::artifacts::ArtifactCollector;
use crate::deployer::Deployer;
use crate::events::EventBus;
use crate::provisioner::{CloudProvider, Ec2Provider, FakeCloudProvider, Provisioner};
use crate::runner::Runner;
use crate::scheduler::Scheduler;
use crate::server::AppState;
use crate::ssh_keys::SshKeyStore;
use crate::storage::{Storage, StorageError};
use crate::webhook::{RunTrigger, WebhookAdapter};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Everything the daemon process owns, wired together from a single
/// [`DaemonConfig`].
pub struct Daemon {
    config: DaemonConfig,
    storage: Arc<Storage>,
    runner: Arc<Runner>,
    scheduler: Arc<Scheduler>,
    webhook: Arc<WebhookAdapter>,
}

impl Daemon {
    pub async fn new(config: DaemonConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.workspace_root)?;
        std::fs::create_dir_all(&config.artifacts_root)?;
        if let Some(parent) = config.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let storage = Arc::new(Storage::new(&config.database_path).await?);
        storage.migrate_embedded().await?;

        let events = EventBus::new();
        let ssh_keys = Arc::new(SshKeyStore::new(Arc::clone(&storage)));
        let provider = build_cloud_provider(&config).await;
        let provisioner = Arc::new(Provisioner::new(provider));
        let deployer = Arc::new(Deployer::new(
            Arc::clone(&storage),
            Arc::clone(&ssh_keys),
            Arc::clone(&provisioner),
            events.clone(),
        ));
        let artifacts = Arc::new(ArtifactCollector::new(Arc::clone(&storage), config.artifacts_root.clone()));

        let runner = Arc::new(Runner::new(
            Arc::clone(&storage),
            Arc::clone(&deployer),
            Arc::clone(&artifacts),
            events.clone(),
            config.workspace_root.clone(),
            config.artifacts_root.clone(),
            Duration::from_secs(config.run_soft_timeout_secs),
        ));

        let runner_trigger: Arc<dyn RunTrigger> = Arc::clone(&runner) as Arc<dyn RunTrigger>;

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&storage),
            Arc::clone(&runner_trigger),
            Arc::clone(&artifacts),
            Arc::clone(&deployer),
            Duration::from_secs(config.scheduler_tick_secs),
        ));

        let webhook = Arc::new(WebhookAdapter::new(Arc::clone(&storage), Arc::clone(&runner_trigger)));

        Ok(Self {
            config,
            storage,
            runner,
            scheduler,
            webhook,
        })
    }

    /// Crash recovery, cron registration, the background tick loop, and
    /// the HTTP server: runs until the server stops or is cancelled.
    pub async fn run(&self) -> Result<()> {
        let recovered = self.runner.recover_interrupted_runs().await?;
        if recovered > 0 {
            warn!(count = recovered, "recovered runs interrupted by a prior daemon crash");
        }

        self.scheduler.load_all().await?;

        let scheduler = Arc::clone(&self.scheduler);
        let tick_handle = tokio::spawn(async move {
            scheduler.run().await;
        });

        let state = Arc::new(AppState {
            storage: Arc::clone(&self.storage),
            runner: Arc::clone(&self.runner) as Arc<dyn RunTrigger>,
            scheduler: Arc::clone(&self.scheduler),
            artifacts_root: self.config.artifacts_root.clone(),
            webhook: Arc::clone(&self.webhook),
            auth_token: self.config.auth_token.clone(),
        });

        info!(port = self.config.http_port, "starting daemon");
        let result = crate::server::start_server(state, self.config.http_port)
            .await
            .map_err(|e| DaemonError::Server(e.to_string()));

        // Belt-and-suspenders: the scheduler already stops itself on
        // shutdown, this also covers the server exiting for any other reason.
        tick_handle.abort();
        result
    }

    /// Signal both halves of `run()` to stop: the HTTP server's graceful
    /// shutdown polls this through `AppState::scheduler`, and the tick loop
    /// checks it between ticks, so `run()` returns instead of being
    /// cancelled out from under them.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.scheduler.is_shutdown()
    }
}

/// Build the AWS EC2 provider when every required config field is present;
/// otherwise fall back to the in-memory fake so a fresh checkout can run
/// the daemon without cloud credentials.
async fn build_cloud_provider(config: &DaemonConfig) -> Box<dyn CloudProvider> {
    let region = config.aws_default_region.clone();
    let ami = config.aws_ami_id.clone();
    let key_name = config.aws_ec2_key_name.clone();
    let security_group = config.aws_security_group_id.clone();
    let subnet = config.aws_subnet_id.clone();

    let Some(((region, ami), (key_name, (security_group, subnet)))) =
        region.zip(ami).zip(key_name.zip(security_group.zip(subnet)))
    else {
        warn!("AWS provisioning config incomplete; using the in-memory fake cloud provider");
        return Box::new(FakeCloudProvider::default());
    };

    let shared_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region))
        .load()
        .await;
    let client = aws_sdk_ec2::Client::new(&shared_config);
    Box::new(Ec2Provider::new(client, ami, key_name, security_group, subnet))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn daemon_initializes_with_a_fresh_database() {
        let dir = TempDir::new().unwrap();
        let mut config = DaemonConfig::default();
        config.workspace_root = dir.path().join("workspaces");
        config.artifacts_root = dir.path().join("artifacts");
        config.database_path = dir.path().join("lightci.db");
        config.http_port = 0;

        let daemon = Daemon::new(config).await.unwrap();
        assert!(!daemon.is_shutdown());
        daemon.shutdown();
        assert!(daemon.is_shutdown());
    }
}
