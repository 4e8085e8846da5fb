//! Instance Provisioner (Section 4.5): launches, health-checks, and
//! terminates the VMs that pipelines deploy onto.

use async_trait::async_trait;
use chrono::Utc;
use lightci_core::{AutoDeployment, DeploymentStatus, Id};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionerError {
    #[error("cloud provider error: {0}")]
    CloudProvider(String),
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
}

pub type Result<T> = std::result::Result<T, ProvisionerError>;

#[derive(Debug, Clone)]
pub struct ProvisionedInstance {
    pub instance_id: String,
    pub public_dns: String,
}

#[derive(Debug, Clone, Default)]
pub struct DiagnosisReport {
    pub success: bool,
    pub details: Vec<String>,
    pub remediation: Vec<String>,
}

/// Collaborator seam over the real cloud API (Section 6 "Cloud provider
/// (collaborator)"). A real `aws-sdk-ec2` client and an in-memory test fake
/// both implement this, so the daemon's own tests never touch the network.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn launch_instance(&self, owner_id: &Id, pipeline_id: &Id) -> Result<ProvisionedInstance>;
    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;
    async fn instance_state(&self, instance_id: &str) -> Result<InstanceState>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceState {
    pub running: bool,
    pub system_status_ok: bool,
    pub instance_status_ok: bool,
}

/// Real EC2-backed provider (Section 6: launch/terminate, describe
/// instances, describe instance status).
pub struct Ec2Provider {
    client: aws_sdk_ec2::Client,
    image_id: String,
    key_name: String,
    security_group_id: String,
    subnet_id: String,
}

impl Ec2Provider {
    pub fn new(
        client: aws_sdk_ec2::Client,
        image_id: String,
        key_name: String,
        security_group_id: String,
        subnet_id: String,
    ) -> Self {
        Self {
            client,
            image_id,
            key_name,
            security_group_id,
            subnet_id,
        }
    }
}

#[async_trait]
impl CloudProvider for Ec2Provider {
    async fn launch_instance(&self, owner_id: &Id, pipeline_id: &Id) -> Result<ProvisionedInstance> {
        use aws_sdk_ec2::types::{InstanceType, ResourceType, Tag, TagSpecification};

        let run_result = self
            .client
            .run_instances()
            .image_id(&self.image_id)
            .instance_type(InstanceType::T3Micro)
            .key_name(&self.key_name)
            .security_group_ids(&self.security_group_id)
            .subnet_id(&self.subnet_id)
            .min_count(1)
            .max_count(1)
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Instance)
                    .tags(Tag::builder().key("lightci:pipeline").value(pipeline_id.to_string()).build())
                    .tags(Tag::builder().key("lightci:owner").value(owner_id.to_string()).build())
                    .build(),
            )
            .send()
            .await
            .map_err(|e| ProvisionerError::CloudProvider(e.to_string()))?;

        let instance = run_result
            .instances()
            .first()
            .ok_or_else(|| ProvisionerError::CloudProvider("launch returned no instances".into()))?;
        let instance_id = instance
            .instance_id()
            .ok_or_else(|| ProvisionerError::CloudProvider("instance missing id".into()))?
            .to_string();

        wait_until_reachable(&self.client, &instance_id).await?;

        let describe = self
            .client
            .describe_instances()
            .instance_ids(&instance_id)
            .send()
            .await
            .map_err(|e| ProvisionerError::CloudProvider(e.to_string()))?;
        let public_dns = describe
            .reservations()
            .first()
            .and_then(|r| r.instances().first())
            .and_then(|i| i.public_dns_name())
            .unwrap_or_default()
            .to_string();

        Ok(ProvisionedInstance { instance_id, public_dns })
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.client
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| ProvisionerError::CloudProvider(e.to_string()))?;
        Ok(())
    }

    async fn instance_state(&self, instance_id: &str) -> Result<InstanceState> {
        let describe = self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| ProvisionerError::CloudProvider(e.to_string()))?;
        let instance = describe
            .reservations()
            .first()
            .and_then(|r| r.instances().first())
            .ok_or_else(|| ProvisionerError::InstanceNotFound(instance_id.to_string()))?;
        let running = instance
            .state()
            .and_then(|s| s.name())
            .map(|n| n.as_str() == "running")
            .unwrap_or(false);

        let status = self
            .client
            .describe_instance_status()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| ProvisionerError::CloudProvider(e.to_string()))?;
        let status_entry = status.instance_statuses().first();
        let system_status_ok = status_entry
            .and_then(|s| s.system_status())
            .and_then(|s| s.status())
            .map(|s| s.as_str() == "ok")
            .unwrap_or(false);
        let instance_status_ok = status_entry
            .and_then(|s| s.instance_status())
            .and_then(|s| s.status())
            .map(|s| s.as_str() == "ok")
            .unwrap_or(false);

        Ok(InstanceState {
            running,
            system_status_ok,
            instance_status_ok,
        })
    }
}

async fn wait_until_reachable(client: &aws_sdk_ec2::Client, instance_id: &str) -> Result<()> {
    for _ in 0..60 {
        let describe = client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| ProvisionerError::CloudProvider(e.to_string()))?;
        let running = describe
            .reservations()
            .first()
            .and_then(|r| r.instances().first())
            .and_then(|i| i.state())
            .and_then(|s| s.name())
            .map(|n| n.as_str() == "running")
            .unwrap_or(false);
        if running {
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    }
    Err(ProvisionerError::CloudProvider(format!(
        "instance {instance_id} never reached running state"
    )))
}

/// In-memory fake used by daemon tests so they never touch the network
/// (Section 9 ambient stack: test tooling).
#[derive(Default)]
pub struct FakeCloudProvider {
    instances: Mutex<HashMap<String, InstanceState>>,
}

#[async_trait]
impl CloudProvider for FakeCloudProvider {
    async fn launch_instance(&self, _owner_id: &Id, _pipeline_id: &Id) -> Result<ProvisionedInstance> {
        let instance_id = format!("i-fake-{}", Id::new());
        self.instances.lock().unwrap().insert(
            instance_id.clone(),
            InstanceState {
                running: true,
                system_status_ok: true,
                instance_status_ok: true,
            },
        );
        Ok(ProvisionedInstance {
            instance_id: instance_id.clone(),
            public_dns: format!("{instance_id}.example.internal"),
        })
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.instances.lock().unwrap().remove(instance_id);
        Ok(())
    }

    async fn instance_state(&self, instance_id: &str) -> Result<InstanceState> {
        self.instances
            .lock()
            .unwrap()
            .get(instance_id)
            .copied()
            .ok_or_else(|| ProvisionerError::InstanceNotFound(instance_id.to_string()))
    }
}

pub struct Provisioner {
    provider: Box<dyn CloudProvider>,
}

impl Provisioner {
    pub fn new(provider: Box<dyn CloudProvider>) -> Self {
        Self { provider }
    }

    pub async fn provision(&self, owner_id: &Id, pipeline_id: &Id) -> Result<AutoDeployment> {
        let instance = self.provider.launch_instance(owner_id, pipeline_id).await?;
        Ok(AutoDeployment {
            id: Id::new(),
            pipeline_id: pipeline_id.clone(),
            owner_id: owner_id.clone(),
            instance_id: instance.instance_id,
            region: std::env::var("AWS_DEFAULT_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            status: DeploymentStatus::Active,
            ssh_key_id: None,
            metadata: HashMap::from([("publicDns".to_string(), instance.public_dns)]),
            created_at: Utc::now(),
        })
    }

    pub async fn terminate(&self, deployment: &AutoDeployment) -> Result<()> {
        self.provider.terminate_instance(&deployment.instance_id).await
    }

    /// `running AND both status checks ok AND a TCP probe succeeds` (Section 4.5).
    pub async fn health_check(&self, instance_id: &str, public_dns: &str, app_port: u16) -> Result<bool> {
        let state = self.provider.instance_state(instance_id).await?;
        if !(state.running && state.system_status_ok && state.instance_status_ok) {
            return Ok(false);
        }
        Ok(tcp_probe(public_dns, app_port).await)
    }

    pub async fn diagnose(&self, instance_id: &str) -> Result<DiagnosisReport> {
        let state = self.provider.instance_state(instance_id).await?;
        let mut details = Vec::new();
        let mut remediation = Vec::new();

        if !state.running {
            details.push("instance is not in running state".to_string());
            remediation.push("start or relaunch the instance".to_string());
        }
        if !state.system_status_ok {
            details.push("system status check failing".to_string());
            remediation.push("wait for AWS system status to recover, or relaunch".to_string());
        }
        if !state.instance_status_ok {
            details.push("instance status check failing".to_string());
            remediation.push("reboot the instance".to_string());
        }

        Ok(DiagnosisReport {
            success: details.is_empty(),
            details,
            remediation,
        })
    }
}

async fn tcp_probe(host: &str, port: u16) -> bool {
    tokio::time::timeout(
        std::time::Duration::from_secs(5),
        tokio::net::TcpStream::connect((host, port)),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_provider_launches_and_terminates() {
        let provider = FakeCloudProvider::default();
        let provisioner = Provisioner::new(Box::new(provider));
        let deployment = provisioner.provision(&Id::new(), &Id::new()).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Active);

        provisioner.terminate(&deployment).await.unwrap();
        let err = provisioner
            .diagnose(&deployment.instance_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionerError::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn diagnose_reports_success_when_healthy() {
        let provider = FakeCloudProvider::default();
        let instance = provider.launch_instance(&Id::new(), &Id::new()).await.unwrap();
        let provisioner = Provisioner::new(Box::new(provider));
        let report = provisioner.diagnose(&instance.instance_id).await.unwrap();
        assert!(report.success);
        assert!(report.details.is_empty());
    }
}
