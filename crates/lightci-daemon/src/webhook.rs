//! Webhook/Trigger Adapter (Section 4.7): turns a push or pull-request
//! payload from a supported host into a `runPipeline` call.
//!
//! The adapter is deliberately generic about the host: it reads the handful
//! of fields every major host's push/PR payload shares (`ref` or
//! `pull_request.head.ref`, a head commit sha, and a repository clone URL)
//! rather than hard-coding GitHub- or GitLab-specific schemas.

use async_trait::async_trait;
use lightci_core::{Id, Pipeline};
use serde::Deserialize;
use thiserror::Error;

use crate::storage::{Storage, StorageError};
use std::sync::Arc;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("missing or invalid event header")]
    MissingEventHeader,
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

pub type Result<T> = std::result::Result<T, WebhookError>;

/// What the adapter decided to do with an inbound delivery.
#[derive(Debug, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// A run was triggered.
    Triggered { run_id: Id },
    /// Recognized event, but no pipeline/trigger config matched it.
    NotSupported,
}

/// Anything that can turn a matched trigger into a run. Implemented by the
/// Runner; kept as a trait here so the adapter doesn't need to know about
/// run execution.
#[async_trait]
pub trait RunTrigger: Send + Sync {
    async fn trigger_run(
        &self,
        pipeline: &Pipeline,
        branch: String,
        commit: Option<String>,
        triggered_by: String,
    ) -> std::result::Result<Id, String>;
}

/// Push event shape shared across GitHub/GitLab/Bitbucket: a `ref` of the
/// form `refs/heads/<branch>`, a head commit sha, and a repository clone URL.
#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    after: Option<String>,
    repository: Option<RepositoryRef>,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    action: Option<String>,
    pull_request: Option<PullRequestRef>,
    repository: Option<RepositoryRef>,
}

#[derive(Debug, Deserialize)]
struct PullRequestRef {
    head: PullRequestHead,
}

#[derive(Debug, Deserialize)]
struct PullRequestHead {
    #[serde(rename = "ref")]
    branch: String,
    sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepositoryRef {
    clone_url: Option<String>,
    html_url: Option<String>,
}

impl RepositoryRef {
    fn url(&self) -> Option<&str> {
        self.clone_url.as_deref().or(self.html_url.as_deref())
    }
}

struct ExtractedEvent {
    kind: &'static str,
    branch: String,
    commit: Option<String>,
    repository_url: String,
}

pub struct WebhookAdapter {
    storage: Arc<Storage>,
    runner: Arc<dyn RunTrigger>,
}

impl WebhookAdapter {
    pub fn new(storage: Arc<Storage>, runner: Arc<dyn RunTrigger>) -> Self {
        Self { storage, runner }
    }

    /// Handle one delivery. `event_header` is the host's event-kind header
    /// value (e.g. GitHub's `X-GitHub-Event: push`); its absence is a
    /// validation error the caller should surface as 4xx.
    pub async fn handle(&self, event_header: Option<&str>, body: &[u8]) -> Result<WebhookOutcome> {
        let event_header = event_header.ok_or(WebhookError::MissingEventHeader)?;

        let extracted = match event_header {
            "push" => extract_push(body)?,
            "pull_request" | "merge_request" => extract_pull_request(body)?,
            _ => return Ok(WebhookOutcome::NotSupported),
        };

        let Some(extracted) = extracted else {
            return Ok(WebhookOutcome::NotSupported);
        };

        let Some(pipeline) = self
            .storage
            .find_pipeline_by_repository_url(&extracted.repository_url)
            .await?
        else {
            return Ok(WebhookOutcome::NotSupported);
        };

        if !trigger_matches(&pipeline, extracted.kind, &extracted.branch) {
            return Ok(WebhookOutcome::NotSupported);
        }

        let triggered_by = format!("webhook:{event_header}");
        let run_id = self
            .runner
            .trigger_run(&pipeline, extracted.branch, extracted.commit, triggered_by)
            .await
            .map_err(WebhookError::MalformedPayload)?;

        Ok(WebhookOutcome::Triggered { run_id })
    }
}

fn extract_push(body: &[u8]) -> Result<Option<ExtractedEvent>> {
    let payload: PushPayload =
        serde_json::from_slice(body).map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

    let Some(git_ref) = payload.git_ref else {
        return Ok(None);
    };
    let Some(branch) = git_ref.strip_prefix("refs/heads/") else {
        // Tag pushes and other ref kinds aren't a Section 4.7 concern.
        return Ok(None);
    };
    let Some(repository_url) = payload.repository.as_ref().and_then(|r| r.url()) else {
        return Ok(None);
    };

    Ok(Some(ExtractedEvent {
        kind: "push",
        branch: branch.to_string(),
        commit: payload.after,
        repository_url: repository_url.to_string(),
    }))
}

fn extract_pull_request(body: &[u8]) -> Result<Option<ExtractedEvent>> {
    let payload: PullRequestPayload =
        serde_json::from_slice(body).map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

    // Only open/synchronize/reopen actions represent a buildable head commit.
    if let Some(action) = &payload.action {
        if !matches!(action.as_str(), "opened" | "synchronize" | "reopened") {
            return Ok(None);
        }
    }

    let Some(pr) = payload.pull_request else {
        return Ok(None);
    };
    let Some(repository_url) = payload.repository.as_ref().and_then(|r| r.url()) else {
        return Ok(None);
    };

    Ok(Some(ExtractedEvent {
        kind: "pull_request",
        branch: pr.head.branch,
        commit: pr.head.sha,
        repository_url: repository_url.to_string(),
    }))
}

/// Section 4.7: filter against the pipeline's trigger configuration (event
/// kind set and branch allow-list). An empty `events`/`branches` list means
/// "any" for that dimension.
fn trigger_matches(pipeline: &Pipeline, kind: &str, branch: &str) -> bool {
    let trigger = &pipeline.trigger;
    let event_ok = trigger.events.is_empty() || trigger.events.iter().any(|e| e == kind);
    let branch_ok = trigger.branches.is_empty() || trigger.branches.iter().any(|b| b == branch);
    event_ok && branch_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use lightci_core::{ArtifactPolicy, DeploymentPolicy, TriggerConfig};
    use tempfile::TempDir;

    struct FakeRunner;

    #[async_trait]
    impl RunTrigger for FakeRunner {
        async fn trigger_run(
            &self,
            _pipeline: &Pipeline,
            _branch: String,
            _commit: Option<String>,
            _triggered_by: String,
        ) -> std::result::Result<Id, String> {
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

    fn test_pipeline(repository_url: &str, events: Vec<String>, branches: Vec<String>) -> Pipeline {
        Pipeline {
            id: Id::new(),
            name: "demo".to_string(),
            repository_url: repository_url.to_string(),
            default_branch: "main".to_string(),
            steps: vec![],
            trigger: TriggerConfig {
                cron: None,
                timezone: None,
                events,
                branches,
            },
            artifact_policy: ArtifactPolicy::default(),
            deployment_policy: DeploymentPolicy::default(),
            owner_id: Id::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn push_to_matching_branch_triggers_a_run() {
        let storage = test_storage().await;
        let pipeline = test_pipeline(
            "https://example.com/demo.git",
            vec!["push".to_string()],
            vec!["main".to_string()],
        );
        storage.insert_pipeline(&pipeline).await.unwrap();

        let adapter = WebhookAdapter::new(storage, Arc::new(FakeRunner));
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "abc123",
            "repository": {"clone_url": "https://example.com/demo.git"},
        });
        let outcome = adapter
            .handle(Some("push"), serde_json::to_vec(&body).unwrap().as_slice())
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Triggered { .. }));
    }

    #[tokio::test]
    async fn push_to_unlisted_branch_is_not_supported() {
        let storage = test_storage().await;
        let pipeline = test_pipeline(
            "https://example.com/demo.git",
            vec!["push".to_string()],
            vec!["main".to_string()],
        );
        storage.insert_pipeline(&pipeline).await.unwrap();

        let adapter = WebhookAdapter::new(storage, Arc::new(FakeRunner));
        let body = serde_json::json!({
            "ref": "refs/heads/feature/x",
            "after": "abc123",
            "repository": {"clone_url": "https://example.com/demo.git"},
        });
        let outcome = adapter
            .handle(Some("push"), serde_json::to_vec(&body).unwrap().as_slice())
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::NotSupported);
    }

    #[tokio::test]
    async fn unknown_repository_is_not_supported() {
        let storage = test_storage().await;
        let adapter = WebhookAdapter::new(storage, Arc::new(FakeRunner));
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "abc123",
            "repository": {"clone_url": "https://example.com/unknown.git"},
        });
        let outcome = adapter
            .handle(Some("push"), serde_json::to_vec(&body).unwrap().as_slice())
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::NotSupported);
    }

    #[tokio::test]
    async fn unrecognized_event_kind_acknowledges_without_erroring() {
        let storage = test_storage().await;
        let adapter = WebhookAdapter::new(storage, Arc::new(FakeRunner));
        let outcome = adapter.handle(Some("issues"), b"{}").await.unwrap();
        assert_eq!(outcome, WebhookOutcome::NotSupported);
    }

    #[tokio::test]
    async fn missing_event_header_is_an_error() {
        let storage = test_storage().await;
        let adapter = WebhookAdapter::new(storage, Arc::new(FakeRunner));
        let result = adapter.handle(None, b"{}").await;
        assert!(matches!(result, Err(WebhookError::MissingEventHeader)));
    }

    #[tokio::test]
    async fn pull_request_opened_triggers_a_run() {
        let storage = test_storage().await;
        let pipeline = test_pipeline("https://example.com/demo.git", vec![], vec![]);
        storage.insert_pipeline(&pipeline).await.unwrap();

        let adapter = WebhookAdapter::new(storage, Arc::new(FakeRunner));
        let body = serde_json::json!({
            "action": "opened",
            "pull_request": {"head": {"ref": "feature/x", "sha": "deadbeef"}},
            "repository": {"clone_url": "https://example.com/demo.git"},
        });
        let outcome = adapter
            .handle(
                Some("pull_request"),
                serde_json::to_vec(&body).unwrap().as_slice(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Triggered { .. }));
    }
}
