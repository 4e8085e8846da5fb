//! HTTP client for the daemon's control-plane API.

use base64::Engine;
use lightci_core::{
    ArtifactPolicy, ArtifactRecord, DeploymentPolicy, Id, Pipeline, PipelineRun, Step, TriggerConfig,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: ciod\n  → or pass --addr if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check CICTL_TOKEN env var or --token flag")]
    Unauthorized,
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e.url().map(|u| u.to_string()).unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// Request body for creating or updating a pipeline.
#[derive(Debug, Serialize)]
pub struct PipelineRequest {
    pub name: String,
    pub repository_url: String,
    pub default_branch: String,
    pub steps: Vec<Step>,
    pub trigger: TriggerConfig,
    pub artifact_policy: ArtifactPolicy,
    pub deployment_policy: DeploymentPolicy,
    pub owner_id: Id,
}

#[derive(Debug, Serialize)]
pub struct TriggerRunRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerRunResponse {
    pub run_id: Id,
}

#[derive(Debug, Serialize)]
pub struct UploadArtifactRequest {
    pub relative_path: String,
    pub content_base64: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// HTTP client for `ciod`'s control-plane API (Section 4.8).
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.base_url
    }

    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        if status == 401 {
            return ClientError::Unauthorized;
        }
        if status == 404 {
            return ClientError::NotFound("resource not found".to_string());
        }
        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| "unknown error".to_string());
        ClientError::HttpError { status, message }
    }

    pub async fn create_pipeline(&self, req: PipelineRequest) -> Result<Pipeline, ClientError> {
        let url = format!("{}/pipelines", self.base_url);
        let response = self.http.post(&url).headers(self.headers()).json(&req).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn list_pipelines(&self) -> Result<Vec<Pipeline>, ClientError> {
        let url = format!("{}/pipelines", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn get_pipeline(&self, id: &str) -> Result<Pipeline, ClientError> {
        let url = format!("{}/pipelines/{}", self.base_url, id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn update_pipeline(&self, id: &str, req: PipelineRequest) -> Result<Pipeline, ClientError> {
        let url = format!("{}/pipelines/{}", self.base_url, id);
        let response = self.http.put(&url).headers(self.headers()).json(&req).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn delete_pipeline(&self, id: &str) -> Result<(), ClientError> {
        let url = format!("{}/pipelines/{}", self.base_url, id);
        let response = self.http.delete(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn trigger_run(
        &self,
        pipeline_id: &str,
        branch: Option<String>,
        commit: Option<String>,
    ) -> Result<Id, ClientError> {
        let url = format!("{}/pipelines/{}/runs", self.base_url, pipeline_id);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&TriggerRunRequest { branch, commit })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        let body: TriggerRunResponse =
            response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.run_id)
    }

    pub async fn list_runs(&self, pipeline_id: Option<&str>) -> Result<Vec<PipelineRun>, ClientError> {
        let mut url = format!("{}/runs", self.base_url);
        if let Some(id) = pipeline_id {
            url = format!("{url}?pipelineId={id}");
        }
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn get_run(&self, run_id: &str) -> Result<PipelineRun, ClientError> {
        let url = format!("{}/runs/{}", self.base_url, run_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn cancel_run(&self, run_id: &str) -> Result<(), ClientError> {
        let url = format!("{}/runs/{}/cancel", self.base_url, run_id);
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn list_artifacts(&self, run_id: &str) -> Result<Vec<ArtifactRecord>, ClientError> {
        let url = format!("{}/runs/{}/artifacts", self.base_url, run_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn download_artifact(&self, run_id: &str, artifact_id: &str) -> Result<Vec<u8>, ClientError> {
        let url = format!("{}/runs/{}/artifacts/{}/download", self.base_url, run_id, artifact_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(response.bytes().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?.to_vec())
    }

    pub async fn upload_artifact(
        &self,
        run_id: &str,
        relative_path: &str,
        content: &[u8],
    ) -> Result<ArtifactRecord, ClientError> {
        let url = format!("{}/runs/{}/artifacts/upload", self.base_url, run_id);
        let req = UploadArtifactRequest {
            relative_path: relative_path.to_string(),
            content_base64: base64::engine::general_purpose::STANDARD.encode(content),
        };
        let response = self.http.post(&url).headers(self.headers()).json(&req).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_trims_trailing_slash() {
        let client = Client::new("http://localhost:8420/", None);
        assert_eq!(client.base_url, "http://localhost:8420");
    }

    #[test]
    fn client_preserves_url_without_trailing_slash() {
        let client = Client::new("http://localhost:8420", None);
        assert_eq!(client.base_url, "http://localhost:8420");
    }

    #[test]
    fn client_headers_include_content_type() {
        let client = Client::new("http://localhost:8420", None);
        let headers = client.headers();
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn client_headers_include_auth_when_token_set() {
        let client = Client::new("http://localhost:8420", Some("test-token"));
        let headers = client.headers();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer test-token");
    }

    #[test]
    fn client_headers_omit_auth_when_no_token() {
        let client = Client::new("http://localhost:8420", None);
        let headers = client.headers();
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn check_health_fails_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19999", None);
        let result = client.check_health().await;
        assert!(result.is_err());
    }
}
