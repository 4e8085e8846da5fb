//! Event types for the run log stream and in-process notifications.
//!
//! Event names and payloads match Section 4.1 (run/step lifecycle) and
//! Section 4.3 ("in-process signals, not durable") of the specification.

use crate::types::Id;
use serde::{Deserialize, Serialize};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunCreated,
    RunStarted,
    StepStarted,
    StepFinished,
    RunCompleted,
    RunFailed,
    RunCancelled,
    ArtifactsCollected,
    DeploymentStart,
    DeploymentComplete,
    DeploymentError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "RUN_CREATED",
            Self::RunStarted => "RUN_STARTED",
            Self::StepStarted => "STEP_STARTED",
            Self::StepFinished => "STEP_FINISHED",
            Self::RunCompleted => "RUN_COMPLETED",
            Self::RunFailed => "RUN_FAILED",
            Self::RunCancelled => "RUN_CANCELLED",
            Self::ArtifactsCollected => "ARTIFACTS_COLLECTED",
            Self::DeploymentStart => "DEPLOYMENT_START",
            Self::DeploymentComplete => "DEPLOYMENT_COMPLETE",
            Self::DeploymentError => "DEPLOYMENT_ERROR",
        }
    }
}

/// Payload for `RUN_CREATED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCreatedPayload {
    pub run_id: Id,
    pub pipeline_id: Id,
    pub branch: String,
    pub triggered_by: String,
}

/// Payload for `STEP_STARTED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStartedPayload {
    pub run_id: Id,
    pub step_id: Id,
    pub name: String,
}

/// Payload for `STEP_FINISHED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFinishedPayload {
    pub run_id: Id,
    pub step_id: Id,
    pub status: String,
    pub duration_ms: u64,
}

/// Payload for `RUN_COMPLETED` / `RUN_FAILED` / `RUN_CANCELLED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTerminalPayload {
    pub run_id: Id,
    pub status: String,
    pub error: Option<String>,
}

/// Payload for `deployment:*` events (Section 4.3 "Events").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEventPayload {
    pub run_id: Id,
    pub pipeline_id: Id,
    pub success: Option<bool>,
    pub message: Option<String>,
    pub error: Option<String>,
}

/// A single audit-log entry: type tag plus JSON payload, appended in
/// execution order (Section 5: "log append order matches execution order").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Event {
    pub fn new(event_type: EventType, payload: impl Serialize) -> Self {
        Self {
            id: Id::new(),
            event_type,
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            created_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_as_str_is_screaming_snake_case() {
        assert_eq!(EventType::DeploymentStart.as_str(), "DEPLOYMENT_START");
        assert_eq!(EventType::RunCancelled.as_str(), "RUN_CANCELLED");
    }

    #[test]
    fn event_serializes_payload_as_json_value() {
        let event = Event::new(
            EventType::RunCreated,
            RunCreatedPayload {
                run_id: Id::new(),
                pipeline_id: Id::new(),
                branch: "main".into(),
                triggered_by: "manual".into(),
            },
        );
        assert!(event.payload.get("branch").is_some());
    }
}
