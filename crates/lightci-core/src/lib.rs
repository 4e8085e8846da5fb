pub mod config;
pub mod events;
pub mod glob;
pub mod types;

pub use config::Config;
pub use events::{Event, EventType};
pub use glob::{compile_all, matches_any, GlobPattern};
pub use types::{
    ArtifactPolicy, ArtifactRecord, ArtifactSummary, AutoDeployment, DeployMode,
    DeploymentConfig, DeploymentPolicy, DeploymentStatus, Id, Pipeline, PipelineRun,
    ReleaseStrategy, RunLocation, RunStatus, SshKey, SshKeySummary, Step, StepResult,
    StepStatus, TriggerConfig,
};
