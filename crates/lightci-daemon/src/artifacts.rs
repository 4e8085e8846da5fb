//! Artifact Collector (Section 4.4): glob-based collection of build output
//! into a per-run artifacts tree, plus the retention sweep and upload
//! validation that share its compiled pattern set.

use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lightci_core::glob::{self, GlobPattern};
use lightci_core::{ArtifactRecord, ArtifactSummary, Pipeline, PipelineRun};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::storage::{Storage, StorageError};
use std::sync::Arc;

const IGNORED_DIRS: &[&str] = &["node_modules", ".git", "coverage", "tmp"];

/// Built-in pattern set covering the file classes Section 4.4 names:
/// distribution, build output, source, package metadata, env files,
/// scripts, Dockerfiles, and config directories.
const DEFAULT_PATTERNS: &[&str] = &[
    "dist/**/*",
    "build/**/*",
    "out/**/*",
    "src/**/*",
    "package.json",
    "package-lock.json",
    "Cargo.toml",
    "Cargo.lock",
    ".env*",
    "scripts/**/*",
    "Dockerfile",
    "docker-compose*.yml",
    "config/**/*",
];

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid glob pattern: {0}")]
    Glob(#[from] glob::GlobError),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

pub struct ArtifactCollector {
    storage: Arc<Storage>,
    artifacts_root: PathBuf,
}

impl ArtifactCollector {
    pub fn new(storage: Arc<Storage>, artifacts_root: PathBuf) -> Self {
        Self { storage, artifacts_root }
    }

    /// Union of the built-in set and the pipeline's own patterns, compiled once.
    fn compiled_patterns(pipeline: &Pipeline) -> Result<Vec<GlobPattern>> {
        let mut patterns: Vec<String> = DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect();
        patterns.extend(pipeline.artifact_policy.patterns.iter().cloned());
        Ok(glob::compile_all(&patterns)?)
    }

    /// Idempotent per run: a run whose summary already has `collected=true`
    /// returns immediately without re-scanning.
    pub async fn collect(&self, run: &mut PipelineRun, pipeline: &Pipeline, workspace_path: &Path) -> Result<()> {
        if run.artifact_summary.collected {
            return Ok(());
        }
        if !pipeline.artifact_policy.enabled {
            return Ok(());
        }

        let patterns = match Self::compiled_patterns(pipeline) {
            Ok(p) => p,
            Err(e) => {
                run.error = Some(format!("artifact collection failed: {e}"));
                return Ok(());
            }
        };

        let dest_root = self.artifacts_root.join(run.id.to_string());
        let mut count = 0u64;
        let mut total_bytes = 0u64;

        for entry in WalkDir::new(workspace_path).into_iter().filter_entry(|e| !is_ignored(e.path(), workspace_path)) {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(workspace_path) else {
                continue;
            };
            let relative_str = relative.to_string_lossy().replace('\\', "/");
            if !glob::matches_any(&patterns, &relative_str) {
                continue;
            }

            let dest_path = dest_root.join(relative);
            if let Err(e) = copy_one(entry.path(), &dest_path) {
                tracing::warn!(path = %relative_str, error = %e, "failed to copy artifact");
                continue;
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            count += 1;
            total_bytes += size;

            let record = ArtifactRecord {
                id: artifact_id(&run.id.to_string(), &relative_str),
                run_id: run.id.clone(),
                name: entry.file_name().to_string_lossy().to_string(),
                relative_path: relative_str,
                size,
                content_type: guess_content_type(entry.path()),
                created_at: Utc::now(),
            };
            self.storage.insert_artifact_record(&record).await?;
        }

        let retention_days = pipeline.artifact_policy.retention_days.max(1);
        run.artifact_summary = ArtifactSummary {
            collected: true,
            count,
            total_bytes,
            base_path: Some(dest_root.to_string_lossy().to_string()),
            expiry: Some(Utc::now() + ChronoDuration::days(retention_days as i64)),
        };

        Ok(())
    }

    /// Validate a candidate relative path against the pipeline's compiled
    /// pattern set before accepting a manual upload (Section 4.4, scenario 6).
    pub fn validate_upload_path(pipeline: &Pipeline, relative_path: &str) -> Result<bool> {
        let patterns = Self::compiled_patterns(pipeline)?;
        Ok(glob::matches_any(&patterns, relative_path))
    }

    /// Delete expired artifact trees and their records; swallow-and-log
    /// like every other cleanup path.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired_runs = self.storage.list_expired_artifact_runs(now).await?;
        let mut swept = 0;
        for run in expired_runs {
            let dir = self.artifacts_root.join(run.id.to_string());
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    tracing::warn!(run_id = %run.id, error = %e, "failed to remove expired artifact tree");
                }
            }
            if let Err(e) = self.storage.delete_artifact_records_for_run(&run.id).await {
                tracing::warn!(run_id = %run.id, error = %e, "failed to delete expired artifact records");
            } else {
                swept += 1;
            }
        }
        Ok(swept)
    }
}

fn is_ignored(path: &Path, root: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    relative
        .components()
        .any(|c| IGNORED_DIRS.contains(&c.as_os_str().to_string_lossy().as_ref()))
}

fn copy_one(src: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dest)?;
    Ok(())
}

/// Universal artifact id format (Section 6): `{runId}-{base64url(relativePath)}`,
/// shared by the collector and the manual upload endpoint so both round-trip
/// identically.
pub(crate) fn artifact_id(run_id: &str, relative_path: &str) -> String {
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(relative_path.as_bytes());
    format!("{run_id}-{encoded}")
}

fn guess_content_type(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("js") => "application/javascript",
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("txt" | "log") => "text/plain",
        Some("yml" | "yaml") => "application/yaml",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lightci_core::{ArtifactPolicy, DeploymentPolicy, Id, Step, TriggerConfig};
    use tempfile::TempDir;

    fn test_pipeline(patterns: Vec<String>) -> Pipeline {
        Pipeline {
            id: Id::new(),
            name: "demo".to_string(),
            repository_url: "https://example.com/demo.git".to_string(),
            default_branch: "main".to_string(),
            steps: vec![Step {
                id: Id::new(),
                name: "Build".to_string(),
                command: "echo build".to_string(),
                env: std::collections::HashMap::new(),
                timeout_secs: None,
                run_location: lightci_core::RunLocation::Local,
                is_deploy_step: false,
            }],
            trigger: TriggerConfig::default(),
            artifact_policy: ArtifactPolicy {
                enabled: true,
                patterns,
                retention_days: 30,
            },
            deployment_policy: DeploymentPolicy::default(),
            owner_id: Id::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn test_storage() -> Arc<Storage> {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("db.sqlite")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        std::mem::forget(dir);
        Arc::new(storage)
    }

    #[tokio::test]
    async fn collect_copies_matching_files_and_sets_summary() {
        let workspace = TempDir::new().unwrap();
        std::fs::create_dir_all(workspace.path().join("dist")).unwrap();
        std::fs::write(workspace.path().join("dist/app.js"), b"console.log(1)").unwrap();
        std::fs::write(workspace.path().join("README.md"), b"ignored").unwrap();

        let artifacts_root = TempDir::new().unwrap();
        let storage = test_storage().await;
        let collector = ArtifactCollector::new(storage, artifacts_root.path().to_path_buf());
        let pipeline = test_pipeline(vec![]);
        let mut run = PipelineRun::new(&pipeline, "main".to_string(), None, "tester".to_string());

        collector.collect(&mut run, &pipeline, workspace.path()).await.unwrap();

        assert!(run.artifact_summary.collected);
        assert_eq!(run.artifact_summary.count, 1);
        let copied = artifacts_root.path().join(run.id.to_string()).join("dist/app.js");
        assert!(copied.exists());
    }

    #[tokio::test]
    async fn collect_is_idempotent() {
        let workspace = TempDir::new().unwrap();
        let artifacts_root = TempDir::new().unwrap();
        let storage = test_storage().await;
        let collector = ArtifactCollector::new(storage, artifacts_root.path().to_path_buf());
        let pipeline = test_pipeline(vec![]);
        let mut run = PipelineRun::new(&pipeline, "main".to_string(), None, "tester".to_string());
        run.artifact_summary.collected = true;

        collector.collect(&mut run, &pipeline, workspace.path()).await.unwrap();
        assert_eq!(run.artifact_summary.count, 0);
    }

    #[test]
    fn ignored_directories_are_excluded() {
        let root = Path::new("/work");
        assert!(is_ignored(Path::new("/work/node_modules/x.js"), root));
        assert!(is_ignored(Path::new("/work/.git/HEAD"), root));
        assert!(!is_ignored(Path::new("/work/src/main.rs"), root));
    }

    #[test]
    fn validate_upload_path_requires_a_pattern_match() {
        let pipeline = test_pipeline(vec!["release/**/*".to_string()]);
        assert!(ArtifactCollector::validate_upload_path(&pipeline, "release/app.tar.gz").unwrap());
        assert!(!ArtifactCollector::validate_upload_path(&pipeline, "secrets/key.pem").unwrap());
    }

    #[test]
    fn artifact_id_encodes_relative_path() {
        let id = artifact_id("run-1", "dist/app.js");
        assert!(id.starts_with("run-1-"));
    }
}
