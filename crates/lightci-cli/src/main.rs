//! cictl - CLI client for ciod.
//!
//! Local control plane client for the pipeline execution daemon.

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError, PipelineRequest};
use std::path::PathBuf;

/// CLI client for the ciod pipeline execution daemon.
#[derive(Parser)]
#[command(name = "cictl")]
#[command(about = "Control plane for the ciod pipeline execution daemon")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:8420)
    #[arg(long, global = true, env = "CICTL_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "CICTL_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a pipeline from a JSON definition file
    #[command(name = "pipeline-create")]
    PipelineCreate {
        /// Path to a JSON file matching the pipeline request shape
        file: PathBuf,
    },

    /// List pipelines
    #[command(name = "pipeline-list")]
    PipelineList,

    /// Show a pipeline's definition
    #[command(name = "pipeline-get")]
    PipelineGet { pipeline_id: String },

    /// Replace a pipeline's definition from a JSON file
    #[command(name = "pipeline-update")]
    PipelineUpdate { pipeline_id: String, file: PathBuf },

    /// Delete a pipeline
    #[command(name = "pipeline-delete")]
    PipelineDelete { pipeline_id: String },

    /// Trigger a run for a pipeline
    #[command(name = "run-trigger")]
    RunTrigger {
        pipeline_id: String,
        /// Branch to run (defaults to the pipeline's default branch)
        #[arg(long)]
        branch: Option<String>,
        /// Commit SHA to run
        #[arg(long)]
        commit: Option<String>,
    },

    /// List runs, optionally filtered by pipeline
    #[command(name = "run-list")]
    RunList {
        #[arg(long)]
        pipeline: Option<String>,
    },

    /// Show a run's detail, including step results
    #[command(name = "run-get")]
    RunGet { run_id: String },

    /// Cancel a running run
    #[command(name = "run-cancel")]
    RunCancel { run_id: String },

    /// List a run's collected artifacts
    #[command(name = "artifact-list")]
    ArtifactList { run_id: String },

    /// Download an artifact to a local path
    #[command(name = "artifact-download")]
    ArtifactDownload {
        run_id: String,
        artifact_id: String,
        /// Local destination path
        #[arg(long)]
        output: PathBuf,
    },

    /// Upload a local file as a run artifact
    #[command(name = "artifact-upload")]
    ArtifactUpload {
        run_id: String,
        /// Local file to upload
        file: PathBuf,
        /// Relative path to record it under (defaults to the file name)
        #[arg(long)]
        relative_path: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli.addr.unwrap_or_else(|| "http://127.0.0.1:8420".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    let result = match cli.command {
        Command::PipelineCreate { file } => pipeline_create(&client, &file).await,
        Command::PipelineList => pipeline_list(&client).await,
        Command::PipelineGet { pipeline_id } => pipeline_get(&client, &pipeline_id).await,
        Command::PipelineUpdate { pipeline_id, file } => pipeline_update(&client, &pipeline_id, &file).await,
        Command::PipelineDelete { pipeline_id } => pipeline_delete(&client, &pipeline_id).await,
        Command::RunTrigger { pipeline_id, branch, commit } => run_trigger(&client, &pipeline_id, branch, commit).await,
        Command::RunList { pipeline } => run_list(&client, pipeline).await,
        Command::RunGet { run_id } => run_get(&client, &run_id).await,
        Command::RunCancel { run_id } => run_cancel(&client, &run_id).await,
        Command::ArtifactList { run_id } => artifact_list(&client, &run_id).await,
        Command::ArtifactDownload { run_id, artifact_id, output } => {
            artifact_download(&client, &run_id, &artifact_id, &output).await
        }
        Command::ArtifactUpload { run_id, file, relative_path } => {
            artifact_upload(&client, &run_id, &file, relative_path).await
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn read_pipeline_request(path: &std::path::Path) -> Result<PipelineRequest, ClientError> {
    let content = std::fs::read_to_string(path).map_err(|e| ClientError::IoError(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&content).map_err(|e| ClientError::InvalidResponse(format!("invalid pipeline definition: {e}")))
}

async fn pipeline_create(client: &Client, file: &std::path::Path) -> Result<(), ClientError> {
    let req = read_pipeline_request(file)?;
    let pipeline = client.create_pipeline(req).await?;
    render::print_pipeline_created(&pipeline);
    Ok(())
}

async fn pipeline_list(client: &Client) -> Result<(), ClientError> {
    let pipelines = client.list_pipelines().await?;
    render::print_pipeline_list(&pipelines);
    Ok(())
}

async fn pipeline_get(client: &Client, pipeline_id: &str) -> Result<(), ClientError> {
    let pipeline = client.get_pipeline(pipeline_id).await?;
    render::print_pipeline_details(&pipeline);
    Ok(())
}

async fn pipeline_update(client: &Client, pipeline_id: &str, file: &std::path::Path) -> Result<(), ClientError> {
    let req = read_pipeline_request(file)?;
    let pipeline = client.update_pipeline(pipeline_id, req).await?;
    render::print_pipeline_details(&pipeline);
    Ok(())
}

async fn pipeline_delete(client: &Client, pipeline_id: &str) -> Result<(), ClientError> {
    client.delete_pipeline(pipeline_id).await?;
    println!("Pipeline {} deleted", pipeline_id);
    Ok(())
}

async fn run_trigger(
    client: &Client,
    pipeline_id: &str,
    branch: Option<String>,
    commit: Option<String>,
) -> Result<(), ClientError> {
    let run_id = client.trigger_run(pipeline_id, branch, commit).await?;
    render::print_run_triggered(&run_id);
    Ok(())
}

async fn run_list(client: &Client, pipeline: Option<String>) -> Result<(), ClientError> {
    let runs = client.list_runs(pipeline.as_deref()).await?;
    render::print_run_list(&runs);
    Ok(())
}

async fn run_get(client: &Client, run_id: &str) -> Result<(), ClientError> {
    let run = client.get_run(run_id).await?;
    render::print_run_details(&run);
    Ok(())
}

async fn run_cancel(client: &Client, run_id: &str) -> Result<(), ClientError> {
    client.cancel_run(run_id).await?;
    println!("Run {} cancellation requested", run_id);
    Ok(())
}

async fn artifact_list(client: &Client, run_id: &str) -> Result<(), ClientError> {
    let artifacts = client.list_artifacts(run_id).await?;
    render::print_artifact_list(&artifacts);
    Ok(())
}

async fn artifact_download(
    client: &Client,
    run_id: &str,
    artifact_id: &str,
    output: &std::path::Path,
) -> Result<(), ClientError> {
    let bytes = client.download_artifact(run_id, artifact_id).await?;
    std::fs::write(output, &bytes).map_err(|e| ClientError::IoError(format!("{}: {}", output.display(), e)))?;
    println!("Downloaded {} bytes to {}", bytes.len(), output.display());
    Ok(())
}

async fn artifact_upload(
    client: &Client,
    run_id: &str,
    file: &std::path::Path,
    relative_path: Option<String>,
) -> Result<(), ClientError> {
    let content = std::fs::read(file).map_err(|e| ClientError::IoError(format!("{}: {}", file.display(), e)))?;
    let relative_path = relative_path.unwrap_or_else(|| {
        file.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| file.display().to_string())
    });
    let record = client.upload_artifact(run_id, &relative_path, &content).await?;
    println!("Uploaded {} ({} bytes) as {}", record.relative_path, record.size, record.id);
    Ok(())
}
