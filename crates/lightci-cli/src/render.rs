//! Output rendering for `cictl`.

use lightci_core::{ArtifactRecord, Pipeline, PipelineRun, RunStatus, StepStatus};

pub fn print_pipeline_created(pipeline: &Pipeline) {
    println!("Created pipeline: {}", pipeline.id);
    println!("  Name:       {}", pipeline.name);
    println!("  Repository: {}", pipeline.repository_url);
    println!("  Branch:     {}", pipeline.default_branch);
    println!("  Steps:      {}", pipeline.steps.len());
}

pub fn print_pipeline_list(pipelines: &[Pipeline]) {
    if pipelines.is_empty() {
        println!("No pipelines found.");
        return;
    }

    println!("{:<36}  {:<24}  {:<30}  {}", "ID", "NAME", "REPOSITORY", "BRANCH");
    println!("{}", "-".repeat(110));
    for pipeline in pipelines {
        println!(
            "{:<36}  {:<24}  {:<30}  {}",
            pipeline.id,
            truncate(&pipeline.name, 24),
            truncate(&pipeline.repository_url, 30),
            pipeline.default_branch,
        );
    }
    println!();
    println!("{} pipeline(s)", pipelines.len());
}

pub fn print_pipeline_details(pipeline: &Pipeline) {
    println!("Pipeline: {}", pipeline.id);
    println!();
    println!("  Name:       {}", pipeline.name);
    println!("  Repository: {}", pipeline.repository_url);
    println!("  Branch:     {}", pipeline.default_branch);
    println!("  Owner:      {}", pipeline.owner_id);
    if let Some(cron) = &pipeline.trigger.cron {
        println!("  Schedule:   {} ({})", cron, pipeline.trigger.timezone.as_deref().unwrap_or("UTC"));
    }
    println!("  Artifacts:  {}", if pipeline.artifact_policy.enabled { "enabled" } else { "disabled" });
    println!(
        "  Deploy:     {}",
        if pipeline.deployment_policy.enabled { &pipeline.deployment_policy.platform } else { "disabled" }
    );

    println!();
    println!("  Steps:");
    println!("    {:<20}  {:<40}  {}", "NAME", "COMMAND", "LOCATION");
    println!("    {}", "-".repeat(90));
    for step in &pipeline.steps {
        println!(
            "    {:<20}  {:<40}  {}",
            truncate(&step.name, 20),
            truncate(&step.command, 40),
            step.run_location.as_str(),
        );
    }
}

pub fn print_run_triggered(run_id: &lightci_core::Id) {
    println!("Triggered run: {}", run_id);
}

pub fn print_run_list(runs: &[PipelineRun]) {
    if runs.is_empty() {
        println!("No runs found.");
        return;
    }

    println!("{:<36}  {:<36}  {:<10}  {:<20}", "ID", "PIPELINE", "STATUS", "STARTED");
    println!("{}", "-".repeat(110));
    for run in runs {
        println!(
            "{:<36}  {:<36}  {:<10}  {:<20}",
            run.id,
            run.pipeline_id,
            format_run_status(run.status),
            format_time(&run.start_time),
        );
    }
    println!();
    println!("{} run(s)", runs.len());
}

pub fn print_run_details(run: &PipelineRun) {
    println!("Run: {}", run.id);
    println!();
    println!("  Pipeline:     {}", run.pipeline_id);
    println!("  Branch:       {}", run.branch);
    if let Some(commit) = &run.commit {
        println!("  Commit:       {}", commit);
    }
    println!("  Status:       {}", format_run_status(run.status));
    println!("  Triggered by: {}", run.triggered_by);
    println!("  Started:      {}", format_time(&run.start_time));
    if let Some(end) = run.completion_time {
        println!("  Completed:    {}", format_time(&end));
    }
    if let Some(error) = &run.error {
        println!("  Error:        {}", error);
    }

    if !run.step_results.is_empty() {
        println!();
        println!("  Steps:");
        println!("    {:<36}  {:<20}  {:<10}", "ID", "NAME", "STATUS");
        println!("    {}", "-".repeat(70));
        for step in &run.step_results {
            println!("    {:<36}  {:<20}  {:<10}", step.id, truncate(&step.name, 20), format_step_status(step.status));
        }
    }

    println!();
    println!("  Artifacts: {} files, {} bytes", run.artifact_summary.count, run.artifact_summary.total_bytes);
}

pub fn print_artifact_list(artifacts: &[ArtifactRecord]) {
    if artifacts.is_empty() {
        println!("No artifacts found.");
        return;
    }

    println!("{:<40}  {:<40}  {:<10}  {}", "ID", "PATH", "SIZE", "CONTENT TYPE");
    println!("{}", "-".repeat(110));
    for artifact in artifacts {
        println!(
            "{:<40}  {:<40}  {:<10}  {}",
            truncate(&artifact.id, 40),
            truncate(&artifact.relative_path, 40),
            artifact.size,
            artifact.content_type,
        );
    }
    println!();
    println!("{} artifact(s)", artifacts.len());
}

fn format_run_status(status: RunStatus) -> &'static str {
    status.as_str()
}

fn format_step_status(status: StepStatus) -> &'static str {
    status.as_str()
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len.saturating_sub(3)])
    }
}
