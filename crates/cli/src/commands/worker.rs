use anyhow::Context as _;
use tracing::info;

use credsync_infra::{Job, JobStore, TaskKind};

use crate::context::Context;

/// Queue every task listed in a JSON file and run them to completion.
pub async fn run(ctx: &Context, jobs_path: &str) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(jobs_path)
        .with_context(|| format!("reading tasks from {jobs_path}"))?;
    let tasks = parse_tasks(&raw).with_context(|| format!("parsing tasks in {jobs_path}"))?;

    for kind in tasks {
        let task = kind.name();
        let id = ctx.queue.enqueue(Job::new(kind))?;
        info!(job_id = %id, task, "queued task");
    }

    let stats = ctx.drain().await?;
    if stats.jobs_failed > 0 {
        anyhow::bail!("{} task invocation(s) failed", stats.jobs_failed);
    }
    Ok(())
}

fn parse_tasks(raw: &str) -> serde_json::Result<Vec<TaskKind>> {
    serde_json::from_str(raw)
}
