use chrono::{DateTime, Utc};
use tracing::info;

use credsync_core::{CourseRunKey, Username};
use credsync_infra::{Job, JobStore, TaskKind};

use crate::context::Context;

pub async fn award_programs(ctx: &Context, username: &str) -> anyhow::Result<()> {
    run_one(ctx, TaskKind::award_program_certificates(Username::new(username))).await
}

pub async fn award_course(
    ctx: &Context,
    username: &str,
    course_run: CourseRunKey,
    available_date: Option<DateTime<Utc>>,
) -> anyhow::Result<()> {
    run_one(
        ctx,
        TaskKind::award_course_certificate(Username::new(username), course_run, available_date),
    )
    .await
}

pub async fn revoke_programs(
    ctx: &Context,
    username: &str,
    course_run: CourseRunKey,
) -> anyhow::Result<()> {
    run_one(
        ctx,
        TaskKind::revoke_program_certificates(Username::new(username), course_run),
    )
    .await
}

async fn run_one(ctx: &Context, kind: TaskKind) -> anyhow::Result<()> {
    let task = kind.name();
    let id = ctx.queue.enqueue(Job::new(kind))?;
    info!(job_id = %id, task, "queued task");

    let stats = ctx.drain().await?;
    if stats.jobs_failed > 0 {
        anyhow::bail!("{task} failed, see the dead letters above");
    }
    println!("{task} finished");
    Ok(())
}
