use std::time::Duration;

use anyhow::bail;
use tracing::info;

use credsync_infra::NotifyOptions;

use crate::NotifyArgs;
use crate::context::Context;

pub async fn run(ctx: &Context, args: &NotifyArgs) -> anyhow::Result<()> {
    let options = options(args)?;
    let notifier = ctx.notifier();
    let batch = options.clone();
    let summary =
        tokio::task::spawn_blocking(move || notifier.handle_notify_credentials(&batch)).await??;

    println!(
        "{} certificates ({} handled, {} skipped), {} grades ({} sent, {} skipped)",
        summary.certificates,
        summary.certificates_handled,
        summary.certificates_skipped,
        summary.grades,
        summary.grades_sent,
        summary.grades_skipped,
    );

    if options.dry_run {
        println!("Dry run: nothing was queued");
        return Ok(());
    }

    info!("running queued tasks");
    ctx.drain().await?;
    Ok(())
}

fn options(args: &NotifyArgs) -> anyhow::Result<NotifyOptions> {
    if args.courses.is_empty() && args.start_date.is_none() && args.user_ids.is_empty() {
        bail!("You must specify a filter (e.g. --courses, --start-date or --user-ids)");
    }
    if !args.delay.is_finite() || args.delay < 0.0 {
        bail!("--delay must be a non-negative number of seconds");
    }
    if args.page_size == 0 {
        bail!("--page-size must be at least 1");
    }

    Ok(NotifyOptions {
        start: args.start_date,
        end: args.end_date,
        course_keys: args.courses.clone(),
        user_ids: args.user_ids(),
        site: args.site.clone(),
        page_size: args.page_size,
        delay: Duration::from_secs_f64(args.delay),
        dry_run: args.dry_run,
        verbose: args.verbose,
        notify_programs: args.notify_programs,
    })
}
