use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::Parser;

use credsync_core::{CourseRunKey, UserId};

mod commands;
mod context;

#[derive(Parser)]
#[command(name = "credsync", about = "Keep the Credentials service in sync with learner records", version)]
struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "credsync.toml")]
    config: String,

    /// Path to the learner records snapshot (JSON)
    #[arg(long, default_value = "records.json")]
    records: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Replay certificate and grade changes from a date window
    Notify(NotifyArgs),
    /// Run queued tasks from a JSON file until they finish
    Worker {
        /// JSON array of tasks, e.g. [{"task": "award_program_certificates", "username": "ada"}]
        #[arg(long)]
        jobs: String,
    },
    /// Award missing program certificates to a learner
    AwardPrograms {
        #[arg(long)]
        username: String,
    },
    /// Send a learner's course certificate
    AwardCourse {
        #[arg(long)]
        username: String,
        #[arg(long, value_parser = CourseRunKey::parse)]
        course_run: CourseRunKey,
        /// Certificate availability date set by course staff
        #[arg(long, value_parser = parse_date)]
        available_date: Option<DateTime<Utc>>,
    },
    /// Revoke program certificates that depend on a course run
    RevokePrograms {
        #[arg(long)]
        username: String,
        #[arg(long, value_parser = CourseRunKey::parse)]
        course_run: CourseRunKey,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct NotifyArgs {
    /// Course run keys to notify for
    #[arg(long, num_args = 1.., value_parser = CourseRunKey::parse)]
    courses: Vec<CourseRunKey>,
    /// Changes modified on or after this date
    #[arg(long, value_parser = parse_date)]
    start_date: Option<DateTime<Utc>>,
    /// Changes modified before this date
    #[arg(long, value_parser = parse_date)]
    end_date: Option<DateTime<Utc>>,
    /// Restrict to these user ids
    #[arg(long, num_args = 1..)]
    user_ids: Vec<u64>,
    /// Only notify for orgs of this site
    #[arg(long)]
    site: Option<String>,
    /// Items fetched per page
    #[arg(long, default_value = "100")]
    page_size: usize,
    /// Seconds to pause between pages
    #[arg(long, default_value = "0")]
    delay: f64,
    /// Log what would be sent without sending anything
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    verbose: bool,
    /// Also award program certificates for passing certificates
    #[arg(long)]
    notify_programs: bool,
}

impl NotifyArgs {
    fn user_ids(&self) -> Vec<UserId> {
        self.user_ids.iter().copied().map(UserId).collect()
    }
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD`, all read as UTC.
fn parse_date(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(parsed.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|datetime| datetime.and_utc())
        .ok_or_else(|| format!("invalid date '{value}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let ctx = context::Context::load(&cli.config, &cli.records)?;
    credsync_observability::init(ctx.settings.logging.format);

    match cli.command {
        Commands::Notify(args) => {
            commands::notify::run(&ctx, &args).await?;
        }
        Commands::Worker { jobs } => {
            commands::worker::run(&ctx, &jobs).await?;
        }
        Commands::AwardPrograms { username } => {
            commands::enqueue::award_programs(&ctx, &username).await?;
        }
        Commands::AwardCourse {
            username,
            course_run,
            available_date,
        } => {
            commands::enqueue::award_course(&ctx, &username, course_run, available_date).await?;
        }
        Commands::RevokePrograms {
            username,
            course_run,
        } => {
            commands::enqueue::revoke_programs(&ctx, &username, course_run).await?;
        }
    }

    Ok(())
}
