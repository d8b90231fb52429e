//! Core job types and the credentials retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use credsync_core::{CourseRunKey, Username};

/// Unique invocation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reconciliation task together with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskKind {
    AwardProgramCertificates {
        username: Username,
    },
    RevokeProgramCertificates {
        username: Username,
        course_run: CourseRunKey,
    },
    AwardCourseCertificate {
        username: Username,
        course_run: CourseRunKey,
        #[serde(default)]
        available_date: Option<DateTime<Utc>>,
    },
    SendGradeToCredentials {
        username: Username,
        course_run: CourseRunKey,
        verified: bool,
        letter_grade: String,
        percent_grade: f64,
    },
    UpdateCertificateVisibleDateOnCourseUpdate {
        course_run: CourseRunKey,
        #[serde(default)]
        available_date: Option<DateTime<Utc>>,
    },
    UpdateCourseCertificateConfiguration {
        course_run: CourseRunKey,
        #[serde(default)]
        available_date: Option<DateTime<Utc>>,
    },
}

impl TaskKind {
    pub fn award_program_certificates(username: impl Into<Username>) -> Self {
        Self::AwardProgramCertificates {
            username: username.into(),
        }
    }

    pub fn revoke_program_certificates(username: impl Into<Username>, course_run: CourseRunKey) -> Self {
        Self::RevokeProgramCertificates {
            username: username.into(),
            course_run,
        }
    }

    pub fn award_course_certificate(
        username: impl Into<Username>,
        course_run: CourseRunKey,
        available_date: Option<DateTime<Utc>>,
    ) -> Self {
        Self::AwardCourseCertificate {
            username: username.into(),
            course_run,
            available_date,
        }
    }

    /// Task name used in logs and by `list_by_task`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AwardProgramCertificates { .. } => "award_program_certificates",
            Self::RevokeProgramCertificates { .. } => "revoke_program_certificates",
            Self::AwardCourseCertificate { .. } => "award_course_certificate",
            Self::SendGradeToCredentials { .. } => "send_grade_to_credentials",
            Self::UpdateCertificateVisibleDateOnCourseUpdate { .. } => {
                "update_certificate_visible_date_on_course_update"
            }
            Self::UpdateCourseCertificateConfiguration { .. } => {
                "update_course_certificate_configuration"
            }
        }
    }

    /// Leading sentence of the message recorded when retries are exhausted.
    pub fn failure_prefix(&self) -> String {
        match self {
            Self::AwardProgramCertificates { username } => {
                format!("Failed to award program certificate for user {username}")
            }
            Self::RevokeProgramCertificates {
                username,
                course_run,
            } => format!(
                "Failed to revoke program certificate for user {username} for course {course_run}"
            ),
            Self::AwardCourseCertificate {
                username,
                course_run,
                ..
            } => format!(
                "Failed to award course certificate for user {username} for course {course_run}"
            ),
            Self::SendGradeToCredentials { .. } => "Failed to send grade to credentials".to_string(),
            Self::UpdateCertificateVisibleDateOnCourseUpdate { course_run, .. } => {
                format!("Failed to update certificate availability date for course {course_run}")
            }
            Self::UpdateCourseCertificateConfiguration { course_run, .. } => {
                format!("Failed to update course certificate configuration for course {course_run}")
            }
        }
    }
}

/// Invocation status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for its eta
    Pending,
    /// Currently being executed
    Running,
    /// Finished, possibly as a skip
    Succeeded,
    /// Failed; a follow-up invocation was enqueued
    RetryScheduled { next: JobId, countdown_secs: u64 },
    /// Retry budget exhausted
    Failed { message: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// Retry policy shared by every credentials task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Highest `retries` value that may still reschedule
    pub max_retries: u32,
    /// Countdown unit: attempt `n` waits `base_delay * 2^n`
    pub base_delay: Duration,
    /// Fixed countdown after the remote service rate-limited us
    pub rate_limit_delay: Duration,
}

impl RetryPolicy {
    pub const MAX_RETRIES: u32 = 11;

    pub fn credentials() -> Self {
        Self {
            max_retries: Self::MAX_RETRIES,
            base_delay: Duration::from_secs(1),
            rate_limit_delay: Duration::from_secs(60),
        }
    }

    /// Countdown before the retry of an invocation that ran with `retries`.
    pub fn countdown(&self, retries: u32, rate_limited: bool) -> Duration {
        if rate_limited {
            return self.rate_limit_delay;
        }
        let factor = 1u32.checked_shl(retries).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Sum of every exponential countdown before the budget runs out.
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_retries).map(|n| self.countdown(n, false)).sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::credentials()
    }
}

/// One invocation of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: TaskKind,
    pub status: JobStatus,
    /// Number of invocations that preceded this one
    pub retries: u32,
    /// Invocation this one retries
    pub retry_of: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the invocation may run
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Skip reason or failure message
    pub note: Option<String>,
}

impl Job {
    pub fn new(kind: TaskKind) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind,
            status: JobStatus::Pending,
            retries: 0,
            retry_of: None,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            started_at: None,
            finished_at: None,
            note: None,
        }
    }

    /// Schedule the job for later execution.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Follow-up invocation of `self` after `countdown`.
    pub fn retry_after(&self, countdown: Duration) -> Job {
        let mut next = Job::new(self.kind.clone());
        next.retries = self.retries + 1;
        next.retry_of = Some(self.id);
        next.scheduled_at =
            Some(next.created_at + chrono::Duration::from_std(countdown).unwrap_or_default());
        next
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready_at(Utc::now())
    }

    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    pub fn mark_running(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_succeeded(&mut self, skip_reason: Option<String>) {
        self.finish(JobStatus::Succeeded);
        self.note = skip_reason;
    }

    pub fn mark_retry_scheduled(&mut self, next: JobId, countdown: Duration, reason: String) {
        self.finish(JobStatus::RetryScheduled {
            next,
            countdown_secs: countdown.as_secs(),
        });
        self.note = Some(reason);
    }

    pub fn mark_failed(&mut self, message: String) {
        self.finish(JobStatus::Failed {
            message: message.clone(),
        });
        self.note = Some(message);
    }

    fn finish(&mut self, status: JobStatus) {
        let now = Utc::now();
        self.status = status;
        self.finished_at = Some(now);
        self.updated_at = now;
    }
}

/// Successful end of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Nothing to do, or a condition no retry can fix.
    Skipped { reason: String },
}

impl TaskOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

/// Failure of a task invocation; every variant is retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("{reason}")]
    Retryable { reason: String },
    /// The remote service asked us to slow down.
    #[error("{reason}")]
    RateLimited { reason: String },
}

impl TaskError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable {
            reason: reason.into(),
        }
    }

    pub fn rate_limited(reason: impl Into<String>) -> Self {
        Self::RateLimited {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Retryable { reason } | Self::RateLimited { reason } => reason,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

pub type TaskResult = Result<TaskOutcome, TaskError>;

/// Entry in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String) -> Self {
        Self {
            job,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}
