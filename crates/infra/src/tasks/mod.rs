//! Reconciliation tasks that keep the Credentials service in line with
//! local certificate, grade and program state.
//!
//! Every task is idempotent: it recomputes what the remote side should hold
//! from local records and posts the difference. Transient failures surface
//! as [`TaskError`] and the [`JobExecutor`](crate::jobs::JobExecutor) turns
//! them into scheduled retries; conditions no retry can fix end as
//! [`TaskOutcome::Skipped`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{ConfigProvider, Settings};
use crate::credentials::{ClientError, CredentialsClient};
use crate::jobs::{Job, JobId, JobStore, TaskError, TaskHandler, TaskKind, TaskResult};
use crate::records::{LearnerRecords, ProgramCatalog};

mod course;
mod grades;
mod programs;

/// Seconds a rate-limited task waits, as quoted in log messages.
const RATE_LIMIT_SECS: u64 = 60;

/// The task bodies, wired to their collaborators.
#[derive(Clone)]
pub struct CredentialsTasks {
    config: Arc<dyn ConfigProvider>,
    records: Arc<dyn LearnerRecords>,
    catalog: Arc<dyn ProgramCatalog>,
    client: Arc<dyn CredentialsClient>,
    queue: Arc<dyn JobStore>,
}

impl CredentialsTasks {
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        records: Arc<dyn LearnerRecords>,
        catalog: Arc<dyn ProgramCatalog>,
        client: Arc<dyn CredentialsClient>,
        queue: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            config,
            records,
            catalog,
            client,
            queue,
        }
    }

    /// Fresh configuration; read at the top of every invocation.
    fn settings(&self) -> Result<Settings, TaskError> {
        self.config
            .current()
            .map_err(|e| TaskError::retryable(format!("failed to load configuration: {e}")))
    }

    /// Queue a follow-up task.
    fn enqueue(&self, kind: TaskKind) -> Result<JobId, TaskError> {
        let task = kind.name();
        self.queue
            .enqueue(Job::new(kind))
            .map_err(|e| TaskError::retryable(format!("failed to enqueue {task}: {e}")))
    }
}

impl std::fmt::Debug for CredentialsTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsTasks").finish_non_exhaustive()
    }
}

#[async_trait]
impl TaskHandler for CredentialsTasks {
    async fn handle(&self, job: &Job) -> TaskResult {
        match &job.kind {
            TaskKind::AwardProgramCertificates { username } => {
                self.award_program_certificates(username).await
            }
            TaskKind::RevokeProgramCertificates {
                username,
                course_run,
            } => self.revoke_program_certificates(username, course_run).await,
            TaskKind::AwardCourseCertificate {
                username,
                course_run,
                available_date,
            } => {
                self.award_course_certificate(username, course_run, *available_date)
                    .await
            }
            TaskKind::SendGradeToCredentials {
                username,
                course_run,
                verified,
                letter_grade,
                percent_grade,
            } => {
                self.send_grade_to_credentials(
                    username,
                    course_run,
                    *verified,
                    letter_grade,
                    *percent_grade,
                )
                .await
            }
            TaskKind::UpdateCertificateVisibleDateOnCourseUpdate {
                course_run,
                available_date,
            } => {
                self.update_certificate_visible_date_on_course_update(course_run, *available_date)
            }
            TaskKind::UpdateCourseCertificateConfiguration {
                course_run,
                available_date,
            } => {
                self.update_course_certificate_configuration(course_run, *available_date)
                    .await
            }
        }
    }
}

/// Retryable failure when issuance is switched off; it may be switched back on.
fn ensure_issuance_enabled(settings: &Settings, task: &str) -> Result<(), TaskError> {
    if settings.credentials.is_learner_issuance_enabled {
        return Ok(());
    }
    let reason =
        format!("Task {task} cannot be executed when credentials issuance is disabled in API config");
    warn!(task, "{reason}");
    Err(TaskError::retryable(reason))
}

/// Whole-task failure for a client error, keeping rate limits distinct.
fn client_failure(err: &ClientError, reason: String) -> TaskError {
    if matches!(err, ClientError::RateLimited) {
        TaskError::rate_limited(reason)
    } else {
        TaskError::retryable(reason)
    }
}

fn rate_limited(action: &str) -> TaskError {
    let reason = format!("Rate limited. Retrying task to {action} in {RATE_LIMIT_SECS} seconds");
    info!("{reason}");
    TaskError::rate_limited(reason)
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Shared wiring for task tests.

    use std::sync::Arc;

    use chrono::{DateTime, TimeZone, Utc};

    use credsync_core::{
        CertificateStatus, CourseCertificate, CourseMode, CourseOverview, CourseRunKey, Learner,
        Program, ProgramCourse, ProgramId, UserId, Username,
    };

    use super::CredentialsTasks;
    use crate::config::{Settings, StaticConfigProvider};
    use crate::credentials::InMemoryCredentialsClient;
    use crate::jobs::InMemoryJobStore;
    use crate::records::{InMemoryLearnerRecords, InMemoryProgramCatalog};

    pub struct World {
        pub config: Arc<StaticConfigProvider>,
        pub records: Arc<InMemoryLearnerRecords>,
        pub catalog: Arc<InMemoryProgramCatalog>,
        pub client: Arc<InMemoryCredentialsClient>,
        pub queue: Arc<InMemoryJobStore>,
        pub tasks: CredentialsTasks,
    }

    impl World {
        /// Issuance enabled, learner `ada` (id 1) known, nothing else.
        pub fn new() -> Self {
            let mut settings = Settings::default();
            settings.credentials.is_learner_issuance_enabled = true;

            let config = Arc::new(StaticConfigProvider::new(settings));
            let records = Arc::new(InMemoryLearnerRecords::new());
            let catalog = Arc::new(InMemoryProgramCatalog::new(Vec::new()));
            let client = Arc::new(InMemoryCredentialsClient::new());
            let queue = InMemoryJobStore::arc();
            records.add_learner(Learner::new(1, "ada"));

            let tasks = CredentialsTasks::new(
                config.clone(),
                records.clone(),
                catalog.clone(),
                client.clone(),
                queue.clone(),
            );

            Self {
                config,
                records,
                catalog,
                client,
                queue,
                tasks,
            }
        }

        pub fn disable_issuance(&self) {
            self.config
                .update(|s| s.credentials.is_learner_issuance_enabled = false);
        }

        pub fn pass(&self, code: &str, day: u32) -> CourseCertificate {
            let cert = certificate(code, CertificateStatus::Downloadable, day);
            self.records.upsert_certificate(cert.clone());
            cert
        }
    }

    pub fn ada() -> Username {
        Username::from("ada")
    }

    pub fn run(code: &str) -> CourseRunKey {
        CourseRunKey::parse(&format!("course-v1:edX+{code}+1T")).unwrap()
    }

    pub fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 9, 30, 0).unwrap()
    }

    pub fn certificate(code: &str, status: CertificateStatus, day: u32) -> CourseCertificate {
        CourseCertificate {
            user_id: UserId(1),
            username: ada(),
            course_run: run(code),
            mode: CourseMode::verified(),
            status,
            created_date: at(day),
            modified_date: at(day),
        }
    }

    pub fn overview(code: &str) -> CourseOverview {
        CourseOverview::new(run(code))
    }

    pub fn program(n: u128, codes: &[&str]) -> Program {
        Program {
            uuid: ProgramId::from_uuid(uuid::Uuid::from_u128(n)),
            title: format!("Program {n}"),
            courses: codes
                .iter()
                .map(|code| ProgramCourse {
                    key: format!("edX+{code}"),
                    course_runs: vec![run(code)],
                })
                .collect(),
        }
    }
}
