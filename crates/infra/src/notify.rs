//! Batch replay of recent certificate and grade changes.
//!
//! Used to backfill the Credentials service after an outage or a config
//! change: every certificate and grade modified in a window is pushed
//! through the same entry points the live signals use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use credsync_core::{
    CertificateStatus, CourseCertificate, CourseGrade, CourseMode, CourseRunKey, Learner, UserId,
};

use crate::config::{ConfigError, ConfigProvider, Settings, SiteConfiguration};
use crate::jobs::{Job, JobId, JobStore, JobStoreError, TaskKind};
use crate::paging::{PageSource, StoreError, paged_query};
use crate::records::{LearnerRecords, ModifiedFilter, ProgramCatalog};
use crate::signals::{CertificateSignals, SignalError};

/// Items listed per kind by a dry run.
const DRY_RUN_ITEMS: usize = 10;

pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyOptions {
    /// Inclusive lower bound on the modification date.
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the modification date.
    pub end: Option<DateTime<Utc>>,
    pub course_keys: Vec<CourseRunKey>,
    pub user_ids: Vec<UserId>,
    /// Only notify for orgs of this site.
    pub site: Option<String>,
    pub page_size: usize,
    /// Pause between pages.
    pub delay: Duration,
    pub dry_run: bool,
    pub verbose: bool,
    /// Also queue program awards for passing certificates.
    pub notify_programs: bool,
}

impl Default for NotifyOptions {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            course_keys: Vec::new(),
            user_ids: Vec::new(),
            site: None,
            page_size: DEFAULT_PAGE_SIZE,
            delay: Duration::ZERO,
            dry_run: false,
            verbose: false,
            notify_programs: false,
        }
    }
}

impl NotifyOptions {
    pub fn filter(&self) -> ModifiedFilter {
        ModifiedFilter {
            course_keys: self.course_keys.clone(),
            start: self.start,
            end: self.end,
            user_ids: self.user_ids.clone(),
        }
    }
}

/// What a notify run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifySummary {
    /// Certificates in the window.
    pub certificates: usize,
    /// Grades in the window.
    pub grades: usize,
    pub certificates_handled: usize,
    pub certificates_skipped: usize,
    pub grades_sent: usize,
    pub grades_skipped: usize,
    pub dry_run: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("no site configuration found for site {0}")]
    UnknownSite(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("records unavailable: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error("failed to enqueue task: {0}")]
    Queue(#[from] JobStoreError),
}

/// Why a grade was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradeSkip {
    IssuanceDisabled,
    LearnerRecordsDisabled,
    NoCertificate,
    /// Mode or status the Credentials service does not track grades for.
    Uninteresting,
    NotInProgram,
    NoGrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradeDecision {
    Sent(JobId),
    Skipped(GradeSkip),
}

/// Runs notify batches against the local records.
#[derive(Clone)]
pub struct CredentialsNotifier {
    config: Arc<dyn ConfigProvider>,
    records: Arc<dyn LearnerRecords>,
    catalog: Arc<dyn ProgramCatalog>,
    queue: Arc<dyn JobStore>,
    signals: CertificateSignals,
}

impl std::fmt::Debug for CredentialsNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsNotifier").finish_non_exhaustive()
    }
}

fn certstr(cert: &CourseCertificate) -> String {
    format!("{} for user {}", cert.course_run, cert.user_id)
}

fn gradestr(grade: &CourseGrade) -> String {
    format!("{} for user {}", grade.course_run, grade.user_id)
}

impl CredentialsNotifier {
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        records: Arc<dyn LearnerRecords>,
        catalog: Arc<dyn ProgramCatalog>,
        queue: Arc<dyn JobStore>,
    ) -> Self {
        let signals = CertificateSignals::new(config.clone(), queue.clone());
        Self {
            config,
            records,
            catalog,
            queue,
            signals,
        }
    }

    /// Find the certificates and grades changed in the window and notify
    /// for each of them, or only list them on a dry run.
    pub fn handle_notify_credentials(
        &self,
        options: &NotifyOptions,
    ) -> Result<NotifySummary, NotifyError> {
        let settings = self.config.current()?;
        let site = match &options.site {
            Some(domain) => match settings.site(domain) {
                Some(site) => Some(site.clone()),
                None => {
                    error!(site = %domain, "no site configuration found");
                    return Err(NotifyError::UnknownSite(domain.clone()));
                }
            },
            None => None,
        };

        let filter = options.filter();
        let certs = self.records.recently_modified_certificates(&filter);
        let grades = self.records.recently_modified_grades(&filter);

        info!(
            certificates = certs.count()?,
            grades = grades.count()?,
            "notify_credentials sending notifications"
        );

        let summary = if options.dry_run {
            log_dry_run(&*certs, &*grades)?
        } else {
            self.send_notifications(&*certs, &*grades, &settings, site.as_ref(), options)?
        };

        info!("notify_credentials finished");
        Ok(summary)
    }

    /// Certificates first, then grades, each through a paged cursor.
    pub fn send_notifications<C, G>(
        &self,
        certs: &C,
        grades: &G,
        settings: &Settings,
        site: Option<&SiteConfiguration>,
        options: &NotifyOptions,
    ) -> Result<NotifySummary, NotifyError>
    where
        C: PageSource<Item = CourseCertificate> + ?Sized,
        G: PageSource<Item = CourseGrade> + ?Sized,
    {
        let mut summary = NotifySummary::default();
        let mut cert_info: HashMap<(UserId, CourseRunKey), (CourseMode, CertificateStatus)> =
            HashMap::new();

        let cert_pages = paged_query(certs, options.delay, options.page_size)?;
        summary.certificates = cert_pages.total();
        for (i, cert) in cert_pages {
            if site.is_some_and(|site| !site.has_org(cert.course_run.org())) {
                info!(index = i, certificate = %certstr(&cert), "skipping credential changes");
                summary.certificates_skipped += 1;
                continue;
            }

            info!(index = i, certificate = %certstr(&cert), "handling credential changes");
            cert_info.insert(
                (cert.user_id, cert.course_run.clone()),
                (cert.mode.clone(), cert.status),
            );
            self.signals.course_cert_changed(&cert)?;
            if options.notify_programs && cert.is_passing() {
                self.signals.course_cert_awarded(&cert)?;
            }
            summary.certificates_handled += 1;
        }

        let grade_pages = paged_query(grades, options.delay, options.page_size)?;
        summary.grades = grade_pages.total();
        for (i, grade) in grade_pages {
            if site.is_some_and(|site| !site.has_org(grade.course_run.org())) {
                info!(index = i, grade = %gradestr(&grade), "skipping grade changes");
                summary.grades_skipped += 1;
                continue;
            }

            info!(index = i, grade = %gradestr(&grade), "handling grade changes");
            let Some(learner) = self.records.learner_by_id(grade.user_id)? else {
                info!(user_id = %grade.user_id, "grade belongs to an unknown learner");
                summary.grades_skipped += 1;
                continue;
            };

            let (mode, status) = cert_info
                .get(&(grade.user_id, grade.course_run.clone()))
                .cloned()
                .unzip();
            let decision = self.decide(
                settings,
                &learner,
                &grade.course_run,
                mode,
                status,
                Some(&grade),
                options.verbose,
            )?;
            match decision {
                GradeDecision::Sent(_) => summary.grades_sent += 1,
                GradeDecision::Skipped(_) => summary.grades_skipped += 1,
            }
        }

        Ok(summary)
    }

    /// Queue a grade for the Credentials service if it tracks it.
    ///
    /// Unknown `mode`/`status` are read from the learner's certificate and a
    /// missing `grade` from the persisted grades.
    pub fn send_grade_if_interesting(
        &self,
        learner: &Learner,
        course_run: &CourseRunKey,
        mode: Option<CourseMode>,
        status: Option<CertificateStatus>,
        grade: Option<&CourseGrade>,
        verbose: bool,
    ) -> Result<GradeDecision, NotifyError> {
        let settings = self.config.current()?;
        self.decide(&settings, learner, course_run, mode, status, grade, verbose)
    }

    #[allow(clippy::too_many_arguments)]
    fn decide(
        &self,
        settings: &Settings,
        learner: &Learner,
        course_run: &CourseRunKey,
        mode: Option<CourseMode>,
        status: Option<CertificateStatus>,
        grade: Option<&CourseGrade>,
        verbose: bool,
    ) -> Result<GradeDecision, NotifyError> {
        let skip = |reason: GradeSkip| -> Result<GradeDecision, NotifyError> {
            if verbose {
                info!(user = %learner.username, %course_run, ?reason, "skipping send grade");
            } else {
                debug!(user = %learner.username, %course_run, ?reason, "skipping send grade");
            }
            Ok(GradeDecision::Skipped(reason))
        };

        if verbose {
            info!(
                user = %learner.username,
                %course_run,
                mode = ?mode,
                status = ?status,
                "starting send_grade_if_interesting"
            );
        }

        if !settings.credentials.is_learner_issuance_enabled {
            return skip(GradeSkip::IssuanceDisabled);
        }
        if !settings.is_learner_records_enabled_for_org(course_run.org()) {
            return skip(GradeSkip::LearnerRecordsDisabled);
        }

        let (mode, status) = match (mode, status) {
            (Some(mode), Some(status)) => (mode, status),
            _ => match self.records.certificate(learner.id, course_run)? {
                Some(cert) => (cert.mode, cert.status),
                None => return skip(GradeSkip::NoCertificate),
            },
        };

        if !mode.is_certificate_relevant()
            || !matches!(
                status,
                CertificateStatus::Notpassing | CertificateStatus::Downloadable
            )
        {
            return skip(GradeSkip::Uninteresting);
        }

        if !self.catalog.is_course_run_in_a_program(course_run)? {
            return skip(GradeSkip::NotInProgram);
        }

        let grade = match grade {
            Some(grade) => grade.clone(),
            None => match self.records.read_grade(learner.id, course_run)? {
                Some(grade) => grade,
                None => return skip(GradeSkip::NoGrade),
            },
        };

        let id = self.queue.enqueue(Job::new(TaskKind::SendGradeToCredentials {
            username: learner.username.clone(),
            course_run: course_run.clone(),
            verified: true,
            letter_grade: grade.letter_grade,
            percent_grade: grade.percent_grade,
        }))?;
        if verbose {
            info!(user = %learner.username, %course_run, job_id = %id, "queued send grade");
        }
        Ok(GradeDecision::Sent(id))
    }
}

/// Log how much a real run would handle, with a short preview of each kind.
pub fn log_dry_run<C, G>(certs: &C, grades: &G) -> Result<NotifySummary, NotifyError>
where
    C: PageSource<Item = CourseCertificate> + ?Sized,
    G: PageSource<Item = CourseGrade> + ?Sized,
{
    info!("DRY-RUN: this task would have handled changes for...");

    let cert_count = certs.count()?;
    info!("{cert_count} Certificates:");
    for cert in certs.page(0, DRY_RUN_ITEMS).flatten() {
        info!("   {}", certstr(&cert));
    }
    if cert_count > DRY_RUN_ITEMS {
        info!("    (+ {} more)", cert_count - DRY_RUN_ITEMS);
    }

    let grade_count = grades.count()?;
    info!("{grade_count} Grades:");
    for grade in grades.page(0, DRY_RUN_ITEMS).flatten() {
        info!("   {}", gradestr(&grade));
    }
    if grade_count > DRY_RUN_ITEMS {
        info!("    (+ {} more)", grade_count - DRY_RUN_ITEMS);
    }

    Ok(NotifySummary {
        certificates: cert_count,
        grades: grade_count,
        dry_run: true,
        ..NotifySummary::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfigProvider;
    use crate::jobs::InMemoryJobStore;
    use crate::records::{InMemoryLearnerRecords, InMemoryProgramCatalog};
    use chrono::TimeZone;
    use credsync_core::{Program, ProgramCourse, ProgramId};

    struct Harness {
        config: Arc<StaticConfigProvider>,
        records: Arc<InMemoryLearnerRecords>,
        catalog: Arc<InMemoryProgramCatalog>,
        queue: Arc<InMemoryJobStore>,
        notifier: CredentialsNotifier,
    }

    fn harness() -> Harness {
        let mut settings = Settings::default();
        settings.credentials.is_learner_issuance_enabled = true;
        let config = Arc::new(StaticConfigProvider::new(settings));
        let records = Arc::new(InMemoryLearnerRecords::new());
        let catalog = Arc::new(InMemoryProgramCatalog::new(Vec::new()));
        let queue = InMemoryJobStore::arc();
        records.add_learner(Learner::new(1, "ada"));
        let notifier =
            CredentialsNotifier::new(config.clone(), records.clone(), catalog.clone(), queue.clone());
        Harness {
            config,
            records,
            catalog,
            queue,
            notifier,
        }
    }

    fn key(org: &str, code: &str) -> CourseRunKey {
        CourseRunKey::parse(&format!("course-v1:{org}+{code}+1T")).unwrap()
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, day, 8, 0, 0).unwrap()
    }

    fn cert(course_run: CourseRunKey, status: CertificateStatus, day: u32) -> CourseCertificate {
        CourseCertificate {
            user_id: UserId(1),
            username: "ada".into(),
            course_run,
            mode: CourseMode::verified(),
            status,
            created_date: at(day),
            modified_date: at(day),
        }
    }

    fn grade(course_run: CourseRunKey, day: u32) -> CourseGrade {
        CourseGrade {
            user_id: UserId(1),
            course_run,
            letter_grade: "A".into(),
            percent_grade: 0.95,
            passed: true,
            modified: at(day),
        }
    }

    fn in_program(h: &Harness, course_run: &CourseRunKey) {
        h.catalog.add_program(Program {
            uuid: ProgramId::new(),
            title: "P".into(),
            courses: vec![ProgramCourse {
                key: "edX+P".into(),
                course_runs: vec![course_run.clone()],
            }],
        });
    }

    fn ada() -> Learner {
        Learner::new(1, "ada")
    }

    fn count(h: &Harness, task: &str) -> usize {
        h.queue.list_by_task(task, 1000).unwrap().len()
    }

    #[test]
    fn unknown_site_is_an_error() {
        let h = harness();
        let options = NotifyOptions {
            site: Some("nowhere.example.com".into()),
            ..NotifyOptions::default()
        };

        let err = h.notifier.handle_notify_credentials(&options).unwrap_err();
        assert!(matches!(err, NotifyError::UnknownSite(_)));
    }

    #[test]
    fn dry_run_queues_nothing() {
        let h = harness();
        for day in 1..=12 {
            h.records
                .upsert_certificate(cert(key("edX", &format!("C{day}")), CertificateStatus::Downloadable, day));
        }

        let summary = h
            .notifier
            .handle_notify_credentials(&NotifyOptions {
                dry_run: true,
                ..NotifyOptions::default()
            })
            .unwrap();

        assert!(summary.dry_run);
        assert_eq!(summary.certificates, 12);
        assert_eq!(h.queue.stats().unwrap().pending, 0);
    }

    #[test]
    fn certificates_fire_changes_and_optionally_programs() {
        let h = harness();
        h.records
            .upsert_certificate(cert(key("edX", "A"), CertificateStatus::Downloadable, 2));
        h.records
            .upsert_certificate(cert(key("edX", "B"), CertificateStatus::Notpassing, 3));

        let summary = h
            .notifier
            .handle_notify_credentials(&NotifyOptions {
                notify_programs: true,
                ..NotifyOptions::default()
            })
            .unwrap();

        assert_eq!(summary.certificates_handled, 2);
        assert_eq!(count(&h, "award_course_certificate"), 2);
        assert_eq!(count(&h, "award_program_certificates"), 1);
    }

    #[test]
    fn window_is_half_open() {
        let h = harness();
        h.records
            .upsert_certificate(cert(key("edX", "A"), CertificateStatus::Downloadable, 2));
        h.records
            .upsert_certificate(cert(key("edX", "B"), CertificateStatus::Downloadable, 5));

        let summary = h
            .notifier
            .handle_notify_credentials(&NotifyOptions {
                start: Some(at(2)),
                end: Some(at(5)),
                ..NotifyOptions::default()
            })
            .unwrap();

        assert_eq!(summary.certificates, 1);
    }

    #[test]
    fn site_filter_skips_foreign_orgs() {
        let h = harness();
        h.config.update(|s| {
            s.sites.push(SiteConfiguration {
                domain: "edx.example.com".into(),
                orgs: vec!["edX".into()],
                enable_learner_records: None,
            })
        });
        h.records
            .upsert_certificate(cert(key("edX", "A"), CertificateStatus::Downloadable, 2));
        h.records
            .upsert_certificate(cert(key("Other", "B"), CertificateStatus::Downloadable, 3));
        h.records.upsert_grade(grade(key("Other", "B"), 3));

        let summary = h
            .notifier
            .handle_notify_credentials(&NotifyOptions {
                site: Some("edx.example.com".into()),
                ..NotifyOptions::default()
            })
            .unwrap();

        assert_eq!(summary.certificates_handled, 1);
        assert_eq!(summary.certificates_skipped, 1);
        assert_eq!(summary.grades_skipped, 1);
        assert_eq!(count(&h, "send_grade_to_credentials"), 0);
    }

    #[test]
    fn interesting_grades_are_sent_verified() {
        let h = harness();
        let run = key("edX", "A");
        in_program(&h, &run);
        h.records
            .upsert_certificate(cert(run.clone(), CertificateStatus::Notpassing, 2));
        h.records.upsert_grade(grade(run, 2));

        let summary = h
            .notifier
            .handle_notify_credentials(&NotifyOptions::default())
            .unwrap();

        assert_eq!(summary.grades_sent, 1);
        let jobs = h.queue.list_by_task("send_grade_to_credentials", 10).unwrap();
        assert!(matches!(
            &jobs[0].kind,
            TaskKind::SendGradeToCredentials { verified: true, letter_grade, .. } if letter_grade == "A"
        ));
    }

    #[test]
    fn grade_predicate_checks_in_order() {
        let h = harness();
        let run = key("edX", "A");

        // no certificate to read mode/status from
        assert_eq!(
            h.notifier
                .send_grade_if_interesting(&ada(), &run, None, None, None, false)
                .unwrap(),
            GradeDecision::Skipped(GradeSkip::NoCertificate)
        );

        // audit mode
        assert_eq!(
            h.notifier
                .send_grade_if_interesting(
                    &ada(),
                    &run,
                    Some(CourseMode::audit()),
                    Some(CertificateStatus::Downloadable),
                    None,
                    false
                )
                .unwrap(),
            GradeDecision::Skipped(GradeSkip::Uninteresting)
        );

        // generating is not tracked
        assert_eq!(
            h.notifier
                .send_grade_if_interesting(
                    &ada(),
                    &run,
                    Some(CourseMode::verified()),
                    Some(CertificateStatus::Generating),
                    None,
                    false
                )
                .unwrap(),
            GradeDecision::Skipped(GradeSkip::Uninteresting)
        );

        let relevant = |h: &Harness| {
            h.notifier.send_grade_if_interesting(
                &ada(),
                &run,
                Some(CourseMode::verified()),
                Some(CertificateStatus::Downloadable),
                None,
                true,
            )
        };

        assert_eq!(relevant(&h).unwrap(), GradeDecision::Skipped(GradeSkip::NotInProgram));

        in_program(&h, &run);
        assert_eq!(relevant(&h).unwrap(), GradeDecision::Skipped(GradeSkip::NoGrade));

        h.records.upsert_grade(grade(run.clone(), 4));
        assert!(matches!(relevant(&h).unwrap(), GradeDecision::Sent(_)));

        h.config
            .update(|s| s.credentials.is_learner_issuance_enabled = false);
        assert_eq!(
            relevant(&h).unwrap(),
            GradeDecision::Skipped(GradeSkip::IssuanceDisabled)
        );

        h.config.update(|s| {
            s.credentials.is_learner_issuance_enabled = true;
            s.enable_learner_records = false;
        });
        assert_eq!(
            relevant(&h).unwrap(),
            GradeDecision::Skipped(GradeSkip::LearnerRecordsDisabled)
        );
    }

    #[test]
    fn catalog_outage_aborts_the_run() {
        let h = harness();
        let run = key("edX", "A");
        h.records
            .upsert_certificate(cert(run.clone(), CertificateStatus::Downloadable, 2));
        h.records.upsert_grade(grade(run, 2));
        h.catalog.set_unavailable(true);

        let err = h
            .notifier
            .handle_notify_credentials(&NotifyOptions::default())
            .unwrap_err();
        assert!(matches!(err, NotifyError::Store(StoreError::Unavailable(_))));
    }
}
