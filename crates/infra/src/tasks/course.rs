use chrono::{DateTime, Utc};
use tracing::{info, warn};

use credsync_core::{CourseMode, CourseRunKey, Username, available_date_for_certificate};

use super::{CredentialsTasks, client_failure, ensure_issuance_enabled, rate_limited};
use crate::credentials::{ClientError, CourseCertificateConfig, CredentialStatus};
use crate::jobs::{TaskError, TaskKind, TaskOutcome, TaskResult};

impl CredentialsTasks {
    /// Push the learner's certificate for one run, awarded when it is valid
    /// and revoked otherwise.
    ///
    /// `available_date` is the staff date carried by a course update; it is
    /// only used for runs that display certificates on a set date.
    pub async fn award_course_certificate(
        &self,
        username: &Username,
        course_run: &CourseRunKey,
        available_date: Option<DateTime<Utc>>,
    ) -> TaskResult {
        info!(%username, %course_run, "running task award_course_certificate");

        let settings = self.settings()?;
        ensure_issuance_enabled(&settings, "award_course_certificate")?;

        let determine = |err: &dyn std::fmt::Display| {
            let reason =
                format!("Failed to determine course certificates to be awarded for user {username}. {err}");
            warn!(%username, %course_run, "{reason}");
            TaskError::retryable(reason)
        };

        let Some(learner) = self
            .records
            .learner_by_username(username)
            .map_err(|e| determine(&e))?
        else {
            warn!(%username, "task award_course_certificate was called with invalid username");
            return Ok(TaskOutcome::skipped(format!("invalid username {username}")));
        };

        let Some(certificate) = self
            .records
            .eligible_certificate(learner.id, course_run)
            .map_err(|e| determine(&e))?
        else {
            warn!(%username, %course_run, "task award_course_certificate was called without certificate");
            return Ok(TaskOutcome::skipped(format!(
                "no eligible certificate for {course_run} to user {username}"
            )));
        };

        if !certificate.mode.is_certificate_relevant() {
            return Ok(TaskOutcome::skipped(format!(
                "certificate mode {} is not certificate relevant",
                certificate.mode
            )));
        }

        let Some(overview) = self
            .records
            .course_overview(course_run)
            .map_err(|e| determine(&e))?
        else {
            warn!(%course_run, "task award_course_certificate was called without course overview data");
            return Ok(TaskOutcome::skipped(format!(
                "no course overview for {course_run}"
            )));
        };

        let visible_date = available_date_for_certificate(&overview, &certificate, available_date);
        let status = if certificate.is_valid() {
            CredentialStatus::Awarded
        } else {
            CredentialStatus::Revoked
        };
        info!(%username, %course_run, %visible_date, ?status, "posting course certificate");

        match self
            .client
            .post_course_credential(username, course_run, &certificate.mode, status, visible_date)
            .await
        {
            Ok(()) => {
                info!(%username, %course_run, "awarded course certificate");
                Ok(TaskOutcome::Completed)
            }
            Err(ClientError::RateLimited) => Err(rate_limited(&format!(
                "award course certificate to user {username}"
            ))),
            Err(err) => Err(determine(&err)),
        }
    }

    /// Re-send every certificate of a run after its availability date changed.
    pub fn update_certificate_visible_date_on_course_update(
        &self,
        course_run: &CourseRunKey,
        available_date: Option<DateTime<Utc>>,
    ) -> TaskResult {
        info!(%course_run, "running task update_certificate_visible_date_on_course_update");

        let settings = self.settings()?;
        ensure_issuance_enabled(&settings, "update_certificate_visible_date_on_course_update")?;

        let certificates = self
            .records
            .eligible_available_certificates(course_run)
            .map_err(|e| {
                TaskError::retryable(format!("failed to list certificates in {course_run}: {e}"))
            })?;

        self.enqueue(TaskKind::UpdateCourseCertificateConfiguration {
            course_run: course_run.clone(),
            available_date,
        })?;
        info!(
            %course_run,
            users = certificates.len(),
            "resending course certificates"
        );

        for certificate in certificates {
            self.enqueue(TaskKind::award_course_certificate(
                certificate.username,
                course_run.clone(),
                available_date,
            ))?;
        }
        Ok(TaskOutcome::Completed)
    }

    /// Tell the service which mode and availability date the run's
    /// certificate uses.
    pub async fn update_course_certificate_configuration(
        &self,
        course_run: &CourseRunKey,
        available_date: Option<DateTime<Utc>>,
    ) -> TaskResult {
        info!(%course_run, "running task update_course_certificate_configuration");

        let modes: Vec<CourseMode> = self
            .records
            .course_modes(course_run)
            .map_err(|e| TaskError::retryable(format!("failed to read modes of {course_run}: {e}")))?
            .into_iter()
            .filter(CourseMode::is_certificate_relevant)
            .collect();

        let [mode] = modes.as_slice() else {
            warn!(
                %course_run,
                modes = modes.len(),
                "course has no certificate mode or multiple modes"
            );
            return Ok(TaskOutcome::skipped(format!(
                "course {course_run} has {} certificate modes, expected exactly one",
                modes.len()
            )));
        };

        let config = CourseCertificateConfig {
            course_id: course_run.clone(),
            certificate_type: mode.clone(),
            certificate_available_date: available_date,
            is_active: true,
        };
        self.client
            .post_course_certificate_configuration(&config)
            .await
            .map_err(|e| {
                client_failure(
                    &e,
                    format!("failed to post certificate configuration for {course_run}: {e}"),
                )
            })?;

        info!(%course_run, mode = %mode, "updated course certificate configuration");
        Ok(TaskOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::credentials::FailureTarget;
    use crate::jobs::{JobStatus, JobStore};
    use credsync_core::{CertificateStatus, CertificatesDisplayBehavior};

    fn with_overview(world: &World, code: &str) {
        world.records.upsert_course_overview(overview(code));
    }

    #[tokio::test]
    async fn valid_certificate_is_awarded() {
        let world = World::new();
        world.pass("A", 6);
        with_overview(&world, "A");

        let outcome = world.tasks.award_course_certificate(&ada(), &run("A"), None).await;

        assert_eq!(outcome, Ok(TaskOutcome::Completed));
        assert_eq!(world.client.course_status(&ada(), &run("A")), Some(CredentialStatus::Awarded));
        assert_eq!(world.client.course_visible_date(&ada(), &run("A")), Some(at(6)));
    }

    #[tokio::test]
    async fn invalid_certificate_is_revoked() {
        let world = World::new();
        world
            .records
            .upsert_certificate(certificate("A", CertificateStatus::Notpassing, 6));
        with_overview(&world, "A");

        world
            .tasks
            .award_course_certificate(&ada(), &run("A"), None)
            .await
            .unwrap();

        assert_eq!(world.client.course_status(&ada(), &run("A")), Some(CredentialStatus::Revoked));
    }

    #[tokio::test]
    async fn override_date_applies_to_dated_runs() {
        let world = World::new();
        world.pass("A", 6);
        let mut overview = overview("A");
        overview.certificates_display_behavior = CertificatesDisplayBehavior::EndWithDate;
        overview.certificate_available_date = Some(at(10));
        world.records.upsert_course_overview(overview);

        world
            .tasks
            .award_course_certificate(&ada(), &run("A"), Some(at(25)))
            .await
            .unwrap();

        assert_eq!(world.client.course_visible_date(&ada(), &run("A")), Some(at(25)));
    }

    #[tokio::test]
    async fn missing_local_data_is_skipped() {
        let world = World::new();

        // no certificate
        let outcome = world.tasks.award_course_certificate(&ada(), &run("A"), None).await;
        assert!(matches!(outcome, Ok(TaskOutcome::Skipped { .. })));

        // certificate but no overview
        world.pass("A", 6);
        let outcome = world.tasks.award_course_certificate(&ada(), &run("A"), None).await;
        assert!(matches!(outcome, Ok(TaskOutcome::Skipped { .. })));

        // audit mode
        let mut audit = certificate("B", CertificateStatus::Downloadable, 6);
        audit.mode = CourseMode::audit();
        world.records.upsert_certificate(audit);
        with_overview(&world, "B");
        let outcome = world.tasks.award_course_certificate(&ada(), &run("B"), None).await;
        assert!(matches!(outcome, Ok(TaskOutcome::Skipped { .. })));

        assert!(world.client.calls().is_empty());
    }

    #[tokio::test]
    async fn remote_errors_are_classified() {
        let world = World::new();
        world.pass("A", 6);
        with_overview(&world, "A");

        world
            .client
            .fail_next(FailureTarget::CourseRun(run("A")), ClientError::NotFound("nope".into()));
        let err = world
            .tasks
            .award_course_certificate(&ada(), &run("A"), None)
            .await
            .unwrap_err();
        assert!(!err.is_rate_limited());
        assert!(err.reason().contains("nope"));

        world
            .client
            .fail_next(FailureTarget::CourseRun(run("A")), ClientError::RateLimited);
        let err = world
            .tasks
            .award_course_certificate(&ada(), &run("A"), None)
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());

        world.client.fail_next(
            FailureTarget::CourseRun(run("A")),
            ClientError::Client {
                status: 400,
                body: "bad".into(),
            },
        );
        let err = world
            .tasks
            .award_course_certificate(&ada(), &run("A"), None)
            .await
            .unwrap_err();
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn course_update_fans_out_follow_up_tasks() {
        let world = World::new();
        world.records.add_learner(credsync_core::Learner::new(2, "grace"));
        world.pass("A", 6);
        let mut other = certificate("A", CertificateStatus::Downloadable, 7);
        other.user_id = credsync_core::UserId(2);
        other.username = Username::from("grace");
        world.records.upsert_certificate(other);
        let mut failing = certificate("A", CertificateStatus::Notpassing, 7);
        failing.user_id = credsync_core::UserId(3);
        failing.username = Username::from("linus");
        world.records.upsert_certificate(failing);

        let outcome = world
            .tasks
            .update_certificate_visible_date_on_course_update(&run("A"), Some(at(30)));

        assert_eq!(outcome, Ok(TaskOutcome::Completed));
        assert_eq!(
            world
                .queue
                .list_by_task("update_course_certificate_configuration", 10)
                .unwrap()
                .len(),
            1
        );
        let mut awarded: Vec<String> = world
            .queue
            .list_by_task("award_course_certificate", 10)
            .unwrap()
            .into_iter()
            .map(|job| match job.kind {
                TaskKind::AwardCourseCertificate {
                    username,
                    available_date,
                    ..
                } => {
                    assert_eq!(available_date, Some(at(30)));
                    username.to_string()
                }
                other => panic!("unexpected task {other:?}"),
            })
            .collect();
        awarded.sort();
        assert_eq!(awarded, vec!["ada", "grace"]);
    }

    #[test]
    fn course_update_enqueues_nothing_until_certificates_are_listed() {
        let world = World::new();
        world.pass("A", 6);
        world.records.set_unavailable(true);

        let err = world
            .tasks
            .update_certificate_visible_date_on_course_update(&run("A"), Some(at(30)))
            .unwrap_err();
        assert!(!err.is_rate_limited());
        assert_eq!(world.queue.stats().unwrap().pending, 0);

        world.records.set_unavailable(false);
        world
            .tasks
            .update_certificate_visible_date_on_course_update(&run("A"), Some(at(30)))
            .unwrap();
        assert_eq!(
            world
                .queue
                .list_by_task("update_course_certificate_configuration", 10)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn course_update_waits_for_issuance() {
        let world = World::new();
        world.disable_issuance();

        assert!(
            world
                .tasks
                .update_certificate_visible_date_on_course_update(&run("A"), None)
                .is_err()
        );
        assert_eq!(world.queue.list_by_status(Some(JobStatus::Pending), 10).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn configuration_needs_exactly_one_relevant_mode() {
        let world = World::new();
        world.records.add_course_mode(run("A"), CourseMode::audit());

        let outcome = world
            .tasks
            .update_course_certificate_configuration(&run("A"), None)
            .await;
        assert!(matches!(outcome, Ok(TaskOutcome::Skipped { .. })));

        world.records.add_course_mode(run("A"), CourseMode::verified());
        world
            .tasks
            .update_course_certificate_configuration(&run("A"), Some(at(12)))
            .await
            .unwrap();

        let configs = world.client.course_certificate_configs();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].certificate_type, CourseMode::verified());
        assert_eq!(configs[0].certificate_available_date, Some(at(12)));
        assert!(configs[0].is_active);

        world.records.add_course_mode(run("A"), CourseMode::new("professional"));
        let outcome = world
            .tasks
            .update_course_certificate_configuration(&run("A"), None)
            .await;
        assert!(matches!(outcome, Ok(TaskOutcome::Skipped { .. })));
    }
}
