use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use credsync_core::{
    CourseRunKey, Learner, ProgramId, ProgramProgressMeter, Username, available_date_for_certificate,
};

use super::{CredentialsTasks, client_failure, ensure_issuance_enabled, rate_limited};
use crate::credentials::ClientError;
use crate::jobs::{TaskError, TaskOutcome, TaskResult};
use crate::paging::StoreError;

/// What happened to one program of a batch.
enum ItemOutcome {
    Done,
    /// Logged and dropped; a retry would get the same answer.
    Ignored,
    /// Counted towards the aggregate retry.
    Failed,
}

fn classify(err: &ClientError) -> ItemOutcome {
    match err {
        ClientError::NotFound(_) | ClientError::Client { .. } => ItemOutcome::Ignored,
        _ => ItemOutcome::Failed,
    }
}

fn program_list(programs: &[ProgramId]) -> String {
    let joined: Vec<String> = programs.iter().map(ToString::to_string).collect();
    format!("[{}]", joined.join(", "))
}

impl CredentialsTasks {
    /// Award a program certificate for every program the learner completed
    /// and does not hold yet.
    pub async fn award_program_certificates(&self, username: &Username) -> TaskResult {
        info!(%username, "running task award_program_certificates");

        let settings = self.settings()?;
        if settings.programs_without_certificates.is_all() {
            return Ok(TaskOutcome::skipped(
                "program certificates are disabled for all programs",
            ));
        }
        ensure_issuance_enabled(&settings, "award_program_certificates")?;

        let determine = |err: &dyn std::fmt::Display| {
            let reason = format!(
                "Failed to determine program certificates to be awarded for user {username}. {err}"
            );
            warn!(%username, "{reason}");
            reason
        };

        let Some(learner) = self
            .records
            .learner_by_username(username)
            .map_err(|e| TaskError::retryable(determine(&e)))?
        else {
            warn!(%username, "task award_program_certificates was called with invalid username");
            return Ok(TaskOutcome::skipped(format!("invalid username {username}")));
        };

        let completed = self
            .completed_programs(&learner)
            .map_err(|e| TaskError::retryable(determine(&e)))?;
        if completed.is_empty() {
            info!(%username, "task award_program_certificates was called with no completed programs");
            return Ok(TaskOutcome::Completed);
        }

        let certified = self
            .client
            .certified_programs(username)
            .await
            .map_err(|e| client_failure(&e, determine(&e)))?;

        let new_programs: Vec<(ProgramId, DateTime<Utc>)> = completed
            .into_iter()
            .filter(|(program, _)| !certified.contains(program))
            .filter(|(program, _)| !settings.programs_without_certificates.excludes(program))
            .collect();
        if new_programs.is_empty() {
            info!(%username, "user is not eligible for any new program certificates");
            return Ok(TaskOutcome::Completed);
        }

        let mut failed = Vec::new();
        for (program, visible_date) in new_programs {
            info!(%username, %program, %visible_date, "awarding program certificate");
            let outcome = match self
                .client
                .post_program_credential(username, program, visible_date)
                .await
            {
                Ok(()) => ItemOutcome::Done,
                Err(ClientError::RateLimited) => {
                    return Err(rate_limited(&format!("award certificates to user {username}")));
                }
                Err(err) => {
                    warn!(
                        %username,
                        %program,
                        error = %err,
                        "failed to award program certificate; the program might not be configured"
                    );
                    classify(&err)
                }
            };
            match outcome {
                ItemOutcome::Done => info!(%username, %program, "awarded program certificate"),
                ItemOutcome::Ignored => {}
                ItemOutcome::Failed => failed.push(program),
            }
        }

        if !failed.is_empty() {
            info!(%username, failed = failed.len(), "retrying task to award failed certificates");
            return Err(TaskError::retryable(format!(
                "Failed to award certificate for user {username} for programs {}",
                program_list(&failed)
            )));
        }

        info!(%username, "successfully completed the task award_program_certificates");
        Ok(TaskOutcome::Completed)
    }

    /// Revoke the learner's program certificates for programs that contain
    /// `course_run`.
    pub async fn revoke_program_certificates(
        &self,
        username: &Username,
        course_run: &CourseRunKey,
    ) -> TaskResult {
        info!(%username, %course_run, "running task revoke_program_certificates");

        let settings = self.settings()?;
        ensure_issuance_enabled(&settings, "revoke_program_certificates")?;

        let determine = |err: &dyn std::fmt::Display| {
            let reason = format!(
                "Failed to determine program certificates to be revoked for user {username} \
                 with course {course_run}. {err}"
            );
            warn!(%username, %course_run, "{reason}");
            reason
        };

        let Some(learner) = self
            .records
            .learner_by_username(username)
            .map_err(|e| TaskError::retryable(determine(&e)))?
        else {
            warn!(%username, "task revoke_program_certificates was called with invalid username");
            return Ok(TaskOutcome::skipped(format!("invalid username {username}")));
        };

        let engaged = self
            .programs_containing(&learner, course_run)
            .map_err(|e| TaskError::retryable(determine(&e)))?;
        if engaged.is_empty() {
            info!(
                %username,
                %course_run,
                "task revoke_program_certificates was called with no engaged programs"
            );
            return Ok(TaskOutcome::Completed);
        }

        let certified = self
            .client
            .certified_programs(username)
            .await
            .map_err(|e| client_failure(&e, determine(&e)))?;
        let revokable: Vec<ProgramId> = engaged
            .into_iter()
            .filter(|program| certified.contains(program))
            .collect();
        if revokable.is_empty() {
            info!(%username, "there are no program certificates to revoke");
            return Ok(TaskOutcome::Completed);
        }

        let mut failed = Vec::new();
        for program in revokable {
            let outcome = match self.client.revoke_program_credential(username, program).await {
                Ok(()) => ItemOutcome::Done,
                Err(ClientError::RateLimited) => {
                    return Err(rate_limited(&format!("revoke certificates for user {username}")));
                }
                Err(err) => {
                    warn!(%username, %program, error = %err, "failed to revoke program certificate");
                    classify(&err)
                }
            };
            match outcome {
                ItemOutcome::Done => info!(%username, %program, "revoked program certificate"),
                ItemOutcome::Ignored => {}
                ItemOutcome::Failed => failed.push(program),
            }
        }

        if !failed.is_empty() {
            info!(%username, failed = failed.len(), "retrying task to revoke failed certificates");
            return Err(TaskError::retryable(format!(
                "Failed to revoke certificate for user {username} for programs {}",
                program_list(&failed)
            )));
        }

        info!(%username, "successfully completed the task revoke_program_certificates");
        Ok(TaskOutcome::Completed)
    }

    /// Completed programs and their visible dates, ordered by program id.
    fn completed_programs(
        &self,
        learner: &Learner,
    ) -> Result<BTreeMap<ProgramId, DateTime<Utc>>, StoreError> {
        let certificates = self.records.certificates_for(learner.id)?;
        let enrollments = self.records.enrollments_for(learner.id)?;
        let programs = self.catalog.programs()?;

        let mut overviews = BTreeMap::new();
        for cert in certificates.iter().filter(|c| c.counts_towards_programs()) {
            if let Entry::Vacant(slot) = overviews.entry(cert.course_run.clone()) {
                slot.insert(self.records.course_overview(&cert.course_run)?);
            }
        }

        let meter = ProgramProgressMeter::new(&programs, &certificates, &enrollments);
        Ok(meter.completed_programs_with_available_dates(|cert| {
            match overviews.get(&cert.course_run) {
                Some(Some(overview)) => available_date_for_certificate(overview, cert, None),
                _ => cert.modified_date,
            }
        }))
    }

    /// Engaged programs that offer `course_run`.
    fn programs_containing(
        &self,
        learner: &Learner,
        course_run: &CourseRunKey,
    ) -> Result<Vec<ProgramId>, StoreError> {
        let certificates = self.records.certificates_for(learner.id)?;
        let enrollments = self.records.enrollments_for(learner.id)?;
        let programs = self.catalog.programs()?;

        let meter = ProgramProgressMeter::new(&programs, &certificates, &enrollments);
        let mut found: Vec<ProgramId> = meter
            .invert_programs()
            .get(course_run)
            .map(|programs| programs.iter().map(|p| p.uuid).collect())
            .unwrap_or_default();
        found.sort();
        found.dedup();
        Ok(found)
    }
}
