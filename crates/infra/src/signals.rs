//! Entry points the platform's certificate signals call.
//!
//! Each one checks the switches that gate it and queues the matching task.
//! Returning `Ok(None)` means the switches said no.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use credsync_core::{CourseCertificate, CourseRunKey};

use crate::config::{ConfigError, ConfigProvider, Settings};
use crate::jobs::{Job, JobId, JobStore, JobStoreError, TaskKind};

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to enqueue task: {0}")]
    Queue(#[from] JobStoreError),
}

#[derive(Clone)]
pub struct CertificateSignals {
    config: Arc<dyn ConfigProvider>,
    queue: Arc<dyn JobStore>,
}

impl CertificateSignals {
    pub fn new(config: Arc<dyn ConfigProvider>, queue: Arc<dyn JobStore>) -> Self {
        Self { config, queue }
    }

    /// A certificate was created or changed status.
    pub fn course_cert_changed(
        &self,
        certificate: &CourseCertificate,
    ) -> Result<Option<JobId>, SignalError> {
        let settings = self.config.current()?;
        let org = certificate.course_run.org();
        if !issuance_enabled(&settings, "course_cert_changed")
            || !settings.is_learner_records_enabled_for_org(org)
        {
            debug!(%org, "learner records disabled, ignoring certificate change");
            return Ok(None);
        }

        self.enqueue(TaskKind::award_course_certificate(
            certificate.username.clone(),
            certificate.course_run.clone(),
            None,
        ))
        .map(Some)
    }

    /// A passing certificate was awarded.
    pub fn course_cert_awarded(
        &self,
        certificate: &CourseCertificate,
    ) -> Result<Option<JobId>, SignalError> {
        let settings = self.config.current()?;
        if !issuance_enabled(&settings, "course_cert_awarded") {
            return Ok(None);
        }
        self.enqueue(TaskKind::award_program_certificates(certificate.username.clone()))
            .map(Some)
    }

    /// A previously passing certificate was revoked.
    pub fn course_cert_revoked(
        &self,
        certificate: &CourseCertificate,
    ) -> Result<Option<JobId>, SignalError> {
        let settings = self.config.current()?;
        if !issuance_enabled(&settings, "course_cert_revoked") {
            return Ok(None);
        }
        self.enqueue(TaskKind::revoke_program_certificates(
            certificate.username.clone(),
            certificate.course_run.clone(),
        ))
        .map(Some)
    }

    /// Course staff moved the certificate availability date of a run.
    pub fn course_cert_date_changed(
        &self,
        course_run: &CourseRunKey,
        available_date: Option<DateTime<Utc>>,
    ) -> Result<Option<JobId>, SignalError> {
        let settings = self.config.current()?;
        if !issuance_enabled(&settings, "course_cert_date_changed") {
            return Ok(None);
        }
        self.enqueue(TaskKind::UpdateCertificateVisibleDateOnCourseUpdate {
            course_run: course_run.clone(),
            available_date,
        })
        .map(Some)
    }

    fn enqueue(&self, kind: TaskKind) -> Result<JobId, SignalError> {
        let task = kind.name();
        let id = self.queue.enqueue(Job::new(kind))?;
        info!(job_id = %id, task, "queued task");
        Ok(id)
    }
}

impl std::fmt::Debug for CertificateSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateSignals").finish_non_exhaustive()
    }
}

fn issuance_enabled(settings: &Settings, signal: &str) -> bool {
    let enabled = settings.credentials.is_learner_issuance_enabled;
    if !enabled {
        debug!(signal, "credentials issuance disabled, ignoring signal");
    }
    enabled
}
