//! Client side of the Credentials service.
//!
//! [`CredentialsClient`] is the seam every task talks through. Two
//! implementations exist: [`HttpCredentialsClient`] for the real service and
//! [`InMemoryCredentialsClient`] for tests and local runs.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use credsync_core::{CourseMode, CourseRunKey, ProgramId, Username};

pub mod http;
pub mod in_memory;

pub use http::HttpCredentialsClient;
pub use in_memory::{ClientCall, FailureTarget, InMemoryCredentialsClient};

/// `strftime` format of the `visible_date` attribute.
pub const VISIBLE_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Awarded,
    Revoked,
}

/// Kind of credential, as used in list filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialType {
    #[serde(rename = "program")]
    Program,
    #[serde(rename = "course-run")]
    CourseRun,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Program => "program",
            Self::CourseRun => "course-run",
        }
    }
}

/// What a credential is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CredentialSubject {
    #[serde(rename = "program")]
    Program { program_uuid: ProgramId },
    #[serde(rename = "course-run")]
    CourseRun {
        course_run_key: CourseRunKey,
        mode: CourseMode,
    },
}

impl CredentialSubject {
    pub fn credential_type(&self) -> CredentialType {
        match self {
            Self::Program { .. } => CredentialType::Program,
            Self::CourseRun { .. } => CredentialType::CourseRun,
        }
    }

    pub fn program_uuid(&self) -> Option<ProgramId> {
        match self {
            Self::Program { program_uuid } => Some(*program_uuid),
            Self::CourseRun { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialAttribute {
    pub name: String,
    pub value: String,
}

impl CredentialAttribute {
    pub fn visible_date(date: DateTime<Utc>) -> Self {
        Self {
            name: "visible_date".to_string(),
            value: date.format(VISIBLE_DATE_FORMAT).to_string(),
        }
    }
}

/// Body of `POST /credentials/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPayload {
    pub username: Username,
    pub status: CredentialStatus,
    pub credential: CredentialSubject,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<CredentialAttribute>,
}

impl CredentialPayload {
    pub fn award_program(username: &Username, program: ProgramId, visible_date: DateTime<Utc>) -> Self {
        Self {
            username: username.clone(),
            status: CredentialStatus::Awarded,
            credential: CredentialSubject::Program {
                program_uuid: program,
            },
            attributes: vec![CredentialAttribute::visible_date(visible_date)],
        }
    }

    pub fn revoke_program(username: &Username, program: ProgramId) -> Self {
        Self {
            username: username.clone(),
            status: CredentialStatus::Revoked,
            credential: CredentialSubject::Program {
                program_uuid: program,
            },
            attributes: Vec::new(),
        }
    }

    pub fn course_run(
        username: &Username,
        course_run: &CourseRunKey,
        mode: &CourseMode,
        status: CredentialStatus,
        visible_date: DateTime<Utc>,
    ) -> Self {
        Self {
            username: username.clone(),
            status,
            credential: CredentialSubject::CourseRun {
                course_run_key: course_run.clone(),
                mode: mode.clone(),
            },
            attributes: vec![CredentialAttribute::visible_date(visible_date)],
        }
    }
}

/// A credential as listed by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredential {
    pub username: Username,
    pub status: CredentialStatus,
    pub credential: CredentialSubject,
    #[serde(default)]
    pub attributes: Vec<CredentialAttribute>,
}

/// Body of `POST /grades/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradePayload {
    pub username: Username,
    pub course_run: CourseRunKey,
    pub letter_grade: String,
    pub percent_grade: f64,
    pub verified: bool,
}

/// Body of `POST /course_certificates/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseCertificateConfig {
    pub course_id: CourseRunKey,
    pub certificate_type: CourseMode,
    pub certificate_available_date: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// Failure talking to the Credentials service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited by the credentials service")]
    RateLimited,
    #[error("client error ({status}): {body}")]
    Client { status: u16, body: String },
    #[error("server error ({status}): {body}")]
    Server { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            404 => Self::NotFound(body),
            429 => Self::RateLimited,
            400..=499 => Self::Client { status, body },
            _ => Self::Server { status, body },
        }
    }

    /// Worth another attempt later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Server { .. } | Self::Transport(_) | Self::Decode(_)
        )
    }
}

#[async_trait]
pub trait CredentialsClient: Send + Sync {
    /// Award or revoke a course-run credential.
    async fn post_course_credential(
        &self,
        username: &Username,
        course_run: &CourseRunKey,
        mode: &CourseMode,
        status: CredentialStatus,
        visible_date: DateTime<Utc>,
    ) -> Result<(), ClientError>;

    async fn post_program_credential(
        &self,
        username: &Username,
        program: ProgramId,
        visible_date: DateTime<Utc>,
    ) -> Result<(), ClientError>;

    async fn revoke_program_credential(
        &self,
        username: &Username,
        program: ProgramId,
    ) -> Result<(), ClientError>;

    /// Awarded credentials of one type held by the learner.
    async fn list_credentials(
        &self,
        username: &Username,
        credential_type: CredentialType,
    ) -> Result<Vec<UserCredential>, ClientError>;

    async fn post_grade(&self, grade: &GradePayload) -> Result<(), ClientError>;

    async fn post_course_certificate_configuration(
        &self,
        config: &CourseCertificateConfig,
    ) -> Result<(), ClientError>;

    /// Programs the learner already holds an awarded certificate for.
    async fn certified_programs(&self, username: &Username) -> Result<BTreeSet<ProgramId>, ClientError> {
        Ok(self
            .list_credentials(username, CredentialType::Program)
            .await?
            .iter()
            .filter(|c| c.status == CredentialStatus::Awarded)
            .filter_map(|c| c.credential.program_uuid())
            .collect())
    }
}

#[async_trait]
impl<C: CredentialsClient + ?Sized> CredentialsClient for std::sync::Arc<C> {
    async fn post_course_credential(
        &self,
        username: &Username,
        course_run: &CourseRunKey,
        mode: &CourseMode,
        status: CredentialStatus,
        visible_date: DateTime<Utc>,
    ) -> Result<(), ClientError> {
        (**self)
            .post_course_credential(username, course_run, mode, status, visible_date)
            .await
    }

    async fn post_program_credential(
        &self,
        username: &Username,
        program: ProgramId,
        visible_date: DateTime<Utc>,
    ) -> Result<(), ClientError> {
        (**self).post_program_credential(username, program, visible_date).await
    }

    async fn revoke_program_credential(
        &self,
        username: &Username,
        program: ProgramId,
    ) -> Result<(), ClientError> {
        (**self).revoke_program_credential(username, program).await
    }

    async fn list_credentials(
        &self,
        username: &Username,
        credential_type: CredentialType,
    ) -> Result<Vec<UserCredential>, ClientError> {
        (**self).list_credentials(username, credential_type).await
    }

    async fn post_grade(&self, grade: &GradePayload) -> Result<(), ClientError> {
        (**self).post_grade(grade).await
    }

    async fn post_course_certificate_configuration(
        &self,
        config: &CourseCertificateConfig,
    ) -> Result<(), ClientError> {
        (**self).post_course_certificate_configuration(config).await
    }
}
