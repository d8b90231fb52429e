//! Course certificates, their statuses and the modes that matter for credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{CourseRunKey, UserId, Username};

/// Lifecycle status of a generated course certificate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    Downloadable,
    Notpassing,
    Generating,
    Unavailable,
    AuditPassing,
    AuditNotpassing,
    Unverified,
    Invalidated,
    Error,
    Deleted,
}

impl CertificateStatus {
    /// Statuses that count as having passed the course run.
    pub fn is_passing(&self) -> bool {
        matches!(self, Self::Downloadable | Self::Generating)
    }

    /// Audit certificates never leave the platform.
    pub fn is_eligible(&self) -> bool {
        !matches!(self, Self::AuditPassing | Self::AuditNotpassing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Downloadable => "downloadable",
            Self::Notpassing => "notpassing",
            Self::Generating => "generating",
            Self::Unavailable => "unavailable",
            Self::AuditPassing => "audit_passing",
            Self::AuditNotpassing => "audit_notpassing",
            Self::Unverified => "unverified",
            Self::Invalidated => "invalidated",
            Self::Error => "error",
            Self::Deleted => "deleted",
        }
    }
}

impl core::fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enrollment/certificate mode slug (e.g. `verified`, `audit`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CourseMode(String);

impl CourseMode {
    /// Modes for which a certificate is worth telling the Credentials service about.
    pub const CERTIFICATE_RELEVANT: [&'static str; 8] = [
        "verified",
        "professional",
        "no-id-professional",
        "credit",
        "masters",
        "executive-education",
        "paid-executive-education",
        "paid-bootcamp",
    ];

    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    pub fn verified() -> Self {
        Self::new("verified")
    }

    pub fn audit() -> Self {
        Self::new("audit")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_certificate_relevant(&self) -> bool {
        Self::CERTIFICATE_RELEVANT.contains(&self.0.as_str())
    }
}

impl core::fmt::Display for CourseMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CourseMode {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A learner's certificate for one course run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseCertificate {
    pub user_id: UserId,
    pub username: Username,
    pub course_run: CourseRunKey,
    pub mode: CourseMode,
    pub status: CertificateStatus,
    pub created_date: DateTime<Utc>,
    pub modified_date: DateTime<Utc>,
}

impl CourseCertificate {
    /// Only downloadable certificates are sent as `awarded`; everything else revokes.
    pub fn is_valid(&self) -> bool {
        self.status == CertificateStatus::Downloadable
    }

    pub fn is_passing(&self) -> bool {
        self.status.is_passing()
    }

    /// Passing and in a mode that earns program credit.
    pub fn counts_towards_programs(&self) -> bool {
        self.is_passing() && self.mode.is_certificate_relevant()
    }
}
