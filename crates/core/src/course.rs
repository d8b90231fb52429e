//! Course run overviews and certificate availability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::certificate::CourseCertificate;
use crate::id::CourseRunKey;

/// When certificates of an instructor-paced run become visible to learners.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificatesDisplayBehavior {
    /// Visible as soon as they are generated.
    #[default]
    EarlyNoInfo,
    /// Visible once the course run ends.
    End,
    /// Visible on a date picked by course staff.
    EndWithDate,
}

/// Cached course run metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseOverview {
    pub id: CourseRunKey,
    #[serde(default)]
    pub self_paced: bool,
    #[serde(default)]
    pub certificates_display_behavior: CertificatesDisplayBehavior,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub certificate_available_date: Option<DateTime<Utc>>,
}

impl CourseOverview {
    pub fn new(id: CourseRunKey) -> Self {
        Self {
            id,
            self_paced: false,
            certificates_display_behavior: CertificatesDisplayBehavior::EarlyNoInfo,
            end: None,
            certificate_available_date: None,
        }
    }

    /// Date staff chose for certificates to appear, if any applies to this run.
    ///
    /// `override_date` replaces the stored date for `end_with_date` runs (it is
    /// what a course update carries before the overview is refreshed).
    pub fn staff_available_date(
        &self,
        override_date: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        if self.self_paced {
            return None;
        }
        match self.certificates_display_behavior {
            CertificatesDisplayBehavior::EndWithDate => {
                override_date.or(self.certificate_available_date)
            }
            CertificatesDisplayBehavior::End => self.end,
            CertificatesDisplayBehavior::EarlyNoInfo => None,
        }
    }
}

/// The date a certificate should become visible on the learner's record.
///
/// The later of the staff-set availability date and the certificate's own
/// modification date; just the modification date when staff set nothing.
pub fn available_date_for_certificate(
    overview: &CourseOverview,
    certificate: &CourseCertificate,
    override_date: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let fallback = certificate.modified_date;
    match overview.staff_available_date(override_date) {
        Some(staff) => staff.max(fallback),
        None => fallback,
    }
}
