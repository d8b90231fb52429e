//! `credsync-core`: domain building blocks for learner credentials.
//!
//! This crate contains **pure domain** logic (no IO, no HTTP, no storage):
//! identifiers, certificates, course availability and program progress.

pub mod certificate;
pub mod course;
pub mod error;
pub mod id;
pub mod learner;
pub mod program;

pub use certificate::{CertificateStatus, CourseCertificate, CourseMode};
pub use course::{CertificatesDisplayBehavior, CourseOverview, available_date_for_certificate};
pub use error::{DomainError, DomainResult};
pub use id::{CourseRunKey, ProgramId, UserId, Username};
pub use learner::{CourseGrade, Enrollment, Learner};
pub use program::{Program, ProgramCourse, ProgramProgressMeter};
