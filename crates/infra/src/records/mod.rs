//! Read access to the platform's local learner records and program catalog.
//!
//! Tasks only ever read through these traits; the grading subsystem that
//! writes the records lives elsewhere.

use chrono::{DateTime, Utc};

use credsync_core::{
    CourseCertificate, CourseGrade, CourseMode, CourseOverview, CourseRunKey, Enrollment, Learner,
    Program, UserId, Username,
};

use crate::paging::{PageSource, StoreError};

pub mod in_memory;

pub use in_memory::{InMemoryLearnerRecords, InMemoryProgramCatalog, RecordsSnapshot, SnapshotError};

/// Boxed page source returned by record queries.
pub type BoxedSource<'a, T> = Box<dyn PageSource<Item = T> + Send + Sync + 'a>;

/// Restricts "recently modified" queries.
///
/// The window is half-open: `start <= modified < end`. Empty key/id lists
/// mean "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModifiedFilter {
    pub course_keys: Vec<CourseRunKey>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub user_ids: Vec<UserId>,
}

impl ModifiedFilter {
    pub fn matches(&self, user: UserId, course_run: &CourseRunKey, modified: DateTime<Utc>) -> bool {
        (self.course_keys.is_empty() || self.course_keys.contains(course_run))
            && (self.user_ids.is_empty() || self.user_ids.contains(&user))
            && self.start.is_none_or(|start| modified >= start)
            && self.end.is_none_or(|end| modified < end)
    }
}

pub trait LearnerRecords: Send + Sync {
    fn learner_by_username(&self, username: &Username) -> Result<Option<Learner>, StoreError>;

    fn learner_by_id(&self, id: UserId) -> Result<Option<Learner>, StoreError>;

    /// Every certificate the learner holds, in any status.
    fn certificates_for(&self, user: UserId) -> Result<Vec<CourseCertificate>, StoreError>;

    fn certificate(
        &self,
        user: UserId,
        course_run: &CourseRunKey,
    ) -> Result<Option<CourseCertificate>, StoreError>;

    /// The learner's certificate for the run unless it is an audit certificate.
    fn eligible_certificate(
        &self,
        user: UserId,
        course_run: &CourseRunKey,
    ) -> Result<Option<CourseCertificate>, StoreError> {
        Ok(self
            .certificate(user, course_run)?
            .filter(|cert| cert.status.is_eligible()))
    }

    /// Eligible, passing certificates issued in a run.
    fn eligible_available_certificates(
        &self,
        course_run: &CourseRunKey,
    ) -> Result<Vec<CourseCertificate>, StoreError>;

    fn enrollments_for(&self, user: UserId) -> Result<Vec<Enrollment>, StoreError>;

    fn course_overview(&self, course_run: &CourseRunKey) -> Result<Option<CourseOverview>, StoreError>;

    /// Modes offered for a run.
    fn course_modes(&self, course_run: &CourseRunKey) -> Result<Vec<CourseMode>, StoreError>;

    /// Persisted grade, never computed on demand.
    fn read_grade(
        &self,
        user: UserId,
        course_run: &CourseRunKey,
    ) -> Result<Option<CourseGrade>, StoreError>;

    /// Certificates modified inside the filter, oldest first.
    fn recently_modified_certificates(&self, filter: &ModifiedFilter) -> BoxedSource<'_, CourseCertificate>;

    /// Grades modified inside the filter, oldest first.
    fn recently_modified_grades(&self, filter: &ModifiedFilter) -> BoxedSource<'_, CourseGrade>;
}

/// Source of program definitions.
pub trait ProgramCatalog: Send + Sync {
    fn programs(&self) -> Result<Vec<Program>, StoreError>;

    /// Whether any program offers the run.
    fn is_course_run_in_a_program(&self, course_run: &CourseRunKey) -> Result<bool, StoreError> {
        Ok(self
            .programs()?
            .iter()
            .any(|program| program.contains_course_run(course_run)))
    }
}

impl<T: LearnerRecords + ?Sized> LearnerRecords for std::sync::Arc<T> {
    fn learner_by_username(&self, username: &Username) -> Result<Option<Learner>, StoreError> {
        (**self).learner_by_username(username)
    }

    fn learner_by_id(&self, id: UserId) -> Result<Option<Learner>, StoreError> {
        (**self).learner_by_id(id)
    }

    fn certificates_for(&self, user: UserId) -> Result<Vec<CourseCertificate>, StoreError> {
        (**self).certificates_for(user)
    }

    fn certificate(
        &self,
        user: UserId,
        course_run: &CourseRunKey,
    ) -> Result<Option<CourseCertificate>, StoreError> {
        (**self).certificate(user, course_run)
    }

    fn eligible_certificate(
        &self,
        user: UserId,
        course_run: &CourseRunKey,
    ) -> Result<Option<CourseCertificate>, StoreError> {
        (**self).eligible_certificate(user, course_run)
    }

    fn eligible_available_certificates(
        &self,
        course_run: &CourseRunKey,
    ) -> Result<Vec<CourseCertificate>, StoreError> {
        (**self).eligible_available_certificates(course_run)
    }

    fn enrollments_for(&self, user: UserId) -> Result<Vec<Enrollment>, StoreError> {
        (**self).enrollments_for(user)
    }

    fn course_overview(&self, course_run: &CourseRunKey) -> Result<Option<CourseOverview>, StoreError> {
        (**self).course_overview(course_run)
    }

    fn course_modes(&self, course_run: &CourseRunKey) -> Result<Vec<CourseMode>, StoreError> {
        (**self).course_modes(course_run)
    }

    fn read_grade(
        &self,
        user: UserId,
        course_run: &CourseRunKey,
    ) -> Result<Option<CourseGrade>, StoreError> {
        (**self).read_grade(user, course_run)
    }

    fn recently_modified_certificates(&self, filter: &ModifiedFilter) -> BoxedSource<'_, CourseCertificate> {
        (**self).recently_modified_certificates(filter)
    }

    fn recently_modified_grades(&self, filter: &ModifiedFilter) -> BoxedSource<'_, CourseGrade> {
        (**self).recently_modified_grades(filter)
    }
}

impl<T: ProgramCatalog + ?Sized> ProgramCatalog for std::sync::Arc<T> {
    fn programs(&self) -> Result<Vec<Program>, StoreError> {
        (**self).programs()
    }

    fn is_course_run_in_a_program(&self, course_run: &CourseRunKey) -> Result<bool, StoreError> {
        (**self).is_course_run_in_a_program(course_run)
    }
}
