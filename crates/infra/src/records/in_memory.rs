//! In-memory learner records and program catalog for tests/dev.
//!
//! Both can be seeded from a JSON [`RecordsSnapshot`], which is how the CLI
//! runs against an exported copy of the platform data.

use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use credsync_core::{
    CourseCertificate, CourseGrade, CourseMode, CourseOverview, CourseRunKey, Enrollment, Learner,
    Program, UserId, Username,
};

use super::{BoxedSource, LearnerRecords, ModifiedFilter, ProgramCatalog};
use crate::paging::{StoreError, VecSource};

/// Mode offered by a course run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseModeRecord {
    pub course_run: CourseRunKey,
    pub mode: CourseMode,
}

/// Serializable copy of everything the tasks read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordsSnapshot {
    pub learners: Vec<Learner>,
    pub certificates: Vec<CourseCertificate>,
    pub enrollments: Vec<Enrollment>,
    pub grades: Vec<CourseGrade>,
    pub course_overviews: Vec<CourseOverview>,
    pub course_modes: Vec<CourseModeRecord>,
    pub programs: Vec<Program>,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to read records snapshot {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid records snapshot: {0}")]
    Parse(#[from] serde_json::Error),
}

impl RecordsSnapshot {
    pub fn from_json_str(json: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| SnapshotError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }
}

/// Learner records backed by a snapshot behind a lock.
///
/// `set_unavailable(true)` makes the point lookups fail.
#[derive(Debug, Default)]
pub struct InMemoryLearnerRecords {
    state: RwLock<RecordsSnapshot>,
    unavailable: RwLock<bool>,
}

impl InMemoryLearnerRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: RecordsSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
            unavailable: RwLock::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().unwrap_or_else(PoisonError::into_inner) = unavailable;
    }

    fn state(&self) -> RwLockReadGuard<'_, RecordsSnapshot> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RecordsSnapshot>, StoreError> {
        if *self.unavailable.read().unwrap_or_else(PoisonError::into_inner) {
            return Err(StoreError::Unavailable("learner records".to_string()));
        }
        Ok(self.state())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RecordsSnapshot> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_learner(&self, learner: Learner) {
        let mut state = self.write();
        state.learners.retain(|l| l.id != learner.id);
        state.learners.push(learner);
    }

    /// Insert or replace the learner's certificate for the run.
    pub fn upsert_certificate(&self, certificate: CourseCertificate) {
        let mut state = self.write();
        state.certificates.retain(|c| {
            !(c.user_id == certificate.user_id && c.course_run == certificate.course_run)
        });
        state.certificates.push(certificate);
    }

    pub fn add_enrollment(&self, enrollment: Enrollment) {
        self.write().enrollments.push(enrollment);
    }

    pub fn upsert_grade(&self, grade: CourseGrade) {
        let mut state = self.write();
        state
            .grades
            .retain(|g| !(g.user_id == grade.user_id && g.course_run == grade.course_run));
        state.grades.push(grade);
    }

    pub fn upsert_course_overview(&self, overview: CourseOverview) {
        let mut state = self.write();
        state.course_overviews.retain(|o| o.id != overview.id);
        state.course_overviews.push(overview);
    }

    pub fn add_course_mode(&self, course_run: CourseRunKey, mode: CourseMode) {
        self.write()
            .course_modes
            .push(CourseModeRecord { course_run, mode });
    }
}

impl LearnerRecords for InMemoryLearnerRecords {
    fn learner_by_username(&self, username: &Username) -> Result<Option<Learner>, StoreError> {
        Ok(self
            .read()?
            .learners
            .iter()
            .find(|l| &l.username == username)
            .cloned())
    }

    fn learner_by_id(&self, id: UserId) -> Result<Option<Learner>, StoreError> {
        Ok(self.read()?.learners.iter().find(|l| l.id == id).cloned())
    }

    fn certificates_for(&self, user: UserId) -> Result<Vec<CourseCertificate>, StoreError> {
        Ok(self
            .read()?
            .certificates
            .iter()
            .filter(|c| c.user_id == user)
            .cloned()
            .collect())
    }

    fn certificate(
        &self,
        user: UserId,
        course_run: &CourseRunKey,
    ) -> Result<Option<CourseCertificate>, StoreError> {
        Ok(self
            .read()?
            .certificates
            .iter()
            .find(|c| c.user_id == user && &c.course_run == course_run)
            .cloned())
    }

    fn eligible_available_certificates(
        &self,
        course_run: &CourseRunKey,
    ) -> Result<Vec<CourseCertificate>, StoreError> {
        Ok(self
            .read()?
            .certificates
            .iter()
            .filter(|c| &c.course_run == course_run && c.status.is_eligible() && c.is_passing())
            .cloned()
            .collect())
    }

    fn enrollments_for(&self, user: UserId) -> Result<Vec<Enrollment>, StoreError> {
        Ok(self
            .read()?
            .enrollments
            .iter()
            .filter(|e| e.user_id == user)
            .cloned()
            .collect())
    }

    fn course_overview(&self, course_run: &CourseRunKey) -> Result<Option<CourseOverview>, StoreError> {
        Ok(self
            .read()?
            .course_overviews
            .iter()
            .find(|o| &o.id == course_run)
            .cloned())
    }

    fn course_modes(&self, course_run: &CourseRunKey) -> Result<Vec<CourseMode>, StoreError> {
        Ok(self
            .read()?
            .course_modes
            .iter()
            .filter(|m| &m.course_run == course_run)
            .map(|m| m.mode.clone())
            .collect())
    }

    fn read_grade(
        &self,
        user: UserId,
        course_run: &CourseRunKey,
    ) -> Result<Option<CourseGrade>, StoreError> {
        Ok(self
            .read()?
            .grades
            .iter()
            .find(|g| g.user_id == user && &g.course_run == course_run)
            .cloned())
    }

    fn recently_modified_certificates(&self, filter: &ModifiedFilter) -> BoxedSource<'_, CourseCertificate> {
        let mut certs: Vec<_> = self
            .state()
            .certificates
            .iter()
            .filter(|c| filter.matches(c.user_id, &c.course_run, c.modified_date))
            .cloned()
            .collect();
        certs.sort_by_key(|c| c.modified_date);
        Box::new(VecSource::new(certs))
    }

    fn recently_modified_grades(&self, filter: &ModifiedFilter) -> BoxedSource<'_, CourseGrade> {
        let mut grades: Vec<_> = self
            .state()
            .grades
            .iter()
            .filter(|g| filter.matches(g.user_id, &g.course_run, g.modified))
            .cloned()
            .collect();
        grades.sort_by_key(|g| g.modified);
        Box::new(VecSource::new(grades))
    }
}

/// Program catalog held in memory.
///
/// `set_unavailable(true)` makes every read fail, standing in for a catalog
/// outage.
#[derive(Debug, Default)]
pub struct InMemoryProgramCatalog {
    programs: RwLock<Vec<Program>>,
    unavailable: RwLock<bool>,
}

impl InMemoryProgramCatalog {
    pub fn new(programs: Vec<Program>) -> Self {
        Self {
            programs: RwLock::new(programs),
            unavailable: RwLock::new(false),
        }
    }

    pub fn add_program(&self, program: Program) {
        self.programs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(program);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().unwrap_or_else(PoisonError::into_inner) = unavailable;
    }
}

impl ProgramCatalog for InMemoryProgramCatalog {
    fn programs(&self) -> Result<Vec<Program>, StoreError> {
        if *self.unavailable.read().unwrap_or_else(PoisonError::into_inner) {
            return Err(StoreError::Unavailable("program catalog".to_string()));
        }
        Ok(self
            .programs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::paged_query;
    use chrono::{TimeZone, Utc};
    use credsync_core::{CertificateStatus, ProgramCourse, ProgramId};
    use std::io::Write;
    use std::time::Duration;

    fn key(code: &str) -> CourseRunKey {
        CourseRunKey::parse(&format!("course-v1:edX+{code}+1T")).unwrap()
    }

    fn cert(user: u64, code: &str, status: CertificateStatus, day: u32) -> CourseCertificate {
        let at = Utc.with_ymd_and_hms(2024, 6, day, 0, 0, 0).unwrap();
        CourseCertificate {
            user_id: UserId(user),
            username: Username::new(format!("user{user}")),
            course_run: key(code),
            mode: CourseMode::verified(),
            status,
            created_date: at,
            modified_date: at,
        }
    }

    #[test]
    fn upsert_replaces_certificate_for_same_run() {
        let records = InMemoryLearnerRecords::new();
        records.upsert_certificate(cert(1, "A", CertificateStatus::Notpassing, 1));
        records.upsert_certificate(cert(1, "A", CertificateStatus::Downloadable, 2));

        let certs = records.certificates_for(UserId(1)).unwrap();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].status, CertificateStatus::Downloadable);
    }

    #[test]
    fn eligible_lookups_skip_audit_certificates() {
        let records = InMemoryLearnerRecords::new();
        records.upsert_certificate(cert(1, "A", CertificateStatus::AuditPassing, 1));
        records.upsert_certificate(cert(2, "A", CertificateStatus::Downloadable, 1));
        records.upsert_certificate(cert(3, "A", CertificateStatus::Notpassing, 1));

        assert!(records.eligible_certificate(UserId(1), &key("A")).unwrap().is_none());
        assert!(records.eligible_certificate(UserId(3), &key("A")).unwrap().is_some());

        let available = records.eligible_available_certificates(&key("A")).unwrap();
        let users: Vec<_> = available.iter().map(|c| c.user_id).collect();
        assert_eq!(users, vec![UserId(2)]);
    }

    #[test]
    fn recently_modified_are_sorted_and_pageable() {
        let records = InMemoryLearnerRecords::new();
        records.upsert_certificate(cert(1, "A", CertificateStatus::Downloadable, 9));
        records.upsert_certificate(cert(2, "A", CertificateStatus::Downloadable, 3));
        records.upsert_certificate(cert(3, "B", CertificateStatus::Downloadable, 5));

        let filter = ModifiedFilter {
            course_keys: vec![key("A")],
            ..ModifiedFilter::default()
        };
        let source = records.recently_modified_certificates(&filter);
        let users: Vec<_> = paged_query(&source, Duration::ZERO, 1)
            .unwrap()
            .map(|(_, c)| c.user_id)
            .collect();

        assert_eq!(users, vec![UserId(2), UserId(1)]);
    }

    #[test]
    fn catalog_outage_fails_reads() {
        let catalog = InMemoryProgramCatalog::new(vec![Program {
            uuid: ProgramId::new(),
            title: "Data".into(),
            courses: vec![ProgramCourse {
                key: "edX+A".into(),
                course_runs: vec![key("A")],
            }],
        }]);

        assert!(catalog.is_course_run_in_a_program(&key("A")).unwrap());
        assert!(!catalog.is_course_run_in_a_program(&key("B")).unwrap());

        catalog.set_unavailable(true);
        assert!(matches!(catalog.programs(), Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn snapshot_loads_from_json_file() {
        let json = r#"{
            "learners": [{"id": 5, "username": "ada"}],
            "certificates": [{
                "user_id": 5,
                "username": "ada",
                "course_run": "course-v1:edX+A+1T",
                "mode": "verified",
                "status": "downloadable",
                "created_date": "2024-06-01T00:00:00Z",
                "modified_date": "2024-06-02T00:00:00Z"
            }],
            "course_modes": [{"course_run": "course-v1:edX+A+1T", "mode": "verified"}]
        }"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let snapshot = RecordsSnapshot::from_json_file(file.path()).unwrap();
        let records = InMemoryLearnerRecords::from_snapshot(snapshot);

        let learner = records
            .learner_by_username(&Username::from("ada"))
            .unwrap()
            .unwrap();
        assert_eq!(learner.id, UserId(5));
        assert_eq!(records.certificates_for(UserId(5)).unwrap().len(), 1);
        assert_eq!(records.course_modes(&key("A")).unwrap(), vec![CourseMode::verified()]);
        assert!(records.course_overview(&key("A")).unwrap().is_none());
    }

    #[test]
    fn malformed_snapshot_is_rejected() {
        let err = RecordsSnapshot::from_json_str(r#"{"certificates": [{"course_run": "bogus"}]}"#);
        assert!(matches!(err, Err(SnapshotError::Parse(_))));
    }
}
