//! Programs and learner progress through them.
//!
//! A program is an ordered list of courses; each course can be taken in any of
//! its runs. The progress meter is pure: callers hand in the catalog slice and
//! the learner's certificates/enrollments.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::certificate::CourseCertificate;
use crate::id::{CourseRunKey, ProgramId};
use crate::learner::Enrollment;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramCourse {
    pub key: String,
    pub course_runs: Vec<CourseRunKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub uuid: ProgramId,
    pub title: String,
    pub courses: Vec<ProgramCourse>,
}

impl Program {
    pub fn contains_course_run(&self, course_run: &CourseRunKey) -> bool {
        self.course_runs().any(|run| run == course_run)
    }

    pub fn course_runs(&self) -> impl Iterator<Item = &CourseRunKey> {
        self.courses.iter().flat_map(|c| c.course_runs.iter())
    }
}

/// Computes completion and engagement for one learner.
#[derive(Debug, Clone, Copy)]
pub struct ProgramProgressMeter<'a> {
    programs: &'a [Program],
    certificates: &'a [CourseCertificate],
    enrollments: &'a [Enrollment],
}

impl<'a> ProgramProgressMeter<'a> {
    pub fn new(
        programs: &'a [Program],
        certificates: &'a [CourseCertificate],
        enrollments: &'a [Enrollment],
    ) -> Self {
        Self {
            programs,
            certificates,
            enrollments,
        }
    }

    /// Completed programs keyed by UUID, with the date the program credential
    /// should become visible.
    ///
    /// `available_date` maps a qualifying certificate to its own visible date.
    pub fn completed_programs_with_available_dates<F>(
        &self,
        available_date: F,
    ) -> BTreeMap<ProgramId, DateTime<Utc>>
    where
        F: Fn(&CourseCertificate) -> DateTime<Utc>,
    {
        let mut completed = BTreeMap::new();

        for program in self.programs {
            if program.courses.is_empty() {
                continue;
            }

            let mut program_date: Option<DateTime<Utc>> = None;
            let mut complete = true;

            for course in &program.courses {
                let earliest = self
                    .certificates
                    .iter()
                    .filter(|cert| cert.counts_towards_programs())
                    .filter(|cert| course.course_runs.contains(&cert.course_run))
                    .map(&available_date)
                    .min();

                match earliest {
                    Some(date) => {
                        program_date = Some(program_date.map_or(date, |d| d.max(date)));
                    }
                    None => {
                        complete = false;
                        break;
                    }
                }
            }

            if let (true, Some(date)) = (complete, program_date) {
                completed.insert(program.uuid, date);
            }
        }

        completed
    }

    /// Programs with at least one run the learner is enrolled in or holds a certificate for.
    pub fn engaged_programs(&self) -> Vec<&'a Program> {
        let touched: BTreeSet<&CourseRunKey> = self
            .enrollments
            .iter()
            .filter(|e| e.is_active)
            .map(|e| &e.course_run)
            .chain(self.certificates.iter().map(|c| &c.course_run))
            .collect();

        self.programs
            .iter()
            .filter(|p| p.course_runs().any(|run| touched.contains(run)))
            .collect()
    }

    /// Engaged programs keyed by each course run they contain.
    pub fn invert_programs(&self) -> BTreeMap<CourseRunKey, Vec<&'a Program>> {
        let mut inverted: BTreeMap<CourseRunKey, Vec<&'a Program>> = BTreeMap::new();
        for program in self.engaged_programs() {
            for run in program.course_runs() {
                let entry = inverted.entry(run.clone()).or_default();
                if !entry.iter().any(|p| p.uuid == program.uuid) {
                    entry.push(program);
                }
            }
        }
        inverted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::{CertificateStatus, CourseMode};
    use crate::id::{UserId, Username};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn run(code: &str) -> CourseRunKey {
        CourseRunKey::parse(&format!("course-v1:edX+{code}+1T")).unwrap()
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn program(n: u128, runs: &[&str]) -> Program {
        Program {
            uuid: ProgramId::from_uuid(uuid::Uuid::from_u128(n)),
            title: format!("Program {n}"),
            courses: runs
                .iter()
                .map(|code| ProgramCourse {
                    key: format!("edX+{code}"),
                    course_runs: vec![run(code)],
                })
                .collect(),
        }
    }

    fn cert(code: &str, status: CertificateStatus, day: u32) -> CourseCertificate {
        CourseCertificate {
            user_id: UserId(7),
            username: Username::from("grace"),
            course_run: run(code),
            mode: CourseMode::verified(),
            status,
            created_date: at(day),
            modified_date: at(day),
        }
    }

    fn by_modified(cert: &CourseCertificate) -> DateTime<Utc> {
        cert.modified_date
    }

    #[test]
    fn program_requires_every_course() {
        let programs = vec![program(1, &["A", "B"])];
        let certs = vec![cert("A", CertificateStatus::Downloadable, 3)];
        let meter = ProgramProgressMeter::new(&programs, &certs, &[]);

        assert!(meter.completed_programs_with_available_dates(by_modified).is_empty());
    }

    #[test]
    fn completed_program_uses_latest_certificate_date() {
        let programs = vec![program(1, &["A", "B"])];
        let certs = vec![
            cert("A", CertificateStatus::Downloadable, 3),
            cert("B", CertificateStatus::Downloadable, 9),
        ];
        let meter = ProgramProgressMeter::new(&programs, &certs, &[]);

        let completed = meter.completed_programs_with_available_dates(by_modified);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed.get(&programs[0].uuid), Some(&at(9)));
    }

    #[test]
    fn failing_or_audit_certificates_do_not_complete_programs() {
        let programs = vec![program(1, &["A"])];
        let mut audit = cert("A", CertificateStatus::Downloadable, 3);
        audit.mode = CourseMode::audit();
        let certs = vec![cert("A", CertificateStatus::Notpassing, 2), audit];
        let meter = ProgramProgressMeter::new(&programs, &certs, &[]);

        assert!(meter.completed_programs_with_available_dates(by_modified).is_empty());
    }

    #[test]
    fn earliest_run_of_a_course_counts() {
        let mut p = program(1, &["A"]);
        p.courses[0].course_runs.push(run("A2"));
        let programs = vec![p];
        let certs = vec![
            cert("A2", CertificateStatus::Downloadable, 12),
            cert("A", CertificateStatus::Downloadable, 4),
        ];
        let meter = ProgramProgressMeter::new(&programs, &certs, &[]);

        let completed = meter.completed_programs_with_available_dates(by_modified);
        assert_eq!(completed.values().next(), Some(&at(4)));
    }

    #[test]
    fn inverted_programs_cover_engaged_runs() {
        let programs = vec![program(1, &["A", "B"]), program(2, &["B", "C"]), program(3, &["D"])];
        let enrollments = vec![Enrollment {
            user_id: UserId(7),
            course_run: run("B"),
            mode: CourseMode::verified(),
            is_active: true,
        }];
        let meter = ProgramProgressMeter::new(&programs, &[], &enrollments);

        let inverted = meter.invert_programs();
        let on_b: Vec<_> = inverted[&run("B")].iter().map(|p| p.uuid).collect();
        assert_eq!(on_b, vec![programs[0].uuid, programs[1].uuid]);
        assert_eq!(inverted[&run("A")].len(), 1);
        assert!(!inverted.contains_key(&run("D")));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: a program is completed exactly when every one of its
        /// courses has a passing certificate, and then its date is the max.
        #[test]
        fn completion_matches_per_course_passes(passes in prop::collection::vec(prop::option::of(1u32..28), 1..6)) {
            let codes: Vec<String> = (0..passes.len()).map(|i| format!("C{i}")).collect();
            let code_refs: Vec<&str> = codes.iter().map(String::as_str).collect();
            let programs = vec![program(42, &code_refs)];
            let certs: Vec<_> = passes
                .iter()
                .zip(&codes)
                .filter_map(|(day, code)| day.map(|d| cert(code, CertificateStatus::Downloadable, d)))
                .collect();

            let meter = ProgramProgressMeter::new(&programs, &certs, &[]);
            let completed = meter.completed_programs_with_available_dates(by_modified);

            if passes.iter().all(Option::is_some) {
                let latest = at(passes.iter().flatten().max().copied().unwrap());
                prop_assert_eq!(completed.get(&programs[0].uuid), Some(&latest));
            } else {
                prop_assert!(completed.is_empty());
            }
        }
    }
}
