//! In-memory Credentials service for tests/dev.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use credsync_core::{CourseMode, CourseRunKey, ProgramId, Username};

use super::{
    ClientError, CourseCertificateConfig, CredentialAttribute, CredentialStatus, CredentialSubject,
    CredentialType, CredentialsClient, GradePayload, UserCredential,
};

/// A call received by [`InMemoryCredentialsClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCall {
    PostCourseCredential {
        username: Username,
        course_run: CourseRunKey,
        status: CredentialStatus,
        visible_date: DateTime<Utc>,
    },
    PostProgramCredential {
        username: Username,
        program: ProgramId,
        visible_date: DateTime<Utc>,
    },
    RevokeProgramCredential {
        username: Username,
        program: ProgramId,
    },
    ListCredentials {
        username: Username,
        credential_type: CredentialType,
    },
    PostGrade(GradePayload),
    PostCourseCertificateConfiguration(CourseCertificateConfig),
}

impl ClientCall {
    pub fn is_post(&self) -> bool {
        !matches!(self, Self::ListCredentials { .. })
    }

    fn program(&self) -> Option<ProgramId> {
        match self {
            Self::PostProgramCredential { program, .. }
            | Self::RevokeProgramCredential { program, .. } => Some(*program),
            _ => None,
        }
    }

    fn course_run(&self) -> Option<&CourseRunKey> {
        match self {
            Self::PostCourseCredential { course_run, .. } => Some(course_run),
            Self::PostGrade(grade) => Some(&grade.course_run),
            Self::PostCourseCertificateConfiguration(config) => Some(&config.course_id),
            _ => None,
        }
    }
}

/// Which calls a queued failure applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureTarget {
    /// Award or revoke of this program.
    Program(ProgramId),
    /// Any post about this course run.
    CourseRun(CourseRunKey),
    AnyPost,
    List,
}

impl FailureTarget {
    fn matches(&self, call: &ClientCall) -> bool {
        match self {
            Self::Program(program) => call.program() == Some(*program),
            Self::CourseRun(key) => call.course_run() == Some(key),
            Self::AnyPost => call.is_post(),
            Self::List => !call.is_post(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProgramCredential {
    status: CredentialStatus,
    visible_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CourseCredential {
    mode: CourseMode,
    status: CredentialStatus,
    visible_date: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    programs: BTreeMap<(Username, ProgramId), ProgramCredential>,
    courses: BTreeMap<(Username, CourseRunKey), CourseCredential>,
    grades: Vec<GradePayload>,
    configs: Vec<CourseCertificateConfig>,
    calls: Vec<ClientCall>,
    failures: VecDeque<(FailureTarget, ClientError)>,
}

impl State {
    /// Record the call and pop the first queued failure aimed at it.
    fn receive(&mut self, call: ClientCall) -> Result<(), ClientError> {
        let failure = self
            .failures
            .iter()
            .position(|(target, _)| target.matches(&call));
        self.calls.push(call);
        match failure.and_then(|idx| self.failures.remove(idx)) {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }
}

/// Credentials service kept in memory, with a call log and failure injection.
#[derive(Debug, Default)]
pub struct InMemoryCredentialsClient {
    state: Mutex<State>,
}

impl InMemoryCredentialsClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed an already-awarded program certificate without logging a call.
    pub fn seed_program_credential(&self, username: impl Into<Username>, program: ProgramId) {
        self.state().programs.insert(
            (username.into(), program),
            ProgramCredential {
                status: CredentialStatus::Awarded,
                visible_date: None,
            },
        );
    }

    /// Fail the next call matching `target` with `error`.
    pub fn fail_next(&self, target: FailureTarget, error: ClientError) {
        self.fail_times(target, error, 1);
    }

    pub fn fail_times(&self, target: FailureTarget, error: ClientError, times: usize) {
        let mut state = self.state();
        for _ in 0..times {
            state.failures.push_back((target.clone(), error.clone()));
        }
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.state().calls.clone()
    }

    pub fn post_count(&self) -> usize {
        self.state().calls.iter().filter(|c| c.is_post()).count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn program_status(&self, username: &Username, program: ProgramId) -> Option<CredentialStatus> {
        self.state()
            .programs
            .get(&(username.clone(), program))
            .map(|c| c.status)
    }

    pub fn program_visible_date(&self, username: &Username, program: ProgramId) -> Option<DateTime<Utc>> {
        self.state()
            .programs
            .get(&(username.clone(), program))
            .and_then(|c| c.visible_date)
    }

    pub fn course_status(&self, username: &Username, course_run: &CourseRunKey) -> Option<CredentialStatus> {
        self.state()
            .courses
            .get(&(username.clone(), course_run.clone()))
            .map(|c| c.status)
    }

    pub fn course_visible_date(
        &self,
        username: &Username,
        course_run: &CourseRunKey,
    ) -> Option<DateTime<Utc>> {
        self.state()
            .courses
            .get(&(username.clone(), course_run.clone()))
            .map(|c| c.visible_date)
    }

    pub fn grades(&self) -> Vec<GradePayload> {
        self.state().grades.clone()
    }

    pub fn course_certificate_configs(&self) -> Vec<CourseCertificateConfig> {
        self.state().configs.clone()
    }
}

#[async_trait]
impl CredentialsClient for InMemoryCredentialsClient {
    async fn post_course_credential(
        &self,
        username: &Username,
        course_run: &CourseRunKey,
        mode: &CourseMode,
        status: CredentialStatus,
        visible_date: DateTime<Utc>,
    ) -> Result<(), ClientError> {
        let mut state = self.state();
        state.receive(ClientCall::PostCourseCredential {
            username: username.clone(),
            course_run: course_run.clone(),
            status,
            visible_date,
        })?;
        state.courses.insert(
            (username.clone(), course_run.clone()),
            CourseCredential {
                mode: mode.clone(),
                status,
                visible_date,
            },
        );
        Ok(())
    }

    async fn post_program_credential(
        &self,
        username: &Username,
        program: ProgramId,
        visible_date: DateTime<Utc>,
    ) -> Result<(), ClientError> {
        let mut state = self.state();
        state.receive(ClientCall::PostProgramCredential {
            username: username.clone(),
            program,
            visible_date,
        })?;
        state.programs.insert(
            (username.clone(), program),
            ProgramCredential {
                status: CredentialStatus::Awarded,
                visible_date: Some(visible_date),
            },
        );
        Ok(())
    }

    async fn revoke_program_credential(
        &self,
        username: &Username,
        program: ProgramId,
    ) -> Result<(), ClientError> {
        let mut state = self.state();
        state.receive(ClientCall::RevokeProgramCredential {
            username: username.clone(),
            program,
        })?;
        state
            .programs
            .entry((username.clone(), program))
            .and_modify(|c| c.status = CredentialStatus::Revoked)
            .or_insert(ProgramCredential {
                status: CredentialStatus::Revoked,
                visible_date: None,
            });
        Ok(())
    }

    async fn list_credentials(
        &self,
        username: &Username,
        credential_type: CredentialType,
    ) -> Result<Vec<UserCredential>, ClientError> {
        let mut state = self.state();
        state.receive(ClientCall::ListCredentials {
            username: username.clone(),
            credential_type,
        })?;

        let credentials = match credential_type {
            CredentialType::Program => state
                .programs
                .iter()
                .filter(|((user, _), c)| user == username && c.status == CredentialStatus::Awarded)
                .map(|((user, program), c)| UserCredential {
                    username: user.clone(),
                    status: c.status,
                    credential: CredentialSubject::Program {
                        program_uuid: *program,
                    },
                    attributes: c
                        .visible_date
                        .map(CredentialAttribute::visible_date)
                        .into_iter()
                        .collect(),
                })
                .collect(),
            CredentialType::CourseRun => state
                .courses
                .iter()
                .filter(|((user, _), c)| user == username && c.status == CredentialStatus::Awarded)
                .map(|((user, key), c)| UserCredential {
                    username: user.clone(),
                    status: c.status,
                    credential: CredentialSubject::CourseRun {
                        course_run_key: key.clone(),
                        mode: c.mode.clone(),
                    },
                    attributes: vec![CredentialAttribute::visible_date(c.visible_date)],
                })
                .collect(),
        };
        Ok(credentials)
    }

    async fn post_grade(&self, grade: &GradePayload) -> Result<(), ClientError> {
        let mut state = self.state();
        state.receive(ClientCall::PostGrade(grade.clone()))?;
        state.grades.push(grade.clone());
        Ok(())
    }

    async fn post_course_certificate_configuration(
        &self,
        config: &CourseCertificateConfig,
    ) -> Result<(), ClientError> {
        let mut state = self.state();
        state.receive(ClientCall::PostCourseCertificateConfiguration(config.clone()))?;
        state.configs.push(config.clone());
        Ok(())
    }
}
