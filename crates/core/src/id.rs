//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Numeric identifier of a learner account in the local store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl core::fmt::Display for UserId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Stable, unique login name of a learner.
///
/// Usernames are the join key with the Credentials service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Username {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Username {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Username {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of a program in the catalog.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgramId(Uuid);

impl ProgramId {
    /// Create a random identifier. Prefer fixed UUIDs in tests when ordering matters.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProgramId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ProgramId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for ProgramId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for ProgramId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s.trim())
            .map_err(|e| DomainError::invalid_id(format!("ProgramId: {}", e)))?;
        Ok(Self(uuid))
    }
}

/// Key of a single course run.
///
/// Accepts `course-v1:ORG+COURSE+RUN` and the legacy `ORG/COURSE/RUN` form.
/// Equality and ordering follow the original string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CourseRunKey {
    raw: String,
    org: String,
    course: String,
    run: String,
}

impl CourseRunKey {
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let raw = value.trim();
        let parts: Vec<&str> = match raw.strip_prefix("course-v1:") {
            Some(rest) => rest.split('+').collect(),
            None => raw.split('/').collect(),
        };

        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(DomainError::invalid_id(format!(
                "CourseRunKey: malformed key '{}'",
                value
            )));
        }

        Ok(Self {
            raw: raw.to_string(),
            org: parts[0].to_string(),
            course: parts[1].to_string(),
            run: parts[2].to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Organization that owns the run.
    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn course(&self) -> &str {
        &self.course
    }

    pub fn run(&self) -> &str {
        &self.run
    }
}

impl core::fmt::Display for CourseRunKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for CourseRunKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CourseRunKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CourseRunKey> for String {
    fn from(value: CourseRunKey) -> Self {
        value.raw
    }
}
