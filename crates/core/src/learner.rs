//! Learners, their enrollments and persisted grades.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::certificate::CourseMode;
use crate::id::{CourseRunKey, UserId, Username};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Learner {
    pub id: UserId,
    pub username: Username,
}

impl Learner {
    pub fn new(id: u64, username: impl Into<Username>) -> Self {
        Self {
            id: UserId(id),
            username: username.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub user_id: UserId,
    pub course_run: CourseRunKey,
    pub mode: CourseMode,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Persisted course grade of a learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseGrade {
    pub user_id: UserId,
    pub course_run: CourseRunKey,
    pub letter_grade: String,
    pub percent_grade: f64,
    #[serde(default)]
    pub passed: bool,
    pub modified: DateTime<Utc>,
}
