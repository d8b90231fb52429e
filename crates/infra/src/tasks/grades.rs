use tracing::info;

use credsync_core::{CourseRunKey, Username};

use super::{CredentialsTasks, client_failure};
use crate::credentials::GradePayload;
use crate::jobs::{TaskOutcome, TaskResult};

impl CredentialsTasks {
    pub async fn send_grade_to_credentials(
        &self,
        username: &Username,
        course_run: &CourseRunKey,
        verified: bool,
        letter_grade: &str,
        percent_grade: f64,
    ) -> TaskResult {
        info!(%username, %course_run, "running task send_grade_to_credentials");

        let grade = GradePayload {
            username: username.clone(),
            course_run: course_run.clone(),
            letter_grade: letter_grade.to_string(),
            percent_grade,
            verified,
        };

        self.client.post_grade(&grade).await.map_err(|e| {
            client_failure(
                &e,
                format!("Failed to send grade for user {username} in course {course_run}: {e}"),
            )
        })?;

        info!(%username, %course_run, "sent grade to credentials");
        Ok(TaskOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use crate::credentials::{ClientError, FailureTarget};

    #[tokio::test]
    async fn posts_grade_as_given() {
        let world = World::new();

        world
            .tasks
            .send_grade_to_credentials(&ada(), &run("A"), true, "B", 0.81)
            .await
            .unwrap();

        let grades = world.client.grades();
        assert_eq!(grades.len(), 1);
        assert_eq!(grades[0].letter_grade, "B");
        assert_eq!(grades[0].percent_grade, 0.81);
        assert!(grades[0].verified);
    }

    #[tokio::test]
    async fn every_failure_is_retried() {
        let world = World::new();
        world
            .client
            .fail_next(FailureTarget::CourseRun(run("A")), ClientError::NotFound(String::new()));
        world
            .client
            .fail_next(FailureTarget::CourseRun(run("A")), ClientError::RateLimited);

        let first = world
            .tasks
            .send_grade_to_credentials(&ada(), &run("A"), true, "B", 0.81)
            .await
            .unwrap_err();
        let second = world
            .tasks
            .send_grade_to_credentials(&ada(), &run("A"), true, "B", 0.81)
            .await
            .unwrap_err();

        assert!(!first.is_rate_limited());
        assert!(second.is_rate_limited());
        assert!(world.client.grades().is_empty());
    }
}
