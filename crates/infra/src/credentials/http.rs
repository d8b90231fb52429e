//! Typed reqwest wrapper for the Credentials service v2 API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use credsync_core::{CourseMode, CourseRunKey, ProgramId, Username};

use super::{
    ClientError, CourseCertificateConfig, CredentialPayload, CredentialStatus, CredentialType,
    CredentialsClient, GradePayload, UserCredential,
};
use crate::config::CredentialsApiConfig;

const API_PATH: &str = "/api/credentials/v2";

/// Upper bound on `next` links followed by one listing.
const MAX_LIST_PAGES: usize = 1000;

/// HTTP client for the Credentials service.
#[derive(Debug, Clone)]
pub struct HttpCredentialsClient {
    http: reqwest::Client,
    base_url: String,
    service_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListResponse {
    Page {
        #[serde(default)]
        next: Option<String>,
        results: Vec<UserCredential>,
    },
    Plain(Vec<UserCredential>),
}

impl HttpCredentialsClient {
    /// Build a client from the `[credentials]` settings.
    pub fn from_config(config: &CredentialsApiConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ClientError::Transport(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.internal_service_url.trim_end_matches('/').to_string(),
            service_token: config.service_token.clone(),
        })
    }

    /// Override the base URL (for testing with wiremock).
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn url(&self, resource: &str) -> String {
        format!("{}{}/{}/", self.base_url, API_PATH, resource)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.service_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post_json<T: Serialize + ?Sized>(&self, resource: &str, body: &T) -> Result<(), ClientError> {
        let resp = self
            .authorized(self.http.post(self.url(resource)))
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("POST {resource} failed: {e}")))?;

        check_status(resp).await.map(|_| ())
    }

    async fn post_credential(&self, payload: &CredentialPayload) -> Result<(), ClientError> {
        debug!(
            username = %payload.username,
            status = ?payload.status,
            credential_type = payload.credential.credential_type().as_str(),
            "posting credential"
        );
        self.post_json("credentials", payload).await
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ClientError::from_status(status.as_u16(), body))
}

#[async_trait]
impl CredentialsClient for HttpCredentialsClient {
    async fn post_course_credential(
        &self,
        username: &Username,
        course_run: &CourseRunKey,
        mode: &CourseMode,
        status: CredentialStatus,
        visible_date: DateTime<Utc>,
    ) -> Result<(), ClientError> {
        let payload = CredentialPayload::course_run(username, course_run, mode, status, visible_date);
        self.post_credential(&payload).await
    }

    async fn post_program_credential(
        &self,
        username: &Username,
        program: ProgramId,
        visible_date: DateTime<Utc>,
    ) -> Result<(), ClientError> {
        let payload = CredentialPayload::award_program(username, program, visible_date);
        self.post_credential(&payload).await
    }

    async fn revoke_program_credential(
        &self,
        username: &Username,
        program: ProgramId,
    ) -> Result<(), ClientError> {
        let payload = CredentialPayload::revoke_program(username, program);
        self.post_credential(&payload).await
    }

    async fn list_credentials(
        &self,
        username: &Username,
        credential_type: CredentialType,
    ) -> Result<Vec<UserCredential>, ClientError> {
        let mut credentials = Vec::new();
        let mut request = self.authorized(self.http.get(self.url("credentials")).query(&[
            ("username", username.as_str()),
            ("type", credential_type.as_str()),
            ("status", "awarded"),
        ]));

        for _ in 0..MAX_LIST_PAGES {
            let resp = request
                .send()
                .await
                .map_err(|e| ClientError::Transport(format!("GET credentials failed: {e}")))?;
            let resp = check_status(resp).await?;

            let page: ListResponse = resp
                .json()
                .await
                .map_err(|e| ClientError::Decode(e.to_string()))?;

            match page {
                ListResponse::Plain(results) => {
                    credentials.extend(results);
                    return Ok(credentials);
                }
                ListResponse::Page { next, results } => {
                    credentials.extend(results);
                    match next {
                        Some(next) => request = self.authorized(self.http.get(next)),
                        None => return Ok(credentials),
                    }
                }
            }
        }

        Err(ClientError::Decode(format!(
            "credential listing exceeded {MAX_LIST_PAGES} pages"
        )))
    }

    async fn post_grade(&self, grade: &GradePayload) -> Result<(), ClientError> {
        self.post_json("grades", grade).await
    }

    async fn post_course_certificate_configuration(
        &self,
        config: &CourseCertificateConfig,
    ) -> Result<(), ClientError> {
        self.post_json("course_certificates", config).await
    }
}
