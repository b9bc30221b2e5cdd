use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Outbound submission seam. The backend's reply to a submitted message
/// arrives later over the transport channel, never in this call's response.
#[async_trait]
pub trait SubmitMessages: Send + Sync {
    /// Hand a composed message to the backend; returns the server-issued
    /// message id on acceptance.
    async fn send(&self, conversation_id: &str, content: &str) -> Result<String, SyncError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest<'a> {
    conversation_id: &'a str,
    message: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    message_id: String,
}

/// HTTP implementation of the submission contract: `POST {base}/messages`
/// with bearer auth, expecting `202 Accepted` and `{"messageId": ...}`.
pub struct SubmissionClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: String,
}

impl SubmissionClient {
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.into(),
        }
    }
}

#[async_trait]
impl SubmitMessages for SubmissionClient {
    async fn send(&self, conversation_id: &str, content: &str) -> Result<String, SyncError> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.auth_token)
            .json(&SubmitRequest {
                conversation_id,
                message: content,
            })
            .send()
            .await
            // Connect failures and timeouts are worth retrying later.
            .map_err(|err| SyncError::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body: SubmitResponse = response
                .json()
                .await
                .map_err(|err| SyncError::Transient(err.to_string()))?;
            return Ok(body.message_id);
        }

        match status.as_u16() {
            401 | 403 => Err(SyncError::Auth),
            code if status.is_server_error() => {
                Err(SyncError::Transient(format!("backend returned {code}")))
            }
            code => Err(SyncError::Rejected(format!("backend returned {code}"))),
        }
    }
}
