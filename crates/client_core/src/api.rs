use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, UserId},
    error::{ApiError, ApiException},
    protocol::{
        CreateConversationRequest, CreateConversationResponse, LoginRequest, LoginResponse,
        MediaUploadResponse, MessagePayload,
    },
};
use tracing::{debug, info, warn};

use crate::{
    credentials::Credential,
    error::{ChatError, Result},
    history::HistorySource,
};

/// REST client for the marketplace backend.
#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Transport(format!("failed to build http client: {e}")))?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn login(&self, phone_number: &str, password: &str) -> Result<Credential> {
        let request = self
            .http
            .post(format!("{}/users/login", self.base_url))
            .json(&LoginRequest {
                phone_number: phone_number.to_string(),
                password: password.to_string(),
            });
        let response: LoginResponse = send_json(request).await?;
        info!(user_id = response.user_id.0, "api: logged in");
        Ok(Credential {
            user_id: response.user_id,
            token: response.session_token,
        })
    }

    pub async fn create_conversation(
        &self,
        credential: &Credential,
        participant_ids: Vec<UserId>,
    ) -> Result<ConversationId> {
        let request = self
            .http
            .post(format!("{}/conversations", self.base_url))
            .bearer_auth(&credential.token)
            .json(&CreateConversationRequest { participant_ids });
        let response: CreateConversationResponse = send_json(request).await?;
        info!(
            conversation_id = response.conversation_id.0,
            "api: conversation created"
        );
        Ok(response.conversation_id)
    }

    /// Uploads an image and returns the URL to reference from a message.
    pub async fn upload_media(
        &self,
        credential: &Credential,
        filename: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        let size = bytes.len();
        let part = multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime_type)
            .map_err(|e| ChatError::Validation(format!("invalid mime type {mime_type}: {e}")))?;
        let request = self
            .http
            .post(format!("{}/uploads", self.base_url))
            .bearer_auth(&credential.token)
            .multipart(multipart::Form::new().part("file", part));
        let response: MediaUploadResponse = send_json(request).await?;
        info!(filename, size, "api: media uploaded");
        Ok(response.url)
    }

    pub async fn fetch_history(
        &self,
        conversation_id: ConversationId,
        credential: &Credential,
    ) -> Result<Vec<MessagePayload>> {
        let request = self
            .http
            .get(format!("{}/messages/{}", self.base_url, conversation_id.0))
            .bearer_auth(&credential.token);
        let messages: Vec<MessagePayload> = send_json(request).await?;
        debug!(
            conversation_id = conversation_id.0,
            count = messages.len(),
            "history: loaded"
        );
        Ok(messages)
    }
}

#[async_trait]
impl HistorySource for BackendClient {
    async fn load(
        &self,
        conversation_id: ConversationId,
        credential: &Credential,
    ) -> Result<Vec<MessagePayload>> {
        self.fetch_history(conversation_id, credential).await
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
    let response = check_status(request.send().await?).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| ChatError::Transport(format!("unexpected response body: {e}")))
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    let detail = match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => ApiException::from(api_error).to_string(),
        Err(_) if body.trim().is_empty() => status.to_string(),
        Err(_) => format!("{status}: {}", body.trim()),
    };
    warn!(%status, path = %url, "api: request failed: {detail}");

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ChatError::Unauthorized(detail),
        StatusCode::NOT_FOUND => ChatError::NotFound(detail),
        _ => ChatError::Transport(detail),
    })
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
