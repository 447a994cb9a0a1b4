//! Firebase Cloud Messaging module.
//!
//! Single messages go through the FCM v1 `messages:send` method. Lists of
//! messages and multicast sends are split into chunks of at most
//! [`MAX_MESSAGES_PER_CHUNK`] and every chunk is posted concurrently to the
//! batch endpoint.

mod batch;
pub mod models;

use futures::future::try_join_all;
use reqwest::header;
use reqwest_middleware::ClientWithMiddleware;
use serde::Serialize;
use thiserror::Error;

use crate::core::middleware::AuthMiddleware;
use crate::core::{authorized_client, parse_error_response};
use self::models::{BatchResponse, Message, SendResponseInternal};

const FCM_API_ROOT: &str = "https://fcm.googleapis.com";

/// Largest number of messages the batch endpoint accepts in one request.
pub const MAX_MESSAGES_PER_CHUNK: usize = 500;

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("HTTP Request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Middleware error: {0}")]
    MiddlewareError(#[from] reqwest_middleware::Error),
    #[error("API error: {0}")]
    ApiError(String),
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Multipart response parsing error: {0}")]
    MultipartError(String),
}

#[derive(Serialize)]
pub(crate) struct SendRequest<'a> {
    pub validate_only: bool,
    pub message: &'a Message,
}

#[derive(Clone)]
pub struct FirebaseMessaging {
    client: ClientWithMiddleware,
    api_root: String,
    project_id: String,
    chunk_size: usize,
}

impl FirebaseMessaging {
    /// Creates a new `FirebaseMessaging` instance.
    ///
    /// This is typically called via `FirebaseApp::messaging()`.
    pub fn new(middleware: AuthMiddleware, project_id: impl Into<String>) -> Self {
        Self::new_with_client(authorized_client(middleware), FCM_API_ROOT.to_string(), project_id)
    }

    pub(crate) fn new_with_client(
        client: ClientWithMiddleware,
        api_root: String,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_root,
            project_id: project_id.into(),
            chunk_size: MAX_MESSAGES_PER_CHUNK,
        }
    }

    /// Overrides the chunk size. Clamped to `1..=MAX_MESSAGES_PER_CHUNK`.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_MESSAGES_PER_CHUNK);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn send_path(&self) -> String {
        format!("/v1/projects/{}/messages:send", self.project_id)
    }

    /// Sends one message and returns its FCM name.
    pub async fn send_message(&self, message: &Message) -> Result<String, MessagingError> {
        validate_message(message)?;
        self.send_request(message, false).await
    }

    /// Validates a message with FCM without delivering it.
    pub async fn send_message_dry_run(&self, message: &Message) -> Result<String, MessagingError> {
        validate_message(message)?;
        self.send_request(message, true).await
    }

    async fn send_request(&self, message: &Message, dry_run: bool) -> Result<String, MessagingError> {
        let url = format!("{}{}", self.api_root, self.send_path());
        let request = SendRequest {
            validate_only: dry_run,
            message,
        };

        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(MessagingError::ApiError(
                parse_error_response(response, "FCM send failed").await,
            ));
        }

        let sent: SendResponseInternal = response.json().await?;
        Ok(sent.name)
    }

    /// Sends different messages, each to its own target.
    ///
    /// Every message is validated before anything is sent. A chunk that fails
    /// as a whole fails the call; per-message failures are reported in the
    /// returned [`BatchResponse`].
    pub async fn send_messages(&self, messages: &[Message]) -> Result<BatchResponse, MessagingError> {
        for message in messages {
            validate_message(message)?;
        }
        self.send_chunked(messages, false).await
    }

    /// Like [`send_messages`](Self::send_messages) but only validated by FCM.
    pub async fn send_messages_dry_run(&self, messages: &[Message]) -> Result<BatchResponse, MessagingError> {
        for message in messages {
            validate_message(message)?;
        }
        self.send_chunked(messages, true).await
    }

    /// Sends one message to many registration tokens.
    pub async fn send_multicast_message(
        &self,
        tokens: &[&str],
        message: &Message,
    ) -> Result<BatchResponse, MessagingError> {
        if message.target_count() != 0 {
            return Err(MessagingError::InvalidMessage(
                "multicast base message must not have a token, topic or condition".to_string(),
            ));
        }

        let messages: Vec<Message> = tokens.iter().map(|token| message.for_token(token)).collect();
        self.send_chunked(&messages, false).await
    }

    async fn send_chunked(&self, messages: &[Message], dry_run: bool) -> Result<BatchResponse, MessagingError> {
        let chunks: Vec<&[Message]> = messages.chunks(self.chunk_size).collect();
        tracing::debug!(messages = messages.len(), chunks = chunks.len(), "sending FCM batch");

        let results = try_join_all(chunks.into_iter().map(|chunk| self.send_batch(chunk, dry_run))).await?;

        let mut combined = BatchResponse::default();
        for result in results {
            combined.merge(result);
        }
        if combined.failure_count > 0 {
            tracing::warn!(
                success = combined.success_count,
                failure = combined.failure_count,
                "some FCM messages were rejected"
            );
        }
        Ok(combined)
    }

    async fn send_batch(&self, messages: &[Message], dry_run: bool) -> Result<BatchResponse, MessagingError> {
        let url = format!("{}/batch", self.api_root);
        let boundary = batch::new_boundary();
        let body = batch::encode(messages, &self.send_path(), dry_run, &boundary)?;

        let response = self
            .client
            .post(&url)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/mixed; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(MessagingError::ApiError(
                parse_error_response(response, "FCM batch send failed").await,
            ));
        }

        let response_boundary = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(batch::boundary_of)
            .map(str::to_string)
            .ok_or_else(|| MessagingError::MultipartError("response has no multipart boundary".to_string()))?;

        let text = response.text().await?;
        let responses = batch::decode(&text, &response_boundary)?;
        if responses.len() != messages.len() {
            return Err(MessagingError::MultipartError(format!(
                "expected {} responses, got {}",
                messages.len(),
                responses.len()
            )));
        }

        Ok(BatchResponse::from_responses(responses))
    }
}

fn validate_message(message: &Message) -> Result<(), MessagingError> {
    if message.target_count() != 1 {
        return Err(MessagingError::InvalidMessage(
            "message must have exactly one of token, topic or condition".to_string(),
        ));
    }
    Ok(())
}
