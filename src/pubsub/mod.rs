//! Google Cloud Pub/Sub module.
//!
//! [`PubSubService`] manages topics and subscriptions over the Pub/Sub REST API
//! and turns a subscription into a [`SubscriptionStream`] that application code
//! pulls messages from.
//!
//! # Subscription naming
//!
//! A shared subscription is named `<name>-shared` and load-balances between
//! every process observing it. A non-shared one is named `<name>-<hostname>`,
//! gives each host its own copy of every message and is deleted again by
//! [`PubSubService::shutdown`].
//!
//! # Examples
//!
//! ```rust,no_run
//! # use firebase_cloud_kit::pubsub::PubSubService;
//! # async fn run(pubsub: PubSubService) -> Result<(), firebase_cloud_kit::pubsub::PubSubError> {
//! let events = pubsub.observe_subscription("orders", "billing", false).await?;
//! while let Some(message) = events.next_message().await {
//!     println!("{:?}", message.text());
//!     message.ack().await?;
//! }
//! pubsub.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod models;
pub mod pull;
pub mod subscription;


use std::sync::{Mutex, MutexGuard};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use thiserror::Error;

use crate::core::middleware::AuthMiddleware;
use crate::core::{authenticated_client, authorized_client, parse_error_response};
use self::models::{
    CreateSubscriptionRequest, ListTopicSubscriptionsResponse, ListTopicsResponse, PublishRequest,
    PublishResponse, PubsubMessage, Subscription, Topic,
};
pub use self::pull::{PullSource, PulledMessage};
pub use self::subscription::{MessageSource, SourceEvent, StreamState, SubscriptionStream};

const PUBSUB_V1_API: &str = "https://pubsub.googleapis.com/v1";

/// Publishing is tried this many times before giving up.
pub const PUBLISH_ATTEMPTS: u32 = 3;

/// Errors that can occur during Pub/Sub operations.
#[derive(Error, Debug)]
pub enum PubSubError {
    /// Wrapper for `reqwest::Error`.
    #[error("HTTP Request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    /// Wrapper for `reqwest_middleware::Error`.
    #[error("Middleware error: {0}")]
    MiddlewareError(#[from] reqwest_middleware::Error),
    /// Errors returned by the Pub/Sub API.
    #[error("API error: {0}")]
    ApiError(String),
    /// The topic or subscription does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
    /// Wrapper for `serde_json::Error`.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Client for Cloud Pub/Sub topics and subscriptions.
pub struct PubSubService {
    client: ClientWithMiddleware,
    // no transport retries; `publish_message` counts its own attempts
    publish_client: ClientWithMiddleware,
    api_root: String,
    project_id: String,
    hostname: String,
    transient: Mutex<Vec<SubscriptionStream<PullSource>>>,
}

impl PubSubService {
    /// Creates a new `PubSubService`.
    ///
    /// This is typically called via `FirebaseApp::pubsub()`.
    pub fn new(middleware: AuthMiddleware, project_id: impl Into<String>) -> Self {
        Self::new_with_api_root(middleware, PUBSUB_V1_API.to_string(), project_id)
    }

    pub(crate) fn new_with_api_root(
        middleware: AuthMiddleware,
        api_root: String,
        project_id: impl Into<String>,
    ) -> Self {
        let mut service = Self::new_with_client(authorized_client(middleware.clone()), api_root, project_id);
        service.publish_client = authenticated_client(middleware);
        service
    }

    /// Creates a service with a custom client and API root. Internal use only,
    /// primarily for testing.
    pub(crate) fn new_with_client(
        client: ClientWithMiddleware,
        api_root: String,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            publish_client: client.clone(),
            client,
            api_root,
            project_id: project_id.into(),
            hostname: local_hostname(),
            transient: Mutex::new(Vec::new()),
        }
    }

    /// Overrides the host name used to suffix non-shared subscriptions.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn subscription_full_name(&self, name: &str, shared: bool) -> String {
        let postfix = if shared { "shared" } else { self.hostname.as_str() };
        format!("{}-{}", name, postfix)
    }

    fn project_url(&self) -> String {
        format!("{}/projects/{}", self.api_root, self.project_id)
    }

    fn resource_url(&self, resource_name: &str) -> String {
        format!("{}/{}", self.api_root, resource_name)
    }

    fn transient(&self) -> MutexGuard<'_, Vec<SubscriptionStream<PullSource>>> {
        self.transient.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Looks a topic up by its short name.
    pub async fn get_topic(&self, name: &str) -> Result<Option<Topic>, PubSubError> {
        let url = format!("{}/topics", self.project_url());
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.client.get(&url);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(PubSubError::ApiError(
                    parse_error_response(response, "List topics failed").await,
                ));
            }

            let page: ListTopicsResponse = response.json().await?;
            if let Some(topic) = page.topics.into_iter().find(|topic| topic.short_name() == name) {
                return Ok(Some(topic));
            }

            match page.next_page_token.filter(|token| !token.is_empty()) {
                Some(token) => page_token = Some(token),
                None => return Ok(None),
            }
        }
    }

    pub async fn create_topic(&self, name: &str) -> Result<Topic, PubSubError> {
        let url = format!("{}/topics/{}", self.project_url(), name);

        let response = self.client.put(&url).json(&serde_json::json!({})).send().await?;
        if !response.status().is_success() {
            return Err(PubSubError::ApiError(
                parse_error_response(response, "Create topic failed").await,
            ));
        }

        let topic: Topic = response.json().await?;
        tracing::debug!(topic = %topic.name, "created topic");
        Ok(topic)
    }

    pub async fn get_or_create_topic(&self, name: &str) -> Result<Topic, PubSubError> {
        match self.get_topic(name).await? {
            Some(topic) => Ok(topic),
            None => self.create_topic(name).await,
        }
    }

    /// Finds the subscription `name` (suffixed per `shared`) attached to `topic`.
    pub async fn get_subscription(
        &self,
        topic: &Topic,
        name: &str,
        shared: bool,
    ) -> Result<Option<Subscription>, PubSubError> {
        let full_name = self.subscription_full_name(name, shared);
        let url = format!("{}/subscriptions", self.resource_url(&topic.name));
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.client.get(&url);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let response = request.send().await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Err(PubSubError::NotFound(
                    parse_error_response(response, "List subscriptions failed").await,
                ));
            }
            if !response.status().is_success() {
                return Err(PubSubError::ApiError(
                    parse_error_response(response, "List subscriptions failed").await,
                ));
            }

            let page: ListTopicSubscriptionsResponse = response.json().await?;
            let found = page
                .subscriptions
                .into_iter()
                .find(|path| path.rsplit('/').next() == Some(full_name.as_str()));
            if let Some(path) = found {
                return Ok(Some(Subscription {
                    name: path,
                    topic: topic.name.clone(),
                    ack_deadline_seconds: None,
                }));
            }

            match page.next_page_token.filter(|token| !token.is_empty()) {
                Some(token) => page_token = Some(token),
                None => return Ok(None),
            }
        }
    }

    pub async fn create_subscription(
        &self,
        topic: &Topic,
        name: &str,
        shared: bool,
    ) -> Result<Subscription, PubSubError> {
        let full_name = self.subscription_full_name(name, shared);
        let url = format!("{}/subscriptions/{}", self.project_url(), full_name);
        let request = CreateSubscriptionRequest {
            topic: &topic.name,
            ack_deadline_seconds: None,
        };

        let response = self.client.put(&url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(PubSubError::ApiError(
                parse_error_response(response, "Create subscription failed").await,
            ));
        }

        let subscription: Subscription = response.json().await?;
        tracing::debug!(subscription = %subscription.name, topic = %topic.name, "created subscription");
        Ok(subscription)
    }

    pub async fn get_or_create_subscription(
        &self,
        topic: &Topic,
        name: &str,
        shared: bool,
    ) -> Result<Subscription, PubSubError> {
        match self.get_subscription(topic, name, shared).await? {
            Some(subscription) => Ok(subscription),
            None => self.create_subscription(topic, name, shared).await,
        }
    }

    /// Wraps an existing subscription in a stream without creating anything.
    pub fn stream_for(&self, subscription: &Subscription) -> SubscriptionStream<PullSource> {
        let source = PullSource::new(
            self.client.clone(),
            self.resource_url(&subscription.name),
            subscription.short_name().to_string(),
        );
        SubscriptionStream::new(source)
    }

    /// Ensures the topic and subscription exist and returns a stream over the
    /// subscription. Non-shared subscriptions are deleted on [`shutdown`](Self::shutdown).
    pub async fn observe_subscription(
        &self,
        topic_name: &str,
        subscription_name: &str,
        shared: bool,
    ) -> Result<SubscriptionStream<PullSource>, PubSubError> {
        let topic = self.get_or_create_topic(topic_name).await?;
        let subscription = self
            .get_or_create_subscription(&topic, subscription_name, shared)
            .await?;

        let stream = self.stream_for(&subscription);
        if !shared {
            self.transient().push(stream.clone());
        }
        Ok(stream)
    }

    /// Publishes raw messages and returns their ids.
    pub async fn publish(
        &self,
        topic: &Topic,
        messages: &[PubsubMessage],
    ) -> Result<Vec<String>, PubSubError> {
        let url = format!("{}:publish", self.resource_url(&topic.name));

        let response = self
            .publish_client
            .post(&url)
            .json(&PublishRequest { messages })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PubSubError::ApiError(
                parse_error_response(response, "Publish failed").await,
            ));
        }

        let published: PublishResponse = response.json().await?;
        Ok(published.message_ids)
    }

    /// Publishes a UTF-8 text message, creating the topic when needed.
    ///
    /// The topic is resolved once; only the publish call itself is retried, up
    /// to [`PUBLISH_ATTEMPTS`] times in total.
    pub async fn publish_message(&self, topic_name: &str, message: &str) -> Result<String, PubSubError> {
        let topic = self.get_or_create_topic(topic_name).await?;
        let message = PubsubMessage {
            data: STANDARD.encode(message.as_bytes()),
            ..Default::default()
        };

        let mut attempt = 1;
        loop {
            match self.publish(&topic, std::slice::from_ref(&message)).await {
                Ok(ids) => {
                    return ids
                        .into_iter()
                        .next()
                        .ok_or_else(|| PubSubError::ApiError("Publish returned no message id".to_string()));
                }
                Err(e) if attempt < PUBLISH_ATTEMPTS => {
                    tracing::warn!(topic = %topic.name, attempt, error = %e, "publish failed, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(topic = %topic.name, attempts = attempt, error = %e, "publish failed");
                    return Err(e);
                }
            }
        }
    }

    /// Deletes every non-shared subscription observed through this service.
    pub async fn shutdown(&self) {
        let transient = std::mem::take(&mut *self.transient());
        tracing::debug!(count = transient.len(), "deleting transient subscriptions");
        futures::future::join_all(transient.iter().map(|stream| stream.delete())).await;
    }
}

/// Host name used for per-host subscriptions.
fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
