use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::core::parse_error_response;
use crate::pubsub::models::{
    AcknowledgeRequest, ModifyAckDeadlineRequest, PullRequest, PullResponse, ReceivedMessage,
};
use crate::pubsub::subscription::{EventHandler, MessageSource, SourceEvent};
use crate::pubsub::PubSubError;

const IDLE_DELAY: Duration = Duration::from_millis(250);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Acknowledgement endpoints of one subscription.
#[derive(Clone)]
struct Acker {
    client: ClientWithMiddleware,
    subscription_url: String,
}

impl Acker {
    async fn acknowledge(&self, ack_id: &str) -> Result<(), PubSubError> {
        let url = format!("{}:acknowledge", self.subscription_url);
        let body = AcknowledgeRequest { ack_ids: [ack_id] };
        self.post(&url, &body, "Acknowledge failed").await
    }

    async fn modify_ack_deadline(&self, ack_id: &str, seconds: u32) -> Result<(), PubSubError> {
        let url = format!("{}:modifyAckDeadline", self.subscription_url);
        let body = ModifyAckDeadlineRequest {
            ack_ids: [ack_id],
            ack_deadline_seconds: seconds,
        };
        self.post(&url, &body, "Modify ack deadline failed").await
    }

    async fn post<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        failure: &str,
    ) -> Result<(), PubSubError> {
        let response = self.client.post(url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(PubSubError::ApiError(parse_error_response(response, failure).await));
        }
        Ok(())
    }
}

/// A message pulled from a subscription.
///
/// Holds one flow-control slot of its source until it is acked, nacked or
/// dropped. Dropping without acking leaves redelivery to the ack deadline.
pub struct PulledMessage {
    pub id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub publish_time: Option<DateTime<Utc>>,
    pub delivery_attempt: Option<u32>,
    ack_id: String,
    acker: Acker,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PulledMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulledMessage")
            .field("id", &self.id)
            .field("data_len", &self.data.len())
            .field("attributes", &self.attributes)
            .field("publish_time", &self.publish_time)
            .finish()
    }
}

impl PulledMessage {
    fn new(received: ReceivedMessage, acker: Acker, permit: OwnedSemaphorePermit) -> Self {
        let ReceivedMessage {
            ack_id,
            message,
            delivery_attempt,
        } = received;

        let data = match STANDARD.decode(&message.data) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(ack_id = %ack_id, error = %e, "message data is not base64, passing it through");
                message.data.into_bytes()
            }
        };

        Self {
            id: message.message_id.unwrap_or_default(),
            data,
            attributes: message.attributes,
            publish_time: message.publish_time,
            delivery_attempt,
            ack_id,
            acker,
            _permit: permit,
        }
    }

    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    pub async fn ack(self) -> Result<(), PubSubError> {
        self.acker.acknowledge(&self.ack_id).await
    }

    /// Asks for immediate redelivery.
    pub async fn nack(self) -> Result<(), PubSubError> {
        self.acker.modify_ack_deadline(&self.ack_id, 0).await
    }
}

/// [`MessageSource`] backed by the Pub/Sub REST `pull` method.
///
/// A background task pulls one message at a time while flow-control slots are
/// free and reports what it receives to the registered handler.
pub struct PullSource {
    acker: Acker,
    name: String,
    max_messages: AtomicUsize,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PullSource {
    pub(crate) fn new(client: ClientWithMiddleware, subscription_url: String, name: String) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            acker: Acker {
                client,
                subscription_url,
            },
            name,
            max_messages: AtomicUsize::new(1),
            shutdown,
            worker: Mutex::new(None),
        }
    }

    fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[async_trait]
impl MessageSource for PullSource {
    type Message = PulledMessage;

    fn set_flow_control(&self, max_messages: usize) {
        self.max_messages.store(max_messages.max(1), Ordering::SeqCst);
    }

    fn on_event(&self, handler: EventHandler<PulledMessage>) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(subscription = %self.name, error = %e, "no tokio runtime to pull messages on");
                handler(SourceEvent::Closed);
                return;
            }
        };

        let worker = PullWorker {
            acker: self.acker.clone(),
            name: self.name.clone(),
            permits: Arc::new(Semaphore::new(self.max_messages.load(Ordering::SeqCst))),
            shutdown: self.shutdown.subscribe(),
            handler,
        };
        let handle = runtime.spawn(worker.run());

        let mut slot = self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(handle);
    }

    async fn close(&self) -> Result<(), PubSubError> {
        self.shutdown.send_replace(true);
        if let Some(worker) = self.take_worker() {
            if let Err(e) = worker.await {
                tracing::warn!(subscription = %self.name, error = %e, "pull worker ended abnormally");
            }
        }
        Ok(())
    }

    async fn delete(&self) -> Result<(), PubSubError> {
        let response = self
            .acker
            .client
            .delete(&self.acker.subscription_url)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                tracing::debug!(subscription = %self.name, "subscription already gone");
                Ok(())
            }
            _ => Err(PubSubError::ApiError(
                parse_error_response(response, "Delete subscription failed").await,
            )),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct PullWorker {
    acker: Acker,
    name: String,
    permits: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
    handler: EventHandler<PulledMessage>,
}

impl PullWorker {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                _ = self.shutdown.changed() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let pulled = tokio::select! {
                _ = self.shutdown.changed() => break,
                pulled = pull_one(&self.acker) => pulled,
            };

            match pulled {
                Ok(Some(received)) => {
                    let message = PulledMessage::new(received, self.acker.clone(), permit);
                    (self.handler)(SourceEvent::Message(message));
                }
                Ok(None) => {
                    drop(permit);
                    if !self.pause(IDLE_DELAY).await {
                        break;
                    }
                }
                Err(PubSubError::NotFound(reason)) => {
                    tracing::warn!(subscription = %self.name, reason = %reason, "subscription no longer exists");
                    break;
                }
                Err(e) => {
                    drop(permit);
                    tracing::warn!(subscription = %self.name, error = %e, "pull failed");
                    if !self.pause(ERROR_BACKOFF).await {
                        break;
                    }
                }
            }
        }

        (self.handler)(SourceEvent::Closed);
    }

    /// Sleeps unless shutdown is requested first; `false` means stop.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.changed() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

async fn pull_one(acker: &Acker) -> Result<Option<ReceivedMessage>, PubSubError> {
    let url = format!("{}:pull", acker.subscription_url);
    let response = acker
        .client
        .post(&url)
        .json(&PullRequest { max_messages: 1 })
        .send()
        .await?;

    if response.status() == StatusCode::NOT_FOUND {
        return Err(PubSubError::NotFound(parse_error_response(response, "Pull failed").await));
    }
    if !response.status().is_success() {
        return Err(PubSubError::ApiError(parse_error_response(response, "Pull failed").await));
    }

    let pulled: PullResponse = response.json().await?;
    Ok(pulled.received_messages.into_iter().next())
}
