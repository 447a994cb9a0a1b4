//! Pull-based view over a push-based subscription.
//!
//! [`SubscriptionStream`] wraps a [`MessageSource`] that pushes events through a
//! callback and hands them out one pull at a time, in delivery order. Messages
//! that arrive while nobody is pulling wait in a buffer; pulls that arrive while
//! the buffer is empty wait on a oneshot channel until a message or shutdown.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::stream::{self, Stream};
use tokio::sync::oneshot;

use crate::pubsub::PubSubError;

/// At most one unacknowledged message is handed out by the source at a time.
pub const MAX_IN_FLIGHT_MESSAGES: usize = 1;

/// Something the source reports to its registered handler.
#[derive(Debug)]
pub enum SourceEvent<M> {
    Message(M),
    /// The source stopped delivering on its own.
    Closed,
}

pub type EventHandler<M> = Box<dyn Fn(SourceEvent<M>) + Send + Sync>;

/// A push-based message source, typically a live Pub/Sub subscription.
#[async_trait]
pub trait MessageSource: Send + Sync + 'static {
    type Message: Send + 'static;

    /// Limits how many delivered messages may be outstanding before the source
    /// pauses. Called once, before `on_event`.
    fn set_flow_control(&self, max_messages: usize);

    /// Starts delivery. Events may be reported from any thread.
    fn on_event(&self, handler: EventHandler<Self::Message>);

    async fn close(&self) -> Result<(), PubSubError>;

    /// Removes the subscription resource itself.
    async fn delete(&self) -> Result<(), PubSubError>;

    /// Human readable name used in logs.
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Listening,
    Closed,
}

struct State<M> {
    phase: StreamState,
    pending: VecDeque<M>,
    // dropping a sender ends the pull waiting on it
    waiting: VecDeque<oneshot::Sender<M>>,
    deleted: bool,
}

struct Inner<S: MessageSource> {
    source: S,
    state: Mutex<State<S::Message>>,
}

impl<S: MessageSource> Inner<S> {
    fn lock(&self) -> MutexGuard<'_, State<S::Message>> {
        // state is consistent at every unlock
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(&self, event: SourceEvent<S::Message>) {
        match event {
            SourceEvent::Message(message) => self.deliver(message),
            SourceEvent::Closed => {
                let mut state = self.lock();
                if state.phase != StreamState::Closed {
                    tracing::debug!(subscription = self.source.name(), "subscription closed by source");
                    state.phase = StreamState::Closed;
                    state.waiting.clear();
                }
            }
        }
    }

    fn deliver(&self, mut message: S::Message) {
        let mut state = self.lock();
        if state.phase == StreamState::Closed {
            tracing::debug!(subscription = self.source.name(), "dropping message received after close");
            return;
        }

        while let Some(waiter) = state.waiting.pop_front() {
            match waiter.send(message) {
                Ok(()) => return,
                // that pull was abandoned; try the next one
                Err(returned) => message = returned,
            }
        }
        state.pending.push_back(message);
    }
}

/// An ordered, cancellable async sequence of the messages of one subscription.
///
/// Cloning yields another handle to the same stream, so one task can pull
/// while another closes.
pub struct SubscriptionStream<S: MessageSource> {
    inner: Arc<Inner<S>>,
}

impl<S: MessageSource> Clone for SubscriptionStream<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: MessageSource> SubscriptionStream<S> {
    pub fn new(source: S) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                state: Mutex::new(State {
                    phase: StreamState::Idle,
                    pending: VecDeque::new(),
                    waiting: VecDeque::new(),
                    deleted: false,
                }),
            }),
        }
    }

    pub fn source(&self) -> &S {
        &self.inner.source
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().phase
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    #[cfg(test)]
    pub(crate) fn waiting_pulls(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// Starts delivery ahead of the first pull. Pulling does this on its own.
    pub(crate) fn listen(&self) {
        {
            let mut state = self.inner.lock();
            if state.phase != StreamState::Idle {
                return;
            }
            state.phase = StreamState::Listening;
        }

        tracing::debug!(subscription = self.inner.source.name(), "listening to subscription");
        self.inner.source.set_flow_control(MAX_IN_FLIGHT_MESSAGES);

        // The source owns the handler and we own the source, so hold it weakly.
        let inner: Weak<Inner<S>> = Arc::downgrade(&self.inner);
        self.inner.source.on_event(Box::new(move |event| {
            if let Some(inner) = inner.upgrade() {
                inner.handle(event);
            }
        }));
    }

    /// Waits for the next message. `None` once the stream is closed and every
    /// buffered message has been handed out.
    pub async fn next_message(&self) -> Option<S::Message> {
        self.listen();

        let receiver = {
            let mut state = self.inner.lock();
            if let Some(message) = state.pending.pop_front() {
                return Some(message);
            }
            if state.phase == StreamState::Closed {
                return None;
            }
            state.waiting.retain(|waiter| !waiter.is_closed());
            let (sender, receiver) = oneshot::channel();
            state.waiting.push_back(sender);
            receiver
        };

        receiver.await.ok()
    }

    /// The messages as a [`Stream`], ending when the subscription closes.
    pub fn messages(&self) -> impl Stream<Item = S::Message> + Send + 'static {
        stream::unfold(self.clone(), |subscription| async move {
            let message = subscription.next_message().await?;
            Some((message, subscription))
        })
    }

    /// Stops delivery and ends every pending pull. Messages already buffered
    /// are still handed out. Only the first call reaches the source.
    pub async fn close(&self) -> Result<(), PubSubError> {
        {
            let mut state = self.inner.lock();
            if state.phase == StreamState::Closed {
                return Ok(());
            }
            state.phase = StreamState::Closed;
            state.waiting.clear();
        }

        tracing::debug!(subscription = self.inner.source.name(), "closing subscription");
        self.inner.source.close().await
    }

    /// Closes the stream and deletes the subscription. Failures are logged,
    /// never returned; repeated calls do nothing.
    pub async fn delete(&self) {
        {
            let mut state = self.inner.lock();
            if state.deleted {
                return;
            }
            state.deleted = true;
        }

        if let Err(e) = self.close().await {
            tracing::error!(subscription = self.inner.source.name(), error = %e, "failed to close subscription");
        }

        match self.inner.source.delete().await {
            Ok(()) => tracing::debug!(subscription = self.inner.source.name(), "subscription deleted"),
            Err(e) => {
                tracing::error!(subscription = self.inner.source.name(), error = %e, "failed to delete subscription")
            }
        }
    }
}
