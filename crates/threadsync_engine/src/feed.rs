//! Change-feed listener.
//!
//! The listener keeps one subscription to the thread's event stream and asks
//! for reconciliation passes when events arrive. It never touches the store:
//! events only say *that* something changed, the pass decides *what*.
//!
//! A gap (HTTP 410 or a `reset` event) or too many failed reconnects degrade
//! to a full pass instead of trying to replay.

use crate::cancel::CancelToken;
use crate::config::FeedConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{FeedSource, FeedStream};
use parking_lot::Mutex;
use std::sync::Arc;
use threadsync_protocol::{EventId, FeedEventKind, FeedMessage};
use tracing::{debug, info, warn};

/// Why a pass was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerReason {
    /// User asked for it.
    Manual,
    /// A change-feed event.
    FeedEvent {
        /// Path named by the event.
        path: Option<String>,
    },
    /// The feed cannot resume.
    FeedGap,
    /// The feed stayed down for too long.
    ReconnectExhausted,
    /// Periodic timer.
    Interval,
}

/// Something that can start a reconciliation pass.
pub trait PassRequester: Send + Sync {
    /// Requests a pass; must not block.
    fn request_pass(&self, reason: TriggerReason);
}

/// Connection state of the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Not started.
    Idle,
    /// Opening a subscription.
    Connecting {
        /// 1-based attempt since the last healthy stream.
        attempt: u32,
    },
    /// Receiving events.
    Streaming,
    /// Waiting before reconnecting.
    Backoff {
        /// Failed attempts so far.
        attempt: u32,
    },
    /// Stopped for good.
    Stopped,
}

enum StreamEnd {
    Stopped,
    Gap,
    Closed { delivered: bool },
    Failed { delivered: bool, error: SyncError },
}

/// Listens to the change feed of one thread.
pub struct ChangeFeedListener<F: FeedSource, P: PassRequester> {
    thread_id: String,
    source: Arc<F>,
    requester: Arc<P>,
    config: FeedConfig,
    state: Mutex<ListenerState>,
    last_event_id: Mutex<Option<EventId>>,
    stop: CancelToken,
}

impl<F: FeedSource, P: PassRequester> ChangeFeedListener<F, P> {
    /// Creates an idle listener.
    pub fn new(
        thread_id: impl Into<String>,
        source: Arc<F>,
        requester: Arc<P>,
        config: FeedConfig,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            source,
            requester,
            config,
            state: Mutex::new(ListenerState::Idle),
            last_event_id: Mutex::new(None),
            stop: CancelToken::new(),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    /// Id of the last event received.
    pub fn last_event_id(&self) -> Option<EventId> {
        self.last_event_id.lock().clone()
    }

    /// Stops [`run`](Self::run) at the next await point.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    fn set_state(&self, state: ListenerState) {
        *self.state.lock() = state;
    }

    /// Subscribes and dispatches events until [`stop`](Self::stop) is called.
    pub async fn run(&self) -> SyncResult<()> {
        let mut failures: u32 = 0;
        loop {
            if self.stop.is_cancelled() {
                break;
            }
            self.set_state(ListenerState::Connecting {
                attempt: failures + 1,
            });

            let resume = self.last_event_id();
            let subscribed = tokio::select! {
                r = self.source.subscribe(&self.thread_id, resume.as_ref()) => r,
                _ = self.stop.cancelled() => break,
            };

            let error = match subscribed {
                Ok(stream) => {
                    self.set_state(ListenerState::Streaming);
                    info!(thread = %self.thread_id, resume = ?resume.as_ref().map(EventId::as_str), "change feed connected");
                    match self.consume(stream).await {
                        StreamEnd::Stopped => break,
                        StreamEnd::Gap => {
                            self.on_gap();
                            failures = 0;
                            continue;
                        }
                        StreamEnd::Closed { delivered } => {
                            if delivered {
                                failures = 0;
                            }
                            SyncError::Network("change feed closed".into())
                        }
                        StreamEnd::Failed { delivered, error } => {
                            if delivered {
                                failures = 0;
                            }
                            error
                        }
                    }
                }
                Err(SyncError::FeedGap) => {
                    self.on_gap();
                    failures = 0;
                    continue;
                }
                Err(error) => error,
            };

            failures += 1;
            warn!(thread = %self.thread_id, attempt = failures, error = %error, "change feed disconnected");
            if failures > self.config.max_reconnect_attempts {
                warn!(thread = %self.thread_id, "change feed unavailable; falling back to a full pass");
                self.requester.request_pass(TriggerReason::ReconnectExhausted);
                failures = 0;
            }

            self.set_state(ListenerState::Backoff { attempt: failures });
            let delay = self.config.reconnect.delay_for_attempt(failures.max(1));
            if self.stop.sleep(delay).await.is_err() {
                break;
            }
        }
        self.set_state(ListenerState::Stopped);
        debug!(thread = %self.thread_id, "change feed stopped");
        Ok(())
    }

    fn on_gap(&self) {
        info!(thread = %self.thread_id, "change feed gap; requesting a full pass");
        *self.last_event_id.lock() = None;
        self.requester.request_pass(TriggerReason::FeedGap);
    }

    async fn consume(&self, mut stream: Box<dyn FeedStream>) -> StreamEnd {
        let mut delivered = false;
        loop {
            let next = tokio::select! {
                r = tokio::time::timeout(self.config.idle_timeout, stream.next_message()) => r,
                _ = self.stop.cancelled() => return StreamEnd::Stopped,
            };
            let message = match next {
                Err(_) => {
                    return StreamEnd::Failed {
                        delivered,
                        error: SyncError::Timeout,
                    }
                }
                Ok(Err(SyncError::FeedGap)) => return StreamEnd::Gap,
                Ok(Err(error)) => return StreamEnd::Failed { delivered, error },
                Ok(Ok(None)) => return StreamEnd::Closed { delivered },
                Ok(Ok(Some(message))) => message,
            };
            delivered = true;

            let event = match message {
                FeedMessage::Reset => return StreamEnd::Gap,
                FeedMessage::Event(event) => event,
            };
            if let Some(id) = &event.id {
                *self.last_event_id.lock() = Some(id.clone());
            }
            if event
                .thread_id
                .as_deref()
                .is_some_and(|thread| thread != self.thread_id)
            {
                continue;
            }
            match event.kind {
                FeedEventKind::Heartbeat => {}
                kind => {
                    debug!(thread = %self.thread_id, kind = kind.as_str(), path = ?event.path, "change event");
                    self.requester
                        .request_pass(TriggerReason::FeedEvent { path: event.path });
                }
            }
        }
    }
}
