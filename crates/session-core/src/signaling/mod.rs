//! Typed request/response wrapper over the raw signaling channel
//!
//! The channel itself (websocket, data channel, test double) lives behind
//! [`SignalingChannel`]; this module adds request ids, per-call timeouts
//! sized by event-name heuristics, bounded retry of server-rejected calls,
//! and typed push-event registration. Every in-flight call is tracked so
//! cleanup can cancel the lot.

pub mod messages;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};
use crate::media::MediaKind;
pub use messages::{
    ConsumeResponse, DisconnectReason, JoinResponse, ParticipantInfo, ProduceResponse,
    RemoteProducerInfo, ServerMessage, SignalingNotification, SignalingRequest, TransportCreated,
};

/// Outbound half of the raw bidirectional channel.
///
/// Implementations deliver the tagged request to the server; responses and
/// push events come back on the inbound receiver handed to
/// [`SignalingClient::new`].
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, request_id: u64, request: &SignalingRequest) -> SessionResult<()>;
}

/// Push-event handler installed by the orchestrator.
///
/// Registering a new handler replaces the previous set; there is never
/// duplicate registration.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn on_new_producer(&self, info: RemoteProducerInfo);
    async fn on_producer_closed(&self, producer_id: String);
    async fn on_participant_disconnected(&self, participant_id: String);
    async fn on_meeting_ended(&self);
    /// Unexpected channel-level failure (not a clean server close)
    async fn on_connection_error(&self, reason: String);
}

/// Per-call timeout sizing and rejected-call retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingTimeouts {
    /// `join*` and `*media*` events
    pub long_timeout_ms: u64,
    /// `*transport*` and everything else
    pub medium_timeout_ms: u64,
    /// Fixed delay between retries of server-rejected calls
    pub retry_delay_ms: u64,
    /// Additional attempts after a server-rejected response
    pub max_retries: u32,
}

impl Default for SignalingTimeouts {
    fn default() -> Self {
        Self {
            long_timeout_ms: 15_000,
            medium_timeout_ms: 10_000,
            retry_delay_ms: 1_000,
            max_retries: 2,
        }
    }
}

impl SignalingTimeouts {
    /// Timeout for an event, sized by name heuristics
    pub fn for_event(&self, event: &str) -> Duration {
        let ms = if event.starts_with("join") || event.contains("media") {
            self.long_timeout_ms
        } else {
            // `*transport*` and the default bucket share the medium timer.
            self.medium_timeout_ms
        };
        Duration::from_millis(ms)
    }
}

/// Typed signaling façade over the raw channel
pub struct SignalingClient {
    channel: Arc<dyn SignalingChannel>,
    pending: Arc<DashMap<u64, oneshot::Sender<SessionResult<Value>>>>,
    handler: Arc<RwLock<Option<Arc<dyn NotificationHandler>>>>,
    next_request_id: AtomicU64,
    timeouts: SignalingTimeouts,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingClient")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl SignalingClient {
    /// Wrap a channel. Spawns the dispatch task that routes responses to
    /// their waiters and push events to the registered handler.
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
        mut incoming: mpsc::UnboundedReceiver<ServerMessage>,
        timeouts: SignalingTimeouts,
    ) -> Self {
        let pending: Arc<DashMap<u64, oneshot::Sender<SessionResult<Value>>>> =
            Arc::new(DashMap::new());
        let handler: Arc<RwLock<Option<Arc<dyn NotificationHandler>>>> =
            Arc::new(RwLock::new(None));

        // Push events are delivered off the response path: a handler that
        // issues its own signaling requests (consume on new-producer) must
        // not block response routing. The worker keeps delivery sequential.
        let (note_tx, mut note_rx) = mpsc::unbounded_channel::<SignalingNotification>();
        let notifier = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                while let Some(note) = note_rx.recv().await {
                    let current = handler.read().await.clone();
                    match current {
                        Some(h) => dispatch_notification(h, note).await,
                        None => debug!("push event dropped, no handler registered"),
                    }
                }
            })
        };

        let dispatch = {
            let pending = Arc::clone(&pending);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                while let Some(message) = incoming.recv().await {
                    match message {
                        ServerMessage::Response { request_id, body } => {
                            match pending.remove(&request_id) {
                                Some((_, tx)) => {
                                    let _ = tx.send(Ok(body));
                                }
                                None => {
                                    debug!(request_id, "late response for unknown request");
                                }
                            }
                        }
                        ServerMessage::Notification(note) => {
                            let _ = note_tx.send(note);
                        }
                        ServerMessage::Disconnected { reason } => {
                            fail_pending(
                                &pending,
                                SessionError::channel_closed(reason.describe()),
                            );
                            if reason.is_unexpected() {
                                let current = handler.read().await.clone();
                                if let Some(h) = current {
                                    h.on_connection_error(reason.describe()).await;
                                }
                            } else {
                                debug!("signaling channel closed cleanly");
                            }
                        }
                    }
                }
            })
        };

        Self {
            channel,
            pending,
            handler,
            next_request_id: AtomicU64::new(1),
            timeouts,
            tasks: std::sync::Mutex::new(vec![dispatch, notifier]),
        }
    }

    /// Install the push-event handler, removing any previously installed
    /// set first.
    pub async fn register_handler(&self, handler: Arc<dyn NotificationHandler>) {
        *self.handler.write().await = Some(handler);
    }

    /// Issue a request and await its response.
    ///
    /// The timer is sized by event-name heuristics unless overridden. No
    /// response before the timer expires rejects with `SignalingTimeout`.
    /// A response carrying an `"error"` string is retried up to
    /// `max_retries` additional times with a fixed delay before rejecting
    /// with `SignalingRejected`.
    pub async fn call(
        &self,
        request: SignalingRequest,
        timeout_override: Option<Duration>,
    ) -> SessionResult<Value> {
        let event = request.event_name();
        let timeout = timeout_override.unwrap_or_else(|| self.timeouts.for_event(event));
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            self.pending.insert(request_id, tx);

            if let Err(e) = self.channel.send(request_id, &request).await {
                self.pending.remove(&request_id);
                return Err(e);
            }

            let body = match tokio::time::timeout(timeout, rx).await {
                Err(_) => {
                    self.pending.remove(&request_id);
                    return Err(SessionError::SignalingTimeout {
                        event: event.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                // Waiter dropped without a value: cancelled by cleanup.
                Ok(Err(_)) => {
                    return Err(SessionError::channel_closed("request cancelled"));
                }
                Ok(Ok(Err(e))) => return Err(e),
                Ok(Ok(Ok(body))) => body,
            };

            match body.get("error").and_then(Value::as_str) {
                None => return Ok(body),
                Some(reason) if attempt <= self.timeouts.max_retries => {
                    warn!(
                        event,
                        attempt,
                        reason,
                        "signaling request rejected, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(self.timeouts.retry_delay_ms))
                        .await;
                }
                Some(reason) => {
                    return Err(SessionError::SignalingRejected {
                        event: event.to_string(),
                        reason: reason.to_string(),
                    });
                }
            }
        }
    }

    /// Join a meeting and load the router's media-session capabilities
    pub async fn join(
        &self,
        meeting_id: &str,
        participant_id: &str,
    ) -> SessionResult<JoinResponse> {
        let body = self
            .call(
                SignalingRequest::JoinMeeting {
                    meeting_id: meeting_id.to_string(),
                    participant_id: participant_id.to_string(),
                },
                None,
            )
            .await?;
        parse("joinMeeting", body)
    }

    /// Re-join an existing meeting after connectivity loss
    pub async fn reconnect(
        &self,
        meeting_id: &str,
        participant_id: &str,
    ) -> SessionResult<JoinResponse> {
        let body = self
            .call(
                SignalingRequest::ReconnectMeeting {
                    meeting_id: meeting_id.to_string(),
                    participant_id: participant_id.to_string(),
                },
                None,
            )
            .await?;
        parse("reconnectMeeting", body)
    }

    pub async fn create_producer_transport(
        &self,
        meeting_id: &str,
    ) -> SessionResult<TransportCreated> {
        let body = self
            .call(
                SignalingRequest::CreateProducerTransport {
                    meeting_id: meeting_id.to_string(),
                },
                None,
            )
            .await?;
        parse("create-producer-transport", body)
    }

    pub async fn create_consumer_transport(
        &self,
        meeting_id: &str,
    ) -> SessionResult<TransportCreated> {
        let body = self
            .call(
                SignalingRequest::CreateConsumerTransport {
                    meeting_id: meeting_id.to_string(),
                },
                None,
            )
            .await?;
        parse("create-consumer-transport", body)
    }

    pub async fn connect_producer_transport(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> SessionResult<()> {
        self.call(
            SignalingRequest::ConnectProducerTransport {
                transport_id: transport_id.to_string(),
                dtls_parameters,
            },
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn connect_consumer_transport(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> SessionResult<()> {
        self.call(
            SignalingRequest::ConnectConsumerTransport {
                transport_id: transport_id.to_string(),
                dtls_parameters,
            },
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> SessionResult<ProduceResponse> {
        let body = self
            .call(
                SignalingRequest::Produce {
                    transport_id: transport_id.to_string(),
                    kind,
                    rtp_parameters,
                },
                None,
            )
            .await?;
        parse("produce", body)
    }

    pub async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> SessionResult<ConsumeResponse> {
        let body = self
            .call(
                SignalingRequest::Consume {
                    producer_id: producer_id.to_string(),
                    rtp_capabilities,
                },
                None,
            )
            .await?;
        parse("consume", body)
    }

    /// Number of calls currently awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Remove the handler, cancel every pending call, and stop the
    /// dispatch task. Idempotent.
    pub async fn cleanup(&self) {
        *self.handler.write().await = None;
        fail_pending(
            &self.pending,
            SessionError::channel_closed("signaling client cleaned up"),
        );
        for handle in self.tasks.lock().expect("task lock").drain(..) {
            handle.abort();
        }
        debug!("signaling client cleaned up");
    }
}

async fn dispatch_notification(handler: Arc<dyn NotificationHandler>, note: SignalingNotification) {
    match note {
        SignalingNotification::NewProducer(info) => handler.on_new_producer(info).await,
        SignalingNotification::ProducerClosed { producer_id } => {
            handler.on_producer_closed(producer_id).await
        }
        SignalingNotification::ParticipantDisconnected { participant_id } => {
            handler.on_participant_disconnected(participant_id).await
        }
        SignalingNotification::MeetingEnded => handler.on_meeting_ended().await,
    }
}

fn fail_pending(
    pending: &DashMap<u64, oneshot::Sender<SessionResult<Value>>>,
    error: SessionError,
) {
    let ids: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

fn parse<T: DeserializeOwned>(event: &'static str, body: Value) -> SessionResult<T> {
    serde_json::from_value(body).map_err(|e| SessionError::malformed(event, e.to_string()))
}
