//! Shared test doubles: a scripted conference server, fake capture
//! devices, and controllable transports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use confab_session_core::error::SessionResult;
use confab_session_core::media::{
    LocalStream, LocalTrack, MediaConstraints, MediaDevices, MediaKind, PermissionState,
};
use confab_session_core::signaling::{
    ServerMessage, SignalingChannel, SignalingNotification, SignalingRequest, TransportCreated,
};
use confab_session_core::transport::{
    IceConnectionState, Transport, TransportConnectionState, TransportFactory, TransportKind,
    TransportStats,
};

/// Simulated conference server: answers every request immediately and
/// records what was asked.
pub struct MockServer {
    tx: mpsc::UnboundedSender<ServerMessage>,
    /// Body returned for join/reconnect requests
    pub join_body: Mutex<Value>,
    /// When set, reconnect requests are rejected with an error body
    pub fail_reconnects: AtomicBool,
    pub join_calls: AtomicUsize,
    pub reconnect_calls: AtomicUsize,
    pub produce_calls: AtomicUsize,
    pub consume_calls: Mutex<Vec<String>>,
    /// When non-zero, consume responses are held back by this many
    /// milliseconds so tests can race events against an in-flight consume
    pub consume_delay_ms: AtomicU64,
    /// Media kind per announced remote producer, for consume responses
    producer_kinds: Mutex<HashMap<String, MediaKind>>,
    next_id: AtomicUsize,
}

impl MockServer {
    pub fn start() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = Arc::new(Self {
            tx,
            join_body: Mutex::new(json!({
                "rtp_capabilities": { "codecs": [] },
                "participants": [],
            })),
            fail_reconnects: AtomicBool::new(false),
            join_calls: AtomicUsize::new(0),
            reconnect_calls: AtomicUsize::new(0),
            produce_calls: AtomicUsize::new(0),
            consume_calls: Mutex::new(Vec::new()),
            consume_delay_ms: AtomicU64::new(0),
            producer_kinds: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
        });
        (server, rx)
    }

    /// Pre-announce a remote producer present at join time
    pub fn announce_at_join(&self, participant_id: &str, producer_id: &str, kind: MediaKind) {
        self.producer_kinds
            .lock()
            .unwrap()
            .insert(producer_id.to_string(), kind);
        let mut body = self.join_body.lock().unwrap();
        body["participants"] = json!([{
            "participant_id": participant_id,
            "producers": [{ "producer_id": producer_id, "kind": kind }],
        }]);
    }

    /// Push a `new-producer` event
    pub fn push_new_producer(&self, participant_id: &str, producer_id: &str, kind: MediaKind) {
        self.producer_kinds
            .lock()
            .unwrap()
            .insert(producer_id.to_string(), kind);
        let raw = json!({
            "event": "new-producer",
            "data": {
                "producer_id": producer_id,
                "kind": kind,
                "participant_id": participant_id,
            },
        });
        let note: SignalingNotification = serde_json::from_value(raw).unwrap();
        let _ = self.tx.send(ServerMessage::Notification(note));
    }

    pub fn push_notification(&self, raw: Value) {
        let note: SignalingNotification = serde_json::from_value(raw).unwrap();
        let _ = self.tx.send(ServerMessage::Notification(note));
    }

    fn fresh_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn respond(&self, request: &SignalingRequest) -> Value {
        match request {
            SignalingRequest::JoinMeeting { .. } => {
                self.join_calls.fetch_add(1, Ordering::SeqCst);
                self.join_body.lock().unwrap().clone()
            }
            SignalingRequest::ReconnectMeeting { .. } => {
                self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
                if self.fail_reconnects.load(Ordering::SeqCst) {
                    json!({ "error": "cannot rejoin" })
                } else {
                    self.join_body.lock().unwrap().clone()
                }
            }
            SignalingRequest::CreateProducerTransport { .. }
            | SignalingRequest::CreateConsumerTransport { .. } => json!({
                "id": self.fresh_id("transport"),
                "ice_parameters": {},
                "ice_candidates": [],
                "dtls_parameters": {},
            }),
            SignalingRequest::ConnectProducerTransport { .. }
            | SignalingRequest::ConnectConsumerTransport { .. } => json!({}),
            SignalingRequest::Produce { kind, .. } => {
                self.produce_calls.fetch_add(1, Ordering::SeqCst);
                json!({ "producer_id": format!("local-{kind}") })
            }
            SignalingRequest::Consume { producer_id, .. } => {
                self.consume_calls.lock().unwrap().push(producer_id.clone());
                let kind = self
                    .producer_kinds
                    .lock()
                    .unwrap()
                    .get(producer_id)
                    .copied()
                    .unwrap_or(MediaKind::Video);
                json!({
                    "consumer_id": self.fresh_id("consumer"),
                    "producer_id": producer_id,
                    "kind": kind,
                    "rtp_parameters": {},
                })
            }
        }
    }
}

#[async_trait]
impl SignalingChannel for MockServer {
    async fn send(&self, request_id: u64, request: &SignalingRequest) -> SessionResult<()> {
        let delay = match request {
            SignalingRequest::Consume { .. } => self.consume_delay_ms.load(Ordering::SeqCst),
            _ => 0,
        };
        let body = self.respond(request);
        if delay > 0 {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let _ = tx.send(ServerMessage::Response { request_id, body });
            });
        } else {
            let _ = self.tx.send(ServerMessage::Response { request_id, body });
        }
        Ok(())
    }
}

/// Capture layer double that always grants and returns one track per
/// requested kind.
pub struct MockDevices;

#[async_trait]
impl MediaDevices for MockDevices {
    async fn permission_state(&self) -> Option<PermissionState> {
        Some(PermissionState::Granted)
    }

    async fn acquire(&self, constraints: &MediaConstraints) -> SessionResult<LocalStream> {
        let mut tracks = Vec::new();
        if constraints.audio.is_some() {
            tracks.push(LocalTrack::new(MediaKind::Audio, Some("mock-mic".into())));
        }
        if constraints.video.is_some() {
            tracks.push(LocalTrack::new(MediaKind::Video, Some("mock-cam".into())));
        }
        Ok(LocalStream { tracks })
    }
}

/// Controllable transport: tests drive its state watch directly.
pub struct MockTransport {
    id: String,
    state_tx: watch::Sender<TransportConnectionState>,
    ice: Mutex<IceConnectionState>,
    pub restarts: AtomicUsize,
    pub closed: AtomicUsize,
}

impl MockTransport {
    pub fn new(id: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            state_tx: watch::channel(TransportConnectionState::New).0,
            ice: Mutex::new(IceConnectionState::New),
            restarts: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        })
    }

    pub fn set_state(&self, state: TransportConnectionState) {
        let _ = self.state_tx.send(state);
    }

    pub fn set_ice(&self, state: IceConnectionState) {
        *self.ice.lock().unwrap() = state;
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn id(&self) -> &str {
        &self.id
    }
    fn connection_state(&self) -> TransportConnectionState {
        *self.state_tx.borrow()
    }
    fn ice_state(&self) -> IceConnectionState {
        *self.ice.lock().unwrap()
    }
    fn subscribe_state(&self) -> watch::Receiver<TransportConnectionState> {
        self.state_tx.subscribe()
    }
    fn dtls_parameters(&self) -> Value {
        json!({ "fingerprints": [] })
    }
    async fn restart_ice(&self) -> SessionResult<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn stats(&self) -> SessionResult<TransportStats> {
        Ok(TransportStats {
            rtt_ms: 40.0,
            packet_loss: 0.0,
            bitrate_kbps: 1500.0,
        })
    }
    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        let _ = self.state_tx.send(TransportConnectionState::Closed);
    }
}

/// Factory that records every transport it hands out
#[derive(Default)]
pub struct MockFactory {
    pub created: Mutex<Vec<(TransportKind, Arc<MockTransport>)>>,
}

impl MockFactory {
    /// Most recently created transport of a kind
    pub fn latest(&self, kind: TransportKind) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(k, _)| *k == kind)
            .map(|(_, t)| Arc::clone(t))
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create_transport(
        &self,
        kind: TransportKind,
        params: &TransportCreated,
    ) -> SessionResult<Arc<dyn Transport>> {
        let transport = MockTransport::new(format!("{kind}-{}", params.id));
        transport.set_state(TransportConnectionState::Connected);
        transport.set_ice(IceConnectionState::Connected);
        self.created.lock().unwrap().push((kind, Arc::clone(&transport)));
        Ok(transport)
    }
}
