//! Session orchestration: the single coordinator that sequences join,
//! transport setup, media production/consumption, recovery, and teardown
//!
//! The orchestrator is the only component that talks to more than one
//! subsystem. Everything below it (signaling, media, transports, quality)
//! is a focused owner with a narrow API; the orchestrator wires them
//! together, drives the connection state machine, and surfaces results to
//! the embedding UI through four plain callbacks.

pub mod builder;
pub mod config;
pub mod recovery;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub use builder::SessionBuilder;
pub use config::{QualityConfig, ReconnectConfig, SessionConfig};
pub use recovery::{retry_with_backoff, with_timeout, RetryConfig};

use crate::error::{SessionError, SessionResult};
use crate::events::{
    BusMessage, EventBus, TOPIC_SIGNALING_CLOSED, TOPIC_TRANSPORT_FAILED, TOPIC_TRANSPORT_STATS,
};
use crate::media::{
    Consumer, LocalStream, MediaKind, MediaManager, Producer, QualityProfile, RemoteStream,
    RemoteTrack,
};
use crate::quality::{QualityLevel, QualityMonitor, QualityThresholds};
use crate::signaling::{
    NotificationHandler, RemoteProducerInfo, SignalingClient, TransportCreated,
};
use crate::state::{ConnectionState, ConnectionStateMachine};
use crate::transport::{TransportFactory, TransportKind, TransportPool};

/// Snapshot handed to the streams callback on every media change
#[derive(Debug, Clone, Default)]
pub struct StreamsUpdate {
    pub local: Option<LocalStream>,
    pub remote: Option<RemoteStream>,
}

/// Diagnostic snapshot returned by [`SessionOrchestrator::stats`]
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub state: ConnectionState,
    pub time_in_state: Duration,
    /// Applied state transitions so far
    pub transitions: usize,
    pub quality_level: QualityLevel,
    /// Attempts spent against the reconnect ceiling
    pub reconnect_attempts: u32,
    pub producer_count: usize,
    pub consumer_count: usize,
    /// Remote producers queued awaiting the consumer transport
    pub pending_producers: usize,
    pub video_profile: QualityProfile,
}

type StateCallback = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;
type StreamsCallback = Arc<dyn Fn(StreamsUpdate) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(SessionError) + Send + Sync>;
type QualityCallback = Arc<dyn Fn(QualityLevel, QualityLevel) + Send + Sync>;

/// The four UI-facing callbacks. All optional; all receive plain data.
#[derive(Default)]
pub struct SessionCallbacks {
    on_state_change: Mutex<Option<StateCallback>>,
    on_streams_update: Mutex<Option<StreamsCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
    on_quality_change: Mutex<Option<QualityCallback>>,
}

impl SessionCallbacks {
    fn state_changed(&self, new: ConnectionState, old: ConnectionState) {
        if let Some(cb) = self.on_state_change.lock().expect("callback lock").clone() {
            cb(new, old);
        }
    }

    fn streams_updated(&self, update: StreamsUpdate) {
        if let Some(cb) = self.on_streams_update.lock().expect("callback lock").clone() {
            cb(update);
        }
    }

    fn error(&self, error: SessionError) {
        if let Some(cb) = self.on_error.lock().expect("callback lock").clone() {
            cb(error);
        }
    }

    fn quality_changed(&self, new: QualityLevel, old: QualityLevel) {
        if let Some(cb) = self.on_quality_change.lock().expect("callback lock").clone() {
            cb(new, old);
        }
    }
}

/// Coordinator for one meeting session
pub struct SessionOrchestrator {
    config: SessionConfig,
    signaling: Arc<SignalingClient>,
    media: Arc<MediaManager>,
    pool: Arc<TransportPool>,
    factory: Arc<dyn TransportFactory>,
    bus: EventBus,
    state: Mutex<ConnectionStateMachine>,
    quality: Mutex<QualityMonitor>,
    callbacks: Arc<SessionCallbacks>,

    /// Router capabilities from the join response
    rtp_capabilities: Mutex<Option<Value>>,
    /// Server-assigned transport ids, needed for produce/consume calls
    send_transport_id: Mutex<Option<String>>,
    recv_transport_id: Mutex<Option<String>>,
    /// Remote producers announced before the consumer transport was ready
    pending_producers: Mutex<VecDeque<RemoteProducerInfo>>,
    consumer_ready: AtomicBool,
    /// Guard against interleaved pending-producer drains
    draining: AtomicBool,
    /// Set once teardown has run, even when no state transition was
    /// recorded (teardown before connect).
    torn_down: AtomicBool,
    /// Guard against overlapping reconnect sequences
    reconnecting: AtomicBool,
    /// Attempts spent against the reconnect ceiling. One counter for the
    /// whole session; reset only on a successful recovery.
    reconnect_attempts: AtomicU32,
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("meeting_id", &self.config.meeting_id)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionOrchestrator {
    /// Assemble an orchestrator over its collaborators and wire the bus
    /// listeners. Use [`SessionBuilder`] rather than calling this directly.
    pub fn new(
        config: SessionConfig,
        signaling: Arc<SignalingClient>,
        media: Arc<MediaManager>,
        factory: Arc<dyn TransportFactory>,
        bus: EventBus,
    ) -> Arc<Self> {
        let pool = Arc::new(TransportPool::new(bus.clone(), config.transport.clone()));
        let quality = QualityMonitor::new(config.quality.window_size, QualityThresholds::default());

        let orchestrator = Arc::new(Self {
            config,
            signaling,
            media,
            pool,
            factory,
            bus: bus.clone(),
            state: Mutex::new(ConnectionStateMachine::new()),
            quality: Mutex::new(quality),
            callbacks: Arc::new(SessionCallbacks::default()),
            rtp_capabilities: Mutex::new(None),
            send_transport_id: Mutex::new(None),
            recv_transport_id: Mutex::new(None),
            pending_producers: Mutex::new(VecDeque::new()),
            consumer_ready: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
        });

        {
            let callbacks = Arc::clone(&orchestrator.callbacks);
            orchestrator
                .state
                .lock()
                .expect("state lock")
                .set_on_change(Box::new(move |new, old| {
                    callbacks.state_changed(new, old);
                }));
        }

        orchestrator.wire_bus();
        orchestrator
    }

    fn wire_bus(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.bus.on(TOPIC_TRANSPORT_STATS, move |msg| {
            if let (Some(this), BusMessage::TransportStats { sample, .. }) =
                (weak.upgrade(), msg)
            {
                this.ingest_quality_sample(*sample);
            }
        });

        let weak = Arc::downgrade(self);
        self.bus.on(TOPIC_TRANSPORT_FAILED, move |msg| {
            if let (
                Some(this),
                BusMessage::TransportFailed {
                    transport_id,
                    reason,
                    ..
                },
            ) = (weak.upgrade(), msg)
            {
                this.handle_transport_failure(transport_id.clone(), reason.clone());
            }
        });
    }

    fn ingest_quality_sample(self: &Arc<Self>, sample: crate::quality::QualitySample) {
        let change = self.quality.lock().expect("quality lock").update(sample);
        let Some((new, old)) = change else { return };
        self.callbacks.quality_changed(new, old);

        if !self.config.quality.auto_adapt {
            return;
        }
        // Classification is the monitor's job; the reaction policy lives
        // here. Only the extremes move the profile.
        let profile = match new {
            QualityLevel::Poor => Some(QualityProfile::Low),
            QualityLevel::Excellent => Some(QualityProfile::High),
            _ => None,
        };
        if let Some(profile) = profile {
            let media = Arc::clone(&self.media);
            tokio::spawn(async move {
                if let Err(e) = media.change_quality(profile).await {
                    warn!(profile = %profile, error = %e, "quality adaptation failed");
                }
            });
        }
    }

    fn handle_transport_failure(self: &Arc<Self>, transport_id: String, reason: String) {
        let can_reconnect = self.state.lock().expect("state lock").can_reconnect();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if can_reconnect {
                info!(transport_id, reason, "transport failed, starting session recovery");
                if let Err(e) = this.attempt_reconnect().await {
                    warn!(error = %e, "session recovery abandoned");
                }
            } else {
                this.state
                    .lock()
                    .expect("state lock")
                    .transition(ConnectionState::Failed);
                this.callbacks
                    .error(SessionError::transport_failure(transport_id, reason));
            }
        });
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        let current = self.state.lock().expect("state lock").current();
        // A session torn down before anything started has no legal edge
        // out of `New`, but it is still terminally closed.
        if current == ConnectionState::New && self.torn_down.load(Ordering::SeqCst) {
            return ConnectionState::Closed;
        }
        current
    }

    /// Combined stream of all live remote tracks, if any
    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.media.remote_stream()
    }

    /// The local capture stream, if one is held
    pub async fn local_stream(&self) -> Option<LocalStream> {
        self.media.local_stream().await
    }

    /// Diagnostic snapshot of the session
    pub fn stats(&self) -> SessionStats {
        let (time_in_state, transitions) = {
            let machine = self.state.lock().expect("state lock");
            (machine.time_in_state(), machine.history().len())
        };
        let state = self.state();
        SessionStats {
            state,
            time_in_state,
            transitions,
            quality_level: self.quality_level(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
            producer_count: self.media.producer_count(),
            consumer_count: self.media.consumer_count(),
            pending_producers: self.pending_producers.lock().expect("pending lock").len(),
            video_profile: self.media.video_profile(),
        }
    }

    /// Currently classified quality level
    pub fn quality_level(&self) -> QualityLevel {
        self.quality.lock().expect("quality lock").level()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn media(&self) -> &Arc<MediaManager> {
        &self.media
    }

    /// Install the state-change callback
    pub fn on_state_change<F>(&self, f: F)
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        *self.callbacks.on_state_change.lock().expect("callback lock") = Some(Arc::new(f));
    }

    /// Install the streams-update callback
    pub fn on_streams_update<F>(&self, f: F)
    where
        F: Fn(StreamsUpdate) + Send + Sync + 'static,
    {
        *self
            .callbacks
            .on_streams_update
            .lock()
            .expect("callback lock") = Some(Arc::new(f));
    }

    /// Install the error callback
    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(SessionError) + Send + Sync + 'static,
    {
        *self.callbacks.on_error.lock().expect("callback lock") = Some(Arc::new(f));
    }

    /// Install the quality-change callback
    pub fn on_quality_change<F>(&self, f: F)
    where
        F: Fn(QualityLevel, QualityLevel) + Send + Sync + 'static,
    {
        *self
            .callbacks
            .on_quality_change
            .lock()
            .expect("callback lock") = Some(Arc::new(f));
    }

    /// Run the full connect sequence: join, transports, media, produce.
    ///
    /// Legal only from `New`. Any failure moves the session to `Failed`,
    /// surfaces the error through the error callback, and returns it.
    pub async fn connect(self: &Arc<Self>) -> SessionResult<()> {
        self.config.validate()?;
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(SessionError::invalid_state("session already closed"));
        }
        if !self
            .state
            .lock()
            .expect("state lock")
            .transition(ConnectionState::Connecting)
        {
            return Err(SessionError::invalid_state(format!(
                "connect is not valid from state '{}'",
                self.state()
            )));
        }

        match self.run_connect_sequence().await {
            Ok(()) => {
                self.state
                    .lock()
                    .expect("state lock")
                    .transition(ConnectionState::Connected);
                info!(meeting_id = %self.config.meeting_id, "session connected");
                self.emit_streams_update().await;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, category = e.category(), "connect failed");
                self.state
                    .lock()
                    .expect("state lock")
                    .transition(ConnectionState::Failed);
                self.callbacks.error(e.clone());
                Err(e)
            }
        }
    }

    async fn run_connect_sequence(self: &Arc<Self>) -> SessionResult<()> {
        let bridge: Arc<dyn NotificationHandler> = Arc::new(NotificationBridge {
            orchestrator: Arc::downgrade(self),
        });
        self.signaling.register_handler(bridge).await;

        let join = self
            .signaling
            .join(&self.config.meeting_id, &self.config.participant_id)
            .await?;
        *self.rtp_capabilities.lock().expect("caps lock") = Some(join.rtp_capabilities);

        // Producers already announced by present participants are consumed
        // once the consumer transport is up.
        {
            let mut pending = self.pending_producers.lock().expect("pending lock");
            for participant in join.participants {
                for mut producer in participant.producers {
                    if producer.participant_id.is_none() {
                        producer.participant_id = Some(participant.participant_id.clone());
                    }
                    pending.push_back(producer);
                }
            }
        }

        self.setup_transport(TransportKind::Producer).await?;
        self.setup_transport(TransportKind::Consumer).await?;
        self.consumer_ready.store(true, Ordering::SeqCst);
        self.drain_pending_producers().await;

        let stream = self.media.acquire_media(Some(self.config.media.clone())).await?;
        for track in &stream.tracks {
            self.produce_track(track.kind()).await?;
        }
        Ok(())
    }

    /// Create one transport server-side, build the local half through the
    /// factory, hand it to the pool, and complete the DTLS handshake.
    async fn setup_transport(&self, kind: TransportKind) -> SessionResult<()> {
        let created: TransportCreated = match kind {
            TransportKind::Producer => {
                self.signaling
                    .create_producer_transport(&self.config.meeting_id)
                    .await?
            }
            TransportKind::Consumer => {
                self.signaling
                    .create_consumer_transport(&self.config.meeting_id)
                    .await?
            }
        };

        let transport = self.factory.create_transport(kind, &created).await?;
        let dtls = transport.dtls_parameters();
        match kind {
            TransportKind::Producer => {
                self.pool.add_producer_transport(transport).await;
                self.signaling
                    .connect_producer_transport(&created.id, dtls)
                    .await?;
                *self.send_transport_id.lock().expect("transport id lock") =
                    Some(created.id.clone());
            }
            TransportKind::Consumer => {
                self.pool.add_consumer_transport(transport).await;
                self.signaling
                    .connect_consumer_transport(&created.id, dtls)
                    .await?;
                *self.recv_transport_id.lock().expect("transport id lock") =
                    Some(created.id.clone());
            }
        }
        debug!(kind = %kind, transport_id = %created.id, "transport established");
        Ok(())
    }

    /// Announce one local track to the SFU and register the producer
    async fn produce_track(&self, kind: MediaKind) -> SessionResult<()> {
        let transport_id = self
            .send_transport_id
            .lock()
            .expect("transport id lock")
            .clone()
            .ok_or_else(|| SessionError::invalid_state("no send transport"))?;
        let stream = self
            .media
            .local_stream()
            .await
            .ok_or_else(|| SessionError::invalid_state("no local stream"))?;
        let track = stream
            .track_of_kind(kind)
            .ok_or_else(|| SessionError::invalid_state(format!("no local {kind} track")))?
            .clone();

        let settings = track.settings();
        let rtp_parameters = json!({
            "kind": kind,
            "encodings": [{ "maxBitrate": settings.max_bitrate_kbps * 1000 }],
        });

        let response = self
            .signaling
            .produce(&transport_id, kind, rtp_parameters)
            .await?;
        self.media
            .add_producer(Producer::new(response.producer_id, kind, track));
        self.pool.touch(TransportKind::Producer).await;
        Ok(())
    }

    /// Subscribe to one remote producer. Consuming the same producer twice
    /// is a no-op.
    async fn consume_remote(self: &Arc<Self>, info: RemoteProducerInfo) -> SessionResult<()> {
        if self.media.consumer_for_producer(&info.producer_id).is_some() {
            debug!(producer_id = %info.producer_id, "already consuming, skipping");
            return Ok(());
        }
        let capabilities = self
            .rtp_capabilities
            .lock()
            .expect("caps lock")
            .clone()
            .ok_or_else(|| SessionError::invalid_state("no router capabilities"))?;

        let response = self
            .signaling
            .consume(&info.producer_id, capabilities)
            .await?;
        self.media.add_consumer(Consumer::new(
            response.consumer_id,
            response.producer_id,
            info.participant_id,
            response.kind,
            RemoteTrack::new(response.kind),
        ));
        self.pool.touch(TransportKind::Consumer).await;
        self.emit_streams_update().await;
        Ok(())
    }

    /// Consume queued remote producers in arrival order. A transient
    /// failure puts the entry back at the front and stops the drain; the
    /// next drain picks it up again.
    ///
    /// At most one drain runs at a time so two triggers can never
    /// interleave their consume calls; a trigger that bounces off the
    /// guard leaves its entries for the running drain.
    async fn drain_pending_producers(self: &Arc<Self>) {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("pending-producer drain already running");
            return;
        }

        loop {
            let mut clean = true;
            loop {
                let next = self
                    .pending_producers
                    .lock()
                    .expect("pending lock")
                    .pop_front();
                let Some(info) = next else { break };

                if let Err(e) = self.consume_remote(info.clone()).await {
                    if e.is_recoverable() {
                        warn!(producer_id = %info.producer_id, error = %e, "consume failed, requeueing");
                        self.pending_producers
                            .lock()
                            .expect("pending lock")
                            .push_front(info);
                    } else {
                        warn!(producer_id = %info.producer_id, error = %e, "consume failed, dropping");
                    }
                    clean = false;
                    break;
                }
            }
            self.draining.store(false, Ordering::SeqCst);

            // An entry queued while the guard was being released would
            // otherwise sit until the next trigger; take one more pass.
            let more = clean
                && !self.pending_producers.lock().expect("pending lock").is_empty()
                && self
                    .draining
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok();
            if !more {
                break;
            }
        }
    }

    /// React to a `new-producer` push event. Queued until the consumer
    /// transport is ready, consumed immediately afterwards.
    async fn handle_new_producer(self: &Arc<Self>, info: RemoteProducerInfo) {
        if !self.consumer_ready.load(Ordering::SeqCst) {
            debug!(producer_id = %info.producer_id, "consumer transport not ready, queueing");
            let mut pending = self.pending_producers.lock().expect("pending lock");
            if !pending.iter().any(|p| p.producer_id == info.producer_id) {
                pending.push_back(info);
            }
            return;
        }
        self.pending_producers
            .lock()
            .expect("pending lock")
            .push_back(info);
        self.drain_pending_producers().await;
    }

    async fn handle_producer_closed(self: &Arc<Self>, producer_id: String) {
        self.pending_producers
            .lock()
            .expect("pending lock")
            .retain(|p| p.producer_id != producer_id);
        if self.media.remove_consumer_for_producer(&producer_id) {
            self.emit_streams_update().await;
        }
    }

    async fn handle_participant_disconnected(self: &Arc<Self>, participant_id: String) {
        self.pending_producers
            .lock()
            .expect("pending lock")
            .retain(|p| p.participant_id.as_deref() != Some(&participant_id));
        if self.media.remove_consumers_for_participant(&participant_id) > 0 {
            self.emit_streams_update().await;
        }
    }

    fn handle_connection_error(self: &Arc<Self>, reason: String) {
        self.bus.emit(
            TOPIC_SIGNALING_CLOSED,
            &BusMessage::SignalingClosed {
                reason: reason.clone(),
            },
        );
        self.handle_transport_failure("signaling".to_string(), reason);
    }

    /// Run a bounded reconnect sequence.
    ///
    /// At most one sequence runs at a time; a second call while one is in
    /// flight returns immediately. Exhausting the attempt ceiling moves
    /// the session to `Failed` and surfaces the ceiling error exactly once.
    pub async fn attempt_reconnect(self: &Arc<Self>) -> SessionResult<()> {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("reconnect already in progress");
            return Ok(());
        }
        let result = self.reconnect_inner().await;
        self.reconnecting.store(false, Ordering::SeqCst);
        result
    }

    async fn reconnect_inner(self: &Arc<Self>) -> SessionResult<()> {
        {
            let mut state = self.state.lock().expect("state lock");
            if !state.can_reconnect() {
                return Err(SessionError::invalid_state(format!(
                    "cannot reconnect from state '{}'",
                    state.current()
                )));
            }
            if !state.transition(ConnectionState::Reconnecting) {
                return Err(SessionError::invalid_state(format!(
                    "cannot reconnect from state '{}'",
                    state.current()
                )));
            }
        }
        self.consumer_ready.store(false, Ordering::SeqCst);

        let reconnect = &self.config.reconnect;
        let already_spent = self.reconnect_attempts.load(Ordering::SeqCst);
        if already_spent >= reconnect.max_attempts {
            return self.give_up_reconnect().await;
        }
        let retry = RetryConfig {
            max_attempts: reconnect.max_attempts - already_spent,
            initial_delay: Duration::from_millis(reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(reconnect.max_delay_ms),
            backoff_multiplier: 2.0,
            use_jitter: true,
        };

        let this = Arc::clone(self);
        let outcome = retry_with_backoff("session-reconnect", &retry, move || {
            let this = Arc::clone(&this);
            async move {
                let attempt = this.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                info!(attempt, "reconnect attempt");
                this.reconnect_once().await
            }
        })
        .await;

        match outcome {
            Ok(()) => {
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.state
                    .lock()
                    .expect("state lock")
                    .transition(ConnectionState::Connected);
                info!("session recovered");
                self.emit_streams_update().await;
                Ok(())
            }
            Err(e) if !e.is_recoverable() => {
                // A structural failure (malformed payload, bad state) is not
                // a budget problem; surface it as itself and leave the
                // remaining attempts unspent.
                warn!(error = %e, "reconnect hit a non-recoverable error");
                self.state
                    .lock()
                    .expect("state lock")
                    .transition(ConnectionState::Failed);
                self.callbacks.error(e.clone());
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "reconnect sequence failed");
                self.give_up_reconnect().await
            }
        }
    }

    async fn give_up_reconnect(&self) -> SessionResult<()> {
        let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
        {
            let mut state = self.state.lock().expect("state lock");
            state.mark_reconnect_exhausted();
            state.transition(ConnectionState::Failed);
        }
        let error = SessionError::MaxReconnectAttemptsExceeded { attempts };
        self.callbacks.error(error.clone());
        Err(error)
    }

    /// One full recovery pass: rejoin, rebuild both transports, re-acquire
    /// media only if every local track has ended, re-produce, re-consume.
    async fn reconnect_once(self: &Arc<Self>) -> SessionResult<()> {
        let join = self
            .signaling
            .reconnect(&self.config.meeting_id, &self.config.participant_id)
            .await?;
        *self.rtp_capabilities.lock().expect("caps lock") = Some(join.rtp_capabilities);

        {
            let mut pending = self.pending_producers.lock().expect("pending lock");
            for participant in join.participants {
                for mut producer in participant.producers {
                    if producer.participant_id.is_none() {
                        producer.participant_id = Some(participant.participant_id.clone());
                    }
                    if !pending.iter().any(|p| p.producer_id == producer.producer_id) {
                        pending.push_back(producer);
                    }
                }
            }
        }

        self.setup_transport(TransportKind::Producer).await?;
        self.setup_transport(TransportKind::Consumer).await?;
        self.consumer_ready.store(true, Ordering::SeqCst);

        // Capture survives most outages; only restart it when every track
        // actually ended.
        let need_media = match self.media.local_stream().await {
            Some(stream) => stream.all_ended(),
            None => true,
        };
        let stream = if need_media {
            self.media.acquire_media(Some(self.config.media.clone())).await?
        } else {
            self.media
                .local_stream()
                .await
                .ok_or_else(|| SessionError::invalid_state("no local stream"))?
        };
        for track in &stream.tracks {
            if !track.has_ended() {
                self.produce_track(track.kind()).await?;
            }
        }
        self.drain_pending_producers().await;
        Ok(())
    }

    /// Toggle outbound audio at both the network and capture level
    pub async fn set_audio_enabled(&self, enabled: bool) {
        self.media.set_track_enabled(MediaKind::Audio, enabled).await;
    }

    /// Toggle outbound video at both the network and capture level
    pub async fn set_video_enabled(&self, enabled: bool) {
        self.media.set_track_enabled(MediaKind::Video, enabled).await;
    }

    /// Tear the session down. Idempotent; subsystem teardown runs
    /// concurrently and a failure in one never blocks the others.
    pub async fn disconnect(self: &Arc<Self>) {
        if self.torn_down.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock().expect("state lock");
            match state.current() {
                ConnectionState::Closed | ConnectionState::Closing => return,
                ConnectionState::New => {
                    // Nothing was ever started; release what little exists.
                }
                ConnectionState::Connected | ConnectionState::Failed => {
                    state.transition(ConnectionState::Closing);
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    state.transition(ConnectionState::Failed);
                    state.transition(ConnectionState::Closing);
                }
            }
        }
        self.consumer_ready.store(false, Ordering::SeqCst);
        self.pending_producers.lock().expect("pending lock").clear();

        // Final teardown stops capture unconditionally; the device must not
        // stay hot just because a producer still references its track.
        tokio::join!(
            self.signaling.cleanup(),
            self.media.cleanup(true),
            self.pool.cleanup(),
        );

        {
            let mut state = self.state.lock().expect("state lock");
            if state.current() == ConnectionState::Closing {
                state.transition(ConnectionState::Closed);
            }
        }
        self.torn_down.store(true, Ordering::SeqCst);
        info!(meeting_id = %self.config.meeting_id, "session closed");
    }

    async fn emit_streams_update(&self) {
        let update = StreamsUpdate {
            local: self.media.local_stream().await,
            remote: self.media.remote_stream(),
        };
        self.callbacks.streams_updated(update);
    }
}

/// Forwards signaling push events into the orchestrator. Holds a `Weak`
/// so a registered handler never keeps a dropped session alive.
struct NotificationBridge {
    orchestrator: Weak<SessionOrchestrator>,
}

#[async_trait::async_trait]
impl NotificationHandler for NotificationBridge {
    async fn on_new_producer(&self, info: RemoteProducerInfo) {
        if let Some(this) = self.orchestrator.upgrade() {
            this.handle_new_producer(info).await;
        }
    }

    async fn on_producer_closed(&self, producer_id: String) {
        if let Some(this) = self.orchestrator.upgrade() {
            this.handle_producer_closed(producer_id).await;
        }
    }

    async fn on_participant_disconnected(&self, participant_id: String) {
        if let Some(this) = self.orchestrator.upgrade() {
            this.handle_participant_disconnected(participant_id).await;
        }
    }

    async fn on_meeting_ended(&self) {
        if let Some(this) = self.orchestrator.upgrade() {
            info!("meeting ended by server");
            // Teardown aborts the signaling dispatch task this handler
            // runs on; detach so the abort cannot cancel the teardown.
            tokio::spawn(async move { this.disconnect().await });
        }
    }

    async fn on_connection_error(&self, reason: String) {
        if let Some(this) = self.orchestrator.upgrade() {
            this.handle_connection_error(reason);
        }
    }
}
