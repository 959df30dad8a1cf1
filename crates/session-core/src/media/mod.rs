//! Local/remote media ownership: capture stream, producers, consumers
//!
//! The manager is the sole owner of the local capture stream and of every
//! producer/consumer wrapper. Producers are keyed by media kind (at most
//! one per kind), consumers by the remote producer id they were created
//! for. Entries register self-removal on close and on track-ended so the
//! maps never hold stale handles.

pub mod track;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};
pub use track::{
    AudioConstraints, LocalStream, LocalTrack, MediaConstraints, MediaKind, PermissionState,
    ProfileSettings, QualityProfile, RemoteStream, RemoteTrack, TrackSettings, VideoConstraints,
};

/// Boundary to the platform capture layer.
///
/// Implementations bridge to whatever actually captures media (a browser
/// runtime, a native device layer, a test double). The manager only ever
/// talks to this trait.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Best-effort permission lookup. `None` when the platform cannot
    /// report permission state; acquisition proceeds regardless.
    async fn permission_state(&self) -> Option<PermissionState>;

    /// Request a capture stream satisfying the constraints
    async fn acquire(&self, constraints: &MediaConstraints) -> SessionResult<LocalStream>;
}

/// One local outbound track being sent to the SFU
pub struct Producer {
    id: String,
    kind: MediaKind,
    track: LocalTrack,
    paused: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("paused", &self.is_paused())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Producer {
    /// Wrap a server-assigned producer id around a local track
    pub fn new(id: impl Into<String>, kind: MediaKind, track: LocalTrack) -> Self {
        Self {
            id: id.into(),
            kind,
            track,
            paused: AtomicBool::new(false),
            closed_tx: watch::channel(false).0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn track(&self) -> &LocalTrack {
        &self.track
    }

    /// Network-level mute: stop sending without touching capture
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume sending
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Close the producer. Idempotent; does not stop the capture track.
    pub fn close(&self) {
        self.closed_tx.send_replace(true);
    }

    /// Watch for this producer closing
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}

/// One remote inbound track received from the SFU
pub struct Consumer {
    id: String,
    producer_id: String,
    participant_id: Option<String>,
    kind: MediaKind,
    track: RemoteTrack,
    closed_tx: watch::Sender<bool>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("producer_id", &self.producer_id)
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Consumer {
    pub fn new(
        id: impl Into<String>,
        producer_id: impl Into<String>,
        participant_id: Option<String>,
        kind: MediaKind,
        track: RemoteTrack,
    ) -> Self {
        Self {
            id: id.into(),
            producer_id: producer_id.into(),
            participant_id,
            kind,
            track,
            closed_tx: watch::channel(false).0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn participant_id(&self) -> Option<&str> {
        self.participant_id.as_deref()
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn track(&self) -> &RemoteTrack {
        &self.track
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Close the consumer and stop its remote track. Idempotent.
    pub fn close(&self) {
        self.track.stop();
        self.closed_tx.send_replace(true);
    }

    /// Watch for this consumer closing
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}

/// Owner of local capture and of all producer/consumer wrappers
pub struct MediaManager {
    devices: Arc<dyn MediaDevices>,
    defaults: MediaConstraints,
    local_stream: RwLock<Option<LocalStream>>,
    producers: Arc<DashMap<MediaKind, Arc<Producer>>>,
    consumers: Arc<DashMap<String, Arc<Consumer>>>,
    active_devices: DashMap<MediaKind, String>,
    video_profile: Mutex<QualityProfile>,
}

impl fmt::Debug for MediaManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaManager")
            .field("producers", &self.producers.len())
            .field("consumers", &self.consumers.len())
            .finish()
    }
}

impl MediaManager {
    /// Create a manager over a device boundary with default constraints
    pub fn new(devices: Arc<dyn MediaDevices>, defaults: MediaConstraints) -> Self {
        Self {
            devices,
            defaults,
            local_stream: RwLock::new(None),
            producers: Arc::new(DashMap::new()),
            consumers: Arc::new(DashMap::new()),
            active_devices: DashMap::new(),
            video_profile: Mutex::new(QualityProfile::High),
        }
    }

    /// Acquire the local capture stream.
    ///
    /// Custom constraints shallow-override the defaults per kind. The
    /// permission lookup is best-effort: an unreportable state does not
    /// block acquisition, a reported denial fails fast.
    pub async fn acquire_media(
        &self,
        custom: Option<MediaConstraints>,
    ) -> SessionResult<LocalStream> {
        let constraints = match custom {
            Some(c) => c.merged_over(&self.defaults),
            None => self.defaults.clone(),
        };

        match self.devices.permission_state().await {
            Some(PermissionState::Denied) => {
                return Err(SessionError::media_acquisition(
                    "capture permission denied",
                ));
            }
            Some(_) => {}
            None => {
                debug!("platform cannot report capture permissions, continuing");
            }
        }

        let stream = self
            .devices
            .acquire(&constraints)
            .await
            .map_err(|e| SessionError::media_acquisition(e.to_string()))?;

        for track in &stream.tracks {
            if let Some(label) = track.device_label() {
                self.active_devices.insert(track.kind(), label.to_string());
            }
        }

        *self.local_stream.write().await = Some(stream.clone());
        debug!(tracks = stream.tracks.len(), "acquired local media");
        Ok(stream)
    }

    /// Current local stream, if one is held
    pub async fn local_stream(&self) -> Option<LocalStream> {
        self.local_stream.read().await.clone()
    }

    /// Active capture device label per kind, when reported
    pub fn active_device(&self, kind: MediaKind) -> Option<String> {
        self.active_devices.get(&kind).map(|e| e.value().clone())
    }

    /// Store a producer keyed by kind, replacing and closing any prior
    /// producer of the same kind. Registers self-removal on producer close
    /// and on track end.
    pub fn add_producer(&self, producer: Producer) -> Arc<Producer> {
        let producer = Arc::new(producer);
        let kind = producer.kind();
        if let Some(prior) = self.producers.insert(kind, Arc::clone(&producer)) {
            prior.close();
        }

        let producers = Arc::clone(&self.producers);
        let watched = Arc::clone(&producer);
        let mut closed = producer.subscribe_closed();
        let mut ended = producer.track().subscribe_ended();
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.wait_for(|c| *c) => {}
                _ = ended.wait_for(|e| *e) => {
                    watched.close();
                }
            }
            producers.remove_if(&kind, |_, p| Arc::ptr_eq(p, &watched));
            debug!(kind = %kind, producer_id = watched.id(), "producer removed");
        });
        producer
    }

    /// Store a consumer keyed by the remote producer id. Registers
    /// self-removal on consumer close.
    pub fn add_consumer(&self, consumer: Consumer) -> Arc<Consumer> {
        let consumer = Arc::new(consumer);
        let key = consumer.producer_id().to_string();
        if let Some(prior) = self.consumers.insert(key.clone(), Arc::clone(&consumer)) {
            prior.close();
        }

        let consumers = Arc::clone(&self.consumers);
        let watched = Arc::clone(&consumer);
        let mut closed = consumer.subscribe_closed();
        tokio::spawn(async move {
            let _ = closed.wait_for(|c| *c).await;
            consumers.remove_if(&key, |_, c| Arc::ptr_eq(c, &watched));
            debug!(producer_id = watched.producer_id(), "consumer removed");
        });
        consumer
    }

    /// Producer of a kind, if one is live
    pub fn producer(&self, kind: MediaKind) -> Option<Arc<Producer>> {
        self.producers.get(&kind).map(|e| Arc::clone(e.value()))
    }

    /// Consumer created for a remote producer id, if any
    pub fn consumer_for_producer(&self, producer_id: &str) -> Option<Arc<Consumer>> {
        self.consumers.get(producer_id).map(|e| Arc::clone(e.value()))
    }

    /// Number of live consumers
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Number of live producers
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    /// Pause/resume the matching producer (network-level) and toggle the
    /// matching local track (capture-level) together, so remote peers and
    /// the local preview stay consistent.
    pub async fn set_track_enabled(&self, kind: MediaKind, enabled: bool) {
        if let Some(producer) = self.producer(kind) {
            if enabled {
                producer.resume();
            } else {
                producer.pause();
            }
        } else {
            warn!(kind = %kind, "no producer to toggle");
        }

        if let Some(stream) = self.local_stream.read().await.as_ref() {
            if let Some(track) = stream.track_of_kind(kind) {
                track.set_enabled(enabled);
            }
        }
    }

    /// Apply one of the fixed video constraint profiles to the active
    /// video track. No-op when the profile is already active.
    pub async fn change_quality(&self, profile: QualityProfile) -> SessionResult<()> {
        {
            let mut current = self.video_profile.lock().expect("video profile lock");
            if *current == profile {
                return Ok(());
            }
            *current = profile;
        }

        let settings = profile.settings();
        if let Some(stream) = self.local_stream.read().await.as_ref() {
            if let Some(track) = stream.track_of_kind(MediaKind::Video) {
                track.apply_settings(TrackSettings {
                    width: settings.width,
                    height: settings.height,
                    frame_rate: settings.frame_rate,
                    max_bitrate_kbps: settings.max_bitrate_kbps,
                });
                debug!(profile = %profile, "applied video quality profile");
            }
        }
        Ok(())
    }

    /// Currently active video profile
    pub fn video_profile(&self) -> QualityProfile {
        *self.video_profile.lock().expect("video profile lock")
    }

    /// Synthesize a combined stream from all live consumers.
    ///
    /// Returns `None` when no live consumer exists, never an empty
    /// stream, so callers can distinguish "no remote media yet".
    pub fn remote_stream(&self) -> Option<RemoteStream> {
        let tracks: Vec<RemoteTrack> = self
            .consumers
            .iter()
            .filter(|e| !e.value().is_closed() && e.value().track().is_live())
            .map(|e| e.value().track().clone())
            .collect();
        if tracks.is_empty() {
            None
        } else {
            Some(RemoteStream { tracks })
        }
    }

    /// Close the consumer created for a remote producer, if present.
    /// Returns whether one was found.
    pub fn remove_consumer_for_producer(&self, producer_id: &str) -> bool {
        match self.consumers.remove(producer_id) {
            Some((_, consumer)) => {
                consumer.close();
                true
            }
            None => false,
        }
    }

    /// Close every consumer belonging to a participant. Returns how many
    /// were closed.
    pub fn remove_consumers_for_participant(&self, participant_id: &str) -> usize {
        let matching: Vec<String> = self
            .consumers
            .iter()
            .filter(|e| e.value().participant_id() == Some(participant_id))
            .map(|e| e.key().clone())
            .collect();
        for key in &matching {
            if let Some((_, consumer)) = self.consumers.remove(key) {
                consumer.close();
            }
        }
        matching.len()
    }

    /// Tear down all media state.
    ///
    /// Local tracks are stopped only when no live, unclosed producer still
    /// references them, unless `force` is set. Producer/consumer close
    /// failures are logged individually; one failure never aborts the
    /// rest. Idempotent.
    pub async fn cleanup(&self, force: bool) {
        let stream = self.local_stream.write().await.take();
        if let Some(stream) = stream {
            for track in &stream.tracks {
                let referenced = self
                    .producers
                    .get(&track.kind())
                    .map(|p| !p.is_closed() && p.track().id() == track.id())
                    .unwrap_or(false);
                if force || !referenced {
                    track.stop();
                } else {
                    debug!(
                        kind = %track.kind(),
                        "leaving track running, still referenced by a live producer"
                    );
                }
            }
        }

        for entry in self.producers.iter() {
            entry.value().close();
        }
        self.producers.clear();

        for entry in self.consumers.iter() {
            entry.value().close();
        }
        self.consumers.clear();
        self.active_devices.clear();
        debug!(force = force, "media manager cleaned up");
    }
}
