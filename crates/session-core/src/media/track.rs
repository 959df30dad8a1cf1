//! Local and remote track handles, capture constraints, and the fixed
//! video quality profiles
//!
//! Track handles are thin shared-state wrappers around whatever the
//! platform capture layer hands back through the [`MediaDevices`] seam.
//! The manager owns the lifecycle; everything here is cheaply clonable
//! because the interesting state lives behind an `Arc`.
//!
//! [`MediaDevices`]: crate::media::MediaDevices

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

/// Media kind of a track, producer, or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Reported capture-permission state, when the platform can report one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
    Prompt,
}

/// Audio capture constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Preferred capture device, `None` for the platform default
    pub device_id: Option<String>,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            device_id: None,
        }
    }
}

/// Video capture constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Preferred capture device, `None` for the platform default
    pub device_id: Option<String>,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
            device_id: None,
        }
    }
}

/// Capture constraints for an acquisition request.
///
/// `None` for a kind means "do not capture that kind". The defaults
/// request both kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: Some(VideoConstraints::default()),
        }
    }
}

impl MediaConstraints {
    /// Shallow per-kind merge: a custom `audio`/`video` entry replaces the
    /// default entry wholesale, an absent entry keeps the default.
    pub fn merged_over(self, defaults: &MediaConstraints) -> MediaConstraints {
        MediaConstraints {
            audio: self.audio.or_else(|| defaults.audio.clone()),
            video: self.video.or_else(|| defaults.video.clone()),
        }
    }
}

/// The three fixed constraint profiles applied by quality adaptation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityProfile {
    High,
    Medium,
    Low,
}

impl fmt::Display for QualityProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => f.write_str("high"),
            Self::Medium => f.write_str("medium"),
            Self::Low => f.write_str("low"),
        }
    }
}

/// Resolution / frame-rate / bitrate bounds of one profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub max_bitrate_kbps: u32,
}

impl QualityProfile {
    /// The fixed settings table
    pub fn settings(&self) -> ProfileSettings {
        match self {
            Self::High => ProfileSettings {
                width: 1280,
                height: 720,
                frame_rate: 30,
                max_bitrate_kbps: 2500,
            },
            Self::Medium => ProfileSettings {
                width: 640,
                height: 480,
                frame_rate: 25,
                max_bitrate_kbps: 1000,
            },
            Self::Low => ProfileSettings {
                width: 320,
                height: 240,
                frame_rate: 15,
                max_bitrate_kbps: 300,
            },
        }
    }
}

/// Mutable track settings, adjusted by quality adaptation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub max_bitrate_kbps: u32,
}

struct TrackShared {
    enabled: AtomicBool,
    ended_tx: watch::Sender<bool>,
    settings: Mutex<TrackSettings>,
}

/// Handle to one locally captured track
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    device_label: Option<String>,
    shared: Arc<TrackShared>,
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.has_ended())
            .finish()
    }
}

impl LocalTrack {
    /// Create a live, enabled track handle. Used by [`MediaDevices`]
    /// implementations and by tests.
    ///
    /// [`MediaDevices`]: crate::media::MediaDevices
    pub fn new(kind: MediaKind, device_label: Option<String>) -> Self {
        let settings = match kind {
            MediaKind::Video => {
                let s = QualityProfile::High.settings();
                TrackSettings {
                    width: s.width,
                    height: s.height,
                    frame_rate: s.frame_rate,
                    max_bitrate_kbps: s.max_bitrate_kbps,
                }
            }
            MediaKind::Audio => TrackSettings {
                width: 0,
                height: 0,
                frame_rate: 0,
                max_bitrate_kbps: 64,
            },
        };
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            device_label,
            shared: Arc::new(TrackShared {
                enabled: AtomicBool::new(true),
                ended_tx: watch::channel(false).0,
                settings: Mutex::new(settings),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn device_label(&self) -> Option<&str> {
        self.device_label.as_deref()
    }

    /// Capture-level mute toggle
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Whether the underlying capture source has stopped for good
    pub fn has_ended(&self) -> bool {
        *self.shared.ended_tx.borrow()
    }

    /// Stop the capture source. Idempotent.
    pub fn stop(&self) {
        self.shared.ended_tx.send_replace(true);
    }

    /// Watch for the track ending (device unplug, `stop()`)
    pub fn subscribe_ended(&self) -> watch::Receiver<bool> {
        self.shared.ended_tx.subscribe()
    }

    /// Apply a quality-profile's bounds to this track
    pub fn apply_settings(&self, settings: TrackSettings) {
        *self.shared.settings.lock().expect("track settings lock") = settings;
    }

    /// Current settings snapshot
    pub fn settings(&self) -> TrackSettings {
        *self.shared.settings.lock().expect("track settings lock")
    }
}

/// Handle to one remote track received through a consumer
#[derive(Clone)]
pub struct RemoteTrack {
    id: String,
    kind: MediaKind,
    live: Arc<AtomicBool>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("live", &self.is_live())
            .finish()
    }
}

impl RemoteTrack {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// The locally captured stream: the set of tracks one acquisition returned
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn track_of_kind(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Whether every track has ended (or the stream is empty)
    pub fn all_ended(&self) -> bool {
        self.tracks.iter().all(|t| t.has_ended())
    }
}

/// A synthesized stream combining every live remote track
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub tracks: Vec<RemoteTrack>,
}
