//! Session configuration
//!
//! One aggregate struct carrying every tunable, with defaults that match
//! production behavior. Builders hand this to the orchestrator; nothing
//! here is consulted after construction.

use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};
use crate::media::MediaConstraints;
use crate::signaling::SignalingTimeouts;
use crate::transport::TransportPoolConfig;

/// Reconnection ceiling and backoff shape for full session recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Hard ceiling on reconnect attempts per outage
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Cap on the doubled delay
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 16_000,
        }
    }
}

/// Quality-monitor window size and classification thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Samples kept in each rolling window
    pub window_size: usize,
    /// Enable automatic video-profile adaptation on level changes
    pub auto_adapt: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            auto_adapt: true,
        }
    }
}

/// Everything the orchestrator needs to know up front
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Meeting to join
    pub meeting_id: String,
    /// Our participant identity
    pub participant_id: String,
    /// Default capture constraints, merged under any per-call overrides
    pub media: MediaConstraints,
    pub signaling: SignalingTimeouts,
    pub transport: TransportPoolConfig,
    pub reconnect: ReconnectConfig,
    pub quality: QualityConfig,
}

impl SessionConfig {
    pub fn new(meeting_id: impl Into<String>, participant_id: impl Into<String>) -> Self {
        Self {
            meeting_id: meeting_id.into(),
            participant_id: participant_id.into(),
            ..Default::default()
        }
    }

    pub fn with_media(mut self, media: MediaConstraints) -> Self {
        self.media = media;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_transport(mut self, transport: TransportPoolConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_quality(mut self, quality: QualityConfig) -> Self {
        self.quality = quality;
        self
    }

    /// Reject configurations that cannot produce a working session
    pub fn validate(&self) -> SessionResult<()> {
        if self.meeting_id.is_empty() {
            return Err(SessionError::invalid_state("meeting_id must not be empty"));
        }
        if self.participant_id.is_empty() {
            return Err(SessionError::invalid_state(
                "participant_id must not be empty",
            ));
        }
        if self.quality.window_size == 0 {
            return Err(SessionError::invalid_state(
                "quality window_size must be at least 1",
            ));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(SessionError::invalid_state(
                "reconnect initial delay exceeds max delay",
            ));
        }
        Ok(())
    }
}
