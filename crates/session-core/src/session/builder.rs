//! Fluent construction of a [`SessionOrchestrator`]
//!
//! The builder collects the meeting identity, configuration overrides,
//! and the three platform seams (signaling channel, media devices,
//! transport factory), then assembles the orchestrator with everything
//! wired.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{SessionError, SessionResult};
use crate::events::EventBus;
use crate::media::{MediaConstraints, MediaDevices, MediaManager};
use crate::session::config::{QualityConfig, ReconnectConfig, SessionConfig};
use crate::session::SessionOrchestrator;
use crate::signaling::{ServerMessage, SignalingChannel, SignalingClient};
use crate::transport::{TransportFactory, TransportPoolConfig};

/// Builder for a fully wired session
pub struct SessionBuilder {
    config: SessionConfig,
    channel: Option<Arc<dyn SignalingChannel>>,
    incoming: Option<mpsc::UnboundedReceiver<ServerMessage>>,
    devices: Option<Arc<dyn MediaDevices>>,
    factory: Option<Arc<dyn TransportFactory>>,
    bus: Option<EventBus>,
}

impl SessionBuilder {
    pub fn new(meeting_id: impl Into<String>, participant_id: impl Into<String>) -> Self {
        Self {
            config: SessionConfig::new(meeting_id, participant_id),
            channel: None,
            incoming: None,
            devices: None,
            factory: None,
            bus: None,
        }
    }

    /// The raw signaling channel and its inbound message stream
    pub fn signaling(
        mut self,
        channel: Arc<dyn SignalingChannel>,
        incoming: mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Self {
        self.channel = Some(channel);
        self.incoming = Some(incoming);
        self
    }

    /// The platform capture layer
    pub fn devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// The transport constructor
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Share an existing event bus instead of creating a private one
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn media_constraints(mut self, media: MediaConstraints) -> Self {
        self.config.media = media;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn transport_config(mut self, transport: TransportPoolConfig) -> Self {
        self.config.transport = transport;
        self
    }

    pub fn quality(mut self, quality: QualityConfig) -> Self {
        self.config.quality = quality;
        self
    }

    /// Validate and assemble. Fails when a required seam is missing or the
    /// configuration is unusable.
    pub fn build(self) -> SessionResult<Arc<SessionOrchestrator>> {
        self.config.validate()?;
        let channel = self
            .channel
            .ok_or_else(|| SessionError::invalid_state("signaling channel is required"))?;
        let incoming = self
            .incoming
            .ok_or_else(|| SessionError::invalid_state("signaling receiver is required"))?;
        let devices = self
            .devices
            .ok_or_else(|| SessionError::invalid_state("media devices are required"))?;
        let factory = self
            .factory
            .ok_or_else(|| SessionError::invalid_state("transport factory is required"))?;

        let signaling = Arc::new(SignalingClient::new(
            channel,
            incoming,
            self.config.signaling.clone(),
        ));
        let media = Arc::new(MediaManager::new(devices, self.config.media.clone()));
        let bus = self.bus.unwrap_or_default();

        Ok(SessionOrchestrator::new(
            self.config,
            signaling,
            media,
            factory,
            bus,
        ))
    }
}
