//! # confab-session-core
//!
//! Session orchestration for a video-conferencing client talking to an
//! SFU (selective forwarding unit). The crate owns everything between the
//! signaling channel and the UI boundary: the join sequence, transport
//! setup and recovery, local capture and producer/consumer lifecycles,
//! connection state, and network-quality adaptation.
//!
//! The embedding application provides three seams and receives four
//! callbacks:
//!
//! - [`SignalingChannel`](signaling::SignalingChannel): the raw
//!   bidirectional message channel to the conference server
//! - [`MediaDevices`](media::MediaDevices): the platform capture layer
//! - [`TransportFactory`](transport::TransportFactory): constructs live
//!   transports from server-side parameters
//! - callbacks for state changes, stream updates, errors, and quality
//!   level changes, all carrying plain data
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use confab_session_core::SessionBuilder;
//! # use confab_session_core::signaling::SignalingChannel;
//! # use confab_session_core::media::MediaDevices;
//! # use confab_session_core::transport::TransportFactory;
//! # async fn example(
//! #     channel: Arc<dyn SignalingChannel>,
//! #     rx: tokio::sync::mpsc::UnboundedReceiver<confab_session_core::signaling::ServerMessage>,
//! #     devices: Arc<dyn MediaDevices>,
//! #     factory: Arc<dyn TransportFactory>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let session = SessionBuilder::new("meeting-1", "alice")
//!     .signaling(channel, rx)
//!     .devices(devices)
//!     .transport_factory(factory)
//!     .build()?;
//!
//! session.on_state_change(|new, old| {
//!     println!("session {old} -> {new}");
//! });
//!
//! session.connect().await?;
//! // ...
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod events;
pub mod media;
pub mod quality;
pub mod session;
pub mod signaling;
pub mod state;
pub mod transport;

pub use error::{SessionError, SessionResult};
pub use events::{BusMessage, EventBus, ListenerId};
pub use media::{MediaConstraints, MediaKind, QualityProfile};
pub use quality::{QualityLevel, QualitySample};
pub use session::{
    QualityConfig, ReconnectConfig, SessionBuilder, SessionConfig, SessionOrchestrator,
    SessionStats, StreamsUpdate,
};
pub use state::{ConnectionState, ConnectionStateMachine};
pub use transport::{TransportKind, TransportPoolConfig};
