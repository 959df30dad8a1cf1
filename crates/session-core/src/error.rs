//! Error types for the session orchestration core
//!
//! All fallible operations in this crate return [`SessionResult`]. The
//! taxonomy distinguishes transient failures (retried locally with bounded
//! attempts, never surfaced to the UI boundary unless the bound is
//! exceeded) from structural failures (surfaced once via the error
//! callback and forcing the session into `Failed`).

use thiserror::Error;

/// Result type for session-core operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur while orchestrating a meeting session
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// A signaling request received no response before its timer expired
    #[error("signaling request '{event}' timed out after {timeout_ms}ms")]
    SignalingTimeout { event: String, timeout_ms: u64 },

    /// The server answered a signaling request with an error field
    #[error("signaling request '{event}' rejected by server: {reason}")]
    SignalingRejected { event: String, reason: String },

    /// The signaling channel closed underneath us
    #[error("signaling channel closed: {reason}")]
    ChannelClosed { reason: String },

    /// A signaling payload did not match the expected shape
    #[error("malformed '{event}' payload: {reason}")]
    MalformedPayload { event: String, reason: String },

    /// Local media capture could not be acquired
    #[error("failed to acquire local media: {reason}")]
    MediaAcquisition { reason: String },

    /// A transport exhausted its local recovery budget
    #[error("transport '{transport_id}' failed: {reason}")]
    TransportFailure { transport_id: String, reason: String },

    /// A state transition not present in the transition table was requested.
    /// Logged and swallowed by the state machine; carried here only so
    /// callers that want to inspect rejections have a typed value.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// The reconnect loop hit its attempt ceiling
    #[error("reconnect abandoned after {attempts} attempts")]
    MaxReconnectAttemptsExceeded { attempts: u32 },

    /// The operation is not valid in the current session state
    #[error("invalid session state: {message}")]
    InvalidState { message: String },

    /// Catch-all for internal invariant breakage
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl SessionError {
    /// Create a channel-closed error
    pub fn channel_closed(reason: impl Into<String>) -> Self {
        Self::ChannelClosed {
            reason: reason.into(),
        }
    }

    /// Create a media acquisition error
    pub fn media_acquisition(reason: impl Into<String>) -> Self {
        Self::MediaAcquisition {
            reason: reason.into(),
        }
    }

    /// Create a transport failure error
    pub fn transport_failure(
        transport_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::TransportFailure {
            transport_id: transport_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a malformed-payload error
    pub fn malformed(event: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            event: event.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid-state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a bounded retry is worth attempting for this error.
    ///
    /// Transient network-shaped failures are recoverable; structural
    /// failures (denied media, exhausted reconnect budget, malformed
    /// payloads) are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SignalingTimeout { .. }
                | Self::SignalingRejected { .. }
                | Self::ChannelClosed { .. }
                | Self::TransportFailure { .. }
        )
    }

    /// Coarse error category used in structured log fields
    pub fn category(&self) -> &'static str {
        match self {
            Self::SignalingTimeout { .. }
            | Self::SignalingRejected { .. }
            | Self::ChannelClosed { .. }
            | Self::MalformedPayload { .. } => "signaling",
            Self::MediaAcquisition { .. } => "media",
            Self::TransportFailure { .. } => "transport",
            Self::InvalidStateTransition { .. } | Self::InvalidState { .. } => "state",
            Self::MaxReconnectAttemptsExceeded { .. } => "reconnect",
            Self::Internal { .. } => "internal",
        }
    }
}
