//! Connection state machine for one meeting session
//!
//! A strict finite-state machine with a fixed transition table. Illegal
//! transitions are rejected and logged, never applied; `Closed` is
//! terminal. The change callback is invoked synchronously on every applied
//! transition, so observers always see transitions in order.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// The connection lifecycle states of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ConnectionState {
    /// Created, nothing attempted yet
    New,
    /// Join/transport/media setup in progress
    Connecting,
    /// Fully established and exchanging media
    Connected,
    /// A reconnect sequence is running
    Reconnecting,
    /// Setup or recovery failed; only a fresh `connect()` can leave here
    Failed,
    /// Teardown in progress
    Closing,
    /// Torn down. Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One applied transition, recorded in the history log
#[derive(Debug, Clone)]
pub struct StateTransition {
    /// State we left
    pub from: ConnectionState,
    /// State we entered
    pub to: ConnectionState,
    /// Wall-clock time of the transition
    pub at: DateTime<Utc>,
    /// How long the session sat in `from`
    pub held_for: Duration,
}

/// Callback invoked synchronously on every applied transition
pub type StateChangeFn = Box<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

/// Validated connection state machine with transition history
pub struct ConnectionStateMachine {
    current: ConnectionState,
    history: Vec<StateTransition>,
    entered_at: Instant,
    last_change: DateTime<Utc>,
    reconnect_exhausted: bool,
    on_change: Option<StateChangeFn>,
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("current", &self.current)
            .field("transitions", &self.history.len())
            .field("reconnect_exhausted", &self.reconnect_exhausted)
            .finish()
    }
}

/// The only legal edges. Everything else is rejected.
fn is_legal(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (New, Connecting)
            | (Connecting, Connected)
            | (Connecting, Failed)
            | (Connected, Reconnecting)
            | (Connected, Closing)
            | (Connected, Failed)
            | (Reconnecting, Connected)
            | (Reconnecting, Failed)
            | (Failed, Closing)
            | (Failed, Reconnecting)
            | (Closing, Closed)
    )
}

impl ConnectionStateMachine {
    /// Create a machine in `New` with no change callback
    pub fn new() -> Self {
        Self {
            current: ConnectionState::New,
            history: Vec::new(),
            entered_at: Instant::now(),
            last_change: Utc::now(),
            reconnect_exhausted: false,
            on_change: None,
        }
    }

    /// Install the change callback, replacing any prior one
    pub fn set_on_change(&mut self, f: StateChangeFn) {
        self.on_change = Some(f);
    }

    /// Current state
    pub fn current(&self) -> ConnectionState {
        self.current
    }

    /// Wall-clock time of the most recent applied transition
    pub fn last_state_change(&self) -> DateTime<Utc> {
        self.last_change
    }

    /// How long the session has been in the current state
    pub fn time_in_state(&self) -> Duration {
        self.entered_at.elapsed()
    }

    /// The ordered transition log
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Attempt a transition.
    ///
    /// Returns `true` when the transition was applied. A request for the
    /// state we are already in is a no-op (returns `true`, no callback).
    /// An edge not in the transition table is rejected with a warning and
    /// leaves the machine unchanged; the change callback is not invoked.
    pub fn transition(&mut self, to: ConnectionState) -> bool {
        let from = self.current;
        if from == to {
            return true;
        }
        if !is_legal(from, to) {
            warn!(from = %from, to = %to, "rejected invalid state transition");
            return false;
        }

        let held_for = self.entered_at.elapsed();
        let at = Utc::now();
        self.history.push(StateTransition {
            from,
            to,
            at,
            held_for,
        });
        self.current = to;
        self.entered_at = Instant::now();
        self.last_change = at;
        debug!(from = %from, to = %to, held_ms = held_for.as_millis() as u64, "state transition");

        if let Some(cb) = &self.on_change {
            cb(to, from);
        }
        true
    }

    /// Mark the reconnect budget as spent. `can_reconnect` stays false
    /// until the machine is replaced by a fresh session attempt.
    pub fn mark_reconnect_exhausted(&mut self) {
        self.reconnect_exhausted = true;
    }

    /// Whether a reconnect sequence may be started from the current state
    pub fn can_reconnect(&self) -> bool {
        !self.reconnect_exhausted
            && !matches!(
                self.current,
                ConnectionState::Closed | ConnectionState::Closing
            )
    }

    /// True only when fully connected
    pub fn is_stable(&self) -> bool {
        self.current == ConnectionState::Connected
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
