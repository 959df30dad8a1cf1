//! Transport ownership, health monitoring, and local recovery
//!
//! The pool owns the send and receive transports and converts low-level
//! connectivity events into one clear signal for the orchestrator:
//! healthy, recovering, or failed. Recovery is local first (bounded ICE
//! restarts); only when the budget is spent does the pool escalate a
//! `transport-failed` bus event.
//!
//! There is at most one active transport per kind. Replaced records are
//! closed and parked on a stale list that is reaped opportunistically
//! after an idle timeout, not on a dedicated timer.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SessionResult;
use crate::events::{
    BusMessage, EventBus, TOPIC_TRANSPORT_FAILED, TOPIC_TRANSPORT_RECOVERING,
    TOPIC_TRANSPORT_STATS,
};
use crate::quality::QualitySample;
use crate::signaling::TransportCreated;

/// Which direction a transport carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Producer,
    Consumer,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Producer => f.write_str("producer"),
            Self::Consumer => f.write_str("consumer"),
        }
    }
}

/// Connection state of one transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE-level state of one transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// One stats-poll measurement from a transport
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportStats {
    pub rtt_ms: f64,
    pub packet_loss: f64,
    pub bitrate_kbps: f64,
}

impl From<TransportStats> for QualitySample {
    fn from(stats: TransportStats) -> Self {
        QualitySample {
            rtt_ms: stats.rtt_ms,
            packet_loss: stats.packet_loss,
            bitrate_kbps: stats.bitrate_kbps,
        }
    }
}

/// The negotiated network path (ICE/DTLS) over which producers or
/// consumers flow. Implementations bridge to the actual media stack.
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> &str;
    fn connection_state(&self) -> TransportConnectionState;
    fn ice_state(&self) -> IceConnectionState;
    /// Watch connection-state changes
    fn subscribe_state(&self) -> watch::Receiver<TransportConnectionState>;
    /// Local DTLS parameters for the `connect-*-transport` handshake
    fn dtls_parameters(&self) -> Value;
    /// Renegotiate candidates on the existing transport
    async fn restart_ice(&self) -> SessionResult<()>;
    async fn stats(&self) -> SessionResult<TransportStats>;
    /// Release the transport. The pool calls this at most once per
    /// transport; implementations are not required to tolerate a second
    /// call.
    async fn close(&self);
}

/// Creates live transports from server-side transport parameters.
///
/// Implementations bridge to the media stack's transport constructor; the
/// orchestrator never builds a transport directly.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create_transport(
        &self,
        kind: TransportKind,
        params: &TransportCreated,
    ) -> SessionResult<Arc<dyn Transport>>;
}

/// Pool timing and recovery budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportPoolConfig {
    /// Fixed stats-poll interval
    pub stats_interval_ms: u64,
    /// Grace period after `disconnected` before failure handling starts
    pub disconnect_grace_ms: u64,
    /// ICE restarts attempted before escalating to `transport-failed`
    pub max_ice_restarts: u32,
    /// Stale records idle beyond this are reaped
    pub idle_timeout_ms: u64,
}

impl Default for TransportPoolConfig {
    fn default() -> Self {
        Self {
            stats_interval_ms: 5_000,
            disconnect_grace_ms: 3_000,
            max_ice_restarts: 3,
            idle_timeout_ms: 60_000,
        }
    }
}

/// Bookkeeping for one owned transport
pub struct TransportRecord {
    transport: Arc<dyn Transport>,
    kind: TransportKind,
    created_at: Instant,
    last_used: Mutex<Instant>,
    reconnect_count: AtomicU32,
    failures: AtomicU32,
    last_reconnect: Mutex<Option<Instant>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for TransportRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRecord")
            .field("id", &self.transport.id())
            .field("kind", &self.kind)
            .field("failures", &self.failures.load(Ordering::SeqCst))
            .field(
                "reconnects",
                &self.reconnect_count.load(Ordering::SeqCst),
            )
            .finish()
    }
}

impl TransportRecord {
    fn new(transport: Arc<dyn Transport>, kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            transport,
            kind,
            created_at: Instant::now(),
            last_used: Mutex::new(Instant::now()),
            reconnect_count: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            last_reconnect: Mutex::new(None),
            monitor: Mutex::new(None),
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().expect("last_used lock").elapsed()
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::SeqCst)
    }

    /// When the last ICE restart was attempted, if any
    pub fn last_reconnect(&self) -> Option<Instant> {
        *self.last_reconnect.lock().expect("last_reconnect lock")
    }

    fn touch(&self) {
        *self.last_used.lock().expect("last_used lock") = Instant::now();
    }

    fn stop_monitor(&self) {
        if let Some(handle) = self.monitor.lock().expect("monitor lock").take() {
            handle.abort();
        }
    }
}

/// Owner of the send/receive transports and their health monitors
pub struct TransportPool {
    producer_slot: RwLock<Option<Arc<TransportRecord>>>,
    consumer_slot: RwLock<Option<Arc<TransportRecord>>>,
    stale: Mutex<Vec<Arc<TransportRecord>>>,
    bus: EventBus,
    config: TransportPoolConfig,
}

impl fmt::Debug for TransportPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportPool").finish()
    }
}

impl TransportPool {
    /// Create a pool announcing failures on the given bus
    pub fn new(bus: EventBus, config: TransportPoolConfig) -> Self {
        Self {
            producer_slot: RwLock::new(None),
            consumer_slot: RwLock::new(None),
            stale: Mutex::new(Vec::new()),
            bus,
            config,
        }
    }

    fn slot(&self, kind: TransportKind) -> &RwLock<Option<Arc<TransportRecord>>> {
        match kind {
            TransportKind::Producer => &self.producer_slot,
            TransportKind::Consumer => &self.consumer_slot,
        }
    }

    /// Store the producer transport, replacing and cleaning up any prior
    /// record, and start its health monitor.
    pub async fn add_producer_transport(&self, transport: Arc<dyn Transport>) {
        self.add_transport(TransportKind::Producer, transport).await;
    }

    /// Store the consumer transport, replacing and cleaning up any prior
    /// record, and start its health monitor.
    pub async fn add_consumer_transport(&self, transport: Arc<dyn Transport>) {
        self.add_transport(TransportKind::Consumer, transport).await;
    }

    async fn add_transport(&self, kind: TransportKind, transport: Arc<dyn Transport>) {
        let record = TransportRecord::new(transport, kind);
        let monitor = spawn_monitor(
            Arc::clone(&record),
            self.bus.clone(),
            self.config.clone(),
        );
        *record.monitor.lock().expect("monitor lock") = Some(monitor);

        let prior = self.slot(kind).write().await.replace(Arc::clone(&record));
        if let Some(prior) = prior {
            debug!(kind = %kind, id = prior.transport.id(), "replacing prior transport");
            prior.stop_monitor();
            prior.transport.close().await;
            self.stale.lock().expect("stale lock").push(prior);
        }
        self.perform_cleanup();
    }

    /// Active transport of a kind, if one is held
    pub async fn transport(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        self.slot(kind)
            .read()
            .await
            .as_ref()
            .map(|r| Arc::clone(&r.transport))
    }

    /// Active record of a kind, for stats inspection
    pub async fn record(&self, kind: TransportKind) -> Option<Arc<TransportRecord>> {
        self.slot(kind).read().await.clone()
    }

    /// Note recent use of a transport and opportunistically reap stragglers
    pub async fn touch(&self, kind: TransportKind) {
        if let Some(record) = self.slot(kind).read().await.as_ref() {
            record.touch();
        }
        self.perform_cleanup();
    }

    /// Drop stale records idle beyond the timeout. Runs opportunistically
    /// from other pool calls, never on its own timer.
    pub fn perform_cleanup(&self) {
        let idle_timeout = Duration::from_millis(self.config.idle_timeout_ms);
        let mut stale = self.stale.lock().expect("stale lock");
        let before = stale.len();
        stale.retain(|record| record.idle_for() < idle_timeout);
        let reaped = before - stale.len();
        if reaped > 0 {
            debug!(reaped, "reaped idle transport records");
        }
    }

    /// Unconditionally close and remove every transport and cancel every
    /// monitor. Idempotent.
    pub async fn cleanup(&self) {
        for kind in [TransportKind::Producer, TransportKind::Consumer] {
            let record = self.slot(kind).write().await.take();
            if let Some(record) = record {
                record.stop_monitor();
                record.transport.close().await;
            }
        }
        // Parked records were already closed when they were replaced; only
        // their final drop is outstanding.
        self.stale.lock().expect("stale lock").clear();
        debug!("transport pool cleaned up");
    }
}

/// Health monitor for one transport: periodic stats, disconnect grace
/// handling, bounded ICE-restart recovery, escalation.
fn spawn_monitor(
    record: Arc<TransportRecord>,
    bus: EventBus,
    config: TransportPoolConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let transport = Arc::clone(&record.transport);
        let kind = record.kind;
        let mut state_rx = transport.subscribe_state();
        let mut stats_tick =
            tokio::time::interval(Duration::from_millis(config.stats_interval_ms));
        stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The interval fires immediately once; skip that initial tick so
        // the first sample reflects a full polling window.
        stats_tick.tick().await;

        loop {
            tokio::select! {
                _ = stats_tick.tick() => {
                    if let Ok(stats) = transport.stats().await {
                        bus.emit(
                            TOPIC_TRANSPORT_STATS,
                            &BusMessage::TransportStats { kind, sample: stats.into() },
                        );
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    match state {
                        TransportConnectionState::Connected => {
                            debug!(kind = %kind, id = transport.id(), "transport connected");
                            record.touch();
                        }
                        TransportConnectionState::Disconnected => {
                            warn!(kind = %kind, id = transport.id(), "transport disconnected, starting grace timer");
                            let grace = Duration::from_millis(config.disconnect_grace_ms);
                            tokio::select! {
                                _ = tokio::time::sleep(grace) => {
                                    // ICE recheck after the grace period: a
                                    // transient hiccup will have re-settled.
                                    let ice = transport.ice_state();
                                    if matches!(
                                        ice,
                                        IceConnectionState::Disconnected | IceConnectionState::Failed
                                    ) {
                                        handle_failure(&record, &bus, &config).await;
                                    }
                                }
                                res = state_rx.changed() => {
                                    if res.is_err() {
                                        break;
                                    }
                                    let next = *state_rx.borrow_and_update();
                                    match next {
                                        TransportConnectionState::Failed => {
                                            handle_failure(&record, &bus, &config).await;
                                        }
                                        TransportConnectionState::Closed => break,
                                        _ => {}
                                    }
                                }
                            }
                        }
                        TransportConnectionState::Failed => {
                            handle_failure(&record, &bus, &config).await;
                        }
                        TransportConnectionState::Closed => break,
                        _ => {}
                    }
                }
            }
        }
    })
}

async fn handle_failure(
    record: &Arc<TransportRecord>,
    bus: &EventBus,
    config: &TransportPoolConfig,
) {
    let transport = &record.transport;
    let failures = record.failures.fetch_add(1, Ordering::SeqCst) + 1;

    if failures <= config.max_ice_restarts {
        record.reconnect_count.fetch_add(1, Ordering::SeqCst);
        *record.last_reconnect.lock().expect("last_reconnect lock") = Some(Instant::now());
        warn!(
            kind = %record.kind,
            id = transport.id(),
            attempt = failures,
            "transport failure, attempting ICE restart"
        );
        bus.emit(
            TOPIC_TRANSPORT_RECOVERING,
            &BusMessage::TransportRecovering {
                kind: record.kind,
                transport_id: transport.id().to_string(),
                attempt: failures,
            },
        );
        if let Err(e) = transport.restart_ice().await {
            warn!(kind = %record.kind, id = transport.id(), error = %e, "ICE restart failed");
            bus.emit(
                TOPIC_TRANSPORT_FAILED,
                &BusMessage::TransportFailed {
                    kind: record.kind,
                    transport_id: transport.id().to_string(),
                    reason: format!("ICE restart failed: {e}"),
                },
            );
        }
    } else {
        warn!(
            kind = %record.kind,
            id = transport.id(),
            failures,
            "transport recovery budget exhausted, escalating"
        );
        bus.emit(
            TOPIC_TRANSPORT_FAILED,
            &BusMessage::TransportFailed {
                kind: record.kind,
                transport_id: transport.id().to_string(),
                reason: format!("{failures} failures, recovery budget exhausted"),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct MockTransport {
        id: String,
        state_tx: watch::Sender<TransportConnectionState>,
        ice: Mutex<IceConnectionState>,
        restarts: AtomicUsize,
        closed: AtomicUsize,
    }

    impl MockTransport {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                state_tx: watch::channel(TransportConnectionState::New).0,
                ice: Mutex::new(IceConnectionState::New),
                restarts: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            })
        }

        fn set_state(&self, state: TransportConnectionState) {
            let _ = self.state_tx.send(state);
        }

        fn set_ice(&self, state: IceConnectionState) {
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

    fn test_config() -> TransportPoolConfig {
        TransportPoolConfig {
            stats_interval_ms: 50,
            disconnect_grace_ms: 30,
            max_ice_restarts: 2,
            idle_timeout_ms: 200,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stats_polls_feed_the_bus() {
        let bus = EventBus::new();
        let samples = Arc::new(AtomicUsize::new(0));
        let samples2 = Arc::clone(&samples);
        bus.on(TOPIC_TRANSPORT_STATS, move |_| {
            samples2.fetch_add(1, Ordering::SeqCst);
        });

        let pool = TransportPool::new(bus, test_config());
        let transport = MockTransport::new("t1");
        pool.add_producer_transport(transport.clone()).await;

        tokio::time::sleep(Duration::from_millis(175)).await;
        assert!(samples.load(Ordering::SeqCst) >= 3);
        pool.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_with_stuck_ice_triggers_restart_after_grace() {
        let bus = EventBus::new();
        let pool = TransportPool::new(bus, test_config());
        let transport = MockTransport::new("t1");
        pool.add_producer_transport(transport.clone()).await;

        transport.set_state(TransportConnectionState::Connected);
        tokio::time::sleep(Duration::from_millis(5)).await;
        transport.set_ice(IceConnectionState::Disconnected);
        transport.set_state(TransportConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(transport.restarts.load(Ordering::SeqCst), 1);
        pool.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_avoids_failure_handling() {
        let bus = EventBus::new();
        let pool = TransportPool::new(bus, test_config());
        let transport = MockTransport::new("t1");
        pool.add_producer_transport(transport.clone()).await;

        transport.set_state(TransportConnectionState::Connected);
        tokio::time::sleep(Duration::from_millis(5)).await;
        transport.set_state(TransportConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.set_state(TransportConnectionState::Connected);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.restarts.load(Ordering::SeqCst), 0);
        pool.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_recovery_budget_escalates_to_the_bus() {
        let bus = EventBus::new();
        let failures = Arc::new(AtomicUsize::new(0));
        let failures2 = Arc::clone(&failures);
        bus.on(TOPIC_TRANSPORT_FAILED, move |msg| {
            if matches!(msg, BusMessage::TransportFailed { .. }) {
                failures2.fetch_add(1, Ordering::SeqCst);
            }
        });

        let config = TransportPoolConfig {
            max_ice_restarts: 2,
            ..test_config()
        };
        let pool = TransportPool::new(bus, config);
        let transport = MockTransport::new("t1");
        pool.add_producer_transport(transport.clone()).await;

        // Each `failed` edge consumes one recovery attempt; the third
        // exceeds the budget and escalates.
        for i in 0..3 {
            transport.set_state(TransportConnectionState::Connecting);
            tokio::time::sleep(Duration::from_millis(5)).await;
            transport.set_state(TransportConnectionState::Failed);
            tokio::time::sleep(Duration::from_millis(5)).await;
            if i < 2 {
                assert_eq!(failures.load(Ordering::SeqCst), 0);
            }
        }
        assert_eq!(transport.restarts.load(Ordering::SeqCst), 2);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        pool.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_a_transport_closes_the_prior_one() {
        let bus = EventBus::new();
        let pool = TransportPool::new(bus, test_config());
        let first = MockTransport::new("t1");
        let second = MockTransport::new("t2");

        pool.add_producer_transport(first.clone()).await;
        pool.add_producer_transport(second.clone()).await;

        assert_eq!(first.closed.load(Ordering::SeqCst), 1);
        assert_eq!(second.closed.load(Ordering::SeqCst), 0);
        let active = pool.transport(TransportKind::Producer).await.unwrap();
        assert_eq!(active.id(), "t2");

        // Final cleanup closes the active transport but never re-closes
        // the parked one.
        pool.cleanup().await;
        assert_eq!(first.closed.load(Ordering::SeqCst), 1);
        assert_eq!(second.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_is_idempotent() {
        let bus = EventBus::new();
        let pool = TransportPool::new(bus, test_config());
        let transport = MockTransport::new("t1");
        pool.add_consumer_transport(transport.clone()).await;

        pool.cleanup().await;
        pool.cleanup().await;
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        assert!(pool.transport(TransportKind::Consumer).await.is_none());
    }
}
