//! Rolling network-quality classification
//!
//! The monitor keeps bounded windows of round-trip-time, packet-loss and
//! bitrate samples and derives a discrete [`QualityLevel`] from the window
//! averages. Classification and reaction are deliberately separated: the
//! monitor never touches media state, it only reports level changes. The
//! orchestrator owns the policy (drop the video profile on `Poor`, raise
//! it on `Excellent`).

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Discrete quality classification, best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QualityLevel {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        };
        f.write_str(name)
    }
}

/// One measurement appended to the rolling windows
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualitySample {
    /// Round-trip time in milliseconds
    pub rtt_ms: f64,
    /// Packet loss as a fraction in `[0.0, 1.0]`
    pub packet_loss: f64,
    /// Current receive/send bitrate in kilobits per second
    pub bitrate_kbps: f64,
}

/// Per-level upper/lower bounds a window average must satisfy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityBounds {
    /// Maximum average RTT in milliseconds
    pub max_rtt_ms: f64,
    /// Maximum average loss fraction
    pub max_packet_loss: f64,
    /// Minimum average bitrate in kilobits per second
    pub min_bitrate_kbps: f64,
}

/// Fixed thresholds evaluated in strict order Excellent → Good → Fair,
/// with `Poor` as the default when nothing matches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityThresholds {
    pub excellent: QualityBounds,
    pub good: QualityBounds,
    pub fair: QualityBounds,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            excellent: QualityBounds {
                max_rtt_ms: 100.0,
                max_packet_loss: 0.02,
                min_bitrate_kbps: 500.0,
            },
            good: QualityBounds {
                max_rtt_ms: 200.0,
                max_packet_loss: 0.05,
                min_bitrate_kbps: 250.0,
            },
            fair: QualityBounds {
                max_rtt_ms: 400.0,
                max_packet_loss: 0.10,
                min_bitrate_kbps: 100.0,
            },
        }
    }
}

impl QualityBounds {
    fn matches(&self, rtt_ms: f64, packet_loss: f64, bitrate_kbps: f64) -> bool {
        rtt_ms <= self.max_rtt_ms
            && packet_loss <= self.max_packet_loss
            && bitrate_kbps >= self.min_bitrate_kbps
    }
}

/// Callback invoked with `(new_level, old_level)` on every level change
pub type QualityChangeFn = Box<dyn Fn(QualityLevel, QualityLevel) + Send + Sync>;

struct RollingBuffer {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl RollingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

/// Bounded rolling windows plus change-detecting classification
pub struct QualityMonitor {
    rtt: RollingBuffer,
    loss: RollingBuffer,
    bitrate: RollingBuffer,
    thresholds: QualityThresholds,
    level: QualityLevel,
    on_change: Option<QualityChangeFn>,
}

impl fmt::Debug for QualityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QualityMonitor")
            .field("level", &self.level)
            .field("samples", &self.rtt.samples.len())
            .finish()
    }
}

impl QualityMonitor {
    /// Create a monitor with the given window capacity and thresholds.
    /// The stored level starts at `Poor`, the classification default.
    pub fn new(window: usize, thresholds: QualityThresholds) -> Self {
        Self {
            rtt: RollingBuffer::new(window),
            loss: RollingBuffer::new(window),
            bitrate: RollingBuffer::new(window),
            thresholds,
            level: QualityLevel::Poor,
            on_change: None,
        }
    }

    /// Install the level-change callback, replacing any prior one
    pub fn set_on_change(&mut self, f: QualityChangeFn) {
        self.on_change = Some(f);
    }

    /// Currently stored level
    pub fn level(&self) -> QualityLevel {
        self.level
    }

    /// Append a sample, reclassify, and report the change if any.
    ///
    /// The callback fires only when the derived level differs from the
    /// stored one; repeated identical samples are silent after the first
    /// crossing. Returns `Some((new, old))` on a change, `None` otherwise.
    pub fn update(&mut self, sample: QualitySample) -> Option<(QualityLevel, QualityLevel)> {
        self.rtt.push(sample.rtt_ms);
        self.loss.push(sample.packet_loss);
        self.bitrate.push(sample.bitrate_kbps);

        let new = self.classify();
        if new == self.level {
            return None;
        }
        let old = self.level;
        self.level = new;
        debug!(old = %old, new = %new, "quality level changed");
        if let Some(cb) = &self.on_change {
            cb(new, old);
        }
        Some((new, old))
    }

    fn classify(&self) -> QualityLevel {
        let rtt = self.rtt.average();
        let loss = self.loss.average();
        let bitrate = self.bitrate.average();

        if self.thresholds.excellent.matches(rtt, loss, bitrate) {
            QualityLevel::Excellent
        } else if self.thresholds.good.matches(rtt, loss, bitrate) {
            QualityLevel::Good
        } else if self.thresholds.fair.matches(rtt, loss, bitrate) {
            QualityLevel::Fair
        } else {
            QualityLevel::Poor
        }
    }
}
