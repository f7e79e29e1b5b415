//! Calibration state: the measurement pool, trend extrapolation and the
//! measurement-based safety buffer.
//!
//! The pool keeps the 20 lowest-RTT samples. Lowest RTT correlates with
//! lowest path asymmetry, so `best()` is the sample whose offset we trust
//! most. An outlier gate protects the pool against transient congestion and
//! server clock jumps.

use log::info;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Pool and chronological-view capacity.
const POOL_CAPACITY: usize = 20;
/// Candidates deviating more than this from the best offset are dropped.
const OUTLIER_THRESHOLD_S: f64 = 0.200;
/// Trend window length.
const TREND_WINDOW: usize = 10;
/// Offset jump between consecutive updates worth flagging.
const CHANGE_THRESHOLD_S: f64 = 0.050;

/// One-sided confidence multiplier for the buffer (2 sigma, ~97.7%).
const CONFIDENCE_N: f64 = 2.0;
/// NTP measurement sigma fallback when no delay has been observed yet.
const DEFAULT_NTP_DELAY_S: f64 = 0.008;
/// Empirical path-asymmetry fraction of the one-way delay.
const ASYMMETRY_FRACTION: f64 = 0.15;
/// The buffer never shrinks below this.
const MIN_BUFFER_S: f64 = 0.005;

/// Standing bias of the target server's clock against NTP, from a prior
/// long-run calibration campaign (positive = server ahead).
pub const SERVER_CLOCK_OFFSET_S: f64 = 0.0015;
/// Standing uncertainty (sigma) of that bias.
pub const SERVER_CLOCK_UNCERTAINTY_S: f64 = 0.00408;

// ============================================================================
// DATA MODEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleSource {
    Initial,
    Final,
    Auto,
    Manual,
}

/// Immutable measurement record. `rtt_s` is always positive.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationSample {
    pub offset_s: f64,
    pub rtt_s: f64,
    pub observed_at: f64,
    pub source: SampleSource,
}

/// Derived calibration, replaced atomically on every update.
///
/// `server_offset_s` = local minus server; positive means the local clock is
/// ahead of the target server.
#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    pub server_offset_s: f64,
    pub rtt_one_way_s: f64,
    pub ntp_offset_s: f64,
    pub obs_clock_offset_s: f64,
    pub obs_clock_uncertainty_s: f64,
}

impl Calibration {
    pub fn new(server_offset_s: f64, rtt_one_way_s: f64, ntp_offset_s: f64) -> Self {
        Calibration {
            server_offset_s,
            rtt_one_way_s,
            ntp_offset_s,
            obs_clock_offset_s: SERVER_CLOCK_OFFSET_S,
            obs_clock_uncertainty_s: SERVER_CLOCK_UNCERTAINTY_S,
        }
    }
}

/// JSON shape of `calibration` events and the REST calibration responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationReport {
    pub server_offset_ms: f64,
    pub rtt_one_way_ms: f64,
    pub rtt_full_ms: f64,
    pub ntp_offset_ms: f64,
    pub server_ntp_diff_ms: f64,
    pub accuracy_ms: f64,
    pub source: SampleSource,
}

impl CalibrationReport {
    pub fn from_calibration(cal: &Calibration, accuracy_s: f64, source: SampleSource) -> Self {
        CalibrationReport {
            server_offset_ms: cal.server_offset_s * 1000.0,
            rtt_one_way_ms: cal.rtt_one_way_s * 1000.0,
            rtt_full_ms: cal.rtt_one_way_s * 2000.0,
            ntp_offset_ms: cal.ntp_offset_s * 1000.0,
            server_ntp_diff_ms: (cal.server_offset_s - cal.ntp_offset_s) * 1000.0,
            accuracy_ms: accuracy_s * 1000.0,
            source,
        }
    }
}

// ============================================================================
// SAMPLE POOL
// ============================================================================

#[derive(Debug, Default)]
pub struct SamplePool {
    /// Sorted by RTT ascending at all times.
    by_rtt: Vec<CalibrationSample>,
    /// Insertion-ordered view of the last 20 accepted samples.
    chrono: VecDeque<CalibrationSample>,
}

impl SamplePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a measurement. Returns false when the candidate was rejected
    /// as an outlier against the current best offset.
    pub fn insert(&mut self, sample: CalibrationSample) -> bool {
        debug_assert!(sample.rtt_s > 0.0);

        if let Some(best) = self.best_sample() {
            let deviation = (sample.offset_s - best.offset_s).abs();
            if deviation > OUTLIER_THRESHOLD_S {
                info!(
                    "outlier dropped: {:+.0}ms (best {:+.0}ms, deviation {:.0}ms)",
                    sample.offset_s * 1000.0,
                    best.offset_s * 1000.0,
                    deviation * 1000.0
                );
                return false;
            }
        }

        let pos = self
            .by_rtt
            .partition_point(|existing| existing.rtt_s <= sample.rtt_s);
        self.by_rtt.insert(pos, sample);
        if self.by_rtt.len() > POOL_CAPACITY {
            self.by_rtt.truncate(POOL_CAPACITY);
        }

        self.chrono.push_back(sample);
        if self.chrono.len() > POOL_CAPACITY {
            self.chrono.pop_front();
        }
        true
    }

    pub fn best_sample(&self) -> Option<&CalibrationSample> {
        self.by_rtt.first()
    }

    /// Promote the lowest-RTT sample to a full calibration.
    pub fn best(&self, ntp_offset_s: f64) -> Option<Calibration> {
        self.best_sample()
            .map(|s| Calibration::new(s.offset_s, s.rtt_s / 2.0, ntp_offset_s))
    }

    pub fn len(&self) -> usize {
        self.by_rtt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_rtt.is_empty()
    }

    pub fn by_rtt(&self) -> &[CalibrationSample] {
        &self.by_rtt
    }

    pub fn chronological(&self) -> impl Iterator<Item = &CalibrationSample> {
        self.chrono.iter()
    }
}

// ============================================================================
// TREND ANALYSIS
// ============================================================================

/// Sliding window of (t, offset) points with a least-squares line through
/// them, used to extrapolate the offset at the target instant.
#[derive(Debug, Default)]
pub struct TrendWindow {
    points: VecDeque<(f64, f64)>,
}

impl TrendWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, t: f64, value: f64) {
        self.points.push_back((t, value));
        if self.points.len() > TREND_WINDOW {
            self.points.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Least-squares (slope, intercept). Falls back to the mean when the
    /// window is degenerate.
    pub fn linear_fit(&self) -> (f64, f64) {
        let n = self.points.len();
        if n < 2 {
            return (0.0, self.points.front().map(|p| p.1).unwrap_or(0.0));
        }

        let nf = n as f64;
        let sum_x: f64 = self.points.iter().map(|p| p.0).sum();
        let sum_y: f64 = self.points.iter().map(|p| p.1).sum();
        let sum_xy: f64 = self.points.iter().map(|p| p.0 * p.1).sum();
        let sum_x_sq: f64 = self.points.iter().map(|p| p.0 * p.0).sum();

        let denominator = nf * sum_x_sq - sum_x * sum_x;
        if denominator == 0.0 {
            return (0.0, sum_y / nf);
        }
        let slope = (nf * sum_xy - sum_x * sum_y) / denominator;
        let intercept = (sum_y - slope * sum_x) / nf;
        (slope, intercept)
    }

    pub fn predict_at(&self, t: f64) -> f64 {
        let (slope, intercept) = self.linear_fit();
        slope * t + intercept
    }
}

/// Flags offset jumps between consecutive calibration updates.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    values: VecDeque<f64>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a value; true when it jumped more than 50ms from the previous.
    pub fn push(&mut self, value: f64) -> bool {
        let significant = self
            .values
            .back()
            .map(|prev| (value - prev).abs() > CHANGE_THRESHOLD_S)
            .unwrap_or(false);
        self.values.push_back(value);
        if self.values.len() > TREND_WINDOW {
            self.values.pop_front();
        }
        significant
    }
}

// ============================================================================
// BUFFER MODEL
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct BufferBreakdown {
    pub sigma_ntp_s: f64,
    pub sigma_rtt_s: f64,
    pub sigma_obs_s: f64,
    pub sigma_asym_s: f64,
    pub buffer_s: f64,
}

/// Safety margin derived from the independent error sources:
///
/// `buffer = N * sqrt(sigma_ntp^2 + sigma_rtt^2 + sigma_obs^2 + sigma_asym^2)`
///
/// with N = 2 and a 5ms floor.
pub fn measurement_buffer(
    rtt_one_way_s: f64,
    last_ntp_delay_s: Option<f64>,
    rtt_jitter_s: f64,
    obs_clock_uncertainty_s: f64,
) -> BufferBreakdown {
    let sigma_ntp_s = last_ntp_delay_s.unwrap_or(DEFAULT_NTP_DELAY_S) / 2.0;
    let sigma_rtt_s = rtt_jitter_s;
    let sigma_obs_s = obs_clock_uncertainty_s;
    let sigma_asym_s = rtt_one_way_s * ASYMMETRY_FRACTION;

    let sigma_total = (sigma_ntp_s.powi(2)
        + sigma_rtt_s.powi(2)
        + sigma_obs_s.powi(2)
        + sigma_asym_s.powi(2))
    .sqrt();

    let buffer_s = (CONFIDENCE_N * sigma_total).max(MIN_BUFFER_S);

    BufferBreakdown {
        sigma_ntp_s,
        sigma_rtt_s,
        sigma_obs_s,
        sigma_asym_s,
        buffer_s,
    }
}

// ============================================================================
// TESTS
// ============================================================================
