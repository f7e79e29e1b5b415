//! Registration engine: one-shot orchestrator of a single burst.
//!
//! Flow: token check -> full calibration -> prewarm -> RTT statistics and
//! buffer -> trigger plan -> wait scheduler -> burst loop. One engine per
//! session, one cancellation flag, all user-visible progress published as
//! events. Create a fresh instance for every registration run.
//!
//! Key timing features:
//! - Lowest-RTT sample selection over a bounded pool (jitter immunity)
//! - Periodic quick recalibration while waiting, one final full pass
//! - Keep-alive sentinel POSTs so the congestion window stays warm
//! - Last-second RTT probe with micro-correction of the firing instant
//! - Busy-wait on the monotonic clock for the final 50ms

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::calibration::{
    measurement_buffer, Calibration, CalibrationReport, CalibrationSample, ChangeDetector,
    SamplePool, SampleSource, TrendWindow,
};
use crate::clock::{busy_wait_until, sleep_cancellable, target_epoch, wall_now};
use crate::events::{EventBus, EventKind, LogLevel};
use crate::oracle;
use crate::protocol::{self, classify, Classified, CrnBoard, CrnStatus, TokenTestResult};
use crate::status::{EngineStatus, Phase};
use crate::traits::{NtpSource, RegistrarClient};
use crate::trigger;
use crate::tuning::TimingGuard;

// ============================================================================
// CONSTANTS
// ============================================================================

// Wait scheduler
const RECAL_INTERVAL_S: f64 = 30.0;
const RECAL_EARLIEST_REMAINING_S: f64 = 25.0;
const FINAL_CAL_WINDOW_S: f64 = 20.0;
const FINAL_CAL_MIN_S: f64 = 10.0;
const COUNTDOWN_PERIOD_S: f64 = 1.0;
const BUSY_WAIT_WINDOW_S: f64 = 0.05;
const PROBE_WINDOW_HIGH_S: f64 = 2.5;
const PROBE_WINDOW_LOW_S: f64 = 1.5;
const RTT_WATCH_MIN_REMAINING_S: f64 = 5.0;
const RTT_TREND_ALARM_S: f64 = 0.020;

// Burst loop
const TIGHT_RETRY_S: f64 = 0.05;
const BACKOFF_MIN_S: f64 = 1.0;
const BACKOFF_MAX_S: f64 = 5.0;
const BACKOFF_FACTOR: f64 = 3.0;
const DEFAULT_RETRY_AFTER_S: u64 = 5;

// A target more than this far in the past skips the wait entirely.
const LATE_START_GRACE_S: f64 = 5.0;

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ecrn_list: Vec<String>,
    pub scrn_list: Vec<String>,
    /// Target opening instant, "HH:MM:SS" in the deployment zone.
    pub target_hms: String,
    pub max_attempts: u32,
    pub retry_interval_s: f64,
    /// Starting safety margin; replaced by the measured buffer.
    pub initial_buffer_s: f64,
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            ecrn_list: vec![protocol::SENTINEL_CRN.to_string()],
            scrn_list: Vec::new(),
            target_hms: String::new(),
            max_attempts: 60,
            retry_interval_s: 3.0,
            initial_buffer_s: 0.025,
            dry_run: false,
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct Engine<C, N>
where
    C: RegistrarClient,
    N: NtpSource,
{
    client: C,
    ntp: N,
    cfg: EngineConfig,
    bus: EventBus,
    status: Arc<RwLock<EngineStatus>>,
    cancel: Arc<AtomicBool>,

    pool: SamplePool,
    trend: TrendWindow,
    change: ChangeDetector,
    calibration: Option<Calibration>,
    board: CrnBoard,
    trigger_time: Option<f64>,
    buffer_s: f64,
    last_ntp_delay_s: Option<f64>,
}

impl<C, N> Engine<C, N>
where
    C: RegistrarClient,
    N: NtpSource,
{
    pub fn new(
        client: C,
        ntp: N,
        cfg: EngineConfig,
        bus: EventBus,
        status: Arc<RwLock<EngineStatus>>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let initial_buffer_s = cfg.initial_buffer_s;
        Engine {
            client,
            ntp,
            cfg,
            bus,
            status,
            cancel,
            pool: SamplePool::new(),
            trend: TrendWindow::new(),
            change: ChangeDetector::new(),
            calibration: None,
            board: CrnBoard::new(),
            trigger_time: None,
            buffer_s: initial_buffer_s,
            last_ntp_delay_s: None,
        }
    }

    /// Throwaway engine for the one-shot REST helpers (token test, manual
    /// calibration). Events go nowhere; no worker is spawned.
    pub fn standalone(client: C, ntp: N) -> Self {
        let (bus, _rx) = EventBus::channel();
        Self::new(
            client,
            ntp,
            EngineConfig::default(),
            bus,
            Arc::new(RwLock::new(EngineStatus::default())),
            Arc::new(AtomicBool::new(false)),
        )
    }

    pub fn test_token(&self) -> TokenTestResult {
        protocol::test_token(&self.client)
    }

    // ========================================================================
    // STATE PLUMBING
    // ========================================================================

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn status_mut(&self) -> std::sync::RwLockWriteGuard<'_, EngineStatus> {
        self.status.write().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&mut self, phase: Phase) {
        let running = {
            let mut status = self.status_mut();
            status.phase = phase;
            status.running
        };
        self.bus.emit(EventKind::State { phase, running });
    }

    fn set_trigger(&mut self, trigger: f64) {
        self.trigger_time = Some(trigger);
        self.status_mut().trigger_time = Some(trigger);
    }

    fn set_attempt(&mut self, attempt: u32) {
        self.status_mut().current_attempt = attempt;
    }

    fn publish_results(&mut self) {
        let snapshot = self.board.snapshot();
        self.status_mut().crn_results = snapshot.clone();
        self.bus.emit(EventKind::CrnUpdate { results: snapshot });
    }

    fn emit_countdown(&self, trigger: f64) {
        self.bus.emit(EventKind::Countdown {
            trigger_time: trigger,
            remaining: trigger - wall_now(),
        });
    }

    fn publish_calibration(&mut self, report: CalibrationReport) {
        self.status_mut().calibration = Some(report.clone());
        self.bus.emit(EventKind::Calibration(report));
    }

    // ========================================================================
    // CALIBRATION
    // ========================================================================

    /// Lowest-RTT sample from the pool promoted to a calibration, falling
    /// back to the last derived calibration while the pool is empty.
    fn best_calibration(&self) -> Option<Calibration> {
        let ntp_offset = self.calibration.map(|c| c.ntp_offset_s).unwrap_or(0.0);
        self.pool.best(ntp_offset).or(self.calibration)
    }

    fn update_trend(&mut self) {
        if let Some(cal) = self.calibration {
            self.trend.push(wall_now(), cal.server_offset_s);
            if self.change.push(cal.server_offset_s) {
                self.bus.log(
                    LogLevel::Info,
                    format!(
                        "significant offset change: {:+.0}ms",
                        cal.server_offset_s * 1000.0
                    ),
                );
            }
        }
    }

    /// Full calibration: connection warmup, POST-path RTT, NTP offset
    /// (primary source) and the Date-header transition as cross-validation.
    pub fn calibrate(&mut self, source: SampleSource) -> CalibrationReport {
        self.set_phase(Phase::Calibrating);
        self.bus.log(LogLevel::Info, "measuring server clock...");

        let sentinel = [protocol::SENTINEL_CRN.to_string()];
        if let Err(e) = self.client.submit(&sentinel, &[]) {
            self.bus.log(
                LogLevel::Warning,
                format!("POST warmup failed: {}, trying HEAD...", e),
            );
            if let Err(e2) = self.client.head_date() {
                self.bus
                    .log(LogLevel::Error, format!("HEAD warmup failed too: {}", e2));
                // Origin unreachable: NTP-only calibration so the trigger
                // math still has an offset to work with.
                let ntp_offset = match self.ntp.probe() {
                    Ok(sample) => {
                        self.last_ntp_delay_s = Some(sample.delay_s);
                        sample.offset_s
                    }
                    Err(_) => 0.0,
                };
                let cal = Calibration::new(-ntp_offset, 0.010, ntp_offset);
                self.calibration = Some(cal);
                let report =
                    CalibrationReport::from_calibration(&cal, cal.rtt_one_way_s, source);
                self.publish_calibration(report.clone());
                return report;
            }
        }

        let median_rtt = oracle::median_rtt(&self.client, 5);
        self.bus.log(
            LogLevel::Info,
            format!(
                "RTT: {:.0}ms -> one-way {:.0}ms",
                median_rtt * 1000.0,
                median_rtt * 500.0
            ),
        );

        let ntp_sample = match self.ntp.probe() {
            Ok(sample) => {
                self.last_ntp_delay_s = Some(sample.delay_s);
                Some(sample)
            }
            Err(_) => None,
        };

        let date_offset =
            oracle::date_transition_offset(&self.client, median_rtt, &self.cancel, &self.bus)
                .map(|(offset, _rtt)| offset);

        let (server_offset, accuracy, ntp_offset_raw) = match ntp_sample {
            Some(ntp) => {
                // NTP reports server minus local; we track local minus server.
                let server_offset = -ntp.offset_s;
                let accuracy = ntp.delay_s / 2.0;
                let direction = if server_offset > 0.0 { "AHEAD" } else { "BEHIND" };
                self.bus.log(
                    LogLevel::Info,
                    format!(
                        "NTP offset: {:.1}ms {} (delay {:.0}ms, accuracy +-{:.0}ms)",
                        server_offset.abs() * 1000.0,
                        direction,
                        ntp.delay_s * 1000.0,
                        accuracy * 1000.0
                    ),
                );

                if let Some(date) = date_offset {
                    let diff = (server_offset - date).abs();
                    if diff > 0.500 {
                        self.bus.log(
                            LogLevel::Info,
                            format!(
                                "NTP-Date split: {:.0}ms (expected, Date has 1s granularity)",
                                diff * 1000.0
                            ),
                        );
                    } else {
                        self.bus.log(
                            LogLevel::Info,
                            format!("NTP and Date agree ({:.0}ms apart)", diff * 1000.0),
                        );
                    }
                }
                (server_offset, accuracy, ntp.offset_s)
            }
            None => match date_offset {
                Some(date) => {
                    self.bus.log(
                        LogLevel::Warning,
                        "NTP unavailable, using Date header (+-500ms accuracy)",
                    );
                    (date, median_rtt / 2.0, 0.0)
                }
                None => {
                    self.bus.log(
                        LogLevel::Error,
                        "calibration failed, assuming zero offset",
                    );
                    (0.0, median_rtt / 2.0, 0.0)
                }
            },
        };

        let cal = Calibration::new(server_offset, median_rtt / 2.0, ntp_offset_raw);
        self.calibration = Some(cal);
        self.pool.insert(CalibrationSample {
            offset_s: server_offset,
            rtt_s: median_rtt,
            observed_at: wall_now(),
            source,
        });

        let direction = if server_offset > 0.0 { "AHEAD" } else { "BEHIND" };
        self.bus.log(
            LogLevel::Info,
            format!(
                "result: {:.1}ms {} (+-{:.0}ms) [pool: {} samples]",
                server_offset.abs() * 1000.0,
                direction,
                accuracy * 1000.0,
                self.pool.len()
            ),
        );

        self.update_trend();

        let report = CalibrationReport::from_calibration(&cal, accuracy, source);
        self.publish_calibration(report.clone());
        report
    }

    /// Light recalibration used while waiting: NTP plus a short RTT
    /// measurement, roughly one second of work.
    pub fn quick_calibrate(&mut self, source: SampleSource) -> Option<Calibration> {
        let ntp = match self.ntp.probe() {
            Ok(sample) => {
                self.last_ntp_delay_s = Some(sample.delay_s);
                sample
            }
            Err(e) => {
                self.bus
                    .log(LogLevel::Warning, format!("quick cal: NTP failed ({})", e));
                return None;
            }
        };

        let server_offset = -ntp.offset_s;
        let median_rtt = oracle::median_rtt(&self.client, 3);
        self.pool.insert(CalibrationSample {
            offset_s: server_offset,
            rtt_s: median_rtt,
            observed_at: wall_now(),
            source,
        });

        if let Some(best) = self.best_calibration() {
            self.calibration = Some(best);
        }
        self.update_trend();

        let cal = self.calibration?;
        let report = CalibrationReport::from_calibration(&cal, ntp.delay_s / 2.0, source);
        self.publish_calibration(report);
        self.bus.log(
            LogLevel::Info,
            format!(
                "quick cal: NTP={:+.0}ms/delay={:.0}ms -> best: {:+.0}ms/{:.0}ms [pool: {}]",
                server_offset * 1000.0,
                ntp.delay_s * 1000.0,
                cal.server_offset_s * 1000.0,
                cal.rtt_one_way_s * 1000.0,
                self.pool.len()
            ),
        );
        Some(cal)
    }

    // ========================================================================
    // TRIGGER
    // ========================================================================

    /// Recompute the firing instant from the best pool sample (or the trend
    /// extrapolation once enough points exist) and re-apply the clamp.
    fn recalc_trigger(&mut self, target: f64) -> f64 {
        let cal = self
            .best_calibration()
            .unwrap_or_else(|| Calibration::new(0.0, 0.005, 0.0));
        let offset = if self.trend.len() >= 2 {
            self.trend.predict_at(target)
        } else {
            cal.server_offset_s
        };

        let plan = trigger::plan(target, offset, &cal, self.buffer_s);
        if plan.floor_clamped {
            self.bus.log(
                LogLevel::Info,
                "early-arrival guard: trigger held at target+5ms",
            );
        }
        if plan.ceiling_clamped {
            self.bus.log(
                LogLevel::Warning,
                "late-arrival guard: trigger pulled back to target+200ms",
            );
        }
        plan.fire_at
    }

    // ========================================================================
    // ORCHESTRATION
    // ========================================================================

    /// Full registration flow. Consumes the engine; run it on a dedicated
    /// worker thread. The finalizer always emits the terminal events and
    /// clears `running` last.
    pub fn run(mut self) {
        self.status_mut().running = true;
        let tuning = TimingGuard::engage();

        if let Err(e) = self.run_inner() {
            self.bus
                .log(LogLevel::Error, format!("unexpected engine failure: {}", e));
        }

        // Finalizer order matters: restore the OS tuning first, then the
        // terminal events, then clear running.
        drop(tuning);

        let results = self.board.snapshot();
        self.set_phase(Phase::Done);
        self.bus.emit(EventKind::Done {
            results: results.clone(),
        });
        let mut status = self.status_mut();
        status.crn_results = results;
        // Cleared last: consumers that stop on running=false must already
        // have the terminal state/done events queued.
        status.running = false;
    }

    fn run_inner(&mut self) -> Result<()> {
        if self.cfg.dry_run {
            self.bus.log(LogLevel::Warning, "=== DRY RUN, nothing will be registered ===");
        }

        // 0. Token validity
        self.set_phase(Phase::TokenCheck);
        self.bus.log(LogLevel::Info, "checking token...");
        let token_result = self.test_token();
        if !token_result.valid {
            self.bus.log(
                LogLevel::Error,
                format!("token rejected: {}", token_result.message),
            );
            self.bus
                .log(LogLevel::Error, "fetch a fresh token and try again");
            return Ok(());
        }
        self.bus.log(LogLevel::Info, "token accepted");
        if self.cancelled() {
            return Ok(());
        }

        // 1. Initial calibration
        self.calibrate(SampleSource::Initial);
        if self.cancelled() {
            return Ok(());
        }

        // 2. Warm the connection, POST included
        oracle::prewarm(&self.client, false, &self.bus);
        if self.cancelled() {
            return Ok(());
        }

        // 2b. Jitter measurement and the measurement-based buffer
        let stats = oracle::rtt_statistics(&self.client, 10, &self.cancel);
        self.bus.log(
            LogLevel::Info,
            format!(
                "RTT stats: median={:.0}ms jitter={:.1}ms min={:.0}ms max={:.0}ms ({} samples)",
                stats.median_s * 1000.0,
                stats.jitter_s * 1000.0,
                stats.min_s * 1000.0,
                stats.max_s * 1000.0,
                stats.count
            ),
        );

        let best = self
            .best_calibration()
            .unwrap_or_else(|| Calibration::new(0.0, 0.005, 0.0));
        let breakdown = measurement_buffer(
            best.rtt_one_way_s,
            self.last_ntp_delay_s,
            stats.jitter_s,
            best.obs_clock_uncertainty_s,
        );
        self.buffer_s = breakdown.buffer_s;
        self.bus.log(
            LogLevel::Info,
            format!(
                "buffer: ntp={:.1}ms rtt={:.1}ms srv={:.1}ms asym={:.1}ms -> {:.1}ms",
                breakdown.sigma_ntp_s * 1000.0,
                breakdown.sigma_rtt_s * 1000.0,
                breakdown.sigma_obs_s * 1000.0,
                breakdown.sigma_asym_s * 1000.0,
                breakdown.buffer_s * 1000.0
            ),
        );
        if self.cancelled() {
            return Ok(());
        }

        // 3. Trigger plan
        let target = target_epoch(&self.cfg.target_hms)?;
        let trigger = self.recalc_trigger(target);
        self.set_trigger(trigger);

        let remaining = trigger - wall_now();
        self.bus.log(
            LogLevel::Info,
            format!(
                "trigger: {} +{:.0}ms buffer | {:.1}s to go",
                self.cfg.target_hms,
                self.buffer_s * 1000.0,
                remaining
            ),
        );
        self.emit_countdown(trigger);

        let fired_trigger = if remaining < -LATE_START_GRACE_S {
            self.bus.log(
                LogLevel::Warning,
                "target time already passed, starting immediately",
            );
            trigger
        } else {
            // 4. Wait with continuous calibration
            self.set_phase(Phase::Waiting);
            match self.wait_until_fire(target, trigger) {
                Some(t) => t,
                None => return Ok(()), // cancelled
            }
        };

        if self.cancelled() {
            return Ok(());
        }

        // 5. Burst
        self.set_phase(Phase::Registering);
        let target_delta_ms = (wall_now() - target) * 1000.0;
        let trigger_delta_ms = (wall_now() - fired_trigger) * 1000.0;
        let best = self
            .best_calibration()
            .unwrap_or_else(|| Calibration::new(0.0, 0.005, 0.0));
        self.bus.log(
            LogLevel::Info,
            format!(
                "FIRING (target{:+.0}ms, trigger{:+.0}ms) [buffer={:.0}ms offset={:+.0}ms rtt={:.0}ms pool={}]",
                target_delta_ms,
                trigger_delta_ms,
                self.buffer_s * 1000.0,
                best.server_offset_s * 1000.0,
                best.rtt_one_way_s * 1000.0,
                self.pool.len()
            ),
        );

        if self.cfg.dry_run {
            self.dry_run_burst(target);
        } else {
            self.register_burst();
        }
        Ok(())
    }

    // ========================================================================
    // WAIT SCHEDULER
    // ========================================================================

    /// Cooperative loop between "calibrated" and "fire". Returns the final
    /// trigger instant after the busy-wait, or None when cancelled.
    fn wait_until_fire(&mut self, target: f64, mut trigger: f64) -> Option<f64> {
        let mut prewarm2 = false;
        let mut keepalive_5s = false;
        let mut keepalive_3s = false;
        let mut final_cal_done = false;
        let mut probe_done = false;
        let mut last_recal = wall_now();
        let mut last_countdown = 0.0f64;
        let mut recal_count = 0u32;

        while !self.cancelled() {
            let now = wall_now();
            let mut remaining = trigger - now;

            if now - last_countdown >= COUNTDOWN_PERIOD_S {
                self.emit_countdown(trigger);
                last_countdown = now;
            }

            // Periodic quick recalibration, far from the target.
            if remaining > RECAL_EARLIEST_REMAINING_S && now - last_recal >= RECAL_INTERVAL_S {
                recal_count += 1;
                self.bus
                    .log(LogLevel::Info, format!("periodic calibration #{}...", recal_count));
                self.quick_calibrate(SampleSource::Auto);

                let old = trigger;
                trigger = self.recalc_trigger(target);
                self.set_trigger(trigger);
                let delta_ms = (trigger - old) * 1000.0;
                if delta_ms.abs() > 1.0 {
                    let rtt_ms = self
                        .calibration
                        .map(|c| c.rtt_one_way_s * 1000.0)
                        .unwrap_or(0.0);
                    self.bus.log(
                        LogLevel::Info,
                        format!(
                            "trigger updated: {:+.0}ms drift (best one-way: {:.0}ms)",
                            delta_ms, rtt_ms
                        ),
                    );
                }
                remaining = trigger - wall_now();
                last_recal = now;
            }

            // One final full calibration inside the (10s, 20s] window.
            if !final_cal_done && remaining > FINAL_CAL_MIN_S && remaining <= FINAL_CAL_WINDOW_S {
                self.bus.log(LogLevel::Info, "final full calibration...");
                self.calibrate(SampleSource::Final);
                self.set_phase(Phase::Waiting);

                let old = trigger;
                trigger = self.recalc_trigger(target);
                self.set_trigger(trigger);
                if let Some(best) = self.best_calibration() {
                    self.bus.log(
                        LogLevel::Info,
                        format!(
                            "final cal done -> trigger moved {:+.0}ms | best: offset={:+.0}ms rtt={:.0}ms [pool: {}]",
                            (trigger - old) * 1000.0,
                            best.server_offset_s * 1000.0,
                            best.rtt_one_way_s * 1000.0,
                            self.pool.len()
                        ),
                    );
                }
                remaining = trigger - wall_now();
                self.emit_countdown(trigger);
                last_countdown = wall_now();
                final_cal_done = true;

                oracle::prewarm(&self.client, true, &self.bus);
                prewarm2 = true;
            }

            // Keep the TCP window warm on the way in (~10s, 5s, 3.5s).
            if !prewarm2 && remaining > 0.0 && remaining <= 10.0 {
                oracle::prewarm(&self.client, true, &self.bus);
                prewarm2 = true;
            } else if prewarm2 && !keepalive_5s && remaining > 4.5 && remaining <= 5.5 {
                keepalive_5s = true;
                let sentinel = [protocol::SENTINEL_CRN.to_string()];
                let _ = self.client.submit(&sentinel, &[]);
            } else if keepalive_5s && !keepalive_3s && remaining > 3.0 && remaining <= 4.0 {
                keepalive_3s = true;
                let sentinel = [protocol::SENTINEL_CRN.to_string()];
                let _ = self.client.submit(&sentinel, &[]);
            }

            // RTT watch on the same 30s cadence while the quick recal is
            // out of range.
            if remaining > RTT_WATCH_MIN_REMAINING_S && now - last_recal >= RECAL_INTERVAL_S {
                let stats = oracle::rtt_statistics(&self.client, 5, &self.cancel);
                self.bus.log(
                    LogLevel::Info,
                    format!(
                        "rtt watch: median={:.0}ms trend={:+.1}ms",
                        stats.median_s * 1000.0,
                        stats.trend_s * 1000.0
                    ),
                );
                if stats.trend_s > RTT_TREND_ALARM_S {
                    self.bus.log(
                        LogLevel::Warning,
                        format!("rtt trend rising: {:+.1}ms", stats.trend_s * 1000.0),
                    );
                }
                self.update_trend();
                last_recal = now;
            }

            // Last-second probe: 3 quick POSTs, micro-correct the trigger.
            if !probe_done && remaining > PROBE_WINDOW_LOW_S && remaining <= PROBE_WINDOW_HIGH_S {
                probe_done = true;
                let cal_one_way = self
                    .best_calibration()
                    .map(|c| c.rtt_one_way_s)
                    .unwrap_or(0.005);
                let (correction, probe_rtt) =
                    oracle::last_second_probe(&self.client, cal_one_way);
                if correction.abs() > 0.001 {
                    let plan = trigger::clamp(trigger + correction, target);
                    trigger = plan.fire_at;
                    self.set_trigger(trigger);
                    remaining = trigger - wall_now();
                    self.bus.log(
                        LogLevel::Info,
                        format!(
                            "probe correction: {:+.1}ms -> trigger at target{:+.0}ms (probe RTT {:.0}ms)",
                            correction * 1000.0,
                            (trigger - target) * 1000.0,
                            probe_rtt * 1000.0
                        ),
                    );
                    self.emit_countdown(trigger);
                    last_countdown = wall_now();
                } else {
                    self.bus.log(
                        LogLevel::Info,
                        format!("probe: RTT={:.0}ms, no correction needed", probe_rtt * 1000.0),
                    );
                }
            }

            // Final 50ms: spin on the monotonic clock.
            if remaining <= BUSY_WAIT_WINDOW_S {
                busy_wait_until(trigger);
                return Some(trigger);
            }

            // Tiered sleep, coarse to fine.
            let sleep_s = if remaining <= 0.5 {
                (remaining - BUSY_WAIT_WINDOW_S).max(0.0)
            } else if remaining <= 5.0 {
                0.005
            } else {
                (remaining - 5.0).min(1.0)
            };
            if !sleep_cancellable(Duration::from_secs_f64(sleep_s), &self.cancel) {
                return None;
            }
        }
        None
    }

    // ========================================================================
    // BURST LOOP
    // ========================================================================

    fn register_burst(&mut self) {
        let mut working_set: Vec<String> = self.cfg.ecrn_list.clone();
        let mut succeeded: Vec<String> = Vec::new();
        let mut failed: Vec<(String, String)> = Vec::new();
        let mut interval_s = self.cfg.retry_interval_s;

        for crn in &working_set {
            self.board.set(crn, CrnStatus::Pending, "waiting");
        }
        self.publish_results();

        let mut first = true;
        for attempt in 1..=self.cfg.max_attempts {
            if working_set.is_empty() || self.cancelled() {
                break;
            }
            self.set_attempt(attempt);

            let t0 = Instant::now();
            let outcome = match self.client.submit(&working_set, &self.cfg.scrn_list) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.bus
                        .log(LogLevel::Error, format!("transport error: {}", e));
                    if !sleep_cancellable(Duration::from_secs_f64(interval_s), &self.cancel) {
                        break;
                    }
                    first = false;
                    continue;
                }
            };

            let elapsed_ms = t0.elapsed().as_secs_f64() * 1000.0;
            let tag = if first {
                "FIRST SHOT".to_string()
            } else {
                format!("A{}", attempt)
            };
            self.bus.log(
                LogLevel::Info,
                format!("{} -> {:.0}ms | HTTP {}", tag, elapsed_ms, outcome.status),
            );
            first = false;

            if outcome.status == 429 {
                let wait_s = outcome.retry_after_s.unwrap_or(DEFAULT_RETRY_AFTER_S);
                self.bus.log(
                    LogLevel::Warning,
                    format!("RATE LIMIT, waiting {}s...", wait_s),
                );
                interval_s = (interval_s * BACKOFF_FACTOR).clamp(BACKOFF_MIN_S, BACKOFF_MAX_S);
                if !sleep_cancellable(Duration::from_secs(wait_s), &self.cancel) {
                    break;
                }
                continue;
            }

            if outcome.status == 401 || outcome.status == 403 {
                self.bus.log(
                    LogLevel::Error,
                    format!("HTTP {}: token invalid", outcome.status),
                );
                break;
            }

            let mut all_deferred = true;

            if outcome.status == 200 {
                for item in &outcome.results {
                    let classified = classify(item);
                    if !classified.is_deferred() {
                        all_deferred = false;
                    }
                    let crn = item.crn.clone();

                    match classified {
                        Classified::Success => {
                            self.bus.log(LogLevel::Info, format!("{} -> REGISTERED", crn));
                            self.board.set(&crn, CrnStatus::Success, "registered");
                            if let Some(pos) = working_set.iter().position(|c| *c == crn) {
                                working_set.remove(pos);
                                succeeded.push(crn);
                            }
                        }
                        Classified::Already => {
                            self.bus
                                .log(LogLevel::Info, format!("{} -> already registered", crn));
                            self.board.set(&crn, CrnStatus::Already, "already registered");
                            if let Some(pos) = working_set.iter().position(|c| *c == crn) {
                                working_set.remove(pos);
                                succeeded.push(crn);
                            }
                        }
                        Classified::PeriodNotOpen => {
                            if attempt <= 2 {
                                self.bus
                                    .log(LogLevel::Info, format!("{} -> not open yet", crn));
                            }
                        }
                        Classified::Debounce => {
                            if attempt <= 2 {
                                self.bus.log(LogLevel::Info, format!("{} -> debounce", crn));
                            }
                            self.board
                                .set(&crn, CrnStatus::Debounce, "debounce, retrying");
                        }
                        Classified::Full => {
                            self.bus
                                .log(LogLevel::Error, format!("{} -> CAPACITY FULL", crn));
                            self.board.set(&crn, CrnStatus::Full, "capacity full");
                            if let Some(pos) = working_set.iter().position(|c| *c == crn) {
                                working_set.remove(pos);
                                failed.push((crn, "capacity full".to_string()));
                            }
                        }
                        Classified::Conflict => {
                            self.bus
                                .log(LogLevel::Warning, format!("{} -> schedule conflict", crn));
                            self.board
                                .set(&crn, CrnStatus::Conflict, "schedule conflict");
                            if let Some(pos) = working_set.iter().position(|c| *c == crn) {
                                working_set.remove(pos);
                                failed.push((crn, "schedule conflict".to_string()));
                            }
                        }
                        Classified::Upgrade(course) => {
                            self.bus.log(
                                LogLevel::Warning,
                                format!("{} -> upgrade conflict: {}", crn, course),
                            );
                            let message = format!("upgrade conflict: {}", course);
                            self.board.set(&crn, CrnStatus::Upgrade, message.clone());
                            if let Some(pos) = working_set.iter().position(|c| *c == crn) {
                                working_set.remove(pos);
                                failed.push((crn, message));
                            }
                        }
                        Classified::Unknown(description) => {
                            self.bus
                                .log(LogLevel::Error, format!("{} -> {}", crn, description));
                            self.board.set(&crn, CrnStatus::Error, description.clone());
                            if let Some(pos) = working_set.iter().position(|c| *c == crn) {
                                working_set.remove(pos);
                                failed.push((crn, description));
                            }
                        }
                    }
                }
                self.publish_results();
            } else {
                all_deferred = false;
                self.bus.log(
                    LogLevel::Error,
                    format!("HTTP {}: {}", outcome.status, outcome.body_excerpt),
                );
            }

            if !working_set.is_empty() && attempt < self.cfg.max_attempts {
                // A full interval only when the server deferred everything;
                // once it starts answering for real, retry tight.
                let pause_s = if all_deferred {
                    self.cfg.retry_interval_s
                } else {
                    TIGHT_RETRY_S
                };
                if !sleep_cancellable(Duration::from_secs_f64(pause_s), &self.cancel) {
                    break;
                }
            }
        }

        self.bus.log(
            LogLevel::Info,
            format!("succeeded: {}/{}", succeeded.len(), self.cfg.ecrn_list.len()),
        );
        for (crn, reason) in &failed {
            self.bus
                .log(LogLevel::Error, format!("  failed: {} - {}", crn, reason));
        }
        if !working_set.is_empty() {
            self.bus.log(
                LogLevel::Warning,
                format!("  unresolved: {}", working_set.join(", ")),
            );
        }
    }

    // ========================================================================
    // DRY RUN
    // ========================================================================

    /// Timing rehearsal against the live server: one sentinel POST for the
    /// arrival analysis, then simulated rounds so the UI sees the normal
    /// event sequence. No real CRNs are submitted.
    fn dry_run_burst(&mut self, target: f64) {
        let mut working_set: Vec<String> = self.cfg.ecrn_list.clone();
        for crn in &working_set {
            self.board.set(crn, CrnStatus::Pending, "waiting (dry run)");
        }
        self.publish_results();

        self.bus
            .log(LogLevel::Warning, "DRY RUN, timing analysis only");

        let sentinel = [protocol::SENTINEL_CRN.to_string()];
        let send_wall = wall_now();
        match self.client.submit(&sentinel, &[]) {
            Ok(outcome) => {
                let arrival_est = send_wall + outcome.rtt_s / 2.0;
                let send_delta_ms = (send_wall - target) * 1000.0;
                let arrival_delta_ms = (arrival_est - target) * 1000.0;
                self.bus.log(
                    LogLevel::Info,
                    format!("HTTP {} | RTT {:.0}ms", outcome.status, outcome.rtt_s * 1000.0),
                );
                self.bus.log(
                    LogLevel::Info,
                    format!("sent at target{:+.0}ms, est. arrival target{:+.0}ms (local frame)",
                        send_delta_ms, arrival_delta_ms),
                );

                // Move the arrival estimate into the server frame.
                let offset_ms = self
                    .best_calibration()
                    .map(|c| c.server_offset_s * 1000.0)
                    .unwrap_or(0.0);
                let server_arrival_ms = arrival_delta_ms - offset_ms;
                self.bus.log(
                    LogLevel::Info,
                    format!("server frame: arrival target{:+.0}ms", server_arrival_ms),
                );

                if let Some(date) = outcome.date_header.as_deref() {
                    if let Ok(server_ts) = oracle::parse_http_date(date) {
                        self.bus.log(
                            LogLevel::Info,
                            format!(
                                "server Date header: target{:+.0}ms (1s granularity)",
                                (server_ts - target) * 1000.0
                            ),
                        );
                    }
                }

                if (0.0..=50.0).contains(&server_arrival_ms) {
                    self.bus.log(
                        LogLevel::Info,
                        format!("PERFECT, inside the window ({:+.0}ms of 0-50ms)", server_arrival_ms),
                    );
                } else if server_arrival_ms < 0.0 {
                    self.bus.log(
                        LogLevel::Warning,
                        format!("EARLY by {:.0}ms (debounce-penalty risk)", server_arrival_ms.abs()),
                    );
                } else if server_arrival_ms <= 150.0 {
                    self.bus.log(
                        LogLevel::Info,
                        format!("GOOD, just outside ({:+.0}ms, window 0-50ms)", server_arrival_ms),
                    );
                } else if server_arrival_ms <= 500.0 {
                    self.bus.log(
                        LogLevel::Warning,
                        format!("LATE by {:.0}ms (seat risk)", server_arrival_ms),
                    );
                } else {
                    self.bus.log(
                        LogLevel::Error,
                        format!("VERY LATE, {:.0}ms past the window", server_arrival_ms),
                    );
                }
            }
            Err(e) => {
                self.bus
                    .log(LogLevel::Error, format!("rehearsal request failed: {}", e));
            }
        }

        // Simulated result rounds for the UI.
        self.bus.log(LogLevel::Info, "simulating CRN results...");
        for attempt in 1..=self.cfg.max_attempts.min(4) {
            if working_set.is_empty() || self.cancelled() {
                break;
            }
            self.set_attempt(attempt);
            if attempt <= 2 {
                for crn in &working_set {
                    self.board
                        .set(crn, CrnStatus::Debounce, "dry run: not open yet");
                }
                self.publish_results();
                if !sleep_cancellable(Duration::from_millis(100), &self.cancel) {
                    break;
                }
            } else {
                for crn in working_set.drain(..) {
                    self.board
                        .set(&crn, CrnStatus::Success, "dry run: simulated success");
                }
                self.publish_results();
                break;
            }
        }

        let done = self.cfg.ecrn_list.len() - working_set.len();
        self.bus.log(
            LogLevel::Info,
            format!("DRY RUN complete, {}/{} simulated", done, self.cfg.ecrn_list.len()),
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::ntp::NtpSample;
    use crate::protocol::{EcrnResult, SubmitOutcome};
    use crate::traits::{MockNtpSource, MockRegistrarClient};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn outcome(status: u16, results: Vec<EcrnResult>) -> SubmitOutcome {
        SubmitOutcome {
            status,
            retry_after_s: None,
            results,
            rtt_s: 0.012,
            date_header: None,
            body_excerpt: String::new(),
        }
    }

    fn item(crn: &str, sc: i64, rc: Option<&str>) -> EcrnResult {
        EcrnResult {
            crn: crn.to_string(),
            status_code: sc,
            result_code: rc.map(|s| s.to_string()),
            result_data: None,
        }
    }

    fn build_engine(
        client: MockRegistrarClient,
        ntp: MockNtpSource,
        cfg: EngineConfig,
    ) -> (
        Engine<MockRegistrarClient, MockNtpSource>,
        Arc<RwLock<EngineStatus>>,
        Arc<AtomicBool>,
        UnboundedReceiver<Event>,
    ) {
        let (bus, rx) = EventBus::channel();
        let status = Arc::new(RwLock::new(EngineStatus::default()));
        let cancel = Arc::new(AtomicBool::new(false));
        let engine = Engine::new(client, ntp, cfg, bus, status.clone(), cancel.clone());
        (engine, status, cancel, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_invalid_token_terminates_cleanly() {
        let mut client = MockRegistrarClient::new();
        client
            .expect_submit()
            .returning(|_, _| Ok(outcome(401, vec![])));
        let ntp = MockNtpSource::new();

        let (engine, status, _cancel, mut rx) = build_engine(client, ntp, EngineConfig::default());
        engine.run();

        let events = drain(&mut rx);
        // Last state event is done, followed by exactly one done event.
        let state_phases: Vec<Phase> = events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::State { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect();
        assert_eq!(*state_phases.last().unwrap(), Phase::Done);
        assert!(!state_phases.contains(&Phase::Registering));
        let done_count = events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::Done { .. }))
            .count();
        assert_eq!(done_count, 1);

        let status = status.read().unwrap();
        assert!(!status.running);
        assert_eq!(status.phase, Phase::Done);
    }

    #[test]
    fn test_done_is_after_last_state_event() {
        let mut client = MockRegistrarClient::new();
        client
            .expect_submit()
            .returning(|_, _| Ok(outcome(403, vec![])));
        let (engine, _status, _cancel, mut rx) =
            build_engine(client, MockNtpSource::new(), EngineConfig::default());
        engine.run();

        let events = drain(&mut rx);
        let last_state_idx = events
            .iter()
            .rposition(|e| matches!(e.kind, EventKind::State { .. }))
            .unwrap();
        let done_idx = events
            .iter()
            .position(|e| matches!(e.kind, EventKind::Done { .. }))
            .unwrap();
        assert!(done_idx > last_state_idx);
        match &events[last_state_idx].kind {
            EventKind::State { phase, running } => {
                assert_eq!(*phase, Phase::Done);
                assert!(*running, "running must still be true when state{{done}} is emitted");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_burst_prunes_terminal_results_without_retry() {
        let mut client = MockRegistrarClient::new();
        // One round: VAL06 for 12345, VAL03 for 67890 -> set empties.
        client.expect_submit().times(1).returning(|_, _| {
            Ok(outcome(
                200,
                vec![
                    item("12345", 1, Some("VAL06")),
                    item("67890", 1, Some("VAL03")),
                ],
            ))
        });

        let cfg = EngineConfig {
            ecrn_list: vec!["12345".to_string(), "67890".to_string()],
            ..EngineConfig::default()
        };
        let (mut engine, status, _cancel, _rx) =
            build_engine(client, MockNtpSource::new(), cfg);
        engine.register_burst();

        let status = status.read().unwrap();
        assert_eq!(
            status.crn_results.get("12345").unwrap().status,
            CrnStatus::Full
        );
        assert_eq!(
            status.crn_results.get("67890").unwrap().status,
            CrnStatus::Already
        );
    }

    #[test]
    fn test_burst_all_deferred_sleeps_full_interval() {
        let mut client = MockRegistrarClient::new();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = calls.clone();
        client.expect_submit().times(2).returning(move |_, _| {
            let i = calls_clone.fetch_add(1, Ordering::SeqCst);
            if i == 0 {
                Ok(outcome(200, vec![item("12345", 1, Some("VAL02"))]))
            } else {
                Ok(outcome(200, vec![item("12345", 0, None)]))
            }
        });

        let cfg = EngineConfig {
            ecrn_list: vec!["12345".to_string()],
            retry_interval_s: 0.3,
            ..EngineConfig::default()
        };
        let (mut engine, status, _cancel, _rx) =
            build_engine(client, MockNtpSource::new(), cfg);

        let t0 = Instant::now();
        engine.register_burst();
        let elapsed = t0.elapsed();

        assert!(elapsed >= Duration::from_millis(300), "deferred round must wait the full interval");
        assert_eq!(
            status.read().unwrap().crn_results.get("12345").unwrap().status,
            CrnStatus::Success
        );
    }

    #[test]
    fn test_burst_mixed_round_retries_tight() {
        let mut client = MockRegistrarClient::new();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = calls.clone();
        client.expect_submit().times(2).returning(move |_, _| {
            let i = calls_clone.fetch_add(1, Ordering::SeqCst);
            if i == 0 {
                // One terminal, one deferred: not an all-deferred round.
                Ok(outcome(
                    200,
                    vec![
                        item("12345", 0, None),
                        item("67890", 1, Some("VAL02")),
                    ],
                ))
            } else {
                Ok(outcome(200, vec![item("67890", 0, None)]))
            }
        });

        let cfg = EngineConfig {
            ecrn_list: vec!["12345".to_string(), "67890".to_string()],
            retry_interval_s: 3.0,
            ..EngineConfig::default()
        };
        let (mut engine, _status, _cancel, _rx) =
            build_engine(client, MockNtpSource::new(), cfg);

        let t0 = Instant::now();
        engine.register_burst();
        // Tight retry (50ms), never the 3s interval.
        assert!(t0.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_burst_rate_limit_backoff() {
        let mut client = MockRegistrarClient::new();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = calls.clone();
        client.expect_submit().times(2).returning(move |_, _| {
            let i = calls_clone.fetch_add(1, Ordering::SeqCst);
            if i == 0 {
                Ok(SubmitOutcome {
                    status: 429,
                    retry_after_s: Some(1),
                    results: vec![],
                    rtt_s: 0.010,
                    date_header: None,
                    body_excerpt: String::new(),
                })
            } else {
                Ok(outcome(200, vec![item("12345", 0, None)]))
            }
        });

        let cfg = EngineConfig {
            ecrn_list: vec!["12345".to_string()],
            retry_interval_s: 3.0,
            ..EngineConfig::default()
        };
        let (mut engine, _status, _cancel, _rx) =
            build_engine(client, MockNtpSource::new(), cfg);

        let t0 = Instant::now();
        engine.register_burst();
        // Honors Retry-After: the second attempt starts >= 1s later.
        assert!(t0.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn test_cancel_blocks_new_attempts() {
        let mut client = MockRegistrarClient::new();
        client.expect_submit().never();

        let cfg = EngineConfig {
            ecrn_list: vec!["12345".to_string()],
            ..EngineConfig::default()
        };
        let (mut engine, _status, cancel, _rx) =
            build_engine(client, MockNtpSource::new(), cfg);
        cancel.store(true, Ordering::Relaxed);
        engine.register_burst();
    }

    #[test]
    fn test_quick_calibrate_feeds_pool_and_events() {
        let mut client = MockRegistrarClient::new();
        client
            .expect_submit()
            .returning(|_, _| Ok(outcome(200, vec![])));
        let mut ntp = MockNtpSource::new();
        ntp.expect_probe().returning(|| {
            Ok(NtpSample {
                offset_s: 0.003, // server ahead -> local behind by 3ms
                delay_s: 0.006,
            })
        });

        let (mut engine, status, _cancel, mut rx) =
            build_engine(client, ntp, EngineConfig::default());
        let cal = engine.quick_calibrate(SampleSource::Auto).unwrap();
        assert!((cal.server_offset_s - -0.003).abs() < 1e-12);
        assert_eq!(engine.pool.len(), 1);

        let events = drain(&mut rx);
        let has_calibration = events
            .iter()
            .any(|e| matches!(e.kind, EventKind::Calibration(_)));
        assert!(has_calibration);
        assert!(status.read().unwrap().calibration.is_some());
    }

    #[test]
    fn test_quick_calibrate_skips_on_ntp_failure() {
        let client = MockRegistrarClient::new();
        let mut ntp = MockNtpSource::new();
        ntp.expect_probe()
            .returning(|| Err(anyhow::anyhow!("unreachable")));

        let (mut engine, _status, _cancel, _rx) =
            build_engine(client, ntp, EngineConfig::default());
        assert!(engine.quick_calibrate(SampleSource::Auto).is_none());
        assert_eq!(engine.pool.len(), 0);
    }

    #[test]
    fn test_outlier_sample_does_not_move_trigger() {
        let client = MockRegistrarClient::new();
        let (mut engine, _status, _cancel, _rx) =
            build_engine(client, MockNtpSource::new(), EngineConfig::default());

        // Four good samples near -3ms, then a +250ms outlier.
        for i in 0..4 {
            engine.pool.insert(CalibrationSample {
                offset_s: -0.003,
                rtt_s: 0.012 + i as f64 * 0.001,
                observed_at: i as f64,
                source: SampleSource::Auto,
            });
        }
        let target = wall_now() + 60.0;
        let before = engine.recalc_trigger(target);

        engine.pool.insert(CalibrationSample {
            offset_s: 0.250,
            rtt_s: 0.008,
            observed_at: 9.0,
            source: SampleSource::Auto,
        });
        assert_eq!(engine.pool.len(), 4);
        let after = engine.recalc_trigger(target);
        assert!((before - after).abs() < 1e-9);
    }

    #[test]
    fn test_trigger_respects_clamp_window() {
        let client = MockRegistrarClient::new();
        let (mut engine, _status, _cancel, _rx) =
            build_engine(client, MockNtpSource::new(), EngineConfig::default());

        engine.pool.insert(CalibrationSample {
            offset_s: -0.400, // would fire before the target
            rtt_s: 0.010,
            observed_at: 1.0,
            source: SampleSource::Initial,
        });
        let target = 2_000_000.0;
        let fire = engine.recalc_trigger(target);
        assert!(fire >= target + trigger::EARLIEST_AFTER_TARGET_S);
        assert!(fire <= target + trigger::LATEST_AFTER_TARGET_S);
    }
}
