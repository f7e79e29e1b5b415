//! Clock oracle probes: Date-header transition measurement and RTT
//! statistics over the real submit path.
//!
//! NTP (see `ntp.rs`) is the primary offset source. The Date header ticks
//! in whole seconds, so its transition instant carries +-500ms of noise and
//! is only used to cross-validate the NTP answer. RTT is always measured
//! with sentinel POSTs because the burst itself is a POST.

use anyhow::Result;
use chrono::DateTime;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::clock::sleep_cancellable;
use crate::events::{EventBus, LogLevel};
use crate::protocol::SENTINEL_CRN;
use crate::traits::RegistrarClient;

/// Poll-interval clamp for the transition watch.
const POLL_MIN_S: f64 = 0.002;
const POLL_MAX_S: f64 = 0.050;
/// Budget per transition.
const TRANSITION_BUDGET_S: f64 = 2.0;
/// Transitions attempted before settling for the best pair.
const MAX_TRANSITIONS: usize = 3;
/// A transition RTT below this fraction of the median ends the hunt early.
const SHORTCIRCUIT_FRACTION: f64 = 0.8;

/// RTT fallback when every probe fails.
const FALLBACK_RTT_S: f64 = 0.010;

/// One-way drift below this is treated as probe noise.
const PROBE_DRIFT_FLOOR_S: f64 = 0.003;

pub fn parse_http_date(value: &str) -> Result<f64> {
    let parsed = DateTime::parse_from_rfc2822(value)?;
    Ok(parsed.timestamp() as f64)
}

fn sentinel_rtt<C: RegistrarClient>(client: &C) -> Option<f64> {
    let ecrn = [SENTINEL_CRN.to_string()];
    client.submit(&ecrn, &[]).ok().map(|o| o.rtt_s)
}

/// Median RTT over `n` sentinel POSTs. Falls back to 10ms when nothing
/// comes back, so downstream math always has a value.
pub fn median_rtt<C: RegistrarClient>(client: &C, n: usize) -> f64 {
    let mut rtts: Vec<f64> = (0..n).filter_map(|_| sentinel_rtt(client)).collect();
    if rtts.is_empty() {
        return FALLBACK_RTT_S;
    }
    rtts.sort_by(|a, b| a.total_cmp(b));
    rtts[rtts.len() / 2]
}

#[derive(Debug, Clone, Copy)]
pub struct RttStats {
    pub median_s: f64,
    pub jitter_s: f64,
    pub min_s: f64,
    pub max_s: f64,
    pub count: usize,
    /// Chronological drift: last sample minus first.
    pub trend_s: f64,
}

impl Default for RttStats {
    fn default() -> Self {
        RttStats {
            median_s: FALLBACK_RTT_S,
            jitter_s: 0.005,
            min_s: FALLBACK_RTT_S,
            max_s: FALLBACK_RTT_S,
            count: 0,
            trend_s: 0.0,
        }
    }
}

/// RTT statistics over `n` sentinel POSTs: median, population stddev
/// (jitter), extremes and the chronological trend.
pub fn rtt_statistics<C: RegistrarClient>(client: &C, n: usize, cancel: &AtomicBool) -> RttStats {
    let mut rtts = Vec::with_capacity(n);
    for _ in 0..n {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        if let Some(rtt) = sentinel_rtt(client) {
            rtts.push(rtt);
        }
    }
    if rtts.is_empty() {
        return RttStats::default();
    }

    // Trend needs the chronological order, so compute it before sorting.
    let trend_s = if rtts.len() >= 2 {
        rtts[rtts.len() - 1] - rtts[0]
    } else {
        0.0
    };

    rtts.sort_by(|a, b| a.total_cmp(b));
    let count = rtts.len();
    let median_s = rtts[count / 2];
    let mean = rtts.iter().sum::<f64>() / count as f64;
    let variance = rtts.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / count as f64;

    RttStats {
        median_s,
        jitter_s: variance.sqrt(),
        min_s: rtts[0],
        max_s: rtts[count - 1],
        count,
        trend_s,
    }
}

/// Watch the origin's `Date` header for second transitions and estimate the
/// server offset at each one: `(t_start + rtt/2) - parse(new_date)`.
///
/// Up to three transitions are observed; the lowest-RTT pair wins, and a
/// transition noticeably faster than the median RTT ends the hunt early.
/// Returns `(offset_s, rtt_s)` of the best transition.
pub fn date_transition_offset<C: RegistrarClient>(
    client: &C,
    median_rtt_s: f64,
    cancel: &AtomicBool,
    bus: &EventBus,
) -> Option<(f64, f64)> {
    let poll_interval_s = (median_rtt_s / 2.0).clamp(POLL_MIN_S, POLL_MAX_S);
    let max_polls = (TRANSITION_BUDGET_S / poll_interval_s).ceil() as usize;

    let first = client.head_date().ok()?;
    let mut last_date = first.date_header;
    bus.log(LogLevel::Info, format!("server reports: {}", last_date));

    let mut best: Option<(f64, f64)> = None;

    for _ in 0..MAX_TRANSITIONS {
        let mut transitioned = false;

        for _ in 0..max_polls {
            if cancel.load(Ordering::Relaxed) {
                return best;
            }

            let sample = match client.head_date() {
                Ok(s) => s,
                Err(_) => {
                    sleep_cancellable(Duration::from_secs_f64(poll_interval_s), cancel);
                    continue;
                }
            };

            if sample.date_header != last_date {
                if let Ok(server_ts) = parse_http_date(&sample.date_header) {
                    let offset = (sample.wall_start + sample.rtt_s / 2.0) - server_ts;
                    bus.log(
                        LogLevel::Info,
                        format!(
                            "Date transition: RTT={:.0}ms, offset={:+.0}ms (+-500ms granularity)",
                            sample.rtt_s * 1000.0,
                            offset * 1000.0
                        ),
                    );
                    if best.map_or(true, |(_, rtt)| sample.rtt_s < rtt) {
                        best = Some((offset, sample.rtt_s));
                    }
                } else {
                    debug!("unparseable Date header: {}", sample.date_header);
                }
                last_date = sample.date_header;
                transitioned = true;
                break;
            }

            if !sleep_cancellable(Duration::from_secs_f64(poll_interval_s), cancel) {
                return best;
            }
        }

        if !transitioned {
            break;
        }
        if let Some((_, rtt)) = best {
            if rtt < median_rtt_s * SHORTCIRCUIT_FRACTION {
                break;
            }
        }
    }

    best
}

/// Three quick sentinel POSTs right before firing. The minimum RTT is the
/// most symmetric sample; when its one-way estimate drifted more than 3ms
/// from the calibration, the trigger is shifted by the negated drift.
///
/// Returns `(correction_s, probe_rtt_s)`.
pub fn last_second_probe<C: RegistrarClient>(client: &C, cal_one_way_s: f64) -> (f64, f64) {
    let rtts: Vec<f64> = (0..3).filter_map(|_| sentinel_rtt(client)).collect();
    let Some(probe_rtt) = rtts.iter().copied().min_by(|a, b| a.total_cmp(b)) else {
        return (0.0, 0.0);
    };

    let drift = probe_rtt / 2.0 - cal_one_way_s;
    if drift.abs() > PROBE_DRIFT_FLOOR_S {
        (-drift, probe_rtt)
    } else {
        (0.0, probe_rtt)
    }
}

/// Warm the TLS/TCP path with sentinel POSTs; `light` sends one instead of
/// two. Failures are reported, not fatal.
pub fn prewarm<C: RegistrarClient>(client: &C, light: bool, bus: &EventBus) {
    let ecrn = [SENTINEL_CRN.to_string()];
    match client.submit(&ecrn, &[]) {
        Ok(_) => {
            if !light {
                let _ = client.submit(&ecrn, &[]);
            }
            bus.log(
                LogLevel::Info,
                if light {
                    "connection ready (light prewarm)"
                } else {
                    "connection ready"
                },
            );
        }
        Err(e) => bus.log(LogLevel::Warning, format!("prewarm failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DateSample, SubmitOutcome};
    use crate::traits::MockRegistrarClient;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn outcome(rtt_s: f64) -> SubmitOutcome {
        SubmitOutcome {
            status: 200,
            retry_after_s: None,
            results: vec![],
            rtt_s,
            date_header: None,
            body_excerpt: String::new(),
        }
    }

    #[test]
    fn test_parse_http_date() {
        let ts = parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        assert_eq!(ts, 1445412480.0);
        assert!(parse_http_date("not a date").is_err());
    }

    #[test]
    fn test_median_rtt_odd_samples() {
        let mut client = MockRegistrarClient::new();
        let rtts = Arc::new(AtomicUsize::new(0));
        let seq = [0.030, 0.010, 0.020];
        client.expect_submit().times(3).returning(move |_, _| {
            let i = rtts.fetch_add(1, Ordering::SeqCst);
            Ok(outcome(seq[i]))
        });
        let median = median_rtt(&client, 3);
        assert!((median - 0.020).abs() < 1e-12);
    }

    #[test]
    fn test_median_rtt_fallback_on_failures() {
        let mut client = MockRegistrarClient::new();
        client
            .expect_submit()
            .times(3)
            .returning(|_, _| Err(anyhow::anyhow!("connection refused")));
        assert!((median_rtt(&client, 3) - FALLBACK_RTT_S).abs() < 1e-12);
    }

    #[test]
    fn test_rtt_statistics_trend_is_chronological() {
        let mut client = MockRegistrarClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seq = [0.010, 0.030, 0.020, 0.040];
        client.expect_submit().times(4).returning(move |_, _| {
            let i = calls.fetch_add(1, Ordering::SeqCst);
            Ok(outcome(seq[i]))
        });
        let cancel = AtomicBool::new(false);
        let stats = rtt_statistics(&client, 4, &cancel);
        assert_eq!(stats.count, 4);
        assert!((stats.trend_s - 0.030).abs() < 1e-12);
        assert!((stats.min_s - 0.010).abs() < 1e-12);
        assert!((stats.max_s - 0.040).abs() < 1e-12);
    }

    #[test]
    fn test_rtt_statistics_respects_cancel() {
        let mut client = MockRegistrarClient::new();
        client.expect_submit().never();
        let cancel = AtomicBool::new(true);
        let stats = rtt_statistics(&client, 10, &cancel);
        assert_eq!(stats.count, 0);
    }

    #[test]
    fn test_last_second_probe_corrects_large_drift() {
        let mut client = MockRegistrarClient::new();
        // min RTT 40ms -> one-way 20ms, calibration said 10ms -> drift +10ms
        let calls = Arc::new(AtomicUsize::new(0));
        let seq = [0.050, 0.040, 0.045];
        client.expect_submit().times(3).returning(move |_, _| {
            let i = calls.fetch_add(1, Ordering::SeqCst);
            Ok(outcome(seq[i]))
        });
        let (correction, probe_rtt) = last_second_probe(&client, 0.010);
        assert!((probe_rtt - 0.040).abs() < 1e-12);
        assert!((correction - -0.010).abs() < 1e-12);
    }

    #[test]
    fn test_last_second_probe_ignores_noise() {
        let mut client = MockRegistrarClient::new();
        client
            .expect_submit()
            .times(3)
            .returning(|_, _| Ok(outcome(0.021)));
        // one-way 10.5ms vs calibrated 10ms: inside the 3ms floor
        let (correction, _) = last_second_probe(&client, 0.010);
        assert_eq!(correction, 0.0);
    }

    #[test]
    fn test_date_transition_keeps_lowest_rtt_pair() {
        let mut client = MockRegistrarClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        // Baseline, then a transition with 30ms RTT, then one with 10ms RTT
        // (10ms < 80% of 20ms median short-circuits after the second).
        client.expect_head_date().returning(move || {
            let i = calls.fetch_add(1, Ordering::SeqCst);
            let (date, rtt) = match i {
                0 => ("Wed, 21 Oct 2015 07:28:00 GMT", 0.020),
                1 => ("Wed, 21 Oct 2015 07:28:01 GMT", 0.030),
                _ => ("Wed, 21 Oct 2015 07:28:02 GMT", 0.010),
            };
            Ok(DateSample {
                date_header: date.to_string(),
                rtt_s: rtt,
                wall_start: 1445412480.0 + i as f64,
            })
        });

        let cancel = AtomicBool::new(false);
        let (bus, _rx) = EventBus::channel();
        let (offset, rtt) = date_transition_offset(&client, 0.020, &cancel, &bus).unwrap();
        assert!((rtt - 0.010).abs() < 1e-12);
        // wall_start=1445412482, rtt/2=5ms, server=...482 -> offset=+5ms
        assert!((offset - 0.005).abs() < 1e-9);
    }

    #[test]
    fn test_date_transition_none_when_header_static() {
        let mut client = MockRegistrarClient::new();
        client.expect_head_date().returning(|| {
            Ok(DateSample {
                date_header: "Wed, 21 Oct 2015 07:28:00 GMT".to_string(),
                rtt_s: 0.004,
                wall_start: 1445412480.0,
            })
        });
        let cancel = AtomicBool::new(false);
        let (bus, _rx) = EventBus::channel();
        // 4ms median keeps the poll interval at the 2ms floor; the 2s budget
        // still expires without a transition.
        assert!(date_transition_offset(&client, 0.004, &cancel, &bus).is_none());
    }
}
