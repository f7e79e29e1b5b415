//! Wall-clock and monotonic time helpers.
//!
//! All scheduling math works in epoch seconds (f64); the final approach to
//! the firing instant switches to `Instant` because the OS wall clock is not
//! monotonic and plain sleeps overshoot by 10-16ms on default schedulers.

use anyhow::{anyhow, Result};
use chrono::{FixedOffset, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Civil-time zone of the deployment region (UTC+3, no DST).
/// Target times are interpreted here regardless of the process timezone.
const CIVIL_ZONE_SECS: i32 = 3 * 3600;

/// Current wall clock as epoch seconds.
pub fn wall_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub fn civil_zone() -> FixedOffset {
    FixedOffset::east_opt(CIVIL_ZONE_SECS).expect("static offset is valid")
}

/// Resolve "HH:MM:SS" against today's date in the deployment zone.
pub fn target_epoch(hms: &str) -> Result<f64> {
    let parts: Vec<&str> = hms.split(':').collect();
    if parts.len() != 3 {
        return Err(anyhow!("invalid target time '{}': expected HH:MM:SS", hms));
    }
    let h: u32 = parts[0].parse()?;
    let m: u32 = parts[1].parse()?;
    let s: u32 = parts[2].parse()?;

    let zone = civil_zone();
    let today = Utc::now().with_timezone(&zone).date_naive();
    let naive = today
        .and_hms_opt(h, m, s)
        .ok_or_else(|| anyhow!("invalid target time '{}'", hms))?;
    let local = zone
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| anyhow!("ambiguous target time '{}'", hms))?;
    Ok(local.timestamp() as f64)
}

/// Sleep in <=100ms slices so a cancel is honored promptly.
/// Returns false when the sleep was interrupted by cancellation.
pub fn sleep_cancellable(duration: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        let chunk = (deadline - now).min(Duration::from_millis(100));
        std::thread::sleep(chunk);
    }
}

/// Spin on the monotonic clock until the wall-clock instant `fire_at`.
///
/// The remaining wall time is converted to a monotonic deadline once, then
/// the loop never touches the wall clock again.
pub fn busy_wait_until(fire_at: f64) {
    let remaining = fire_at - wall_now();
    if remaining <= 0.0 {
        return;
    }
    let deadline = Instant::now() + Duration::from_secs_f64(remaining);
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_epoch_resolves_today() {
        let target = target_epoch("13:45:30").unwrap();
        let zone = civil_zone();
        let resolved = zone.timestamp_opt(target as i64, 0).unwrap();
        use chrono::Timelike;
        assert_eq!(resolved.hour(), 13);
        assert_eq!(resolved.minute(), 45);
        assert_eq!(resolved.second(), 30);
    }

    #[test]
    fn test_target_epoch_rejects_garbage() {
        assert!(target_epoch("25:00:00").is_err());
        assert!(target_epoch("14:00").is_err());
        assert!(target_epoch("").is_err());
        assert!(target_epoch("aa:bb:cc").is_err());
    }

    #[test]
    fn test_sleep_cancellable_completes() {
        let cancel = AtomicBool::new(false);
        let t0 = Instant::now();
        assert!(sleep_cancellable(Duration::from_millis(20), &cancel));
        assert!(t0.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_sleep_cancellable_interrupts() {
        let cancel = AtomicBool::new(true);
        let t0 = Instant::now();
        assert!(!sleep_cancellable(Duration::from_secs(5), &cancel));
        assert!(t0.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_busy_wait_reaches_deadline() {
        let fire_at = wall_now() + 0.02;
        busy_wait_until(fire_at);
        assert!(wall_now() >= fire_at);
    }
}
