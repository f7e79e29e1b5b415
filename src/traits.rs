use anyhow::Result;

use crate::ntp::NtpSample;
use crate::protocol::{DateSample, SubmitOutcome};

/// Outbound HTTP seam to the registration endpoint. The engine never talks
/// to the network directly; everything goes through this trait so the burst
/// and calibration logic can be exercised against scripted fakes.
#[cfg_attr(test, mockall::automock)]
pub trait RegistrarClient: Send {
    /// POST the working set. Transport failures (DNS, TCP, TLS, read) are
    /// `Err`; any HTTP status is `Ok` with the parsed outcome.
    fn submit(&self, ecrn: &[String], scrn: &[String]) -> Result<SubmitOutcome>;

    /// HEAD the origin and report the `Date` header plus the measured RTT.
    fn head_date(&self) -> Result<DateSample>;
}

#[cfg_attr(test, mockall::automock)]
pub trait NtpSource: Send {
    /// One NTP measurement: offset (server minus local) and round-trip delay.
    fn probe(&self) -> Result<NtpSample>;
}
