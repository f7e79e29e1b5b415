use anyhow::{anyhow, Result};
use log::debug;
use rsntp::SntpClient;
use std::time::Duration;

use crate::traits::NtpSource;

/// Servers tried in order; the lowest-delay answer wins.
const DEFAULT_SERVERS: [&str; 3] = ["time.google.com", "time.cloudflare.com", "pool.ntp.org"];

const NTP_TIMEOUT: Duration = Duration::from_secs(3);

/// One SNTP measurement.
///
/// `offset_s` is server minus local: positive means the NTP server is ahead
/// of the local clock. Sub-millisecond granularity, which is why NTP is the
/// primary offset source over the 1-second Date header.
#[derive(Debug, Clone, Copy)]
pub struct NtpSample {
    pub offset_s: f64,
    pub delay_s: f64,
}

pub struct SntpSource {
    servers: Vec<String>,
    timeout: Duration,
}

impl SntpSource {
    pub fn new() -> Self {
        SntpSource {
            servers: DEFAULT_SERVERS.iter().map(|s| s.to_string()).collect(),
            timeout: NTP_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_servers(servers: Vec<String>) -> Self {
        SntpSource {
            servers,
            timeout: NTP_TIMEOUT,
        }
    }
}

impl Default for SntpSource {
    fn default() -> Self {
        Self::new()
    }
}

impl NtpSource for SntpSource {
    fn probe(&self) -> Result<NtpSample> {
        let mut best: Option<NtpSample> = None;

        for server in &self.servers {
            let mut client = SntpClient::new();
            client.set_timeout(self.timeout);

            match client.synchronize(server) {
                Ok(result) => {
                    let offset_s = result.clock_offset().as_secs_f64();
                    let delay_s = result.round_trip_delay().as_secs_f64();
                    debug!(
                        "ntp {}: offset={:+.1}ms delay={:.1}ms",
                        server,
                        offset_s * 1000.0,
                        delay_s * 1000.0
                    );
                    if best.map_or(true, |b| delay_s < b.delay_s) {
                        best = Some(NtpSample { offset_s, delay_s });
                    }
                }
                Err(e) => {
                    debug!("ntp {} unreachable: {}", server, e);
                }
            }
        }

        best.ok_or_else(|| anyhow!("no NTP server reachable"))
    }
}
