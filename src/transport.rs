//! Blocking HTTP client for the registration endpoint.
//!
//! Tuned for the burst: Nagle off, OS keep-alive on, one warm connection
//! preferred with headroom for keep-alive races, redirects disabled so a
//! HEAD probe measures exactly one round trip.

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, DATE, RETRY_AFTER, USER_AGENT};
use serde_json::json;
use std::time::{Duration, Instant};

use crate::clock::wall_now;
use crate::protocol::{DateSample, SubmitEnvelope, SubmitOutcome};
use crate::traits::RegistrarClient;

pub const SUBMIT_URL: &str = "https://obs.itu.edu.tr/api/ders-kayit/v21";
pub const ORIGIN_URL: &str = "https://obs.itu.edu.tr";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const POOL_MAX_IDLE: usize = 5;
const BODY_EXCERPT_LEN: usize = 200;

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

pub struct HttpTransport {
    http: Client,
    submit_url: String,
    origin_url: String,
}

impl HttpTransport {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_urls(token, SUBMIT_URL, ORIGIN_URL)
    }

    pub fn with_urls(token: &str, submit_url: &str, origin_url: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| anyhow!("token contains invalid header characters"))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_UA));

        let http = Client::builder()
            .default_headers(headers)
            .tcp_nodelay(true)
            .tcp_keepalive(KEEPALIVE_INTERVAL)
            .pool_max_idle_per_host(POOL_MAX_IDLE)
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("building HTTP client")?;

        Ok(HttpTransport {
            http,
            submit_url: submit_url.to_string(),
            origin_url: origin_url.to_string(),
        })
    }
}

impl RegistrarClient for HttpTransport {
    fn submit(&self, ecrn: &[String], scrn: &[String]) -> Result<SubmitOutcome> {
        let body = json!({ "ECRN": ecrn, "SCRN": scrn });

        let t0 = Instant::now();
        let response = self
            .http
            .post(&self.submit_url)
            .json(&body)
            .send()
            .context("submit request failed")?;
        let rtt_s = t0.elapsed().as_secs_f64();

        let status = response.status().as_u16();
        let retry_after_s = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok());
        let date_header = response
            .headers()
            .get(DATE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let (results, body_excerpt) = if status == 200 {
            let envelope: SubmitEnvelope =
                response.json().context("parsing submit response body")?;
            (envelope.ecrn_result_list.unwrap_or_default(), String::new())
        } else {
            let text = response.text().unwrap_or_default();
            (Vec::new(), text.chars().take(BODY_EXCERPT_LEN).collect())
        };

        Ok(SubmitOutcome {
            status,
            retry_after_s,
            results,
            rtt_s,
            date_header,
            body_excerpt,
        })
    }

    fn head_date(&self) -> Result<DateSample> {
        let wall_start = wall_now();
        let t0 = Instant::now();
        let response = self
            .http
            .head(&self.origin_url)
            .timeout(HEAD_TIMEOUT)
            .send()
            .context("HEAD probe failed")?;
        let rtt_s = t0.elapsed().as_secs_f64();

        let date_header = response
            .headers()
            .get(DATE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("origin answered without a Date header"))?;

        Ok(DateSample {
            date_header,
            rtt_s,
            wall_start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_builds_with_token() {
        let transport = HttpTransport::new("abc.def.ghi").unwrap();
        assert_eq!(transport.submit_url, SUBMIT_URL);
        assert_eq!(transport.origin_url, ORIGIN_URL);
    }

    #[test]
    fn test_transport_rejects_bad_token() {
        assert!(HttpTransport::new("line\nbreak").is_err());
    }
}
