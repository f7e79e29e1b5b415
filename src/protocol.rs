//! Outbound registration protocol: wire shapes, result-code semantics and
//! per-CRN bookkeeping.
//!
//! The endpoint answers a submit with one entry per requested CRN. A status
//! code of 0 is success; everything else carries a `resultCode` string from
//! a small known vocabulary, plus a free-form `resultData` object that we
//! keep as raw JSON for diagnostics.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::traits::RegistrarClient;

/// CRN used for probes, prewarms and keep-alives. Never a real section, so
/// the server answers quickly without touching anyone's enrollment.
pub const SENTINEL_CRN: &str = "00000";

// ============================================================================
// WIRE SHAPES
// ============================================================================

/// Parsed response envelope of one submit attempt.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub status: u16,
    pub retry_after_s: Option<u64>,
    pub results: Vec<EcrnResult>,
    pub rtt_s: f64,
    pub date_header: Option<String>,
    /// First 200 chars of a non-200 body, for logging.
    pub body_excerpt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcrnResult {
    pub crn: String,
    #[serde(rename = "statusCode", default = "default_status_code")]
    pub status_code: i64,
    #[serde(rename = "resultCode", default)]
    pub result_code: Option<String>,
    #[serde(rename = "resultData", default)]
    pub result_data: Option<serde_json::Value>,
}

fn default_status_code() -> i64 {
    -1
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitEnvelope {
    #[serde(rename = "ecrnResultList", default)]
    pub ecrn_result_list: Option<Vec<EcrnResult>>,
}

/// One HEAD probe: Date header value plus measured RTT. `wall_start` is the
/// local wall clock at request start, which is what the offset math needs.
#[derive(Debug, Clone)]
pub struct DateSample {
    pub date_header: String,
    pub rtt_s: f64,
    pub wall_start: f64,
}

// ============================================================================
// RESULT CLASSIFICATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrnStatus {
    Pending,
    Success,
    Already,
    Full,
    Conflict,
    Upgrade,
    Debounce,
    Error,
}

impl CrnStatus {
    /// Terminal statuses are never overwritten by a later debounce/pending.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CrnStatus::Success
                | CrnStatus::Already
                | CrnStatus::Full
                | CrnStatus::Conflict
                | CrnStatus::Upgrade
                | CrnStatus::Error
        )
    }
}

/// What one result item means for the working set.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// statusCode == 0
    Success,
    /// VAL03: already registered
    Already,
    /// VAL02: registration period not open yet; stays in the working set
    PeriodNotOpen,
    /// VAL16: server discarded a repeat within ~3s; stays in the working set
    Debounce,
    /// VAL06: capacity full
    Full,
    /// VAL09: schedule conflict
    Conflict,
    /// VAL22: upgrade conflict, with the upgraded-course tag when present
    Upgrade(String),
    /// anything else, with the raw code for the message
    Unknown(String),
}

impl Classified {
    /// Deferred items stay in the working set and count toward the
    /// all-deferred backoff decision.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Classified::PeriodNotOpen | Classified::Debounce)
    }
}

pub fn classify(item: &EcrnResult) -> Classified {
    if item.status_code == 0 {
        return Classified::Success;
    }
    match item.result_code.as_deref() {
        Some("VAL03") => Classified::Already,
        Some("VAL02") => Classified::PeriodNotOpen,
        Some("VAL16") => Classified::Debounce,
        Some("VAL06") => Classified::Full,
        Some("VAL09") => Classified::Conflict,
        Some("VAL22") => {
            let course = item
                .result_data
                .as_ref()
                .and_then(|d| d.get("yukseltmeyeAlinanDers"))
                .and_then(|v| v.as_str())
                .unwrap_or("?")
                .to_string();
            Classified::Upgrade(course)
        }
        Some(other) => Classified::Unknown(describe(other).to_string()),
        None => Classified::Unknown(format!("status code {}", item.status_code)),
    }
}

pub fn describe(code: &str) -> &str {
    match code {
        "VAL02" => "registration period not open yet",
        "VAL03" => "course already registered",
        "VAL06" => "capacity full",
        "VAL09" => "schedule conflict",
        "VAL16" => "debounce (server ignored a repeat within 3s)",
        "VAL22" => "upgrade-course conflict",
        other => other,
    }
}

// ============================================================================
// PER-CRN BOARD
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrnResult {
    pub status: CrnStatus,
    pub message: String,
}

/// Per-CRN result map with the terminality rule baked in: once a CRN reaches
/// a terminal status, later pending/debounce observations are dropped.
#[derive(Debug, Clone, Default)]
pub struct CrnBoard {
    results: BTreeMap<String, CrnResult>,
}

impl CrnBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a status. Returns false when the update was blocked because
    /// the CRN already holds a terminal status.
    pub fn set(&mut self, crn: &str, status: CrnStatus, message: impl Into<String>) -> bool {
        if let Some(existing) = self.results.get(crn) {
            if existing.status.is_terminal() && !status.is_terminal() {
                return false;
            }
        }
        self.results.insert(
            crn.to_string(),
            CrnResult {
                status,
                message: message.into(),
            },
        );
        true
    }

    pub fn get(&self, crn: &str) -> Option<&CrnResult> {
        self.results.get(crn)
    }

    pub fn snapshot(&self) -> BTreeMap<String, CrnResult> {
        self.results.clone()
    }
}

// ============================================================================
// TOKEN PROBE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenTestResult {
    pub valid: bool,
    pub status_code: u16,
    pub message: String,
}

/// Sentinel submit to find out whether the bearer token is accepted.
/// Any reachable answer other than 401/403 counts as a usable token.
pub fn test_token<C: RegistrarClient + ?Sized>(client: &C) -> TokenTestResult {
    match client.submit(&[SENTINEL_CRN.to_string()], &[]) {
        Ok(outcome) => match outcome.status {
            200 => TokenTestResult {
                valid: true,
                status_code: 200,
                message: "token accepted".to_string(),
            },
            401 | 403 => TokenTestResult {
                valid: false,
                status_code: outcome.status,
                message: "token invalid or expired".to_string(),
            },
            other => TokenTestResult {
                valid: true,
                status_code: other,
                message: format!("unexpected server answer: HTTP {}", other),
            },
        },
        Err(e) => TokenTestResult {
            valid: false,
            status_code: 0,
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(sc: i64, rc: Option<&str>, rd: Option<serde_json::Value>) -> EcrnResult {
        EcrnResult {
            crn: "12345".to_string(),
            status_code: sc,
            result_code: rc.map(|s| s.to_string()),
            result_data: rd,
        }
    }

    #[test]
    fn test_classify_table() {
        assert_eq!(classify(&item(0, None, None)), Classified::Success);
        assert_eq!(classify(&item(1, Some("VAL03"), None)), Classified::Already);
        assert_eq!(
            classify(&item(1, Some("VAL02"), None)),
            Classified::PeriodNotOpen
        );
        assert_eq!(
            classify(&item(1, Some("VAL16"), None)),
            Classified::Debounce
        );
        assert_eq!(classify(&item(1, Some("VAL06"), None)), Classified::Full);
        assert_eq!(
            classify(&item(1, Some("VAL09"), None)),
            Classified::Conflict
        );
    }

    #[test]
    fn test_classify_upgrade_extracts_course() {
        let rd = json!({"yukseltmeyeAlinanDers": "MAT 102"});
        match classify(&item(1, Some("VAL22"), Some(rd))) {
            Classified::Upgrade(course) => assert_eq!(course, "MAT 102"),
            other => panic!("expected upgrade, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_upgrade_without_data() {
        match classify(&item(1, Some("VAL22"), None)) {
            Classified::Upgrade(course) => assert_eq!(course, "?"),
            other => panic!("expected upgrade, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_unknown_code() {
        match classify(&item(1, Some("VAL99"), None)) {
            Classified::Unknown(msg) => assert_eq!(msg, "VAL99"),
            other => panic!("expected unknown, got {:?}", other),
        }
    }

    #[test]
    fn test_deferred_codes() {
        assert!(classify(&item(1, Some("VAL02"), None)).is_deferred());
        assert!(classify(&item(1, Some("VAL16"), None)).is_deferred());
        assert!(!classify(&item(0, None, None)).is_deferred());
        assert!(!classify(&item(1, Some("VAL06"), None)).is_deferred());
    }

    #[test]
    fn test_board_terminal_not_overwritten() {
        let mut board = CrnBoard::new();
        assert!(board.set("12345", CrnStatus::Success, "registered"));
        assert!(!board.set("12345", CrnStatus::Debounce, "repeat"));
        assert!(!board.set("12345", CrnStatus::Pending, "waiting"));
        assert_eq!(board.get("12345").unwrap().status, CrnStatus::Success);
    }

    #[test]
    fn test_board_pending_to_terminal_allowed() {
        let mut board = CrnBoard::new();
        board.set("12345", CrnStatus::Pending, "waiting");
        board.set("12345", CrnStatus::Debounce, "repeat");
        assert!(board.set("12345", CrnStatus::Full, "capacity full"));
        assert_eq!(board.get("12345").unwrap().status, CrnStatus::Full);
    }

    #[test]
    fn test_board_terminal_to_terminal_allowed() {
        // A later terminal observation (e.g. error reclassified) may replace
        // an earlier terminal one; only non-terminal downgrades are blocked.
        let mut board = CrnBoard::new();
        board.set("12345", CrnStatus::Full, "capacity full");
        assert!(board.set("12345", CrnStatus::Error, "server fault"));
    }

    #[test]
    fn test_envelope_parses_real_shape() {
        let raw = json!({
            "ecrnResultList": [
                {"crn": "12345", "statusCode": 0, "resultCode": null, "resultData": null},
                {"crn": "67890", "statusCode": 1, "resultCode": "VAL06",
                 "resultData": {"kontenjan": 60}},
            ]
        });
        let env: SubmitEnvelope = serde_json::from_value(raw).unwrap();
        let items = env.ecrn_result_list.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(classify(&items[0]), Classified::Success);
        assert_eq!(classify(&items[1]), Classified::Full);
    }
}
