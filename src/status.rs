use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::calibration::CalibrationReport;
use crate::protocol::CrnResult;

/// Engine lifecycle. Any phase may jump straight to `Done` on cancel or a
/// fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    TokenCheck,
    Calibrating,
    Waiting,
    Registering,
    Done,
}

/// Snapshot shared between the engine worker and the REST status endpoint.
///
/// The engine writes it at every transition; `running` is cleared last, only
/// after the terminal events have been queued, so a consumer that exits on
/// `running == false` never misses the final `done`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub phase: Phase,
    pub running: bool,
    pub current_attempt: u32,
    pub trigger_time: Option<f64>,
    pub calibration: Option<CalibrationReport>,
    pub crn_results: BTreeMap<String, CrnResult>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        EngineStatus {
            phase: Phase::Idle,
            running: false,
            current_attempt: 0,
            trigger_time: None,
            calibration: None,
            crn_results: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_default() {
        let status = EngineStatus::default();
        assert_eq!(status.phase, Phase::Idle);
        assert!(!status.running);
        assert_eq!(status.current_attempt, 0);
        assert!(status.trigger_time.is_none());
    }

    #[test]
    fn test_phase_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Phase::TokenCheck).unwrap(),
            "\"token_check\""
        );
        assert_eq!(
            serde_json::to_string(&Phase::Registering).unwrap(),
            "\"registering\""
        );
    }

    #[test]
    fn test_status_serde_roundtrip() {
        let mut status = EngineStatus::default();
        status.phase = Phase::Waiting;
        status.running = true;
        status.trigger_time = Some(1700000000.125);

        let json = serde_json::to_string(&status).unwrap();
        let restored: EngineStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.phase, Phase::Waiting);
        assert!(restored.running);
        assert_eq!(restored.trigger_time, Some(1700000000.125));
    }
}
