//! Typed event stream from an engine to its websocket subscribers.
//!
//! Single producer (the engine worker thread), drained by one async task
//! that fans every event out to the session's subscribers as JSON frames.
//! The channel is unbounded; the drain keeps up because serialization is
//! the only work per event.

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::calibration::CalibrationReport;
use crate::clock::wall_now;
use crate::protocol::CrnResult;
use crate::status::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    Log {
        message: String,
        level: LogLevel,
    },
    State {
        phase: Phase,
        running: bool,
    },
    Calibration(CalibrationReport),
    Countdown {
        trigger_time: f64,
        remaining: f64,
    },
    CrnUpdate {
        results: BTreeMap<String, CrnResult>,
    },
    Done {
        results: BTreeMap<String, CrnResult>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: f64,
}

/// Sending half owned by the engine. Cheap to clone; emitting after the
/// consumer is gone is a no-op rather than an error.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventBus { tx }, rx)
    }

    pub fn emit(&self, kind: EventKind) {
        let event = Event {
            kind,
            timestamp: wall_now(),
        };
        let _ = self.tx.send(event);
    }

    /// Queue a `log` event and mirror it to the process log.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!("{}", message),
            LogLevel::Warning => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        self.emit(EventKind::Log { message, level });
    }
}
