//! Session registry: one isolated state bundle per browser session.
//!
//! Each session owns at most one engine and one broadcast fanout; the
//! registry map is the only shared mutable structure in the service and
//! every mutation goes through its mutex.

use log::info;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::{Uuid, Variant};

use crate::config::SessionConfig;
use crate::status::EngineStatus;

pub const MAX_SESSIONS: usize = 100;
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(7200);
const FANOUT_CAPACITY: usize = 256;

/// Strict hyphenated UUIDv4: 8-4-4-4-12 hex digits, version nibble 4,
/// RFC 4122 variant. The uuid crate alone also accepts simple/urn forms,
/// which the front door must reject.
pub fn valid_session_id(id: &str) -> bool {
    if id.len() != 36 {
        return false;
    }
    for (i, b) in id.bytes().enumerate() {
        match i {
            8 | 13 | 18 | 23 => {
                if b != b'-' {
                    return false;
                }
            }
            _ => {
                if !b.is_ascii_hexdigit() {
                    return false;
                }
            }
        }
    }
    match Uuid::parse_str(id) {
        Ok(uuid) => uuid.get_version_num() == 4 && uuid.get_variant() == Variant::RFC4122,
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    InvalidId,
    Capacity,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::InvalidId => write!(f, "invalid session ID format"),
            RegistryError::Capacity => write!(f, "maximum session count reached"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Live engine owned by a session. Dropping the handle detaches the worker
/// thread; the engine itself exits through its own finalizer.
pub struct EngineHandle {
    pub status: Arc<RwLock<EngineStatus>>,
    pub cancel: Arc<AtomicBool>,
    pub max_attempts: u32,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl EngineHandle {
    pub fn new(
        status: Arc<RwLock<EngineStatus>>,
        cancel: Arc<AtomicBool>,
        max_attempts: u32,
        thread: std::thread::JoinHandle<()>,
    ) -> Self {
        EngineHandle {
            status,
            cancel,
            max_attempts,
            thread: Some(thread),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .running
    }

    pub fn thread_alive(&self) -> bool {
        self.thread
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Clear a stuck running flag. The worker, if still alive, will notice
    /// the cancel at its next checkpoint.
    pub fn force_clear(&self) {
        self.cancel();
        self.status
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .running = false;
    }
}

pub struct Session {
    pub config: SessionConfig,
    pub token: String,
    pub engine: Option<EngineHandle>,
    pub fanout: broadcast::Sender<String>,
    pub last_active: Instant,
}

impl Session {
    fn new() -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Session {
            config: SessionConfig::default(),
            token: String::new(),
            engine: None,
            fanout,
            last_active: Instant::now(),
        }
    }

    pub fn engine_running(&self) -> bool {
        self.engine.as_ref().map(|e| e.is_running()).unwrap_or(false)
    }
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    capacity: usize,
    idle_timeout: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_limits(MAX_SESSIONS, IDLE_TIMEOUT)
    }

    pub fn with_limits(capacity: usize, idle_timeout: Duration) -> Self {
        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
            capacity,
            idle_timeout,
        }
    }

    /// Run `f` against the (possibly freshly admitted) session. Touches
    /// `last_active` on every call.
    pub fn with_session<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Session) -> T,
    ) -> Result<T, RegistryError> {
        if !valid_session_id(id) {
            return Err(RegistryError::InvalidId);
        }

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if !sessions.contains_key(id) {
            if sessions.len() >= self.capacity {
                self.evict_idle(&mut sessions);
                if sessions.len() >= self.capacity {
                    return Err(RegistryError::Capacity);
                }
            }
            sessions.insert(id.to_string(), Session::new());
        }

        let session = sessions.get_mut(id).expect("just admitted");
        session.last_active = Instant::now();
        Ok(f(session))
    }

    pub fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<String>, RegistryError> {
        self.with_session(id, |session| session.fanout.subscribe())
    }

    /// Evict sessions whose engine is not running and which have been idle
    /// past the timeout.
    fn evict_idle(&self, sessions: &mut HashMap<String, Session>) {
        let now = Instant::now();
        let before = sessions.len();
        sessions.retain(|_, session| {
            session.engine_running()
                || now.duration_since(session.last_active) <= self.idle_timeout
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!("evicted {} idle sessions", evicted);
        }
    }

    /// Cooperative cancel of every running engine, used at shutdown.
    pub fn cancel_all(&self) {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        for session in sessions.values() {
            if let Some(engine) = &session.engine {
                if engine.is_running() {
                    engine.cancel();
                }
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
