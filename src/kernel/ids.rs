//! Identifier generation and the monotonic millisecond clock.
//!
//! Every identifier family the core hands out lives here so the formats
//! stay in one place: correlation ids (8 hex chars, one per process run),
//! epic ids (6 hex chars), event ids (derived, not random), and the
//! uuid-backed ids for sessions, checkpoints, learnings, signals, and
//! prompts.

use std::sync::atomic::{AtomicI64, Ordering};

use rand::Rng;
use uuid::Uuid;

/// Monotonic wall-clock in unix milliseconds.
///
/// `now_ms` never returns a value less than or equal to the previous call,
/// even if the wall clock steps backwards. Event ids and offsets both rely
/// on this.
#[derive(Debug, Default)]
pub struct Clock {
    last_ms: AtomicI64,
}

impl Clock {
    /// Create a clock with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current unix milliseconds, strictly greater than the previous call.
    pub fn now_ms(&self) -> i64 {
        let wall = chrono::Utc::now().timestamp_millis();
        let mut prev = self.last_ms.load(Ordering::Relaxed);
        loop {
            let next = if wall > prev { wall } else { prev.saturating_add(1) };
            match self.last_ms.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Random lower-hex string of `len` characters.
fn hex_string(len: usize) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..HEX.len());
            char::from(HEX[idx])
        })
        .collect()
}

/// Per-process correlation id grouping all events of one run.
pub fn correlation_id() -> String {
    hex_string(8)
}

/// Six-hex epic identifier, e.g. `"a3f29c"`.
pub fn epic_id() -> String {
    hex_string(6)
}

/// Derive an event id from its correlation id, timestamp, and offset.
///
/// Deterministic so replay reconstructs identical ids from the log.
pub fn event_id(correlation_id: &str, timestamp_ms: i64, offset: u64) -> String {
    format!("evt_{timestamp_ms}_{offset}_{correlation_id}")
}

/// Fresh session identifier for locally created sessions.
pub fn session_id() -> String {
    format!("ses_{}", Uuid::new_v4().simple())
}

/// Fresh checkpoint identifier.
pub fn checkpoint_id() -> String {
    format!("cp_{}", Uuid::new_v4().simple())
}

/// Fresh learning identifier.
pub fn learning_id() -> String {
    format!("lrn_{}", Uuid::new_v4().simple())
}

/// Fresh upward-signal identifier.
pub fn signal_id() -> String {
    format!("sig_{}", Uuid::new_v4().simple())
}

/// Fresh deferred-prompt identifier.
pub fn prompt_id() -> String {
    format!("dp_{}", Uuid::new_v4().simple())
}
