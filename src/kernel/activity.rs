//! High-frequency activity stream: one JSON line per agent action.
//!
//! Unlike the orchestration stream, the activity log favors availability
//! over consistency: when the advisory lock stays contended it appends
//! unlocked rather than losing the line. Rotation is daily, by renaming
//! the active file with the previous date.

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::kernel::log::{AppendLog, LockPolicy, LogError};

/// Active file name inside the base directory.
const ACTIVITY_FILE: &str = "activity.jsonl";

/// One activity record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// Session the activity belongs to.
    pub session_id: String,
    /// Agent performing the action.
    pub agent: String,
    /// Short action tag, e.g. `"task.dispatch"`.
    pub action: String,
    /// Free-form detail.
    pub detail: serde_json::Value,
}

/// Counters surfaced on the status path.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivityStats {
    /// Lines appended since startup.
    pub appends: u64,
    /// Appends that fell through without the advisory lock.
    pub unlocked_appends: u64,
    /// Daily rotations performed.
    pub rotations: u64,
}

struct ActivityState {
    log: AppendLog,
    current_date: NaiveDate,
    appends: u64,
    rotations: u64,
}

/// Cross-process-safe activity logger with daily rotation.
pub struct ActivityLogger {
    state: Mutex<ActivityState>,
}

impl ActivityLogger {
    /// Open the activity log under `base_dir`.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, LogError> {
        let path: PathBuf = base_dir.as_ref().join(ACTIVITY_FILE);
        let log = AppendLog::new(path, LockPolicy::BestEffort)?;
        Ok(Self {
            state: Mutex::new(ActivityState {
                log,
                current_date: Utc::now().date_naive(),
                appends: 0,
                rotations: 0,
            }),
        })
    }

    /// Append one activity line, rotating first if the date rolled over.
    pub fn record(&self, entry: &ActivityEntry) -> Result<(), LogError> {
        let line = serde_json::to_string(entry).map_err(|e| {
            warn!(error = %e, "activity entry failed to serialize");
            LogError::Io {
                path: PathBuf::from(ACTIVITY_FILE),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            }
        })?;

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let today = Utc::now().date_naive();
        if today != state.current_date {
            let suffix = state.current_date.format("%Y-%m-%d").to_string();
            match state.log.rotate(&suffix) {
                Ok(_) => state.rotations = state.rotations.saturating_add(1),
                Err(e) => warn!(error = %e, "daily activity rotation failed"),
            }
            state.current_date = today;
        }

        state.log.append(&line)?;
        state.appends = state.appends.saturating_add(1);
        Ok(())
    }

    /// Convenience wrapper building the entry in place.
    pub fn record_action(
        &self,
        session_id: &str,
        agent: &str,
        action: &str,
        detail: serde_json::Value,
    ) -> Result<(), LogError> {
        self.record(&ActivityEntry {
            timestamp: Utc::now().to_rfc3339(),
            session_id: session_id.to_owned(),
            agent: agent.to_owned(),
            action: action.to_owned(),
            detail,
        })
    }

    /// Current counters.
    pub fn stats(&self) -> ActivityStats {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        ActivityStats {
            appends: state.appends,
            unlocked_appends: state.log.unlocked_appends(),
            rotations: state.rotations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(action: &str) -> ActivityEntry {
        ActivityEntry {
            timestamp: Utc::now().to_rfc3339(),
            session_id: "ses_1".to_owned(),
            agent: "executor".to_owned(),
            action: action.to_owned(),
            detail: serde_json::json!({"n": 1}),
        }
    }

    #[test]
    fn test_record_appends_json_lines() {
        let dir = TempDir::new().expect("tempdir");
        let logger = ActivityLogger::new(dir.path()).expect("create");

        logger.record(&entry("task.dispatch")).expect("record");
        logger.record(&entry("task.complete")).expect("record");

        let body =
            std::fs::read_to_string(dir.path().join(ACTIVITY_FILE)).expect("read");
        let lines: Vec<&str> = body.trim().lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).expect("valid json");
            assert_eq!(value["sessionId"], "ses_1");
        }
        assert_eq!(logger.stats().appends, 2);
    }

    #[test]
    fn test_stats_track_lock_fallbacks() {
        let dir = TempDir::new().expect("tempdir");
        let logger = ActivityLogger::new(dir.path()).expect("create");

        // Plant a foreign lock; best-effort policy appends anyway.
        let lock = dir.path().join(format!("{ACTIVITY_FILE}.lock"));
        std::fs::write(&lock, "").expect("plant lock");
        logger.record(&entry("task.dispatch")).expect("record");
        std::fs::remove_file(lock).expect("cleanup");

        let stats = logger.stats();
        assert_eq!(stats.appends, 1);
        assert_eq!(stats.unlocked_appends, 1);
    }
}
