//! Append-only line log with size-triggered rotation and advisory file
//! locking.
//!
//! This is the storage primitive under both the orchestration stream and
//! the activity logger. One JSON document per line, LF-terminated, written
//! with `O_APPEND` so concurrent appends from the owning process never
//! interleave partial lines. Cross-process writers coordinate through a
//! `<path>.lock` file; lock acquisition retries a bounded number of times
//! and then either fails (stream discipline) or falls through to an
//! unlocked append (activity discipline, availability over consistency).

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Lock acquisition attempts before giving up.
const LOCK_RETRIES: u32 = 5;

/// Delay between lock attempts.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(40);

/// Append-log operation errors.
#[derive(Debug, Error)]
pub enum LogError {
    /// Filesystem read/write/rename failure.
    #[error("log io error at {path}: {source}")]
    Io {
        /// File the operation targeted.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The advisory lock could not be obtained within the retry budget.
    #[error("could not lock {path} after {LOCK_RETRIES} attempts")]
    LockContended {
        /// Lock file path.
        path: PathBuf,
    },
}

/// What to do when the advisory lock stays contended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// Fail the append. The orchestration stream must never write unlocked.
    Required,
    /// Append anyway. The activity logger prefers losing the lock to
    /// losing the line.
    BestEffort,
}

/// Result of a replay pass over the log file.
#[derive(Debug, Default)]
pub struct ReplayedLines {
    /// Parseable lines in write order.
    pub lines: Vec<String>,
    /// Empty or truncated lines that were skipped.
    pub skipped: u64,
}

/// An append-only, rotatable line log.
#[derive(Debug)]
pub struct AppendLog {
    path: PathBuf,
    lock_policy: LockPolicy,
    /// Appends that went through without the advisory lock.
    unlocked_appends: u64,
}

/// Guard holding the `<path>.lock` file; removed on drop.
struct LockGuard {
    lock_path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            warn!(path = %self.lock_path.display(), error = %e, "failed to remove lock file");
        }
    }
}

impl AppendLog {
    /// Open (creating if needed) an append log at `path`.
    pub fn new(path: impl Into<PathBuf>, lock_policy: LockPolicy) -> Result<Self, LogError> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| LogError::Io {
                path: dir.to_path_buf(),
                source: e,
            })?;
        }
        Ok(Self {
            path,
            lock_policy,
            unlocked_appends: 0,
        })
    }

    /// Path of the active log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of appends that fell through without the advisory lock.
    pub fn unlocked_appends(&self) -> u64 {
        self.unlocked_appends
    }

    /// Append one line (LF added here) with `O_APPEND` semantics.
    ///
    /// Takes the advisory lock first. On contention the behavior follows
    /// the configured [`LockPolicy`].
    pub fn append(&mut self, line: &str) -> Result<(), LogError> {
        match self.acquire_lock() {
            Ok(_guard) => self.write_line(line),
            Err(e) => match self.lock_policy {
                LockPolicy::Required => Err(e),
                LockPolicy::BestEffort => {
                    self.unlocked_appends = self.unlocked_appends.saturating_add(1);
                    warn!(
                        path = %self.path.display(),
                        "lock contended, appending without lock"
                    );
                    self.write_line(line)
                }
            },
        }
    }

    /// All lines of the active file, in write order.
    ///
    /// Unreadable lines are skipped and counted; replay never aborts on
    /// them. A missing file replays as empty.
    pub fn read_all(&self) -> Result<ReplayedLines, LogError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ReplayedLines::default())
            }
            Err(e) => {
                return Err(LogError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        let mut out = ReplayedLines::default();
        for line in BufReader::new(file).split(b'\n') {
            match line {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(s) if s.trim().is_empty() => out.skipped = out.skipped.saturating_add(1),
                    Ok(s) => out.lines.push(s),
                    Err(_) => out.skipped = out.skipped.saturating_add(1),
                },
                Err(_) => out.skipped = out.skipped.saturating_add(1),
            }
        }
        Ok(out)
    }

    /// Size of the active file in bytes (0 when absent).
    pub fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Rename the active file aside with `suffix` and start a fresh one.
    ///
    /// Returns the rotated path, or `None` when there was nothing to
    /// rotate.
    pub fn rotate(&mut self, suffix: &str) -> Result<Option<PathBuf>, LogError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let rotated = rotated_path(&self.path, suffix);
        std::fs::rename(&self.path, &rotated).map_err(|e| LogError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        debug!(from = %self.path.display(), to = %rotated.display(), "rotated log file");
        Ok(Some(rotated))
    }

    /// Write one LF-terminated line via a single appending `write`.
    fn write_line(&self, line: &str) -> Result<(), LogError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LogError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        let mut buf = Vec::with_capacity(line.len().saturating_add(1));
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        file.write_all(&buf).map_err(|e| LogError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(())
    }

    /// Take the `<path>.lock` advisory lock with bounded retry.
    fn acquire_lock(&self) -> Result<LockGuard, LogError> {
        let lock_path = lock_path(&self.path);
        for attempt in 0..LOCK_RETRIES {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => {
                    return Ok(LockGuard {
                        lock_path: lock_path.clone(),
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(
                        path = %lock_path.display(),
                        attempt,
                        "lock held by another writer, retrying"
                    );
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(LogError::Io {
                        path: lock_path,
                        source: e,
                    })
                }
            }
        }
        Err(LogError::LockContended { path: lock_path })
    }
}

/// `foo.jsonl` + `"1700000000000"` → `foo_1700000000000.jsonl`.
fn rotated_path(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("log");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("jsonl");
    let name = format!("{stem}_{suffix}.{ext}");
    path.with_file_name(name)
}

/// Lock file sibling for an append log path.
fn lock_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn log_in(dir: &TempDir, policy: LockPolicy) -> AppendLog {
        AppendLog::new(dir.path().join("stream.jsonl"), policy).expect("create log")
    }

    // ── Append and replay ──

    #[test]
    fn test_append_then_read_preserves_order() {
        let dir = TempDir::new().expect("tempdir");
        let mut log = log_in(&dir, LockPolicy::Required);

        for i in 0..5 {
            log.append(&format!("{{\"n\":{i}}}")).expect("append");
        }

        let replay = log.read_all().expect("read");
        assert_eq!(replay.lines.len(), 5);
        assert_eq!(replay.lines[0], "{\"n\":0}");
        assert_eq!(replay.lines[4], "{\"n\":4}");
        assert_eq!(replay.skipped, 0);
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let dir = TempDir::new().expect("tempdir");
        let log = log_in(&dir, LockPolicy::Required);
        let replay = log.read_all().expect("read");
        assert!(replay.lines.is_empty());
    }

    #[test]
    fn test_blank_lines_are_skipped_and_counted() {
        let dir = TempDir::new().expect("tempdir");
        let mut log = log_in(&dir, LockPolicy::Required);
        log.append("{\"a\":1}").expect("append");
        std::fs::write(
            log.path(),
            "{\"a\":1}\n\n   \n{\"b\":2}\n",
        )
        .expect("rewrite");

        let replay = log.read_all().expect("read");
        assert_eq!(replay.lines.len(), 2);
        assert_eq!(replay.skipped, 2);
    }

    // ── Rotation ──

    #[test]
    fn test_rotate_moves_file_aside() {
        let dir = TempDir::new().expect("tempdir");
        let mut log = log_in(&dir, LockPolicy::Required);
        log.append("{\"a\":1}").expect("append");

        let rotated = log.rotate("1700000000000").expect("rotate");
        let rotated = rotated.expect("file existed");
        assert_eq!(
            rotated.file_name().and_then(|s| s.to_str()),
            Some("stream_1700000000000.jsonl")
        );
        assert!(rotated.exists());
        assert_eq!(log.size_bytes(), 0, "active file starts fresh");

        log.append("{\"b\":2}").expect("append after rotate");
        let replay = log.read_all().expect("read");
        assert_eq!(replay.lines, vec!["{\"b\":2}".to_owned()]);
    }

    #[test]
    fn test_rotate_nothing_to_do() {
        let dir = TempDir::new().expect("tempdir");
        let mut log = log_in(&dir, LockPolicy::Required);
        assert!(log.rotate("x").expect("rotate").is_none());
    }

    // ── Locking ──

    #[test]
    fn test_required_policy_fails_on_held_lock() {
        let dir = TempDir::new().expect("tempdir");
        let mut log = log_in(&dir, LockPolicy::Required);
        let lock = lock_path(log.path());
        std::fs::write(&lock, "").expect("plant lock");

        let err = log.append("{\"a\":1}").expect_err("should contend");
        assert!(matches!(err, LogError::LockContended { .. }));
        std::fs::remove_file(lock).expect("cleanup");
    }

    #[test]
    fn test_best_effort_policy_appends_anyway() {
        let dir = TempDir::new().expect("tempdir");
        let mut log = log_in(&dir, LockPolicy::BestEffort);
        let lock = lock_path(log.path());
        std::fs::write(&lock, "").expect("plant lock");

        log.append("{\"a\":1}").expect("best effort append");
        assert_eq!(log.unlocked_appends(), 1);
        let replay = log.read_all().expect("read");
        assert_eq!(replay.lines.len(), 1);
        std::fs::remove_file(lock).expect("cleanup");
    }

    #[test]
    fn test_lock_released_after_append() {
        let dir = TempDir::new().expect("tempdir");
        let mut log = log_in(&dir, LockPolicy::Required);
        log.append("{\"a\":1}").expect("append");
        assert!(!lock_path(log.path()).exists(), "lock must be released");
    }
}
