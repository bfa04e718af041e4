//! Configuration loading and validation.
//!
//! All tunables live in `armitage.toml`, every one of them optional:
//! a missing file or section falls back to the stock defaults. The
//! sections mirror the subsystems they tune.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::kernel::guard::DEFAULT_PROTECTED_AGENTS;
use crate::kernel::stream::StreamConfig;
use crate::observer::ExtractorConfig;
use crate::supervisor::SupervisorConfig;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Supervisor polling and retry tuning.
    pub supervisor: SupervisorSection,

    /// Event stream sizing.
    pub stream: StreamSection,

    /// Learning extractor thresholds.
    pub observer: ObserverSection,

    /// Access control.
    pub guard: GuardSection,
}

/// `[supervisor]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    /// Poll interval when only low-complexity tasks run.
    pub base_interval_ms: u64,
    /// Poll interval when idle or supervising high-complexity tasks.
    pub max_interval_ms: u64,
    /// Heartbeat staleness that classifies a task as stuck.
    pub stuck_threshold_ms: i64,
    /// Age at which terminal tasks leave the registry.
    pub cleanup_ttl_ms: i64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            base_interval_ms: 30_000,
            max_interval_ms: 120_000,
            stuck_threshold_ms: 30_000,
            cleanup_ttl_ms: 3_600_000,
        }
    }
}

/// `[stream]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    /// Rotate the stream file beyond this size.
    pub max_stream_size_mb: u64,
    /// Cap on simultaneously pending checkpoints.
    pub max_checkpoints: usize,
    /// Default checkpoint lifetime before auto-expiry.
    pub checkpoint_timeout_ms: i64,
    /// Ring-buffer cap on in-memory history.
    pub max_history_size: usize,
    /// Snapshot GC horizon in hours.
    pub snapshot_gc_hours: u64,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            max_stream_size_mb: 10,
            max_checkpoints: 20,
            checkpoint_timeout_ms: 300_000,
            max_history_size: 1_000,
            snapshot_gc_hours: 48,
        }
    }
}

/// `[observer]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ObserverSection {
    /// Confidence floor for extracted learnings.
    pub min_confidence: f64,
    /// Cap on learnings per extraction run.
    pub max_learnings: usize,
}

impl Default for ObserverSection {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            max_learnings: 10,
        }
    }
}

/// `[guard]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GuardSection {
    /// Agents that only respond to chief-of-staff.
    pub protected_agents: Vec<String>,
}

impl Default for GuardSection {
    fn default() -> Self {
        Self {
            protected_agents: DEFAULT_PROTECTED_AGENTS
                .iter()
                .map(|a| (*a).to_owned())
                .collect(),
        }
    }
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but does not parse or a
    /// value fails validation.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let body = match std::fs::read_to_string(path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "failed to read config {}: {e}",
                    path.display()
                ))
            }
        };
        let config: Self = toml::from_str(&body)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the subsystems cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.supervisor.base_interval_ms > self.supervisor.max_interval_ms {
            anyhow::bail!("supervisor.base_interval_ms exceeds max_interval_ms");
        }
        if !(0.0..=1.0).contains(&self.observer.min_confidence) {
            anyhow::bail!("observer.min_confidence must be within [0, 1]");
        }
        if self.stream.max_history_size == 0 {
            anyhow::bail!("stream.max_history_size must be positive");
        }
        Ok(())
    }

    /// Stream config rooted at `base_dir`.
    pub fn stream_config(&self, base_dir: impl Into<PathBuf>) -> StreamConfig {
        let mut config = StreamConfig::new(base_dir);
        config.max_stream_size_mb = self.stream.max_stream_size_mb;
        config.max_history_size = self.stream.max_history_size;
        config.max_checkpoints = self.stream.max_checkpoints;
        config.checkpoint_timeout_ms = self.stream.checkpoint_timeout_ms;
        config
    }

    /// Supervisor config.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            base_interval_ms: self.supervisor.base_interval_ms,
            max_interval_ms: self.supervisor.max_interval_ms,
            stuck_threshold_ms: self.supervisor.stuck_threshold_ms,
            cleanup_ttl_ms: self.supervisor.cleanup_ttl_ms,
        }
    }

    /// Extractor config.
    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            min_confidence: self.observer.min_confidence,
            max_learnings: self.observer.max_learnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_stock_values() {
        let config = Config::default();
        assert_eq!(config.supervisor.base_interval_ms, 30_000);
        assert_eq!(config.supervisor.max_interval_ms, 120_000);
        assert_eq!(config.stream.max_stream_size_mb, 10);
        assert_eq!(config.stream.max_checkpoints, 20);
        assert_eq!(config.stream.snapshot_gc_hours, 48);
        assert!((config.observer.min_confidence - 0.6).abs() < f64::EPSILON);
        assert!(config
            .guard
            .protected_agents
            .contains(&"oracle".to_owned()));
        assert_eq!(config.guard.protected_agents.len(), 11);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let config = Config::load(&dir.path().join("armitage.toml")).expect("load");
        assert_eq!(config.stream.max_history_size, 1_000);
    }

    #[test]
    fn test_partial_file_overrides_some_values() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("armitage.toml");
        std::fs::write(
            &path,
            "[supervisor]\nbase_interval_ms = 5000\n\n[observer]\nmax_learnings = 3\n",
        )
        .expect("write");

        let config = Config::load(&path).expect("load");
        assert_eq!(config.supervisor.base_interval_ms, 5_000);
        assert_eq!(config.observer.max_learnings, 3);
        assert_eq!(config.supervisor.max_interval_ms, 120_000, "default kept");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("armitage.toml");
        std::fs::write(&path, "[observer]\nmin_confidence = 1.5\n").expect("write");
        assert!(Config::load(&path).is_err());

        std::fs::write(
            &path,
            "[supervisor]\nbase_interval_ms = 200000\nmax_interval_ms = 100\n",
        )
        .expect("write");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("armitage.toml");
        std::fs::write(&path, "this is not toml [").expect("write");
        assert!(Config::load(&path).is_err());
    }
}
