//! Orchestration kernel: the durable substrate everything else builds on.
//!
//! - [`ids`]: identifier families and the monotonic clock
//! - [`log`]: append-only line log with rotation and advisory locking
//! - [`stream`]: the durable event stream (replay, fan-out, checkpoints)
//! - [`activity`]: high-frequency activity JSONL
//! - [`registry`]: in-memory task table with heartbeats and retries
//! - [`guard`]: protected-agent access control
//! - [`buffers`]: upward-signal and deferred-prompt queues
//! - [`bridge`]: `ledger.*` event emission into the stream

pub mod activity;
pub mod bridge;
pub mod buffers;
pub mod guard;
pub mod ids;
pub mod log;
pub mod registry;
pub mod stream;
