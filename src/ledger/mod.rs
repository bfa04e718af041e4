//! The persistent ledger: epics, tasks, learnings, handoffs, archive.
//!
//! [`model`] holds the domain types, [`markdown`] the canonical index
//! rendering, and [`store`] the serialized read-parse-mutate-render-write
//! operations over the `.opencode` directory tree.

pub mod markdown;
pub mod model;
pub mod store;

pub use model::{Epic, EpicStatus, EpicTask, Handoff, HandoffReason, LedgerIndex};
pub use store::{LedgerError, LedgerStore, LedgerSync};
