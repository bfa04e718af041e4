//! Armitage: a durable orchestration core for long-running AI agent
//! tasks.
//!
//! The crate supervises agent tasks across process restarts: every state
//! change flows through an append-only event stream (`kernel::stream`),
//! task lifecycle lives in a registry polled by an adaptive supervisor
//! (`supervisor`), persistent work state is a markdown ledger (`ledger`),
//! and a guard layer (`kernel::guard`) enforces which callers may reach
//! protected agents. Declarative workflows (`workflow`) drive phased,
//! checkpoint-gated execution through an injected runtime client
//! (`runtime`).
//!
//! There are no hidden globals: the embedding host constructs the
//! components once at startup and passes the handles down.

pub mod config;
pub mod kernel;
pub mod ledger;
pub mod logging;
pub mod observer;
pub mod runtime;
pub mod supervisor;
pub mod tools;
pub mod types;
pub mod workflow;
