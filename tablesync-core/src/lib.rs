//! # tablesync-core
//!
//! Pure logic for tablesync (no I/O, instant tests).
//!
//! This crate implements the operation queue and the pull pagination
//! planner without any storage or network I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce
//! output without side effects. The operation queue plans durable changes
//! as [`QueueChange`] values; `tablesync-client` persists them to the
//! local store and then commits them to the in-memory state, so the
//! durable mirror never runs ahead of what was actually written.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod pull;
pub mod queue;

pub use pull::{PageOutcome, PullPlan};
pub use queue::{Bookmark, OperationQueue, QueueChange, QueueError};
