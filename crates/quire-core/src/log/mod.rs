//! Multi-writer append-only logs
//!
//! Each writer owns exactly one log inside a group. A log is a dense,
//! immutable sequence indexed from zero; the head is `count - 1`.

pub mod entry;
pub mod store;

pub use entry::{EntryBody, LogEntry, LogUpdate, Origin};
pub use store::{LogStore, PutOutcome};
