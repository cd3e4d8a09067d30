//! This module is a raft-specific commit log that wraps the generic commit log. Right now, this
//! might seem odd. But I plan to move the commitlog mod into its own crate/repo, at which point
//! this abstraction will make more sense.

mod listeners;
mod log;
mod log_entry;

pub(crate) use listeners::EntryOutcome;
pub(crate) use log::WriteAheadLog;
pub use log_entry::EntryKind;
pub use log_entry::WriteAheadLogEntry;
