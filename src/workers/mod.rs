//! Worker pools: update (writes + table-admin proxy) and read.

pub mod envelope;
pub mod read;
pub mod update;

pub use envelope::{OutgoingMessage, Reply, ReplyChannel, WorkItem};
