//! Async job lifecycle: the router that owns long-running server-local
//! tasks, and the passive scan job itself.

pub mod apid;
pub mod passive_scan;
pub mod router;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::workers::envelope::Reply;

/// Two-phase termination handshake, shared between a job task and the
/// router that owns it. Grounds `JobInfo.hpp`'s `ThreadTerminationInfo`
/// (there: two `atomic<bool>` plus a pointer to a shared counter; here the
/// counter is an `Arc<AtomicU64>` so ownership is explicit rather than a
/// raw pointer — per spec.md section 9's design note on breaking the
/// router/task cyclic reference via a separately-owned object).
pub struct TerminationInfo {
    wants_to_terminate: AtomicBool,
    has_terminated: AtomicBool,
    scrub_requests: Arc<AtomicU64>,
}

impl TerminationInfo {
    pub fn new(scrub_requests: Arc<AtomicU64>) -> Arc<Self> {
        Arc::new(TerminationInfo {
            wants_to_terminate: AtomicBool::new(false),
            has_terminated: AtomicBool::new(false),
            scrub_requests,
        })
    }

    pub fn set_wants_to_terminate(&self) {
        self.wants_to_terminate.store(true, Ordering::SeqCst);
    }

    pub fn wants_to_terminate(&self) -> bool {
        self.wants_to_terminate.load(Ordering::SeqCst)
    }

    /// Sets `has_terminated` and bumps the shared scrub-request counter by
    /// one, waking the router's next scrub pass.
    pub fn set_terminated(&self) {
        self.has_terminated.store(true, Ordering::SeqCst);
        self.scrub_requests.fetch_add(1, Ordering::SeqCst);
    }

    pub fn has_terminated(&self) -> bool {
        self.has_terminated.load(Ordering::SeqCst)
    }
}

/// Per-job transferred-bytes/records counters, retained after cleanup for
/// post-mortem inspection — these deliberately survive scrub so a client
/// can still query them after the job is gone.
#[derive(Default)]
pub struct JobStatistics {
    transferred_bytes: AtomicU64,
    transferred_records: AtomicU64,
}

impl JobStatistics {
    pub fn record(&self, bytes: u64, records: u64) {
        self.transferred_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.transferred_records.fetch_add(records, Ordering::Relaxed);
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    pub fn transferred_records(&self) -> u64 {
        self.transferred_records.load(Ordering::Relaxed)
    }
}

/// One message on a job's input channel: either a client pull (reply here
/// when data is ready) or the shutdown sentinel.
pub enum JobSignal {
    Pull(Reply),
    Shutdown,
}
