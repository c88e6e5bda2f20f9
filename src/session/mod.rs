//! Client session bookkeeping shared by both transports (spec §3
//! "ClientSession", §5 "Suspension points").
//!
//! Grounded on the teacher's per-connection structs in `proxy/server.rs`
//! (each session owns its io handle and is looked up by id from a shared
//! map) and on agentgateway's `Session`/`SessionDropper` for the
//! idempotent-cleanup and guaranteed-release-counter idioms.

pub mod legacy;
pub mod modern;

pub use legacy::LegacySessionManager;
pub use modern::ModernSessionManager;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A session's connection-state: monotonic `active -> {closed, error}`,
/// never returning (spec §3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closed,
    Error,
}

/// RAII guard around the active-request counter. Incremented on
/// construction, decremented on every exit path including panics — this is
/// how the "incremented before dispatch, decremented on guaranteed-release"
/// invariant (spec §3, §5) is enforced without a hand-written try/finally.
pub struct ActiveRequestGuard {
    counter: Arc<AtomicI64>,
}

impl ActiveRequestGuard {
    pub fn enter(counter: Arc<AtomicI64>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
