//! Relay statistics.
//!
//! Lock-free counters shared between the event loop, the establish tasks,
//! and anyone holding a clone of the `Arc` (tests, shutdown logging).

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing relay activity since startup.
///
/// All loads use `Relaxed` ordering; values are suitable for logging and
/// assertions at quiescent points, not for synchronisation.
#[derive(Debug, Default)]
pub struct RelayStats {
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    legs_closed: AtomicU64,
    dial_failures: AtomicU64,
    upgrade_failures: AtomicU64,
    bytes_forwarded: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn leg_closed(&self) {
        self.legs_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dial_failed(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn upgrade_failed(&self) {
        self.upgrade_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn forwarded(&self, n: usize) {
        self.bytes_forwarded.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }

    pub fn sessions_closed(&self) -> u64 {
        self.sessions_closed.load(Ordering::Relaxed)
    }

    /// Number of session sockets closed. Always twice `sessions_closed`.
    pub fn legs_closed(&self) -> u64 {
        self.legs_closed.load(Ordering::Relaxed)
    }

    pub fn dial_failures(&self) -> u64 {
        self.dial_failures.load(Ordering::Relaxed)
    }

    pub fn upgrade_failures(&self) -> u64 {
        self.upgrade_failures.load(Ordering::Relaxed)
    }

    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded.load(Ordering::Relaxed)
    }

    /// Sessions currently registered.
    pub fn active_sessions(&self) -> u64 {
        self.sessions_opened().saturating_sub(self.sessions_closed())
    }
}
