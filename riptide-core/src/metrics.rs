//! Process-wide serving counters.
//!
//! Workers update these with relaxed atomics on the connection and request
//! paths; [`snapshot`] assembles the point-in-time view exposed through the
//! server's `stats()` surface, including the per-kind arena statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::memory::{self, ArenaKind, ArenaStats};

static CONNECTIONS: AtomicU64 = AtomicU64::new(0);
static REQUESTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static REQUESTS_IN_FLIGHT: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn connection_opened() {
    CONNECTIONS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn connection_closed() {
    CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
}

#[inline]
pub fn request_started() {
    REQUESTS_TOTAL.fetch_add(1, Ordering::Relaxed);
    REQUESTS_IN_FLIGHT.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn request_finished() {
    REQUESTS_IN_FLIGHT.fetch_sub(1, Ordering::Relaxed);
}

/// Point-in-time serving statistics.
#[derive(Debug, Clone)]
pub struct ServerStats {
    /// Currently open connections.
    pub connections: u64,
    /// Requests accepted since process start.
    pub requests_total: u64,
    /// Requests currently between parse-complete and response-written.
    pub requests_in_flight: u64,
    /// Per-kind arena statistics.
    pub arenas: [(ArenaKind, ArenaStats); ArenaKind::COUNT],
}

pub fn snapshot() -> ServerStats {
    ServerStats {
        connections: CONNECTIONS.load(Ordering::Relaxed),
        requests_total: REQUESTS_TOTAL.load(Ordering::Relaxed),
        requests_in_flight: REQUESTS_IN_FLIGHT.load(Ordering::Relaxed),
        arenas: memory::all_stats(),
    }
}
