//! Named bump arenas with request-scoped reset semantics.
//!
//! Every hot-path allocation in the server goes through one of a small set of
//! named arenas. Request and response arenas are leased to a connection by its
//! worker thread and reset after every response; the cache and static arenas
//! are process-wide, written once during startup and never reset.
//!
//! # Key Components
//!
//! - [`Arena`]: a capped bump allocator over [`bumpalo::Bump`], tagged with an
//!   [`ArenaKind`] so allocation/reset activity shows up in the per-kind
//!   statistics.
//! - [`ArenaPool`] / [`ArenaPair`]: per-worker pool of request/response arena
//!   pairs, leased per connection so steady-state work never re-grows chunks.
//! - [`intern`] / [`intern_static`]: copy a string into the process-lifetime
//!   cache or static arena and hand back a `'static` reference.
//!
//! # Thread model
//!
//! Request/response arenas are owned by a single worker thread and never
//! shared. The cache and static arenas take a lock on every write; after
//! startup they are read-only. Statistics counters are lock-free atomics and
//! may be read from any thread.

use std::{
    cell::{Cell, RefCell},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Mutex, OnceLock,
    },
};

use bumpalo::Bump;

/// Upper bound kept on the per-worker free list of arena pairs.
const POOL_KEEP: usize = 64;

/// Byte cap for each of the process-wide interning arenas.
const INTERN_CAP: usize = 16 * 1024 * 1024;
const INTERN_CHUNK: usize = 64 * 1024;

/// The named arenas of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum ArenaKind {
    /// Per-request data: parsed head, decoded path, params, context. Reset
    /// after each response is fully written.
    Request = 0,
    /// Response bodies and transient handler buffers. Reset together with the
    /// request arena.
    Response = 1,
    /// Route-table strings, compiled patterns, interned header names.
    /// Lifetime >= server; never reset.
    Cache = 2,
    /// Read-only server constants.
    Static = 3,
    /// Reserved for background work.
    Task = 4,
}

impl ArenaKind {
    pub const COUNT: usize = 5;

    pub const ALL: [ArenaKind; Self::COUNT] = [
        ArenaKind::Request,
        ArenaKind::Response,
        ArenaKind::Cache,
        ArenaKind::Static,
        ArenaKind::Task,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ArenaKind::Request => "request",
            ArenaKind::Response => "response",
            ArenaKind::Cache => "cache",
            ArenaKind::Static => "static",
            ArenaKind::Task => "task",
        }
    }
}

/// An arena refused an allocation because its byte cap would be exceeded.
///
/// The caller owning the connection must answer with a 500 and close.
#[derive(thiserror::Error, Debug)]
#[error("{} arena exhausted: requested {requested} bytes over cap {cap}", kind.name())]
pub struct AllocationExhausted {
    pub kind: ArenaKind,
    pub requested: usize,
    pub cap: usize,
}

struct KindCounters {
    allocated: AtomicUsize,
    peak: AtomicUsize,
    reset_count: AtomicU64,
}

#[allow(clippy::declare_interior_mutable_const)]
const ZERO_COUNTERS: KindCounters = KindCounters {
    allocated: AtomicUsize::new(0),
    peak: AtomicUsize::new(0),
    reset_count: AtomicU64::new(0),
};

static COUNTERS: [KindCounters; ArenaKind::COUNT] = [ZERO_COUNTERS; ArenaKind::COUNT];

/// Point-in-time statistics for one arena kind, aggregated over every arena
/// of that kind in the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Bytes currently charged against arenas of this kind.
    pub allocated: usize,
    /// High-water mark of `allocated` since process start.
    pub peak: usize,
    /// Number of resets performed on arenas of this kind.
    pub reset_count: u64,
}

/// Statistics for a single kind.
pub fn stats(kind: ArenaKind) -> ArenaStats {
    let c = &COUNTERS[kind as usize];
    ArenaStats {
        allocated: c.allocated.load(Ordering::Relaxed),
        peak: c.peak.load(Ordering::Relaxed),
        reset_count: c.reset_count.load(Ordering::Relaxed),
    }
}

/// Statistics for every kind, in [`ArenaKind::ALL`] order.
pub fn all_stats() -> [(ArenaKind, ArenaStats); ArenaKind::COUNT] {
    ArenaKind::ALL.map(|kind| (kind, stats(kind)))
}

/// A capped bump allocator tagged with an [`ArenaKind`].
///
/// Allocation is a bump within the current chunk; exhaustion of the chunk
/// grows the underlying [`Bump`] by a new chunk sized at least the request.
/// [`reset`](Arena::reset) rewinds every chunk and keeps only the largest one
/// warm, so steady-state traffic does not re-grow the arena.
pub struct Arena {
    kind: ArenaKind,
    bump: Bump,
    chunk: usize,
    cap: usize,
    used: Cell<usize>,
}

impl Arena {
    /// Create an arena with an initial chunk of `chunk` bytes and a total
    /// charge cap of `cap` bytes.
    pub fn new(kind: ArenaKind, chunk: usize, cap: usize) -> Self {
        Arena {
            kind,
            bump: Bump::with_capacity(chunk),
            chunk,
            cap,
            used: Cell::new(0),
        }
    }

    pub fn kind(&self) -> ArenaKind {
        self.kind
    }

    /// Bytes charged since the last reset.
    pub fn used(&self) -> usize {
        self.used.get()
    }

    /// Copy a string into the arena.
    pub fn alloc_str<'a>(&'a self, s: &str) -> Result<&'a str, AllocationExhausted> {
        self.charge(s.len())?;
        Ok(self.bump.alloc_str(s))
    }

    /// Copy a byte slice into the arena.
    pub fn alloc_bytes<'a>(&'a self, bytes: &[u8]) -> Result<&'a [u8], AllocationExhausted> {
        self.charge(bytes.len())?;
        Ok(self.bump.alloc_slice_copy(bytes))
    }

    /// A growable vector living in this arena. Growth is bump-allocated and
    /// charged against the kind's statistics on reset.
    pub fn vec<T>(&self) -> bumpalo::collections::Vec<'_, T> {
        bumpalo::collections::Vec::new_in(&self.bump)
    }

    pub fn vec_with_capacity<T>(&self, cap: usize) -> bumpalo::collections::Vec<'_, T> {
        bumpalo::collections::Vec::with_capacity_in(cap, &self.bump)
    }

    /// Raw access to the underlying bump allocator.
    pub fn bump(&self) -> &Bump {
        &self.bump
    }

    fn charge(&self, n: usize) -> Result<(), AllocationExhausted> {
        let used = self.used.get();
        let after = used.saturating_add(n);
        if after > self.cap {
            return Err(AllocationExhausted {
                kind: self.kind,
                requested: n,
                cap: self.cap,
            });
        }
        self.used.set(after);
        let c = &COUNTERS[self.kind as usize];
        let total = c.allocated.fetch_add(n, Ordering::Relaxed) + n;
        c.peak.fetch_max(total, Ordering::Relaxed);
        Ok(())
    }

    /// Rewind the bump pointer, invalidating every previously returned
    /// address. All but the warmest chunk go back to the allocator.
    pub fn reset(&mut self) {
        let c = &COUNTERS[self.kind as usize];
        c.peak.fetch_max(self.bump.allocated_bytes(), Ordering::Relaxed);
        c.allocated.fetch_sub(self.used.get(), Ordering::Relaxed);
        c.reset_count.fetch_add(1, Ordering::Relaxed);
        self.used.set(0);
        if self.bump.allocated_bytes() > self.cap {
            self.bump = Bump::with_capacity(self.chunk);
        } else {
            self.bump.reset();
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("kind", &self.kind)
            .field("used", &self.used.get())
            .field("cap", &self.cap)
            .finish()
    }
}

/// The request/response arena pair a connection works with.
pub struct ArenaPair {
    pub request: Arena,
    pub response: Arena,
}

/// Per-worker pool of arena pairs.
///
/// A connection leases a pair for its whole lifetime and returns it when it
/// closes; pairs come back reset and keep their warm chunk, so a busy worker
/// reaches a steady state with no allocator traffic on the request path.
pub struct ArenaPool {
    request_chunk: usize,
    request_cap: usize,
    response_chunk: usize,
    response_cap: usize,
    free: RefCell<Vec<ArenaPair>>,
}

impl ArenaPool {
    pub fn new(
        request_chunk: usize,
        request_cap: usize,
        response_chunk: usize,
        response_cap: usize,
    ) -> Self {
        ArenaPool {
            request_chunk,
            request_cap,
            response_chunk,
            response_cap,
            free: RefCell::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> ArenaPair {
        if let Some(pair) = self.free.borrow_mut().pop() {
            return pair;
        }
        ArenaPair {
            request: Arena::new(ArenaKind::Request, self.request_chunk, self.request_cap),
            response: Arena::new(ArenaKind::Response, self.response_chunk, self.response_cap),
        }
    }

    pub fn release(&self, mut pair: ArenaPair) {
        if pair.request.used() != 0 {
            pair.request.reset();
        }
        if pair.response.used() != 0 {
            pair.response.reset();
        }
        let mut free = self.free.borrow_mut();
        if free.len() < POOL_KEEP {
            free.push(pair);
        }
    }
}

static CACHE_INTERNER: OnceLock<Mutex<Arena>> = OnceLock::new();
static STATIC_INTERNER: OnceLock<Mutex<Arena>> = OnceLock::new();

fn intern_in(
    slot: &'static OnceLock<Mutex<Arena>>,
    kind: ArenaKind,
    s: &str,
) -> Result<&'static str, AllocationExhausted> {
    let arena = slot.get_or_init(|| Mutex::new(Arena::new(kind, INTERN_CHUNK, INTERN_CAP)));
    let guard = arena.lock().unwrap_or_else(|e| e.into_inner());
    let copied = guard.alloc_str(s)?;
    // The arena lives in a process-wide static and is never reset or dropped,
    // so the allocation stays valid for the process lifetime.
    Ok(unsafe { &*(copied as *const str) })
}

/// Copy `s` into the cache arena, returning a process-lifetime reference.
///
/// Used by the router at finalize time to intern pattern strings and
/// parameter names.
pub fn intern(s: &str) -> Result<&'static str, AllocationExhausted> {
    intern_in(&CACHE_INTERNER, ArenaKind::Cache, s)
}

/// Copy `s` into the static arena. For server constants computed once at
/// startup (e.g. the `Server` header value).
pub fn intern_static(s: &str) -> Result<&'static str, AllocationExhausted> {
    intern_in(&STATIC_INTERNER, ArenaKind::Static, s)
}
