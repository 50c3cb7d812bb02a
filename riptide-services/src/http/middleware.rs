//! The middleware engine.
//!
//! Routes carry an ordered chain of pre- and post-route entries. The
//! effective chain of a route is computed once, at router finalize time:
//! global pre entries (sorted by priority, ties by registration) followed by
//! the route's own, and after the handler the route's post entries followed
//! by the global ones, post ties resolved in reverse registration so paired
//! pre/post entries wrap the handler symmetrically.
//!
//! Per-request execution walks precomputed slices; the engine itself
//! allocates nothing. A pre entry may short-circuit with a ready outcome:
//! the handler is skipped but every post entry still runs. `Fail` and panics
//! become a 500 that also flows through the post chain, so logging and
//! metrics entries observe failures.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use http::StatusCode;
use riptide_core::AnyError;
use tracing::error;

use super::{
    handler::{panic_message, Outcome},
    request::{Context, Request},
    response::Response,
};

/// What a pre-route entry decided.
pub enum Decision {
    /// Proceed to the next entry (or the handler).
    Continue,
    /// Skip remaining pre entries and the handler; the outcome becomes the
    /// response and the post chain still runs.
    ShortCircuit(Outcome),
    /// Abort with an error; the engine produces a 500 that flows through the
    /// post chain.
    Fail(AnyError),
}

/// A middleware participant. Implement either hook; both default to no-ops.
///
/// Entries must not retain references to the request, response, or context
/// beyond their return; the borrows end with the call.
pub trait Middleware: Send + Sync {
    fn pre(&self, _req: &mut Request<'_>, _ctx: &mut Context<'_>) -> Decision {
        Decision::Continue
    }

    fn post(&self, _req: &Request<'_>, _resp: &mut Response<'_>, _ctx: &mut Context<'_>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

/// A registered middleware entry. Lower priorities run first; ties are
/// broken by registration order (reverse registration for post entries).
pub struct MiddlewareEntry {
    pub priority: i32,
    pub phase: Phase,
    pub reference: Arc<dyn Middleware>,
}

impl MiddlewareEntry {
    pub fn pre(priority: i32, middleware: impl Middleware + 'static) -> Self {
        MiddlewareEntry {
            priority,
            phase: Phase::Pre,
            reference: Arc::new(middleware),
        }
    }

    pub fn post(priority: i32, middleware: impl Middleware + 'static) -> Self {
        MiddlewareEntry {
            priority,
            phase: Phase::Post,
            reference: Arc::new(middleware),
        }
    }
}

/// An entry tagged with its registration sequence number.
pub(crate) struct RankedEntry {
    pub(crate) entry: MiddlewareEntry,
    pub(crate) seq: u32,
}

/// The exact execution sequence for one route, precomputed at finalize.
pub struct EffectiveChain {
    pre: Box<[Arc<dyn Middleware>]>,
    post: Box<[Arc<dyn Middleware>]>,
}

impl EffectiveChain {
    /// `global ++ route` for pre, `route ++ global` for post.
    pub(crate) fn build(global: &[RankedEntry], route: &[RankedEntry]) -> Self {
        fn sorted(
            entries: &[RankedEntry],
            phase: Phase,
            reverse_ties: bool,
        ) -> Vec<Arc<dyn Middleware>> {
            let mut selected: Vec<&RankedEntry> = entries
                .iter()
                .filter(|e| e.entry.phase == phase)
                .collect();
            selected.sort_by_key(|e| {
                let seq = if reverse_ties {
                    u32::MAX - e.seq
                } else {
                    e.seq
                };
                (e.entry.priority, seq)
            });
            selected
                .into_iter()
                .map(|e| e.entry.reference.clone())
                .collect()
        }

        let mut pre = sorted(global, Phase::Pre, false);
        pre.extend(sorted(route, Phase::Pre, false));
        let mut post = sorted(route, Phase::Post, true);
        post.extend(sorted(global, Phase::Post, true));
        EffectiveChain {
            pre: pre.into_boxed_slice(),
            post: post.into_boxed_slice(),
        }
    }

    pub fn pre_len(&self) -> usize {
        self.pre.len()
    }

    pub fn post_len(&self) -> usize {
        self.post.len()
    }

    /// Run the pre chain. Stops at the first non-`Continue` decision; panics
    /// are converted into `Fail`.
    pub fn run_pre(&self, req: &mut Request<'_>, ctx: &mut Context<'_>) -> Decision {
        for entry in self.pre.iter() {
            let decision = match catch_unwind(AssertUnwindSafe(|| entry.pre(req, ctx))) {
                Ok(decision) => decision,
                Err(panic) => Decision::Fail(anyhow::anyhow!(
                    "pre middleware panicked: {}",
                    panic_message(&panic)
                )),
            };
            match decision {
                Decision::Continue => continue,
                other => return other,
            }
        }
        Decision::Continue
    }

    /// Run the full post chain. A panicking entry turns the response into an
    /// empty 500 and the remaining entries still observe it.
    pub fn run_post(&self, req: &Request<'_>, resp: &mut Response<'_>, ctx: &mut Context<'_>) {
        for entry in self.post.iter() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| entry.post(req, resp, ctx))) {
                error!("post middleware panicked: {}", panic_message(&panic));
                let _ = resp.set_status(StatusCode::INTERNAL_SERVER_ERROR);
                let _ = resp.clear_body();
            }
        }
    }
}
