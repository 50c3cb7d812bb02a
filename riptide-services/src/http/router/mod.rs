//! The trie router.
//!
//! Routes are registered against a [`RouterBuilder`], then frozen with
//! [`RouterBuilder::finalize`] into an immutable [`Router`] that every worker
//! shares by reference. Lookup walks the trie one path segment at a time with
//! full backtracking over the ranked alternatives at each node:
//! static child first, then parameter children narrowest-type-first
//! (`int < uint < float < uuid < str`), then rest captures (named `path`
//! capture before the anonymous wildcard).
//!
//! Paths are normalized before matching: duplicate slashes collapse, `.`
//! segments drop, `..` pops (escaping the root is a 400). Matching is pure,
//! allocates only in the request arena, and cannot fail other than by
//! reporting `NotFound` / `MethodNotAllowed`.

mod pattern;
mod trie;

use riptide_core::memory::{AllocationExhausted, Arena};

pub use self::pattern::{ParamType, Pattern, Segment};
use self::trie::{BuildNode, Node, TailChild};
use super::{
    handler::Handler,
    method::{HttpMethod, MethodSet},
    middleware::{EffectiveChain, MiddlewareEntry, RankedEntry},
    parser::BumpVec,
    request::{ParamValue, PathParam},
    HttpError,
};

#[derive(thiserror::Error, Debug)]
pub enum RouteError {
    /// Two routes with the same method and canonical pattern.
    #[error("route conflict: {method} {pattern}")]
    Conflict {
        method: HttpMethod,
        pattern: String,
    },
    #[error("invalid pattern {pattern}: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },
    #[error(transparent)]
    Intern(#[from] AllocationExhausted),
}

/// A registered route, frozen at finalize.
pub struct Route {
    pub id: u32,
    pub method: HttpMethod,
    /// Canonical pattern, interned in the cache arena.
    pub pattern: &'static str,
    pub(crate) handler: Handler,
    pub(crate) chain: EffectiveChain,
}

impl Route {
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn chain(&self) -> &EffectiveChain {
        &self.chain
    }
}

struct PendingRoute {
    method: HttpMethod,
    pattern: Pattern,
    handler: Handler,
    middleware: Vec<RankedEntry>,
}

/// The mutable registration surface. Single exclusive owner during the build
/// phase; consumed by [`finalize`](RouterBuilder::finalize).
#[derive(Default)]
pub struct RouterBuilder {
    root: BuildNode,
    routes: Vec<PendingRoute>,
    global: Vec<RankedEntry>,
    seq: u32,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a global middleware entry, applied to every route.
    pub fn middleware(&mut self, entry: MiddlewareEntry) {
        let seq = self.next_seq();
        self.global.push(RankedEntry { entry, seq });
    }

    /// Register a route. Returns its id, or fails on a malformed pattern or
    /// a conflict with an already registered route.
    pub fn add_route(
        &mut self,
        method: HttpMethod,
        pattern: &str,
        handler: Handler,
        middleware: Vec<MiddlewareEntry>,
    ) -> Result<u32, RouteError> {
        let pattern = Pattern::parse(pattern)?;
        let id = self.routes.len() as u32;
        self.root.insert(&pattern, method, id)?;
        let middleware = middleware
            .into_iter()
            .map(|entry| RankedEntry {
                entry,
                seq: self.next_seq(),
            })
            .collect();
        self.routes.push(PendingRoute {
            method,
            pattern,
            handler,
            middleware,
        });
        Ok(id)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Freeze the trie, intern pattern strings into the cache arena, and
    /// precompute the effective middleware chain of every route.
    pub fn finalize(self) -> Result<Router, RouteError> {
        let root = self.root.freeze()?;
        let mut routes = Vec::with_capacity(self.routes.len());
        for (idx, pending) in self.routes.into_iter().enumerate() {
            routes.push(Route {
                id: idx as u32,
                method: pending.method,
                pattern: riptide_core::memory::intern(&pending.pattern.raw)?,
                handler: pending.handler,
                chain: EffectiveChain::build(&self.global, &pending.middleware),
            });
        }
        Ok(Router {
            root,
            routes: routes.into_boxed_slice(),
        })
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }
}

/// The outcome of a lookup.
pub enum MatchResult<'r, 'a> {
    Matched {
        route: &'r Route,
        params: BumpVec<'a, PathParam<'a>>,
    },
    /// The path matched a terminal but the method did not.
    MethodNotAllowed { allowed: MethodSet },
    NotFound,
}

/// The immutable route table, shared by reference with every worker.
pub struct Router {
    root: Node,
    routes: Box<[Route]>,
}

impl Router {
    pub fn route(&self, id: u32) -> Option<&Route> {
        self.routes.get(id as usize)
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Match a request path. The only failure is a path normalizing out of
    /// the root; everything else is expressed in the [`MatchResult`].
    pub fn lookup<'r, 'a>(
        &'r self,
        method: HttpMethod,
        path: &'a str,
        arena: &'a Arena,
    ) -> Result<MatchResult<'r, 'a>, HttpError> {
        let normalized = normalize_path(path, arena)?;

        // Segment the path once, keeping byte offsets so rest captures can
        // slice the remainder without re-joining.
        let mut segments: BumpVec<'a, (usize, &'a str)> = BumpVec::new_in(arena.bump());
        let mut offset = 1;
        for segment in normalized[1..].split('/') {
            segments.push((offset, segment));
            offset += segment.len() + 1;
        }

        let mut params: BumpVec<'a, PathParam<'a>> = BumpVec::new_in(arena.bump());
        match descend(&self.root, &segments, normalized, &mut params) {
            Some(node) => match node.route_for(method) {
                Some(id) => Ok(MatchResult::Matched {
                    route: &self.routes[id as usize],
                    params,
                }),
                None => Ok(MatchResult::MethodNotAllowed {
                    allowed: node.allowed,
                }),
            },
            None => Ok(MatchResult::NotFound),
        }
    }
}

/// Recursive descent with backtracking. Returns the first terminal node the
/// ranked alternatives reach; parameter bindings are rolled back when a
/// branch dies.
fn descend<'r, 'a>(
    node: &'r Node,
    segments: &[(usize, &'a str)],
    path: &'a str,
    params: &mut BumpVec<'a, PathParam<'a>>,
) -> Option<&'r Node> {
    let Some(&(offset, segment)) = segments.first() else {
        return node.is_terminal().then_some(node);
    };

    if let Some(child) = node.static_child(segment) {
        if let Some(terminal) = descend(child, &segments[1..], path, params) {
            return Some(terminal);
        }
    }

    for param in node.param_children() {
        if let Some(value) = coerce(param.ty, segment) {
            let mark = params.len();
            params.push(PathParam {
                name: param.name,
                value,
            });
            if let Some(terminal) = descend(&param.node, &segments[1..], path, params) {
                return Some(terminal);
            }
            params.truncate(mark);
        }
    }

    let rest = &path[offset..];
    for tail in node.tail_children() {
        match tail {
            TailChild::Param { name, node } if node.is_terminal() => {
                params.push(PathParam {
                    name: *name,
                    value: ParamValue::Path(rest),
                });
                return Some(node);
            }
            TailChild::Wildcard(node) if node.is_terminal() => return Some(node),
            _ => {}
        }
    }

    None
}

/// Coerce one path segment into a declared parameter type. Empty segments
/// never bind; a non-`path` parameter can therefore never span `/`.
fn coerce<'a>(ty: ParamType, segment: &'a str) -> Option<ParamValue<'a>> {
    if segment.is_empty() {
        return None;
    }
    match ty {
        ParamType::Int => segment.parse::<i64>().ok().map(ParamValue::Int),
        ParamType::Uint => segment.parse::<u64>().ok().map(ParamValue::Uint),
        ParamType::Float => segment
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(ParamValue::Float),
        ParamType::Uuid => uuid::Uuid::parse_str(segment).ok().map(ParamValue::Uuid),
        ParamType::Str => Some(ParamValue::Str(segment)),
        ParamType::PathRest => None,
    }
}

/// Collapse duplicate slashes, drop `.` segments, resolve `..`. Escaping the
/// root fails with `BadRequest`. Returns the input untouched when it is
/// already normal, so the common case allocates nothing.
pub fn normalize_path<'a>(path: &'a str, arena: &'a Arena) -> Result<&'a str, HttpError> {
    if !path.starts_with('/') {
        return Err(HttpError::BadRequest("path must be absolute"));
    }
    if !needs_normalization(path) {
        return Ok(path);
    }

    let mut kept: BumpVec<'a, &'a str> = BumpVec::new_in(arena.bump());
    for segment in path[1..].split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if kept.pop().is_none() {
                    return Err(HttpError::BadRequest("path escapes the root"));
                }
            }
            other => kept.push(other),
        }
    }

    if kept.is_empty() {
        return Ok("/");
    }

    let trailing = path.ends_with('/') || path.ends_with("/.");
    let mut out: BumpVec<'a, u8> = BumpVec::new_in(arena.bump());
    for segment in &kept {
        out.push(b'/');
        out.extend_from_slice(segment.as_bytes());
    }
    if trailing {
        out.push(b'/');
    }
    // Segments are substrings of a valid str.
    Ok(std::str::from_utf8(out.into_bump_slice())
        .expect("normalized path built from utf-8 segments"))
}

fn needs_normalization(path: &str) -> bool {
    path.contains("//")
        || path.contains("/./")
        || path.contains("/../")
        || path.ends_with("/.")
        || path.ends_with("/..")
}
