//! The arena-backed request model and per-request context.
//!
//! A [`Request`] is a thin view over decoder output plus the path parameters
//! the router binds and the cooperative-cancel flag of its connection. All of
//! its borrowed data lives in the request arena, so nothing here may outlive
//! the response send; the arena reset that follows invalidates every slice.

use std::{
    cell::{Cell, RefCell},
    net::SocketAddr,
    rc::Rc,
};

use riptide_core::memory::Arena;
use uuid::Uuid;

use super::{
    method::HttpMethod,
    parser::{BumpVec, ParsedRequest},
};

/// Cooperative cancellation flag.
///
/// Cloned into every request context of a connection; the worker raises it
/// when the connection is being torn down so long-running handlers can bail
/// out. The core never forcibly unwinds a handler.
#[derive(Clone, Default)]
pub struct CancelFlag(Rc<Cell<bool>>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }
}

/// A path parameter value, coerced at match time per its pattern type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue<'a> {
    Str(&'a str),
    Int(i64),
    Uint(u64),
    Float(f64),
    Uuid(Uuid),
    /// A `{name:path}` capture; may contain `/`.
    Path(&'a str),
}

impl<'a> ParamValue<'a> {
    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            ParamValue::Str(s) | ParamValue::Path(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            ParamValue::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            ParamValue::Uuid(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PathParam<'a> {
    pub name: &'a str,
    pub value: ParamValue<'a>,
}

/// One in-flight HTTP request.
pub struct Request<'a> {
    method: HttpMethod,
    raw_path: &'a str,
    path: &'a str,
    query_raw: Option<&'a str>,
    headers: BumpVec<'a, (&'a str, &'a [u8])>,
    body: Option<&'a [u8]>,
    remote_addr: SocketAddr,
    keep_alive: bool,
    params: Option<BumpVec<'a, PathParam<'a>>>,
    query_cache: RefCell<Option<BumpVec<'a, (&'a str, &'a str)>>>,
    arena: &'a Arena,
    cancel: CancelFlag,
}

impl<'a> Request<'a> {
    pub fn from_parsed(
        parsed: ParsedRequest<'a>,
        remote_addr: SocketAddr,
        arena: &'a Arena,
        cancel: CancelFlag,
    ) -> Self {
        Request {
            method: parsed.method,
            raw_path: parsed.raw_path,
            path: parsed.path,
            query_raw: parsed.query,
            headers: parsed.headers,
            body: parsed.body,
            remote_addr,
            keep_alive: parsed.keep_alive,
            params: None,
            query_cache: RefCell::new(None),
            arena,
            cancel,
        }
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    /// The request target as received, percent-encoded, query included.
    pub fn raw_path(&self) -> &'a str {
        self.raw_path
    }

    /// The percent-decoded path.
    pub fn path(&self) -> &'a str {
        self.path
    }

    /// The raw query string, if any.
    pub fn query_raw(&self) -> Option<&'a str> {
        self.query_raw
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn keep_alive_hint(&self) -> bool {
        self.keep_alive
    }

    pub fn arena(&self) -> &'a Arena {
        self.arena
    }

    /// Whether the connection is being torn down; cooperating handlers check
    /// this between units of work.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// First occurrence of a header, case-insensitive, as UTF-8.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.header_bytes(name)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn header_bytes(&self, name: &str) -> Option<&'a [u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }

    /// Every occurrence of a header, in wire order.
    pub fn headers<'r>(&'r self, name: &'r str) -> impl Iterator<Item = &'a [u8]> + 'r {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }

    /// All headers in wire order.
    pub fn header_entries(&self) -> impl Iterator<Item = (&'a str, &'a [u8])> + '_ {
        self.headers.iter().copied()
    }

    /// A query parameter, percent-decoded. The query string is split on
    /// first access and cached, so repeated lookups are cheap and the parse
    /// is idempotent.
    pub fn query(&self, name: &str) -> Option<&'a str> {
        let mut cache = self.query_cache.borrow_mut();
        let pairs = cache.get_or_insert_with(|| parse_query(self.query_raw, self.arena));
        pairs
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| *v)
    }

    /// A path parameter bound by the router, typed per the route pattern.
    pub fn path_param(&self, name: &str) -> Option<ParamValue<'a>> {
        self.params
            .as_ref()?
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value)
    }

    /// The complete request body, present once the decoder delivered it all.
    pub fn body(&self) -> Option<&'a [u8]> {
        self.body
    }

    pub(crate) fn set_params(&mut self, params: BumpVec<'a, PathParam<'a>>) {
        self.params = Some(params);
    }
}

fn parse_query<'a>(raw: Option<&'a str>, arena: &'a Arena) -> BumpVec<'a, (&'a str, &'a str)> {
    let mut pairs: BumpVec<'a, (&'a str, &'a str)> = BumpVec::new_in(arena.bump());
    let Some(raw) = raw else {
        return pairs;
    };
    for part in raw.split('&') {
        if part.is_empty() {
            continue;
        }
        let (key, value) = match part.split_once('=') {
            Some((k, v)) => (k, v),
            None => (part, ""),
        };
        let key = decode_component(key, arena);
        let value = decode_component(value, arena);
        pairs.push((key, value));
    }
    pairs
}

/// Decode a query component: `+` to space, `%XX` unescaped. Malformed
/// escapes are kept verbatim rather than failing the whole request.
fn decode_component<'a>(raw: &'a str, arena: &'a Arena) -> &'a str {
    if !raw.contains('%') && !raw.contains('+') {
        return raw;
    }
    let bytes = raw.as_bytes();
    let mut out: BumpVec<'a, u8> = BumpVec::with_capacity_in(bytes.len(), arena.bump());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let pair = bytes.get(i + 1).zip(bytes.get(i + 2));
                match pair.and_then(|(hi, lo)| Some((hex(*hi)?, hex(*lo)?))) {
                    Some((hi, lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    std::str::from_utf8(out.into_bump_slice()).unwrap_or(raw)
}

fn hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// A typed context value. Values are owned by the request arena; entries
/// written by one middleware are visible to every later entry and to the
/// handler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CtxValue<'a> {
    Str(&'a str),
    Bytes(&'a [u8]),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
}

/// The per-request scratch map shared along the middleware chain.
pub struct Context<'a> {
    entries: BumpVec<'a, (&'a str, CtxValue<'a>)>,
    arena: &'a Arena,
    cancel: CancelFlag,
}

impl<'a> Context<'a> {
    pub fn new(arena: &'a Arena, cancel: CancelFlag) -> Self {
        Context {
            entries: BumpVec::new_in(arena.bump()),
            arena,
            cancel,
        }
    }

    pub fn arena(&self) -> &'a Arena {
        self.arena
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Insert or replace an entry. The key is copied into the arena.
    pub fn set(&mut self, key: &str, value: CtxValue<'a>) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
            return;
        }
        let Ok(key) = self.arena.alloc_str(key) else {
            // Exhaustion surfaces on the driver's next allocation.
            return;
        };
        self.entries.push((key, value));
    }

    /// Convenience for string values: copies the value into the arena.
    pub fn set_str(&mut self, key: &str, value: &str) {
        if let Ok(value) = self.arena.alloc_str(value) {
            self.set(key, CtxValue::Str(value));
        }
    }

    pub fn get(&self, key: &str) -> Option<CtxValue<'a>> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use riptide_core::memory::ArenaKind;

    use super::super::parser::{Decoded, DecoderConfig, RequestDecoder};
    use super::*;

    fn arena() -> Arena {
        Arena::new(ArenaKind::Request, 16 * 1024, 1 << 20)
    }

    fn request<'a>(wire: &[u8], arena: &'a Arena) -> Request<'a> {
        let mut dec = RequestDecoder::new(DecoderConfig {
            max_header_bytes: 64 * 1024,
            max_body_bytes: 1 << 20,
        });
        match dec.decode(wire, arena).unwrap() {
            Decoded::Complete { request, .. } => Request::from_parsed(
                request,
                "127.0.0.1:4000".parse().unwrap(),
                arena,
                CancelFlag::new(),
            ),
            Decoded::NeedMore => panic!("incomplete request"),
        }
    }

    #[test]
    fn header_lookup_is_case_insensitive_first_occurrence() {
        let arena = arena();
        let req = request(
            b"GET / HTTP/1.1\r\nX-Tag: one\r\nx-tag: two\r\n\r\n",
            &arena,
        );
        assert_eq!(req.header("X-TAG"), Some("one"));
        let all: Vec<&[u8]> = req.headers("x-tag").collect();
        assert_eq!(all, vec![&b"one"[..], &b"two"[..]]);
    }

    #[test]
    fn query_parse_is_lazy_and_idempotent() {
        let arena = arena();
        let req = request(b"GET /s?a=1&b=x%20y&c=p+q&flag HTTP/1.1\r\n\r\n", &arena);
        assert_eq!(req.query("a"), Some("1"));
        assert_eq!(req.query("b"), Some("x y"));
        assert_eq!(req.query("c"), Some("p q"));
        assert_eq!(req.query("flag"), Some(""));
        assert_eq!(req.query("missing"), None);
        // second pass hits the cache and agrees
        assert_eq!(req.query("b"), Some("x y"));
    }

    #[test]
    fn context_entries_are_visible_and_replaceable() {
        let arena = arena();
        let mut ctx = Context::new(&arena, CancelFlag::new());
        ctx.set("user", CtxValue::Int(7));
        ctx.set_str("role", "admin");
        assert_eq!(ctx.get("user"), Some(CtxValue::Int(7)));
        assert_eq!(ctx.get("role"), Some(CtxValue::Str("admin")));
        ctx.set("user", CtxValue::Int(8));
        assert_eq!(ctx.get("user"), Some(CtxValue::Int(8)));
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn cancel_flag_propagates() {
        let arena = arena();
        let cancel = CancelFlag::new();
        let ctx = Context::new(&arena, cancel.clone());
        assert!(!ctx.is_cancelled());
        cancel.set();
        assert!(ctx.is_cancelled());
    }
}
