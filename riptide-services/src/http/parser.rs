//! Incremental HTTP/1.1 request decoding.
//!
//! The driver reads bytes into a per-connection buffer and feeds the whole
//! buffered prefix to [`RequestDecoder::decode`] until it yields a complete
//! request. The decoder is an explicit state machine (head, then body
//! framing) whose state is plain data, so a request interrupted mid-body
//! costs nothing to resume when the next read lands.
//!
//! Everything the request retains is copied into the request arena: the
//! returned [`ParsedRequest`] borrows only the arena, never the read buffer,
//! which lets the driver compact and refill the buffer immediately.
//!
//! Pipelining falls out of the state machine: `decode` consumes exactly one
//! message and reports how many bytes it used; leftover buffered bytes are
//! the start of the next request.
//!
//! # Limits
//!
//! - Total head size is capped by `max_header_bytes`; a head of exactly the
//!   cap parses, one byte more is rejected.
//! - A single header line (or the request target) is capped at 8 KiB.
//! - Fixed and chunked bodies are capped by `max_body_bytes`; for chunked
//!   bodies the cap applies to the decoded length.

use riptide_core::memory::{AllocationExhausted, Arena};

use super::method::HttpMethod;

/// Header slots handed to httparse. More fields than this in one request is
/// rejected as oversized.
pub const MAX_HEADERS: usize = 96;

/// Cap on a single header line or the request target.
pub const MAX_FIELD_BYTES: usize = 8 * 1024;

pub type BumpVec<'a, T> = bumpalo::collections::Vec<'a, T>;

#[derive(Debug, Clone, Copy)]
pub struct DecoderConfig {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("bad request: {0}")]
    BadRequest(&'static str),
    #[error("request too large")]
    TooLarge,
    #[error(transparent)]
    Arena(#[from] AllocationExhausted),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    None,
    Fixed(usize),
    Chunked,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Head,
    Body { head_len: usize, framing: BodyFraming },
}

/// One decoded request head plus its (complete) body.
///
/// Borrows the request arena only.
#[derive(Debug)]
pub struct ParsedRequest<'a> {
    pub method: HttpMethod,
    /// Request target as received, percent-encoded, including the query.
    pub raw_path: &'a str,
    /// Percent-decoded path, query excluded.
    pub path: &'a str,
    /// Raw query string, `?` excluded.
    pub query: Option<&'a str>,
    /// Keep-alive hint from the version and `Connection` header.
    pub keep_alive: bool,
    /// Headers in wire order, duplicates preserved.
    pub headers: BumpVec<'a, (&'a str, &'a [u8])>,
    pub body: Option<&'a [u8]>,
}

impl<'a> ParsedRequest<'a> {
    /// First occurrence of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&'a [u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }
}

#[derive(Debug)]
pub enum Decoded<'a> {
    /// The buffer does not yet hold a complete message.
    NeedMore,
    /// One complete request; the first `consumed` buffer bytes are spent.
    Complete {
        request: ParsedRequest<'a>,
        consumed: usize,
    },
}

/// Incremental request decoder. One per connection.
pub struct RequestDecoder {
    config: DecoderConfig,
    phase: Phase,
}

impl RequestDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            config,
            phase: Phase::Head,
        }
    }

    /// True when no request is partially decoded; the driver uses this to
    /// pick the idle timeout over the header timeout.
    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Head)
    }

    /// Try to decode one request from the buffered prefix.
    pub fn decode<'a>(
        &mut self,
        buf: &[u8],
        arena: &'a Arena,
    ) -> Result<Decoded<'a>, ParseError> {
        let (head_len, framing) = match self.phase {
            Phase::Head => {
                if buf.is_empty() {
                    return Ok(Decoded::NeedMore);
                }
                match self.parse_head(buf)? {
                    Some(parsed) => {
                        self.phase = Phase::Body {
                            head_len: parsed.0,
                            framing: parsed.1,
                        };
                        parsed
                    }
                    None => return Ok(Decoded::NeedMore),
                }
            }
            Phase::Body { head_len, framing } => (head_len, framing),
        };

        let (body, consumed) = match framing {
            BodyFraming::None => (None, head_len),
            BodyFraming::Fixed(len) => {
                if buf.len() < head_len + len {
                    return Ok(Decoded::NeedMore);
                }
                let body = arena.alloc_bytes(&buf[head_len..head_len + len])?;
                (Some(body), head_len + len)
            }
            BodyFraming::Chunked => {
                match decode_chunked(&buf[head_len..], self.config.max_body_bytes, arena)? {
                    None => return Ok(Decoded::NeedMore),
                    Some((body, used)) => (Some(body), head_len + used),
                }
            }
        };

        let request = self.materialize(&buf[..head_len], body, arena)?;
        self.phase = Phase::Head;
        Ok(Decoded::Complete { request, consumed })
    }

    /// Parse the head if its terminator has arrived. Returns the head length
    /// and body framing, or `None` for an incomplete head within the cap.
    fn parse_head(&self, buf: &[u8]) -> Result<Option<(usize, BodyFraming)>, ParseError> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut head = httparse::Request::new(&mut slots);
        let head_len = match head.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                // An incomplete head means everything buffered so far is head
                // bytes; over the cap it can never complete within bounds.
                if buf.len() > self.config.max_header_bytes {
                    return Err(ParseError::TooLarge);
                }
                return Ok(None);
            }
            Err(httparse::Error::TooManyHeaders) => return Err(ParseError::TooLarge),
            Err(_) => return Err(ParseError::BadRequest("malformed request head")),
        };
        if head_len > self.config.max_header_bytes {
            return Err(ParseError::TooLarge);
        }

        let path = head.path.ok_or(ParseError::BadRequest("missing target"))?;
        if path.len() > MAX_FIELD_BYTES {
            return Err(ParseError::TooLarge);
        }
        if !path.starts_with('/') {
            return Err(ParseError::BadRequest("target must be origin-form"));
        }
        match head.version {
            Some(0) | Some(1) => {}
            _ => return Err(ParseError::BadRequest("unsupported http version")),
        }

        let mut framing = BodyFraming::None;
        for h in head.headers.iter() {
            if h.name.len() + h.value.len() > MAX_FIELD_BYTES {
                return Err(ParseError::TooLarge);
            }
            if h.name.eq_ignore_ascii_case("content-length") {
                let len = parse_content_length(h.value)?;
                match framing {
                    BodyFraming::None => framing = BodyFraming::Fixed(len),
                    BodyFraming::Fixed(prev) if prev == len => {}
                    _ => return Err(ParseError::BadRequest("conflicting body framing")),
                }
            } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
                if !h.value.eq_ignore_ascii_case(b"chunked") {
                    return Err(ParseError::BadRequest("unsupported transfer encoding"));
                }
                if matches!(framing, BodyFraming::Fixed(_)) {
                    return Err(ParseError::BadRequest("conflicting body framing"));
                }
                framing = BodyFraming::Chunked;
            }
        }
        if let BodyFraming::Fixed(len) = framing {
            if len > self.config.max_body_bytes {
                return Err(ParseError::TooLarge);
            }
            if len == 0 {
                framing = BodyFraming::None;
            }
        }
        Ok(Some((head_len, framing)))
    }

    /// Copy the head into the arena and assemble the request. `head` is the
    /// exact head slice, so httparse is guaranteed to complete.
    fn materialize<'a>(
        &self,
        head_bytes: &[u8],
        body: Option<&'a [u8]>,
        arena: &'a Arena,
    ) -> Result<ParsedRequest<'a>, ParseError> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut head = httparse::Request::new(&mut slots);
        match head.parse(head_bytes) {
            Ok(httparse::Status::Complete(_)) => {}
            _ => return Err(ParseError::BadRequest("malformed request head")),
        }

        let method = HttpMethod::from_bytes(head.method.unwrap_or("").as_bytes());
        let raw_target = arena.alloc_str(head.path.unwrap_or("/"))?;
        let (raw_path, query) = match raw_target.find('?') {
            Some(idx) => (&raw_target[..idx], Some(&raw_target[idx + 1..])),
            None => (raw_target, None),
        };
        let path = percent_decode_path(raw_path.as_bytes(), arena)?;

        let mut headers: BumpVec<'a, (&'a str, &'a [u8])> =
            BumpVec::with_capacity_in(head.headers.len(), arena.bump());
        for h in head.headers.iter() {
            let name = arena.alloc_str(h.name)?;
            let value = arena.alloc_bytes(h.value)?;
            headers.push((name, value));
        }

        let http11 = head.version == Some(1);
        let request = ParsedRequest {
            method,
            raw_path: raw_target,
            path,
            query,
            keep_alive: keep_alive_hint(http11, &headers),
            headers,
            body,
        };
        Ok(request)
    }
}

fn parse_content_length(value: &[u8]) -> Result<usize, ParseError> {
    if value.is_empty() || value.len() > 19 {
        return Err(ParseError::BadRequest("invalid content-length"));
    }
    let mut len: usize = 0;
    for b in value {
        if !b.is_ascii_digit() {
            return Err(ParseError::BadRequest("invalid content-length"));
        }
        len = len * 10 + (b - b'0') as usize;
    }
    Ok(len)
}

/// Keep-alive determination: HTTP/1.1 defaults on unless `close`, HTTP/1.0
/// defaults off unless an explicit `keep-alive`.
fn keep_alive_hint(http11: bool, headers: &BumpVec<'_, (&str, &[u8])>) -> bool {
    let connection = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("connection"))
        .map(|(_, v)| *v);
    match (http11, connection) {
        (true, None) => true,
        (true, Some(v)) => !v.eq_ignore_ascii_case(super::CLOSE.as_bytes()),
        (false, Some(v)) => v.eq_ignore_ascii_case(super::KEEPALIVE.as_bytes()),
        (false, None) => false,
    }
}

/// Percent-decode a path into the arena. The input always gets copied (it
/// lives in the read buffer, the output must outlive it).
fn percent_decode_path<'a>(raw: &[u8], arena: &'a Arena) -> Result<&'a str, ParseError> {
    if memchr::memchr(b'%', raw).is_none() {
        let s = std::str::from_utf8(raw)
            .map_err(|_| ParseError::BadRequest("path is not valid utf-8"))?;
        return Ok(arena.alloc_str(s)?);
    }

    let mut out: BumpVec<'a, u8> = BumpVec::with_capacity_in(raw.len(), arena.bump());
    let mut i = 0;
    while i < raw.len() {
        let b = raw[i];
        if b == b'%' {
            let hi = hex_val(raw.get(i + 1).copied());
            let lo = hex_val(raw.get(i + 2).copied());
            match (hi, lo) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => return Err(ParseError::BadRequest("invalid percent escape")),
            }
        } else {
            out.push(b);
            i += 1;
        }
    }
    std::str::from_utf8(out.into_bump_slice())
        .map_err(|_| ParseError::BadRequest("path is not valid utf-8"))
}

fn hex_val(b: Option<u8>) -> Option<u8> {
    match b? {
        c @ b'0'..=b'9' => Some(c - b'0'),
        c @ b'a'..=b'f' => Some(c - b'a' + 10),
        c @ b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decode a chunked body once all of it is buffered.
///
/// Scans the framing first without allocating; only the call that sees the
/// terminating chunk copies data into the arena. Returns the decoded body
/// and the number of input bytes consumed, or `None` while incomplete.
fn decode_chunked<'a>(
    input: &[u8],
    max_body: usize,
    arena: &'a Arena,
) -> Result<Option<(&'a [u8], usize)>, ParseError> {
    // First pass: locate every chunk and the end of the trailer section.
    let mut pos = 0;
    let mut total = 0usize;
    let mut chunks: Vec<(usize, usize)> = Vec::new();
    loop {
        let line_end = match find_crlf(&input[pos..]) {
            Some(rel) => pos + rel,
            None => return Ok(None),
        };
        let size = parse_chunk_size(&input[pos..line_end])?;
        pos = line_end + 2;
        if size == 0 {
            break;
        }
        total = total
            .checked_add(size)
            .ok_or(ParseError::BadRequest("chunk overflow"))?;
        if total > max_body {
            return Err(ParseError::TooLarge);
        }
        if input.len() < pos + size + 2 {
            return Ok(None);
        }
        if &input[pos + size..pos + size + 2] != b"\r\n" {
            return Err(ParseError::BadRequest("chunk missing terminator"));
        }
        chunks.push((pos, size));
        pos += size + 2;
    }

    // Trailer section: zero or more header lines, then an empty line.
    loop {
        let line_end = match find_crlf(&input[pos..]) {
            Some(rel) => pos + rel,
            None => return Ok(None),
        };
        let empty = line_end == pos;
        pos = line_end + 2;
        if empty {
            break;
        }
    }

    let mut out: BumpVec<'a, u8> = BumpVec::with_capacity_in(total, arena.bump());
    for (start, len) in chunks {
        out.extend_from_slice(&input[start..start + len]);
    }
    Ok(Some((out.into_bump_slice(), pos)))
}

fn find_crlf(input: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(idx) = memchr::memchr(b'\r', &input[from..]) {
        let at = from + idx;
        if at + 1 < input.len() {
            if input[at + 1] == b'\n' {
                return Some(at);
            }
            from = at + 1;
        } else {
            return None;
        }
    }
    None
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    // Chunk extensions after ';' are tolerated and ignored.
    let digits = match memchr::memchr(b';', line) {
        Some(idx) => &line[..idx],
        None => line,
    };
    if digits.is_empty() || digits.len() > 8 {
        return Err(ParseError::BadRequest("invalid chunk size"));
    }
    let mut size = 0usize;
    for b in digits {
        let v = hex_val(Some(*b)).ok_or(ParseError::BadRequest("invalid chunk size"))?;
        size = size << 4 | v as usize;
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use riptide_core::memory::ArenaKind;

    use super::*;

    fn arena() -> Arena {
        Arena::new(ArenaKind::Request, 16 * 1024, 8 << 20)
    }

    fn decoder() -> RequestDecoder {
        RequestDecoder::new(DecoderConfig {
            max_header_bytes: 64 * 1024,
            max_body_bytes: 1 << 20,
        })
    }

    fn decode_one<'a>(buf: &[u8], arena: &'a Arena) -> (ParsedRequest<'a>, usize) {
        match decoder().decode(buf, arena).unwrap() {
            Decoded::Complete { request, consumed } => (request, consumed),
            Decoded::NeedMore => panic!("expected a complete request"),
        }
    }

    #[test]
    fn simple_get() {
        let arena = arena();
        let (req, consumed) =
            decode_one(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n", &arena);
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.path, "/health");
        assert_eq!(req.query, None);
        assert!(req.keep_alive);
        assert_eq!(req.header("host"), Some(&b"x"[..]));
        assert_eq!(req.body, None);
        assert_eq!(consumed, 33);
    }

    #[test]
    fn incremental_feed_completes_only_at_terminator() {
        let arena = arena();
        let mut dec = decoder();
        let full = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        for cut in 1..full.len() {
            assert!(matches!(
                dec.decode(&full[..cut], &arena).unwrap(),
                Decoded::NeedMore
            ));
        }
        assert!(matches!(
            dec.decode(full, &arena).unwrap(),
            Decoded::Complete { .. }
        ));
    }

    #[test]
    fn fixed_body_waits_for_all_bytes() {
        let arena = arena();
        let mut dec = decoder();
        let head = b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\n";
        assert!(matches!(dec.decode(head, &arena).unwrap(), Decoded::NeedMore));
        let mut full = head.to_vec();
        full.extend_from_slice(b"hello");
        match dec.decode(&full, &arena).unwrap() {
            Decoded::Complete { request, consumed } => {
                assert_eq!(request.body, Some(&b"hello"[..]));
                assert_eq!(consumed, full.len());
            }
            Decoded::NeedMore => panic!("body was complete"),
        };
    }

    #[test]
    fn pipelined_requests_decode_back_to_back() {
        let arena = arena();
        let mut dec = decoder();
        let two = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let consumed = match dec.decode(two, &arena).unwrap() {
            Decoded::Complete { request, consumed } => {
                assert_eq!(request.path, "/a");
                consumed
            }
            Decoded::NeedMore => panic!(),
        };
        match dec.decode(&two[consumed..], &arena).unwrap() {
            Decoded::Complete { request, .. } => assert_eq!(request.path, "/b"),
            Decoded::NeedMore => panic!(),
        };
    }

    #[test]
    fn oversized_head_is_rejected_one_byte_over_cap() {
        let arena = arena();
        let mut dec = RequestDecoder::new(DecoderConfig {
            max_header_bytes: 128,
            max_body_bytes: 1024,
        });
        // A head of exactly the cap parses.
        let pad = 128 - b"GET / HTTP/1.1\r\nX-Pad: \r\n\r\n".len();
        let exact = format!("GET / HTTP/1.1\r\nX-Pad: {}\r\n\r\n", "a".repeat(pad));
        assert_eq!(exact.len(), 128);
        assert!(matches!(
            dec.decode(exact.as_bytes(), &arena).unwrap(),
            Decoded::Complete { .. }
        ));
        // One byte more fails.
        let over = format!("GET / HTTP/1.1\r\nX-Pad: {}\r\n\r\n", "a".repeat(pad + 1));
        let mut dec = RequestDecoder::new(DecoderConfig {
            max_header_bytes: 128,
            max_body_bytes: 1024,
        });
        assert!(matches!(
            dec.decode(over.as_bytes(), &arena),
            Err(ParseError::TooLarge)
        ));
    }

    #[test]
    fn oversized_partial_head_fails_early() {
        let arena = arena();
        let mut dec = RequestDecoder::new(DecoderConfig {
            max_header_bytes: 64,
            max_body_bytes: 1024,
        });
        let partial = format!("GET / HTTP/1.1\r\nX-Pad: {}", "a".repeat(100));
        assert!(matches!(
            dec.decode(partial.as_bytes(), &arena),
            Err(ParseError::TooLarge)
        ));
    }

    #[test]
    fn body_over_cap_is_rejected_before_buffering() {
        let arena = arena();
        let mut dec = RequestDecoder::new(DecoderConfig {
            max_header_bytes: 1024,
            max_body_bytes: 8,
        });
        let head = b"POST / HTTP/1.1\r\nContent-Length: 9\r\n\r\n";
        assert!(matches!(dec.decode(head, &arena), Err(ParseError::TooLarge)));
    }

    #[test]
    fn percent_decoding_applies_to_path_only() {
        let arena = arena();
        let (req, _) = decode_one(b"GET /a%20b?q=x%20y HTTP/1.1\r\n\r\n", &arena);
        assert_eq!(req.path, "/a b");
        assert_eq!(req.raw_path, "/a%20b?q=x%20y");
        assert_eq!(req.query, Some("q=x%20y"));
    }

    #[test]
    fn invalid_percent_escape_is_bad_request() {
        let arena = arena();
        let err = decoder()
            .decode(b"GET /a%zz HTTP/1.1\r\n\r\n", &arena)
            .unwrap_err();
        assert!(matches!(err, ParseError::BadRequest(_)));
    }

    #[test]
    fn http10_defaults_to_close() {
        let arena = arena();
        let (req, _) = decode_one(b"GET / HTTP/1.0\r\n\r\n", &arena);
        assert!(!req.keep_alive);
        let (req, _) = decode_one(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n", &arena);
        assert!(req.keep_alive);
    }

    #[test]
    fn http11_connection_close_is_honored() {
        let arena = arena();
        let (req, _) = decode_one(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n", &arena);
        assert!(!req.keep_alive);
    }

    #[test]
    fn chunked_body_is_dechunked() {
        let arena = arena();
        let wire = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                     5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let (req, consumed) = decode_one(wire, &arena);
        assert_eq!(req.body, Some(&b"hello world"[..]));
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn chunked_body_over_cap_fails() {
        let arena = arena();
        let mut dec = RequestDecoder::new(DecoderConfig {
            max_header_bytes: 1024,
            max_body_bytes: 4,
        });
        let wire = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        assert!(matches!(dec.decode(wire, &arena), Err(ParseError::TooLarge)));
    }

    #[test]
    fn duplicate_headers_are_preserved_in_order() {
        let arena = arena();
        let (req, _) = decode_one(
            b"GET / HTTP/1.1\r\nX-Tag: one\r\nX-Tag: two\r\n\r\n",
            &arena,
        );
        let tags: Vec<&[u8]> = req
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("x-tag"))
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(tags, vec![&b"one"[..], &b"two"[..]]);
    }

    #[test]
    fn conflicting_framing_is_rejected() {
        let arena = arena();
        let wire = b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert!(matches!(
            decoder().decode(wire, &arena),
            Err(ParseError::BadRequest(_))
        ));
    }
}
