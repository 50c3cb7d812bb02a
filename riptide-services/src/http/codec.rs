//! Response serialization.
//!
//! The encoder assembles the complete wire image of a response into the
//! connection's reusable write buffer: status line, `Server` and `Date`
//! (cached per second, re-rendered only when the clock ticks over),
//! user headers, framing, body. HEAD responses and status codes that forbid
//! a body keep their `Content-Length` but suppress the payload.

use std::{
    cell::RefCell,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use http::StatusCode;

use super::{
    method::HttpMethod,
    response::{Body, Response, ResponseError},
    HttpError,
};

const DATE_LEN: usize = 29;

thread_local! {
    static DATE_CACHE: RefCell<(u64, [u8; DATE_LEN])> = const { RefCell::new((0, [0; DATE_LEN])) };
}

/// Append the current `Date` header value. Formatting runs at most once per
/// second per thread.
fn push_date(out: &mut Vec<u8>) {
    let now = SystemTime::now();
    let secs = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    DATE_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        if cache.0 != secs {
            let formatted = httpdate::fmt_http_date(now);
            debug_assert_eq!(formatted.len(), DATE_LEN);
            cache.1.copy_from_slice(formatted.as_bytes());
            cache.0 = secs;
        }
        out.extend_from_slice(&cache.1);
    });
}

pub struct ResponseEncoder {
    server_name: &'static str,
}

impl ResponseEncoder {
    pub fn new(server_name: &'static str) -> Self {
        Self { server_name }
    }

    /// Serialize `resp` into `out` and flip its sent latch.
    pub fn encode(
        &self,
        method: HttpMethod,
        resp: &mut Response<'_>,
        out: &mut Vec<u8>,
    ) -> Result<(), ResponseError> {
        if resp.is_sent() {
            return Err(ResponseError::AlreadySent);
        }
        let status = resp.status();
        self.push_status_line(status, out);
        push_date(out);

        for (name, value) in resp.headers() {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        let body_forbidden = method == HttpMethod::Head
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
            || status.is_informational();

        match resp.content_length() {
            Some(len) => {
                // 204/304 carry no framing headers at all.
                if status != StatusCode::NO_CONTENT && status != StatusCode::NOT_MODIFIED {
                    push_content_length(len, out);
                }
                out.extend_from_slice(b"\r\n");
                if !body_forbidden && len > 0 {
                    match resp.body() {
                        Body::Arena(b) => out.extend_from_slice(b),
                        Body::Static(b) => out.extend_from_slice(b),
                        Body::Empty | Body::Chunked(_) => {}
                    }
                }
            }
            None => {
                out.extend_from_slice(b"Transfer-Encoding: chunked\r\n\r\n");
                if !body_forbidden {
                    let Body::Chunked(producer) = resp.body_mut() else {
                        unreachable!("only chunked bodies lack a length");
                    };
                    while let Some(chunk) = producer() {
                        if chunk.is_empty() {
                            continue;
                        }
                        push_chunk_header(chunk.len(), out);
                        out.extend_from_slice(&chunk);
                        out.extend_from_slice(b"\r\n");
                    }
                    out.extend_from_slice(b"0\r\n\r\n");
                }
            }
        }

        resp.mark_sent();
        Ok(())
    }

    /// Serialize a response for a failure from the table in
    /// [`HttpError`](super::HttpError), bypassing the middleware chain.
    /// Emits nothing for kinds that close silently.
    pub fn encode_error(&self, err: &HttpError, out: &mut Vec<u8>) {
        let Some(status) = err.status() else {
            return;
        };
        self.push_status_line(status, out);
        push_date(out);
        if let HttpError::MethodNotAllowed(allowed) = err {
            out.extend_from_slice(b"Allow: ");
            out.extend_from_slice(allowed.allow_header().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if err.closes_connection() {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        push_content_length(0, out);
        out.extend_from_slice(b"\r\n");
    }

    fn push_status_line(&self, status: StatusCode, out: &mut Vec<u8>) {
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(status.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
        out.extend_from_slice(b"\r\nServer: ");
        out.extend_from_slice(self.server_name.as_bytes());
        out.extend_from_slice(b"\r\nDate: ");
    }
}

fn push_content_length(len: usize, out: &mut Vec<u8>) {
    let mut digits = [0u8; 20];
    let mut at = digits.len();
    let mut rest = len;
    loop {
        at -= 1;
        digits[at] = b'0' + (rest % 10) as u8;
        rest /= 10;
        if rest == 0 {
            break;
        }
    }
    out.extend_from_slice(b"Content-Length: ");
    out.extend_from_slice(&digits[at..]);
    out.extend_from_slice(b"\r\n");
}

fn push_chunk_header(len: usize, out: &mut Vec<u8>) {
    let hex = format!("{len:x}\r\n");
    out.extend_from_slice(hex.as_bytes());
}

#[cfg(test)]
mod tests {
    use riptide_core::memory::{Arena, ArenaKind};

    use super::super::method::MethodSet;
    use super::*;

    fn arena() -> Arena {
        Arena::new(ArenaKind::Response, 4096, 1 << 20)
    }

    fn encode(method: HttpMethod, resp: &mut Response<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        ResponseEncoder::new("riptide")
            .encode(method, resp, &mut out)
            .unwrap();
        out
    }

    #[test]
    fn wire_image_has_status_server_date_and_length() {
        let arena = arena();
        let mut resp = Response::new(&arena);
        resp.set_body_static(b"{\"ok\":true}").unwrap();
        resp.insert_header(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        )
        .unwrap();
        let wire = encode(HttpMethod::Get, &mut resp);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\nServer: riptide\r\nDate: "));
        assert!(text.contains("Content-Type: application/json\r\n") || text.contains("content-type: application/json\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"ok\":true}"));
        assert!(resp.is_sent());
    }

    #[test]
    fn head_keeps_length_but_drops_body() {
        let arena = arena();
        let mut resp = Response::new(&arena);
        resp.set_body_static(b"hello").unwrap();
        let text = String::from_utf8(encode(HttpMethod::Head, &mut resp)).unwrap();
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn no_content_has_no_framing_headers() {
        let arena = arena();
        let mut resp = Response::with_status(&arena, StatusCode::NO_CONTENT);
        let text = String::from_utf8(encode(HttpMethod::Get, &mut resp)).unwrap();
        assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn chunked_body_is_framed() {
        let arena = arena();
        let mut resp = Response::new(&arena);
        let mut chunks = std::collections::VecDeque::from(vec![
            bytes::Bytes::from_static(b"hello"),
            bytes::Bytes::from_static(b" world"),
        ]);
        resp.set_body_chunked(Box::new(move || chunks.pop_front()))
            .unwrap();
        let text = String::from_utf8(encode(HttpMethod::Get, &mut resp)).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.ends_with("5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"));
    }

    #[test]
    fn method_not_allowed_renders_allow() {
        let mut allowed = MethodSet::default();
        allowed.insert(HttpMethod::Get);
        let mut out = Vec::new();
        ResponseEncoder::new("riptide")
            .encode_error(&HttpError::MethodNotAllowed(allowed), &mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(text.contains("Allow: GET\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(!text.contains("Connection: close"));
    }

    #[test]
    fn silent_kinds_emit_nothing() {
        let mut out = Vec::new();
        ResponseEncoder::new("riptide").encode_error(&HttpError::Timeout, &mut out);
        assert!(out.is_empty());
    }
}
