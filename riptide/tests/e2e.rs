//! End-to-end tests over real sockets: a server per test on a free port,
//! raw HTTP/1.1 written from plain `std::net::TcpStream` clients.

use std::{
    io::{Read, Write},
    net::TcpStream,
    time::Duration,
};

use http::StatusCode;
use riptide::{
    ArenaKind, Context, Decision, Handler, HttpMethod, Middleware, MiddlewareEntry, Outcome,
    Request, Response, Server, ServerBuilder, ServerConfig,
};

fn test_config() -> ServerConfig {
    let mut config = ServerConfig::new(0);
    config.io_threads = 1;
    config
}

fn base_builder() -> ServerBuilder {
    let mut builder = ServerBuilder::new(test_config());
    builder
        .route(
            HttpMethod::Get,
            "/health",
            Handler::sync(|_| Ok(Outcome::json_static(b"{\"ok\":true}"))),
        )
        .unwrap();
    builder
        .route(
            HttpMethod::Get,
            "/users/{id:int}",
            Handler::sync(|req| {
                let id = req.path_param("id").and_then(|v| v.as_int()).unwrap();
                Ok(Outcome::text(format!("user {id}")))
            }),
        )
        .unwrap();
    builder
        .route(
            HttpMethod::Get,
            "/files/{rest:path}",
            Handler::sync(|req| {
                let rest = req.path_param("rest").and_then(|v| v.as_str()).unwrap();
                Ok(Outcome::text(rest.to_string()))
            }),
        )
        .unwrap();
    builder
        .route(
            HttpMethod::Post,
            "/echo",
            Handler::sync(|req| Ok(Outcome::bytes(req.body().unwrap_or(&[]).to_vec()))),
        )
        .unwrap();
    builder
}

fn start(builder: ServerBuilder) -> (Server, std::net::SocketAddr) {
    let mut server = builder.build().unwrap();
    let addr = server.listen("127.0.0.1", 0).unwrap();
    (server, addr)
}

fn connect(addr: std::net::SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

struct Reply {
    status: u16,
    head: String,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.head.lines().find_map(|line| {
            line.to_ascii_lowercase()
                .strip_prefix(&prefix)
                .map(|_| line.split_once(':').unwrap().1.trim().to_string())
        })
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Read one framed response; bytes beyond it stay in `pending`.
fn read_reply(stream: &mut TcpStream, pending: &mut Vec<u8>) -> Reply {
    let mut tmp = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = find(pending, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut tmp).expect("read response head");
        assert!(n > 0, "connection closed before a full response head");
        pending.extend_from_slice(&tmp[..n]);
    };
    let head = String::from_utf8(pending[..head_end].to_vec()).unwrap();
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .expect("status line")
        .parse()
        .unwrap();
    let content_length: usize = head
        .lines()
        .find_map(|line| {
            line.to_ascii_lowercase()
                .strip_prefix("content-length:")
                .map(|v| v.trim().parse().unwrap())
        })
        .unwrap_or(0);
    while pending.len() < head_end + content_length {
        let n = stream.read(&mut tmp).expect("read response body");
        assert!(n > 0, "connection closed before a full response body");
        pending.extend_from_slice(&tmp[..n]);
    }
    let body = pending[head_end..head_end + content_length].to_vec();
    pending.drain(..head_end + content_length);
    Reply { status, head, body }
}

fn roundtrip(stream: &mut TcpStream, request: &[u8]) -> Reply {
    stream.write_all(request).unwrap();
    read_reply(stream, &mut Vec::new())
}

#[test]
fn static_hit_keeps_the_connection_open() {
    let (server, addr) = start(base_builder());
    let mut stream = connect(addr);

    let reply = roundtrip(&mut stream, b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"{\"ok\":true}");
    assert_eq!(reply.header("content-length").as_deref(), Some("11"));
    assert_eq!(
        reply.header("content-type").as_deref(),
        Some("application/json")
    );
    assert!(reply.header("connection").is_none());

    // keep-alive: a second request on the same socket succeeds
    let reply = roundtrip(&mut stream, b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 200);

    drop(server);
}

#[test]
fn param_coercion_type_reject_and_allow_header() {
    let (server, addr) = start(base_builder());

    let mut stream = connect(addr);
    let reply = roundtrip(&mut stream, b"GET /users/42 HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"user 42");

    let reply = roundtrip(&mut stream, b"GET /users/abc HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 404);

    let reply = roundtrip(&mut stream, b"DELETE /users/42 HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 405);
    assert_eq!(reply.header("allow").as_deref(), Some("GET"));

    drop(server);
}

#[test]
fn wildcard_path_param_captures_slashes() {
    let (server, addr) = start(base_builder());
    let mut stream = connect(addr);
    let reply = roundtrip(&mut stream, b"GET /files/a/b/c.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"a/b/c.txt");
    drop(server);
}

struct AuthGate;

impl Middleware for AuthGate {
    fn pre(&self, req: &mut Request<'_>, _ctx: &mut Context<'_>) -> Decision {
        if req.header("authorization").is_none() {
            return Decision::ShortCircuit(Outcome::empty(StatusCode::UNAUTHORIZED));
        }
        Decision::Continue
    }
}

struct Observer;

impl Middleware for Observer {
    fn post(&self, _req: &Request<'_>, resp: &mut Response<'_>, _ctx: &mut Context<'_>) {
        let _ = resp.insert_header(
            http::header::HeaderName::from_static("x-observed"),
            http::HeaderValue::from_static("1"),
        );
    }
}

#[test]
fn pre_short_circuit_still_runs_post_chain() {
    let mut builder = base_builder();
    builder.middleware(MiddlewareEntry::pre(10, AuthGate));
    builder.middleware(MiddlewareEntry::post(90, Observer));
    builder
        .route(
            HttpMethod::Get,
            "/private",
            Handler::sync(|_| Ok(Outcome::text("secret"))),
        )
        .unwrap();
    let (server, addr) = start(builder);

    let mut stream = connect(addr);
    let reply = roundtrip(&mut stream, b"GET /private HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 401);
    assert!(reply.body.is_empty());
    assert_eq!(reply.header("x-observed").as_deref(), Some("1"));

    // With credentials the handler runs, and the observer still tags it.
    let reply = roundtrip(
        &mut stream,
        b"GET /private HTTP/1.1\r\nHost: x\r\nAuthorization: Bearer t\r\n\r\n",
    );
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"secret");
    assert_eq!(reply.header("x-observed").as_deref(), Some("1"));

    drop(server);
}

#[test]
fn pipelined_requests_answer_in_order_and_reset_arenas() {
    let (server, addr) = start(base_builder());
    let before = server
        .stats()
        .arenas
        .iter()
        .find(|(kind, _)| *kind == ArenaKind::Request)
        .map(|(_, stats)| stats.reset_count)
        .unwrap();

    let mut stream = connect(addr);
    stream
        .write_all(
            b"GET /health HTTP/1.1\r\nHost: x\r\n\r\nGET /health HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .unwrap();
    let mut pending = Vec::new();
    let first = read_reply(&mut stream, &mut pending);
    let second = read_reply(&mut stream, &mut pending);
    assert_eq!(first.status, 200);
    assert_eq!(second.status, 200);
    assert_eq!(first.body, b"{\"ok\":true}");
    assert_eq!(second.body, b"{\"ok\":true}");

    // still open
    let reply = roundtrip(&mut stream, b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 200);

    // Both requests reset the request arena. Counters are process-wide, so
    // concurrent tests can only push the delta higher.
    let after = server
        .stats()
        .arenas
        .iter()
        .find(|(kind, _)| *kind == ArenaKind::Request)
        .map(|(_, stats)| stats.reset_count)
        .unwrap();
    assert!(after >= before + 2, "expected >= 2 resets, got {before}->{after}");

    drop(server);
}

#[test]
fn oversized_header_is_413_and_closes() {
    let (server, addr) = start(base_builder());
    let mut stream = connect(addr);

    let huge = "a".repeat(70 * 1024);
    let request = format!("GET /health HTTP/1.1\r\nHost: x\r\nX-Huge: {huge}\r\n\r\n");
    // The server may answer and close before the tail is written.
    let _ = stream.write_all(request.as_bytes());

    let reply = read_reply(&mut stream, &mut Vec::new());
    assert_eq!(reply.status, 413);
    assert_eq!(reply.header("connection").as_deref(), Some("close"));

    // server closes after the response
    let mut tail = [0u8; 16];
    assert_eq!(stream.read(&mut tail).unwrap_or(0), 0);

    drop(server);
}

#[test]
fn header_boundary_is_inclusive() {
    let mut config = test_config();
    config.max_header_bytes = 256;
    let mut builder = ServerBuilder::new(config);
    builder
        .route(
            HttpMethod::Get,
            "/",
            Handler::sync(|_| Ok(Outcome::text("ok"))),
        )
        .unwrap();
    let (server, addr) = start(builder);

    let skeleton = "GET / HTTP/1.1\r\nX-Pad: \r\n\r\n";
    let pad = 256 - skeleton.len();
    let exact = format!("GET / HTTP/1.1\r\nX-Pad: {}\r\n\r\n", "a".repeat(pad));
    assert_eq!(exact.len(), 256);

    let mut stream = connect(addr);
    let reply = roundtrip(&mut stream, exact.as_bytes());
    assert_eq!(reply.status, 200);

    let over = format!("GET / HTTP/1.1\r\nX-Pad: {}\r\n\r\n", "a".repeat(pad + 1));
    let mut stream = connect(addr);
    let reply = roundtrip(&mut stream, over.as_bytes());
    assert_eq!(reply.status, 413);

    drop(server);
}

#[test]
fn echo_round_trips_fixed_and_chunked_bodies() {
    let (server, addr) = start(base_builder());

    let mut stream = connect(addr);
    let reply = roundtrip(
        &mut stream,
        b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello world",
    );
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"hello world");

    let reply = roundtrip(
        &mut stream,
        b"POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
          6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n",
    );
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"hello world");

    drop(server);
}

#[test]
fn connection_close_is_echoed_and_honored() {
    let (server, addr) = start(base_builder());
    let mut stream = connect(addr);
    let reply = roundtrip(
        &mut stream,
        b"GET /health HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("connection").as_deref(), Some("close"));
    let mut tail = [0u8; 16];
    assert_eq!(stream.read(&mut tail).unwrap_or(0), 0);
    drop(server);
}

#[test]
fn handler_panic_is_a_500_that_post_chain_observes() {
    let mut builder = base_builder();
    builder.middleware(MiddlewareEntry::post(90, Observer));
    builder
        .route(
            HttpMethod::Get,
            "/boom",
            Handler::sync(|_| panic!("kaboom")),
        )
        .unwrap();
    let (server, addr) = start(builder);

    let mut stream = connect(addr);
    let reply = roundtrip(&mut stream, b"GET /boom HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 500);
    assert!(reply.body.is_empty());
    assert_eq!(reply.header("x-observed").as_deref(), Some("1"));

    // 500s keep the connection
    let reply = roundtrip(&mut stream, b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 200);

    drop(server);
}

#[test]
fn stop_drains_and_releases_the_port() {
    let (mut server, addr) = start(base_builder());
    let mut stream = connect(addr);
    let reply = roundtrip(&mut stream, b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 200);

    server.stop(500);
    assert!(server.local_addr().is_none());

    // The listener is gone: either the connect fails outright or the
    // half-open socket delivers no further responses.
    if let Ok(mut stream) = TcpStream::connect(addr) {
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let _ = stream.write_all(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut tail = [0u8; 16];
        assert!(matches!(stream.read(&mut tail), Ok(0) | Err(_)));
    }
}
