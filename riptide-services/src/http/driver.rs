//! The per-connection HTTP/1.1 service.
//!
//! One [`HttpServerService`] is built per worker and drives every connection
//! that worker accepts: read with the applicable timeout, decode, route, run
//! the middleware chain and handler, encode, write, reset the arenas, and
//! loop while keep-alive holds.
//!
//! Decoder and router failures never enter the middleware chain; the driver
//! synthesizes the response straight from the failure table. Handler and
//! middleware failures become a 500 that does flow through the post chain.
//!
//! Pipelined requests are answered in order; consecutive responses are
//! batched in the write buffer and flushed together, bounded by
//! `write_queue_bytes`.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use http::{header::CONNECTION, HeaderValue, StatusCode};
use monoio::{
    buf::IoBufMut,
    io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt},
    net::TcpStream,
};
use riptide_core::{
    memory::{ArenaPair, ArenaPool},
    metrics,
};
use tracing::{debug, warn};

use super::{
    codec::ResponseEncoder,
    handler,
    middleware::Decision,
    parser::{Decoded, DecoderConfig, ParseError, RequestDecoder},
    request::{CancelFlag, Context, Request},
    response::Response,
    router::{MatchResult, Router},
    HttpError,
};

/// Raised by a worker entering shutdown; connections observe it both as the
/// keep-alive kill switch and as the cooperative cancel flag in request
/// contexts.
pub type DrainFlag = CancelFlag;

/// Timeout settings of the connection loop.
///
/// `keepalive_timeout` bounds the idle gap between requests (and body
/// reads); `read_header_timeout` bounds receiving a full request head;
/// `write_timeout` bounds a stalled response write. `None` disables the
/// respective deadline.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HttpServerTimeout {
    pub keepalive_timeout: Option<Duration>,
    pub read_header_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl Default for HttpServerTimeout {
    fn default() -> Self {
        Self {
            keepalive_timeout: Some(Duration::from_secs(30)),
            read_header_timeout: Some(Duration::from_secs(10)),
            write_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConnConfig {
    pub read_buf_init: usize,
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
    pub write_queue_bytes: usize,
    pub keep_alive_enabled: bool,
    pub timeout: HttpServerTimeout,
}

impl Default for HttpConnConfig {
    fn default() -> Self {
        Self {
            read_buf_init: 8 * 1024,
            max_header_bytes: 64 * 1024,
            max_body_bytes: 1024 * 1024,
            write_queue_bytes: 256 * 1024,
            keep_alive_enabled: true,
            timeout: HttpServerTimeout::default(),
        }
    }
}

/// Why the connection loop stopped.
enum CloseReason {
    /// Peer closed or keep-alive ended normally.
    Done,
    /// A failure-table kind closed it; any response was already queued.
    Failed(HttpError),
    Io(io::Error),
}

pub struct HttpServerService {
    router: Arc<Router>,
    config: HttpConnConfig,
    encoder: ResponseEncoder,
    pool: ArenaPool,
}

impl HttpServerService {
    pub fn new(
        router: Arc<Router>,
        config: HttpConnConfig,
        server_name: &'static str,
        pool: ArenaPool,
    ) -> Self {
        Self {
            router,
            config,
            encoder: ResponseEncoder::new(server_name),
            pool,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Drive one accepted connection to completion.
    pub async fn serve(&self, mut stream: TcpStream, peer: SocketAddr, drain: DrainFlag) {
        let _ = stream.set_nodelay(true);
        metrics::connection_opened();
        let mut arenas = self.pool.acquire();
        match self.conn_loop(&mut stream, peer, &mut arenas, &drain).await {
            CloseReason::Done => debug!("connection {peer} closed"),
            CloseReason::Failed(err) => debug!("connection {peer} closed on failure: {err}"),
            CloseReason::Io(err) => debug!("connection {peer} i/o error: {err}"),
        }
        let _ = stream.shutdown().await;
        self.pool.release(arenas);
        metrics::connection_closed();
    }

    async fn conn_loop(
        &self,
        stream: &mut TcpStream,
        peer: SocketAddr,
        arenas: &mut ArenaPair,
        drain: &DrainFlag,
    ) -> CloseReason {
        let mut decoder = RequestDecoder::new(DecoderConfig {
            max_header_bytes: self.config.max_header_bytes,
            max_body_bytes: self.config.max_body_bytes,
        });
        // Wire cap: head plus body plus chunked-framing slack. A message
        // that cannot fit is oversized by definition.
        let buf_cap = self.config.max_header_bytes + 2 * self.config.max_body_bytes + 16 * 1024;
        let mut read_buf: Vec<u8> = Vec::with_capacity(self.config.read_buf_init);
        let mut write_buf: Vec<u8> = Vec::with_capacity(1024);

        loop {
            // Bound the batched-response queue before starting a new request.
            if write_buf.len() > self.config.write_queue_bytes {
                match self.flush(stream, &mut write_buf).await {
                    Ok(()) => {}
                    Err(reason) => return reason,
                }
            }

            let step = {
                let req_arena = &arenas.request;
                let resp_arena = &arenas.response;

                // Decode one request, reading as needed.
                let decoded = loop {
                    match decoder.decode(&read_buf, req_arena) {
                        Ok(Decoded::Complete { request, consumed }) => {
                            break Ok((request, consumed))
                        }
                        Ok(Decoded::NeedMore) => {
                            // Never block on the socket with responses queued.
                            if !write_buf.is_empty() {
                                if let Err(e) = self.flush(stream, &mut write_buf).await {
                                    break Err(e);
                                }
                            }
                            if read_buf.len() >= buf_cap {
                                break Err(CloseReason::Failed(HttpError::RequestTooLarge));
                            }
                            // A partially received head gets the header
                            // deadline; the idle gap and body reads get the
                            // keep-alive deadline.
                            let deadline = if decoder.is_idle() && !read_buf.is_empty() {
                                self.config.timeout.read_header_timeout
                            } else {
                                self.config.timeout.keepalive_timeout
                            };
                            match read_some(stream, &mut read_buf, deadline).await {
                                Ok(0) => break Err(CloseReason::Done),
                                Ok(_) => {}
                                Err(e) => break Err(e),
                            }
                        }
                        Err(err) => break Err(CloseReason::Failed(err.into())),
                    }
                };

                match decoded {
                    Err(reason) => {
                        // Synthesize the failure-table response; silent
                        // kinds write nothing.
                        if let CloseReason::Failed(err) = &reason {
                            self.encoder.encode_error(err, &mut write_buf);
                        }
                        Step::Close(reason)
                    }
                    Ok((parsed, consumed)) => {
                        metrics::request_started();
                        let hint = parsed.keep_alive;
                        let mut req =
                            Request::from_parsed(parsed, peer, req_arena, drain.clone());
                        let mut keep = hint && self.config.keep_alive_enabled;

                        let failure =
                            match self.router.lookup(req.method(), req.path(), req_arena) {
                                Err(err) => Some(err),
                                Ok(MatchResult::NotFound) => Some(HttpError::NotFound),
                                Ok(MatchResult::MethodNotAllowed { allowed }) => {
                                    Some(HttpError::MethodNotAllowed(allowed))
                                }
                                Ok(MatchResult::Matched { route, params }) => {
                                    req.set_params(params);
                                    let mut resp = Response::new(resp_arena);
                                    let close = self
                                        .dispatch(route, &mut req, &mut resp, drain)
                                        .await;
                                    keep &= !close && !connection_close_requested(&resp);
                                    keep &= !drain.is_cancelled();
                                    if !keep {
                                        let _ = set_connection_close(&mut resp);
                                    }
                                    match self.encoder.encode(
                                        req.method(),
                                        &mut resp,
                                        &mut write_buf,
                                    ) {
                                        Ok(()) => None,
                                        Err(_) => Some(HttpError::HandlerFailure(
                                            anyhow::anyhow!("response already sent"),
                                        )),
                                    }
                                }
                            };

                        metrics::request_finished();
                        match failure {
                            None => Step::Answered { keep, consumed },
                            Some(err) => {
                                // Decoder/router failures bypass the chain.
                                self.encoder.encode_error(&err, &mut write_buf);
                                if err.closes_connection() {
                                    Step::Close(CloseReason::Failed(err))
                                } else {
                                    Step::Answered {
                                        keep: keep && !drain.is_cancelled(),
                                        consumed,
                                    }
                                }
                            }
                        }
                    }
                }
            };

            match step {
                Step::Close(reason) => {
                    let _ = self.flush(stream, &mut write_buf).await;
                    return reason;
                }
                Step::Answered { keep, consumed } => {
                    consume(&mut read_buf, consumed);
                    arenas.request.reset();
                    arenas.response.reset();
                    if !keep {
                        return match self.flush(stream, &mut write_buf).await {
                            Ok(()) => CloseReason::Done,
                            Err(reason) => reason,
                        };
                    }
                    // With no pipelined bytes waiting, flush now; otherwise
                    // keep batching within the queue bound.
                    if read_buf.is_empty() {
                        if let Err(reason) = self.flush(stream, &mut write_buf).await {
                            return reason;
                        }
                    }
                }
            }
        }
    }

    /// Run the effective chain and handler for a matched route, leaving the
    /// final response in `resp`. Returns whether the failure policy closes
    /// the connection.
    async fn dispatch(
        &self,
        route: &super::router::Route,
        req: &mut Request<'_>,
        resp: &mut Response<'_>,
        drain: &DrainFlag,
    ) -> bool {
        let mut ctx = Context::new(req.arena(), drain.clone());

        let failure = match route.chain().run_pre(req, &mut ctx) {
            Decision::Continue => match route.handler().invoke(req).await {
                Ok(outcome) => handler::marshal(outcome, resp).err(),
                Err(err) => Some(err),
            },
            Decision::ShortCircuit(outcome) => handler::marshal(outcome, resp).err(),
            Decision::Fail(err) => Some(HttpError::HandlerFailure(err)),
        };

        let close = match &failure {
            Some(err) => {
                warn!("request {} {} failed: {err}", req.method(), req.path());
                let status = err.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let _ = resp.set_status(status);
                let _ = resp.clear_body();
                err.closes_connection()
            }
            None => false,
        };

        // The post chain always runs, including over short-circuit
        // responses and engine-made 500s.
        route.chain().run_post(req, resp, &mut ctx);
        close
    }

    async fn flush(
        &self,
        stream: &mut TcpStream,
        write_buf: &mut Vec<u8>,
    ) -> Result<(), CloseReason> {
        if write_buf.is_empty() {
            return Ok(());
        }
        let owned = std::mem::take(write_buf);
        let write = stream.write_all(owned);
        let (result, mut owned) = match self.config.timeout.write_timeout {
            Some(deadline) => match monoio::time::timeout(deadline, write).await {
                Ok(done) => done,
                Err(_) => return Err(CloseReason::Failed(HttpError::Timeout)),
            },
            None => write.await,
        };
        match result {
            Ok(_) => {
                owned.clear();
                *write_buf = owned;
                Ok(())
            }
            Err(e) => Err(CloseReason::Io(e)),
        }
    }
}

enum Step {
    Answered { keep: bool, consumed: usize },
    Close(CloseReason),
}

/// Read into the spare capacity of `buf`, growing it geometrically; the
/// caller bounds total size before asking for more. 0 is EOF.
async fn read_some(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    deadline: Option<Duration>,
) -> Result<usize, CloseReason> {
    if buf.len() == buf.capacity() {
        buf.reserve(buf.capacity().max(1024));
    }
    let owned = std::mem::take(buf);
    let len = owned.len();
    let capacity = owned.capacity();
    let read = stream.read(owned.slice_mut(len..capacity));
    let (result, slice) = match deadline {
        Some(deadline) => match monoio::time::timeout(deadline, read).await {
            Ok(done) => done,
            Err(_) => return Err(CloseReason::Failed(HttpError::Timeout)),
        },
        None => read.await,
    };
    *buf = slice.into_inner();
    match result {
        Ok(n) => Ok(n),
        Err(e) => Err(CloseReason::Io(e)),
    }
}

/// Drop the first `consumed` bytes, keeping any pipelined remainder.
fn consume(buf: &mut Vec<u8>, consumed: usize) {
    if consumed == 0 {
        return;
    }
    let remaining = buf.len() - consumed;
    buf.copy_within(consumed.., 0);
    buf.truncate(remaining);
}

fn connection_close_requested(resp: &Response<'_>) -> bool {
    resp.headers()
        .get(CONNECTION)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(super::CLOSE.as_bytes()))
        .unwrap_or(false)
}

fn set_connection_close(resp: &mut Response<'_>) -> Result<(), super::response::ResponseError> {
    resp.insert_header(CONNECTION, HeaderValue::from_static(super::CLOSE))
}

impl From<ParseError> for HttpError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::BadRequest(reason) => HttpError::BadRequest(reason),
            ParseError::TooLarge => HttpError::RequestTooLarge,
            ParseError::Arena(e) => HttpError::AllocationExhausted(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_keeps_pipelined_remainder() {
        let mut buf = b"firstsecond".to_vec();
        consume(&mut buf, 5);
        assert_eq!(buf, b"second");
        consume(&mut buf, 6);
        assert!(buf.is_empty());
    }

    #[test]
    fn parse_errors_map_to_failure_table() {
        assert!(matches!(
            HttpError::from(ParseError::TooLarge),
            HttpError::RequestTooLarge
        ));
        assert!(matches!(
            HttpError::from(ParseError::BadRequest("x")),
            HttpError::BadRequest("x")
        ));
    }
}
