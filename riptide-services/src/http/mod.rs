//! The HTTP/1.1 data plane.
//!
//! Everything between the accepted TCP stream and the user handler lives
//! here: the incremental request decoder, the arena-backed request/response
//! model, the trie router, the middleware engine, the handler bridge and the
//! per-connection driver that strings them together.
//!
//! # Key Components
//!
//! - [`parser::RequestDecoder`]: byte stream → request, with head/body caps.
//! - [`router::Router`]: built once, then shared immutably by every worker.
//! - [`middleware`]: priority-ordered pre/post chains with short-circuiting.
//! - [`handler`]: the handler capability set and result marshalling.
//! - [`driver::HttpServerService`]: the per-connection event loop.
//!
//! # Error Handling
//!
//! Every cross-component failure is a variant of [`HttpError`]; the driver
//! owns the mapping to wire responses and the decision whether the
//! connection survives.

pub mod codec;
pub mod driver;
pub mod handler;
pub mod method;
pub mod middleware;
pub mod parser;
pub mod request;
pub mod response;
pub mod router;

use http::StatusCode;
use riptide_core::{memory::AllocationExhausted, AnyError};

pub use self::{
    driver::{DrainFlag, HttpConnConfig, HttpServerService, HttpServerTimeout},
    handler::{AsyncHandler, BodySource, Handler, HandlerFuture, Outcome},
    method::{HttpMethod, MethodSet},
    middleware::{Decision, Middleware, MiddlewareEntry, Phase},
    request::{CancelFlag, Context, CtxValue, ParamValue, PathParam, Request},
    response::{Body, Response, ResponseError},
    router::{MatchResult, RouteError, Router, RouterBuilder},
};

pub(crate) const CLOSE: &str = "close";
pub(crate) const KEEPALIVE: &str = "keep-alive";

/// The cross-component failure table.
///
/// Each variant carries its HTTP status (where one is sent at all) and the
/// policy for the connection afterwards; see [`HttpError::status`] and
/// [`HttpError::closes_connection`].
#[derive(thiserror::Error, Debug)]
pub enum HttpError {
    /// Malformed request line, bad percent-encoding, or a path escaping the
    /// root.
    #[error("bad request: {0}")]
    BadRequest(&'static str),

    /// No route accepts the path.
    #[error("not found")]
    NotFound,

    /// The path matched but the method did not; carries the methods that
    /// would have.
    #[error("method not allowed")]
    MethodNotAllowed(MethodSet),

    /// Reserved for body-negotiation failures surfaced by collaborators.
    #[error("unsupported media type")]
    UnsupportedMediaType,

    /// Request head or body over its cap.
    #[error("request too large")]
    RequestTooLarge,

    /// Handler or middleware failure (error return or caught panic).
    #[error("handler failure: {0}")]
    HandlerFailure(#[source] AnyError),

    /// A hot-path arena refused an allocation.
    #[error(transparent)]
    AllocationExhausted(#[from] AllocationExhausted),

    /// The bounded per-connection write queue overflowed.
    #[error("write backpressure")]
    Backpressure,

    /// A read or write deadline elapsed.
    #[error("timeout")]
    Timeout,
}

impl HttpError {
    /// Status code for the synthesized response, or `None` when the
    /// connection is dropped without one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::BadRequest(_) => Some(StatusCode::BAD_REQUEST),
            HttpError::NotFound => Some(StatusCode::NOT_FOUND),
            HttpError::MethodNotAllowed(_) => Some(StatusCode::METHOD_NOT_ALLOWED),
            HttpError::UnsupportedMediaType => Some(StatusCode::UNSUPPORTED_MEDIA_TYPE),
            HttpError::RequestTooLarge => Some(StatusCode::PAYLOAD_TOO_LARGE),
            HttpError::HandlerFailure(_) => Some(StatusCode::INTERNAL_SERVER_ERROR),
            HttpError::AllocationExhausted(_) => Some(StatusCode::INTERNAL_SERVER_ERROR),
            HttpError::Backpressure | HttpError::Timeout => None,
        }
    }

    /// Whether the connection is closed once the error is handled.
    pub fn closes_connection(&self) -> bool {
        match self {
            HttpError::NotFound
            | HttpError::MethodNotAllowed(_)
            | HttpError::UnsupportedMediaType
            | HttpError::HandlerFailure(_) => false,
            HttpError::BadRequest(_)
            | HttpError::RequestTooLarge
            | HttpError::AllocationExhausted(_)
            | HttpError::Backpressure
            | HttpError::Timeout => true,
        }
    }
}
