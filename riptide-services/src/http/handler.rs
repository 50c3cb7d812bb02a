//! The handler capability set and result marshalling.
//!
//! Handlers are opaque references stored in the route table; the bridge here
//! owns the dispatch. A handler is either a plain synchronous function or an
//! [`AsyncHandler`] whose future the connection suspends on. Either flavor
//! returns an [`Outcome`] (status, optional content-type hint, body) which
//! [`marshal`] turns into the response, copying transient buffers into the
//! response arena.
//!
//! Panics from either flavor are caught and funneled into
//! [`HttpError::HandlerFailure`], the only place arbitrary collaborator
//! failure enters the error table.

use std::{
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
};

use futures_util::FutureExt;
use http::{
    header::{HeaderName, CONTENT_TYPE},
    HeaderValue, StatusCode,
};
use riptide_core::AnyError;

use super::{
    request::Request,
    response::{ChunkProducer, Response, ResponseError},
    HttpError,
};

/// Body forms a handler may hand back.
pub enum BodySource {
    None,
    /// A process-lifetime constant; written without copying.
    Static(&'static [u8]),
    /// A transient buffer; the bridge copies it into the response arena.
    Owned(Vec<u8>),
    /// Opt into chunked transfer.
    Chunked(ChunkProducer),
}

/// What a handler produced, before marshalling into the response.
pub struct Outcome {
    pub status: StatusCode,
    /// Populated into `Content-Type` if the response does not set one.
    pub content_type: Option<HeaderValue>,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: BodySource,
}

impl std::fmt::Debug for BodySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodySource::None => f.write_str("BodySource::None"),
            BodySource::Static(s) => f.debug_tuple("BodySource::Static").field(s).finish(),
            BodySource::Owned(v) => f.debug_tuple("BodySource::Owned").field(v).finish(),
            BodySource::Chunked(_) => f.write_str("BodySource::Chunked(..)"),
        }
    }
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outcome")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

impl Outcome {
    pub fn empty(status: StatusCode) -> Self {
        Outcome {
            status,
            content_type: None,
            headers: Vec::new(),
            body: BodySource::None,
        }
    }

    pub fn bytes(body: Vec<u8>) -> Self {
        Outcome {
            status: StatusCode::OK,
            content_type: None,
            headers: Vec::new(),
            body: BodySource::Owned(body),
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Outcome {
            status: StatusCode::OK,
            content_type: Some(HeaderValue::from_static("text/plain; charset=utf-8")),
            headers: Vec::new(),
            body: BodySource::Owned(body.into().into_bytes()),
        }
    }

    pub fn json_static(body: &'static [u8]) -> Self {
        Outcome {
            status: StatusCode::OK,
            content_type: Some(HeaderValue::from_static("application/json")),
            headers: Vec::new(),
            body: BodySource::Static(body),
        }
    }

    pub fn json(body: Vec<u8>) -> Self {
        Outcome {
            status: StatusCode::OK,
            content_type: Some(HeaderValue::from_static("application/json")),
            headers: Vec::new(),
            body: BodySource::Owned(body),
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }
}

pub type HandlerFuture<'r> = Pin<Box<dyn Future<Output = Result<Outcome, AnyError>> + 'r>>;

/// An asynchronous handler. The returned future may borrow the request; the
/// connection is suspended on it and response ordering within the connection
/// is preserved.
pub trait AsyncHandler: Send + Sync {
    fn call<'r>(&self, req: &'r mut Request<'_>) -> HandlerFuture<'r>;
}

type SyncHandlerFn = Box<dyn Fn(&mut Request<'_>) -> Result<Outcome, AnyError> + Send + Sync>;

/// The handler capability set: one concrete variant per collaborator flavor.
pub enum Handler {
    Sync(SyncHandlerFn),
    Async(Box<dyn AsyncHandler>),
}

impl Handler {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&mut Request<'_>) -> Result<Outcome, AnyError> + Send + Sync + 'static,
    {
        Handler::Sync(Box::new(f))
    }

    pub fn from_async(handler: impl AsyncHandler + 'static) -> Self {
        Handler::Async(Box::new(handler))
    }

    /// Invoke the handler, catching panics from either flavor.
    pub async fn invoke(&self, req: &mut Request<'_>) -> Result<Outcome, HttpError> {
        let result = match self {
            Handler::Sync(f) => match catch_unwind(AssertUnwindSafe(|| f(req))) {
                Ok(result) => result,
                Err(panic) => Err(anyhow::anyhow!("handler panicked: {}", panic_message(&panic))),
            },
            Handler::Async(h) => match AssertUnwindSafe(h.call(req)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(anyhow::anyhow!("handler panicked: {}", panic_message(&panic))),
            },
        };
        result.map_err(HttpError::HandlerFailure)
    }
}

/// Marshal a handler outcome into the response: status, extra headers,
/// content-type hint when unset, body into the response arena.
pub fn marshal(outcome: Outcome, resp: &mut Response<'_>) -> Result<(), HttpError> {
    let apply = |resp: &mut Response<'_>| -> Result<(), ResponseError> {
        resp.set_status(outcome.status)?;
        for (name, value) in outcome.headers {
            resp.headers_mut()?.append(name, value);
        }
        if let Some(ct) = outcome.content_type {
            if !resp.headers().contains_key(CONTENT_TYPE) {
                resp.insert_header(CONTENT_TYPE, ct)?;
            }
        }
        match outcome.body {
            BodySource::None => {}
            BodySource::Static(b) => resp.set_body_static(b)?,
            BodySource::Owned(b) => resp.set_body_bytes(&b)?,
            BodySource::Chunked(p) => resp.set_body_chunked(p)?,
        }
        Ok(())
    };
    apply(resp).map_err(|e| match e {
        ResponseError::AlreadySent => {
            HttpError::HandlerFailure(anyhow::anyhow!("response already sent"))
        }
        ResponseError::Arena(e) => HttpError::AllocationExhausted(e),
    })
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "opaque panic payload"
    }
}
