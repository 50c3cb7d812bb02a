//! The response model.
//!
//! A [`Response`] is mutable until it is handed to the connection writer;
//! the `sent` latch flips exactly once and every mutation afterwards fails
//! with [`ResponseError::AlreadySent`]. Bodies are either a buffer in the
//! response arena, a `'static` constant, or a chunk producer that opted into
//! chunked transfer.

use bytes::Bytes;
use http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use riptide_core::memory::{AllocationExhausted, Arena};

#[derive(thiserror::Error, Debug)]
pub enum ResponseError {
    #[error("response already sent")]
    AlreadySent,
    #[error(transparent)]
    Arena(#[from] AllocationExhausted),
}

/// A chunk producer for chunked transfer encoding. Yields chunks until
/// `None`; the encoder writes the terminating zero chunk.
pub type ChunkProducer = Box<dyn FnMut() -> Option<Bytes>>;

pub enum Body<'a> {
    Empty,
    /// A buffer owned by the response arena.
    Arena(&'a [u8]),
    /// A process-lifetime constant.
    Static(&'static [u8]),
    /// A producer that opted into chunked transfer.
    Chunked(ChunkProducer),
}

impl Body<'_> {
    /// Length when known; `None` for chunked bodies.
    pub fn len(&self) -> Option<usize> {
        match self {
            Body::Empty => Some(0),
            Body::Arena(b) => Some(b.len()),
            Body::Static(b) => Some(b.len()),
            Body::Chunked(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.len(), Some(0))
    }
}

pub struct Response<'a> {
    status: StatusCode,
    headers: HeaderMap,
    body: Body<'a>,
    sent: bool,
    arena: &'a Arena,
}

impl<'a> Response<'a> {
    pub fn new(arena: &'a Arena) -> Self {
        Response {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Body::Empty,
            sent: false,
            arena,
        }
    }

    pub fn with_status(arena: &'a Arena, status: StatusCode) -> Self {
        let mut resp = Self::new(arena);
        resp.status = status;
        resp
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// The response arena; middleware replacing the body allocates here.
    pub fn arena(&self) -> &'a Arena {
        self.arena
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<(), ResponseError> {
        self.check_unsent()?;
        self.status = status;
        Ok(())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> Result<&mut HeaderMap, ResponseError> {
        self.check_unsent()?;
        Ok(&mut self.headers)
    }

    pub fn insert_header(
        &mut self,
        name: HeaderName,
        value: HeaderValue,
    ) -> Result<(), ResponseError> {
        self.check_unsent()?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Copy `bytes` into the response arena and make it the body.
    pub fn set_body_bytes(&mut self, bytes: &[u8]) -> Result<(), ResponseError> {
        self.check_unsent()?;
        self.body = Body::Arena(self.arena.alloc_bytes(bytes)?);
        Ok(())
    }

    /// Use a buffer already living in the response arena as the body.
    pub fn set_body_arena(&mut self, bytes: &'a [u8]) -> Result<(), ResponseError> {
        self.check_unsent()?;
        self.body = Body::Arena(bytes);
        Ok(())
    }

    pub fn set_body_static(&mut self, bytes: &'static [u8]) -> Result<(), ResponseError> {
        self.check_unsent()?;
        self.body = Body::Static(bytes);
        Ok(())
    }

    /// Opt into chunked transfer with a chunk producer.
    pub fn set_body_chunked(&mut self, producer: ChunkProducer) -> Result<(), ResponseError> {
        self.check_unsent()?;
        self.body = Body::Chunked(producer);
        Ok(())
    }

    pub fn clear_body(&mut self) -> Result<(), ResponseError> {
        self.check_unsent()?;
        self.body = Body::Empty;
        Ok(())
    }

    pub fn body(&self) -> &Body<'a> {
        &self.body
    }

    /// `Content-Length` the encoder will emit; `None` for chunked bodies.
    pub fn content_length(&self) -> Option<usize> {
        self.body.len()
    }

    pub(crate) fn body_mut(&mut self) -> &mut Body<'a> {
        &mut self.body
    }

    pub(crate) fn mark_sent(&mut self) {
        debug_assert!(!self.sent, "a response is sent exactly once");
        self.sent = true;
    }

    fn check_unsent(&self) -> Result<(), ResponseError> {
        if self.sent {
            return Err(ResponseError::AlreadySent);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use riptide_core::memory::ArenaKind;

    use super::*;

    fn arena() -> Arena {
        Arena::new(ArenaKind::Response, 4096, 1 << 20)
    }

    #[test]
    fn body_is_copied_into_the_arena() {
        let arena = arena();
        let mut resp = Response::new(&arena);
        let transient = b"hello".to_vec();
        resp.set_body_bytes(&transient).unwrap();
        drop(transient);
        match resp.body() {
            Body::Arena(b) => assert_eq!(*b, b"hello"),
            _ => panic!("expected arena body"),
        }
        assert_eq!(resp.content_length(), Some(5));
        assert!(arena.used() >= 5);
    }

    #[test]
    fn sent_latch_rejects_mutation() {
        let arena = arena();
        let mut resp = Response::new(&arena);
        resp.set_status(StatusCode::CREATED).unwrap();
        resp.mark_sent();
        assert!(matches!(
            resp.set_status(StatusCode::OK),
            Err(ResponseError::AlreadySent)
        ));
        assert!(matches!(
            resp.headers_mut(),
            Err(ResponseError::AlreadySent)
        ));
        assert!(matches!(
            resp.set_body_bytes(b"x"),
            Err(ResponseError::AlreadySent)
        ));
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    #[test]
    fn chunked_body_has_no_length() {
        let arena = arena();
        let mut resp = Response::new(&arena);
        let mut chunks = vec![Bytes::from_static(b"b"), Bytes::from_static(b"a")];
        resp.set_body_chunked(Box::new(move || chunks.pop())).unwrap();
        assert_eq!(resp.content_length(), None);
    }
}
