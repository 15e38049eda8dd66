//! Request and response bodies.
//!
//! [`Body`] is the response side: a `Stream`-and-`http_body::Body`
//! hybrid so the handler plugs into frameworks of either persuasion.
//!
//! Requests come in through [`RequestBody`], which owns the intake
//! rules for the whole crate: every chunk read runs under the
//! configured idle timeout, and buffered reads are bounded. PUT
//! consumes chunks one at a time, every other verb drains the body up
//! front.

use std::error::Error as StdError;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use futures_util::stream::{BoxStream, Stream};
use http::header::HeaderMap;
use http::StatusCode;
use http_body::Body as HttpBody;
use pin_project::pin_project;

use crate::errors::DavError;
use crate::DavResult;

/// Body is returned by the webdav handler, and implements both `Stream`
/// and `http_body::Body`.
pub struct Body {
    inner: BodyType,
}

enum BodyType {
    Bytes(Option<Bytes>),
    Stream(BoxStream<'static, Result<Bytes, io::Error>>),
}

impl Body {
    /// Return an empty body.
    pub fn empty() -> Body {
        Body {
            inner: BodyType::Bytes(None),
        }
    }

    /// Create a body from a stream.
    pub fn stream(stream: impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static) -> Body {
        Body {
            inner: BodyType::Stream(Box::pin(stream)),
        }
    }

    /// Is this a statically known empty body.
    pub(crate) fn is_empty(&self) -> bool {
        match &self.inner {
            BodyType::Bytes(b) => b.as_ref().map(|b| b.is_empty()).unwrap_or(true),
            BodyType::Stream(_) => false,
        }
    }
}

impl Stream for Body {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        match &mut self.inner {
            BodyType::Bytes(bytes) => Poll::Ready(bytes.take().map(Ok)),
            BodyType::Stream(stream) => stream.as_mut().poll_next(cx),
        }
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        self.poll_next(cx)
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        _cx: &mut Context,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        Poll::Ready(Ok(None))
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Body {
        Body {
            inner: BodyType::Bytes(Some(b)),
        }
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Bytes::from(s).into()
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Body {
        Bytes::copy_from_slice(s.as_bytes()).into()
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Body {
        Bytes::from(v).into()
    }
}

/// The incoming request body, wrapped with the crate's intake rules.
///
/// A peer that stops sending mid-body fires the idle timeout rather
/// than parking the handler forever; the timer re-arms on every chunk,
/// so slow-but-moving uploads are fine.
pub(crate) struct RequestBody<B> {
    body: Pin<Box<B>>,
    idle: Duration,
}

impl<B, D, E> RequestBody<B>
where
    B: HttpBody<Data = D, Error = E>,
    D: Buf + Send + 'static,
    E: StdError + Send + Sync + 'static,
{
    pub fn new(body: B, idle: Duration) -> RequestBody<B> {
        RequestBody {
            body: Box::pin(body),
            idle,
        }
    }

    /// The next chunk, or None at the end of the body.
    ///
    /// A stalled peer becomes `DavError::Timeout` (408 upstream); a
    /// transport error becomes an unexpected-eof IO error, which also
    /// poisons the connection.
    pub async fn chunk(&mut self) -> DavResult<Option<D>> {
        match tokio::time::timeout(self.idle, self.body.as_mut().data()).await {
            Err(_) => Err(DavError::Timeout),
            Ok(None) => Ok(None),
            Ok(Some(Err(_))) => Err(DavError::IoError(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "UnexpectedEof",
            ))),
            Ok(Some(Ok(data))) => Ok(Some(data)),
        }
    }

    /// Drain the whole body into one buffer, refusing anything over
    /// `max_size`. This is how the XML verbs read their input.
    pub async fn read_to_end(&mut self, max_size: usize) -> DavResult<Vec<u8>> {
        let mut data = Vec::new();
        while let Some(mut buf) = self.chunk().await? {
            while buf.has_remaining() {
                if data.len() + buf.remaining() > max_size {
                    return Err(StatusCode::PAYLOAD_TOO_LARGE.into());
                }
                let b = buf.chunk();
                let l = b.len();
                data.extend_from_slice(b);
                buf.advance(l);
            }
        }
        Ok(data)
    }
}

// A struct that contains a Stream, and implements http_body::Body.
// Used to adapt frameworks that hand us a plain Stream.
#[pin_project]
pub(crate) struct StreamBody<B> {
    #[pin]
    body: B,
}

impl<ReqBody, ReqData, ReqError> HttpBody for StreamBody<ReqBody>
where
    ReqData: Buf + Send,
    ReqError: StdError + Send + Sync + 'static,
    ReqBody: Stream<Item = Result<ReqData, ReqError>>,
{
    type Data = ReqData;
    type Error = ReqError;

    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        let this = self.project();
        this.body.poll_next(cx)
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        _cx: &mut Context,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        Poll::Ready(Ok(None))
    }
}

impl<ReqBody, ReqData, ReqError> StreamBody<ReqBody>
where
    ReqData: Buf + Send,
    ReqError: StdError + Send + Sync + 'static,
    ReqBody: Stream<Item = Result<ReqData, ReqError>>,
{
    pub fn new(body: ReqBody) -> StreamBody<ReqBody> {
        StreamBody { body }
    }
}
