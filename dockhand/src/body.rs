// Copyright 2024 Oxide Computer Company

use std::pin::Pin;
use std::task::{Context, Poll};

use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body as HttpBody, Bytes, Frame};
use tokio::sync::mpsc;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A body type for both requests and responses.
#[derive(Debug)]
pub struct Body {
    inner: BoxBody<Bytes, BoxError>,
}

impl Body {
    /// Create an empty body.
    pub fn empty() -> Self {
        let inner = http_body_util::Empty::new()
            .map_err(|never| match never {})
            .boxed();
        Body { inner }
    }

    /// Create a body with content from a specific buffer.
    pub fn with_content(buf: impl Into<Bytes>) -> Self {
        let inner = http_body_util::Full::new(buf.into())
            .map_err(|never| match never {})
            .boxed();
        Body { inner }
    }

    /// Wrap any body (e.g., hyper's `Incoming`).
    pub fn wrap<B>(under: B) -> Self
    where
        B: HttpBody<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let inner = under.map_err(Into::into).boxed();
        Body { inner }
    }

    /// Create a streaming body fed by `rx`.  The body ends when every sender
    /// is gone.  `on_drop` runs when hyper drops the body, whether or not the
    /// stream finished; the response writer uses it to learn about client
    /// disconnects.
    pub(crate) fn channel<F>(rx: mpsc::Receiver<Bytes>, on_drop: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        let hook: DropHook = Box::new(on_drop);
        let run: fn(DropHook) = |f| f();
        Body::wrap(ChannelBody { rx, _guard: scopeguard::guard(hook, run) })
    }

    /// Read the whole body, failing once more than `cap` bytes arrive.
    pub(crate) async fn collect_capped(
        mut self,
        cap: usize,
    ) -> Result<Bytes, crate::HttpError> {
        let mut buf = bytes::BytesMut::new();
        while let Some(frame) = self.inner.frame().await {
            let frame = frame.map_err(|e| {
                crate::HttpError::for_bad_request(format!(
                    "error reading request body: {}",
                    e
                ))
            })?;
            if let Ok(data) = frame.into_data() {
                if buf.len() + data.len() > cap {
                    return Err(crate::HttpError::for_bad_request(format!(
                        "request body exceeded maximum size of {} bytes",
                        cap
                    )));
                }
                buf.extend_from_slice(&data);
            }
        }
        Ok(buf.freeze())
    }
}

type DropHook = Box<dyn FnOnce() + Send + Sync>;

struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
    _guard: scopeguard::ScopeGuard<DropHook, fn(DropHook)>,
}

impl HttpBody for ChannelBody {
    type Data = Bytes;
    type Error = std::convert::Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(|c| Ok(Frame::data(c))))
    }
}

impl Default for Body {
    fn default() -> Body {
        Body::empty()
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Body {
        Body::with_content(b)
    }
}

impl From<Vec<u8>> for Body {
    fn from(s: Vec<u8>) -> Body {
        Body::with_content(s)
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body::with_content(s)
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body::with_content(s)
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = BoxError;

    #[inline]
    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    #[inline]
    fn size_hint(&self) -> hyper::body::SizeHint {
        self.inner.size_hint()
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }
}
