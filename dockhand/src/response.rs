// Copyright 2024 Oxide Computer Company

//! The response writer handed to middleware and handlers
//!
//! Handlers don't return a response; they write one.  A [`ResponseWriter`]
//! buffers the status, headers and body until the first flush, at which point
//! the response head is handed to hyper and the rest of the body streams
//! through a channel.  A response that is never flushed goes out whole when
//! the request finishes, with a `Content-Length`.
//!
//! All access goes through one async mutex, so writes from a handler and from
//! a keep-alive ticker never interleave within a chunk.  Whether any body
//! bytes were written is tracked separately so that it can be read without
//! taking the lock; the error middleware relies on it to decide between
//! sending an error status and appending an error to the stream.

use crate::body::Body;
use crate::error::HttpError;
use bytes::Bytes;
use bytes::BytesMut;
use http::header;
use http::HeaderMap;
use http::HeaderName;
use http::HeaderValue;
use http::StatusCode;
use hyper::Response;
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const CONTENT_TYPE_JSON: &str = "application/json";

const BODY_CHANNEL_DEPTH: usize = 32;

/// When buffered body bytes are pushed to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushPolicy {
    /// only on an explicit `flush()` or when the request completes
    Buffered,
    /// after every write
    EveryWrite,
    /// after a write once this much time has passed since the last flush,
    /// and otherwise at most this long after the write
    MaxLatency(Duration),
}

struct WriterState {
    status: StatusCode,
    headers: HeaderMap,
    buffer: BytesMut,
    policy: FlushPolicy,
    last_flush: Instant,
    last_write: Instant,
    flush_scheduled: bool,
    head_tx: Option<oneshot::Sender<Response<Body>>>,
    body_tx: Option<mpsc::Sender<Bytes>>,
}

/// A cheaply cloneable handle on one in-progress response.
#[derive(Clone)]
pub struct ResponseWriter {
    state: Arc<Mutex<WriterState>>,
    wrote: Arc<AtomicBool>,
    closed_tx: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("wrote", &self.wrote())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ResponseWriter {
    /// Creates a writer and the receiving end that yields the response once
    /// the writer commits it.
    pub fn new() -> (ResponseWriter, oneshot::Receiver<Response<Body>>) {
        let (head_tx, head_rx) = oneshot::channel();
        let now = Instant::now();
        let (closed_tx, _) = watch::channel(false);
        let writer = ResponseWriter {
            state: Arc::new(Mutex::new(WriterState {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                buffer: BytesMut::new(),
                policy: FlushPolicy::Buffered,
                last_flush: now,
                last_write: now,
                flush_scheduled: false,
                head_tx: Some(head_tx),
                body_tx: None,
            })),
            wrote: Arc::new(AtomicBool::new(false)),
            closed_tx: Arc::new(closed_tx),
        };
        (writer, head_rx)
    }

    /// Returns true once any body bytes have been written.
    pub fn wrote(&self) -> bool {
        self.wrote.load(Ordering::SeqCst)
    }

    /// Returns true once the head has been handed off.  After that the status
    /// and headers can no longer change.
    pub async fn committed(&self) -> bool {
        self.state.lock().await.head_tx.is_none()
    }

    pub async fn status(&self) -> StatusCode {
        self.state.lock().await.status
    }

    /// Sets the status code.  Ignored once the response is committed.
    pub async fn write_status(&self, status: StatusCode) {
        let mut state = self.state.lock().await;
        if state.head_tx.is_some() {
            state.status = status;
        }
    }

    /// Sets a response header.  Ignored once the response is committed.
    pub async fn set_header(&self, name: HeaderName, value: HeaderValue) {
        let mut state = self.state.lock().await;
        if state.head_tx.is_some() {
            state.headers.insert(name, value);
        }
    }

    /// Returns a response header.  After the commit this is the value that
    /// was sent.
    pub async fn header(&self, name: &HeaderName) -> Option<HeaderValue> {
        self.state.lock().await.headers.get(name).cloned()
    }

    pub async fn content_type(&self) -> Option<String> {
        self.header(&header::CONTENT_TYPE)
            .await
            .and_then(|v| v.to_str().ok().map(str::to_string))
    }

    pub async fn set_flush_policy(&self, policy: FlushPolicy) {
        self.state.lock().await.policy = policy;
    }

    /// Appends `data` to the body, flushing according to the flush policy.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), HttpError> {
        let data = data.into();
        if data.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        state.buffer.extend_from_slice(&data);
        state.last_write = Instant::now();
        self.wrote.store(true, Ordering::SeqCst);
        let policy = state.policy;
        match policy {
            FlushPolicy::Buffered => Ok(()),
            FlushPolicy::EveryWrite => self.flush_locked(&mut state).await,
            FlushPolicy::MaxLatency(latency) => {
                if state.last_flush.elapsed() >= latency {
                    return self.flush_locked(&mut state).await;
                }
                if !state.flush_scheduled {
                    state.flush_scheduled = true;
                    let due = state.last_flush + latency;
                    let writer = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep_until(due).await;
                        let mut state = writer.state.lock().await;
                        state.flush_scheduled = false;
                        let _ = writer.flush_locked(&mut state).await;
                    });
                }
                Ok(())
            }
        }
    }

    /// Serializes `value` as one JSON document followed by a newline.  Sets the
    /// content type to `application/json` unless one is already set.
    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> Result<(), HttpError> {
        let mut data = serde_json::to_vec(value)?;
        data.push(b'\n');
        {
            let mut state = self.state.lock().await;
            if state.head_tx.is_some()
                && !state.headers.contains_key(header::CONTENT_TYPE)
            {
                state.headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(CONTENT_TYPE_JSON),
                );
            }
        }
        self.write(data).await
    }

    /// Commits the response head (if not yet committed) and pushes any
    /// buffered bytes to the client.
    pub async fn flush(&self) -> Result<(), HttpError> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await
    }

    async fn flush_locked(
        &self,
        state: &mut WriterState,
    ) -> Result<(), HttpError> {
        state.last_flush = Instant::now();
        if let Some(head_tx) = state.head_tx.take() {
            let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
            let closed_tx = Arc::clone(&self.closed_tx);
            let body = Body::channel(body_rx, move || {
                closed_tx.send_replace(true);
            });
            let mut response = Response::new(body);
            *response.status_mut() = state.status;
            *response.headers_mut() = state.headers.clone();
            if head_tx.send(response).is_err() {
                self.mark_closed();
                return Err(client_gone());
            }
            state.body_tx = Some(body_tx);
        }
        if state.buffer.is_empty() {
            return Ok(());
        }
        let chunk = state.buffer.split().freeze();
        let sent = match &state.body_tx {
            Some(body_tx) => body_tx.send(chunk).await.is_ok(),
            None => false,
        };
        if sent {
            Ok(())
        } else {
            self.mark_closed();
            Err(client_gone())
        }
    }

    /// Replaces whatever was buffered with a complete response.  Returns false
    /// (and changes nothing) if the response was already committed.
    pub async fn send_complete(
        &self,
        status: StatusCode,
        content_type: &'static str,
        body: impl Into<Bytes>,
    ) -> bool {
        let mut state = self.state.lock().await;
        if state.head_tx.is_none() {
            return false;
        }
        state.status = status;
        state.headers.remove(header::CONTENT_LENGTH);
        state.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(content_type),
        );
        state.buffer.clear();
        state.buffer.extend_from_slice(&body.into());
        true
    }

    /// Completes the response.  An uncommitted response goes out whole;
    /// a streamed one gets its remaining bytes and end of stream.
    pub async fn finish(&self) {
        let mut state = self.state.lock().await;
        state.policy = FlushPolicy::Buffered;
        if let Some(head_tx) = state.head_tx.take() {
            let body = state.buffer.split().freeze();
            let mut response = if body.is_empty() {
                Response::new(Body::empty())
            } else {
                Response::new(Body::with_content(body))
            };
            *response.status_mut() = state.status;
            *response.headers_mut() = state.headers.clone();
            if head_tx.send(response).is_err() {
                self.mark_closed();
            }
            return;
        }
        if !state.buffer.is_empty() {
            let _ = self.flush_locked(&mut state).await;
        }
        state.body_tx = None;
    }

    /// How long since the last body write (or since the writer was created).
    pub async fn idle_for(&self) -> Duration {
        self.state.lock().await.last_write.elapsed()
    }

    /// Records that the client is gone.
    pub(crate) fn mark_closed(&self) {
        self.closed_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Resolves once the client has gone away or the response body has been
    /// fully handed to the connection.  Long-lived streams (log followers)
    /// use this to stop.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        // The sender lives as long as `self`, so this can't fail.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

fn client_gone() -> HttpError {
    HttpError::for_internal_error("client disconnected".to_string())
}
