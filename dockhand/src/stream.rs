// Copyright 2024 Oxide Computer Company

//! Newline-delimited JSON progress streams
//!
//! Long-running operations (deploy, bind, unbind, add-units, run, ...) answer
//! with `Content-Type: application/x-json-stream` and a sequence of
//! [`StreamMessage`] lines.  The status code is sent with the first line, so
//! a failure that happens later can only be reported in-band: the stream ends
//! with a line whose `Error` field is set.  Clients use [`StreamDecoder`] to
//! turn the stream back into messages and to surface that error.
//!
//! Operations that may go quiet for a long time wrap their writer in a
//! [`KeepAlive`], which writes a harmless payload whenever the response has
//! been idle for a full interval, so that proxies don't time the connection
//! out.

use crate::error::HttpError;
use crate::response::ResponseWriter;
use bytes::Bytes;
use bytes::BytesMut;
use chrono::DateTime;
use chrono::Utc;
use futures::Stream;
use http::header;
use http::HeaderValue;
use http_body_util::BodyExt;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const CONTENT_TYPE_JSON_STREAM: &str = "application/x-json-stream";

/// One line of a progress stream.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StreamMessage {
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "Timestamp", default)]
    pub timestamp: DateTime<Utc>,
    #[serde(
        rename = "Error",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub error: String,
}

impl StreamMessage {
    pub fn message(message: impl Into<String>) -> Self {
        StreamMessage {
            message: message.into(),
            timestamp: Utc::now(),
            error: String::new(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        StreamMessage {
            message: String::new(),
            timestamp: Utc::now(),
            error: error.into(),
        }
    }

    /// Encodes the message as one line, newline included.
    pub fn to_line(&self) -> Result<Bytes, HttpError> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(Bytes::from(line))
    }
}

/// Writes progress messages to a response.
#[derive(Clone, Debug)]
pub struct JsonStreamWriter {
    writer: ResponseWriter,
}

impl JsonStreamWriter {
    /// Marks the response as a JSON stream.  This must happen before the
    /// first write.
    pub async fn start_stream(writer: &ResponseWriter) -> JsonStreamWriter {
        writer
            .set_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static(CONTENT_TYPE_JSON_STREAM),
            )
            .await;
        JsonStreamWriter { writer: writer.clone() }
    }

    pub async fn write_message(
        &self,
        message: impl Into<String>,
    ) -> Result<(), HttpError> {
        self.writer.write(StreamMessage::message(message).to_line()?).await
    }

    /// Reports a failure in-band.  Handlers that have started streaming call
    /// this and then return `Ok(())`: the status code is already on the wire.
    pub async fn write_error(
        &self,
        error: impl Into<String>,
    ) -> Result<(), HttpError> {
        self.writer.write(StreamMessage::error(error).to_line()?).await
    }

    pub fn writer(&self) -> &ResponseWriter {
        &self.writer
    }
}

/// A keep-alive ticker bound to one response.  It stops when released or
/// dropped; a handler holds it for exactly as long as it is working.
#[derive(Debug)]
pub struct KeepAlive {
    writer: ResponseWriter,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl KeepAlive {
    /// Starts writing `payload` (a newline if empty) to `writer` whenever it
    /// has seen no writes for `interval`.
    pub fn scoped(
        writer: &ResponseWriter,
        interval: Duration,
        payload: &str,
    ) -> KeepAlive {
        let payload = if payload.is_empty() {
            Bytes::from_static(b"\n")
        } else {
            Bytes::copy_from_slice(payload.as_bytes())
        };
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let ticker_writer = writer.clone();
        let task = tokio::spawn(async move {
            loop {
                let idle = ticker_writer.idle_for().await;
                if idle >= interval {
                    if ticker_writer.write(payload.clone()).await.is_err() {
                        // client is gone; nothing more to keep alive
                        return;
                    }
                    continue;
                }
                tokio::select! {
                    _ = &mut stop_rx => return,
                    _ = tokio::time::sleep(interval - idle) => {}
                }
            }
        });
        KeepAlive {
            writer: writer.clone(),
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    pub fn writer(&self) -> &ResponseWriter {
        &self.writer
    }

    /// Stops the ticker and waits for it to exit.  No keep-alive is written
    /// after this returns.
    pub async fn release(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum StreamError {
    /// the server reported a failure in-band
    #[error("{0}")]
    Remote(String),
    #[error("Unparseable chunk: {0:?}")]
    Unparseable(String),
    #[error("error reading stream: {0}")]
    Transport(String),
}

/// Incrementally decodes a progress stream.  Input may be split anywhere;
/// blank lines (keep-alives) are skipped.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: BytesMut,
}

impl StreamDecoder {
    pub fn new() -> Self {
        StreamDecoder::default()
    }

    /// Feeds `data` and returns the messages completed by it.  Stops at the
    /// first in-band error.
    pub fn feed(
        &mut self,
        data: &[u8],
    ) -> Result<Vec<StreamMessage>, StreamError> {
        self.pending.extend_from_slice(data);
        let mut messages = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n')
        {
            let line = self.pending.split_to(newline + 1);
            if let Some(message) = decode_line(&line[..newline])? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Decodes whatever is left once the input has ended.
    pub fn finish(mut self) -> Result<Option<StreamMessage>, StreamError> {
        let rest = self.pending.split();
        decode_line(&rest)
    }

    /// Decodes a complete stream.
    pub fn decode_all(data: &[u8]) -> Result<Vec<StreamMessage>, StreamError> {
        let mut decoder = StreamDecoder::new();
        let mut messages = decoder.feed(data)?;
        messages.extend(decoder.finish()?);
        Ok(messages)
    }

    /// Turns an HTTP body into a stream of messages.
    pub fn messages<B>(
        body: B,
    ) -> impl Stream<Item = Result<StreamMessage, StreamError>>
    where
        B: hyper::body::Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Display,
    {
        async_stream::try_stream! {
            let mut body = body;
            let mut decoder = StreamDecoder::new();
            while let Some(frame) = body.frame().await {
                let frame = frame
                    .map_err(|e| StreamError::Transport(e.to_string()))?;
                if let Ok(data) = frame.into_data() {
                    for message in decoder.feed(&data)? {
                        yield message;
                    }
                }
            }
            if let Some(message) = decoder.finish()? {
                yield message;
            }
        }
    }
}

fn decode_line(line: &[u8]) -> Result<Option<StreamMessage>, StreamError> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let message: StreamMessage = serde_json::from_slice(line).map_err(|_| {
        StreamError::Unparseable(String::from_utf8_lossy(line).into_owned())
    })?;
    if !message.error.is_empty() {
        return Err(StreamError::Remote(message.error));
    }
    Ok(Some(message))
}
