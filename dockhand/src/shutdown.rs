// Copyright 2024 Oxide Computer Company

//! Graceful shutdown
//!
//! Anything that needs a chance to wind down before the process exits
//! (connections, log followers, background workers owned by the consumer)
//! implements [`Shutdownable`] and registers with the server's
//! [`ShutdownRegistry`].  When the server closes, every registered object is
//! shut down concurrently under one deadline.

use crate::response::ResponseWriter;

use async_trait::async_trait;
use futures::future::join_all;
use futures::future::Either;
use hyper_util::server::graceful::GracefulConnection;
use hyper_util::server::graceful::GracefulShutdown;
use slog::Logger;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Something that can be asked to stop.
#[async_trait]
pub trait Shutdownable: Send + Sync + 'static {
    /// A short name for logs.
    fn name(&self) -> String;

    /// Stops the object.  Resolves once it has stopped; the registry gives up
    /// waiting at its deadline.
    async fn shutdown(&self);
}

/// The set of objects to shut down when the server closes.
///
/// Registration is append-only.  Shutdown happens at most once: the first
/// call to [`ShutdownRegistry::shutdown_all`] does the work and later calls
/// return immediately.  Objects registered after that are never shut down.
#[derive(Default)]
pub struct ShutdownRegistry {
    targets: Mutex<Vec<Arc<dyn Shutdownable>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for ShutdownRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownRegistry")
            .field("targets", &self.targets.lock().unwrap().len())
            .field("started", &self.is_shut_down())
            .finish()
    }
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        ShutdownRegistry::default()
    }

    pub fn register(&self, target: Arc<dyn Shutdownable>) {
        self.targets.lock().unwrap().push(target);
    }

    /// Returns true once shutdown has begun.
    pub fn is_shut_down(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Shuts down every registered object concurrently, waiting at most
    /// `deadline` for all of them.  Returns the names of the objects that
    /// were still going at the deadline.
    pub async fn shutdown_all(
        &self,
        deadline: Duration,
        log: &Logger,
    ) -> Vec<String> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!(log, "shutdown already performed");
            return Vec::new();
        }

        let targets = self.targets.lock().unwrap().clone();
        let until = Instant::now() + deadline;
        let results = join_all(targets.iter().map(|target| async move {
            let name = target.name();
            debug!(log, "shutting down"; "target" => &name);
            let done =
                tokio::time::timeout_at(until, target.shutdown()).await.is_ok();
            (name, done)
        }))
        .await;

        let mut timed_out = Vec::new();
        for (name, done) in results {
            if done {
                info!(log, "shutdown complete"; "target" => &name);
            } else {
                warn!(log, "timed out waiting for shutdown";
                    "target" => &name,
                    "deadline_ms" => deadline.as_millis(),
                );
                timed_out.push(name);
            }
        }
        timed_out
    }
}

/// Tracks the server's open connections.
///
/// Shutting down closes idle keep-alive connections right away and lets
/// connections with a request in progress finish that request first.
pub struct ConnectionTracker {
    graceful: Mutex<Option<GracefulShutdown>>,
    open: Arc<AtomicUsize>,
    abort_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("open", &self.open_connections())
            .finish_non_exhaustive()
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        ConnectionTracker {
            graceful: Mutex::new(Some(GracefulShutdown::new())),
            open: Arc::new(AtomicUsize::new(0)),
            abort_tx: watch::channel(false).0,
        }
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        ConnectionTracker::default()
    }

    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Wraps a connection future so that shutdown can reach it.  Connections
    /// that arrive after shutdown are served unwatched.
    pub(crate) fn watch<C>(
        &self,
        conn: C,
    ) -> impl Future<Output = C::Output> + Send
    where
        C: GracefulConnection + Send,
        C::Error: Send,
    {
        let conn = match &*self.graceful.lock().unwrap() {
            Some(graceful) => Either::Left(graceful.watch(conn)),
            None => Either::Right(conn),
        };
        let open = Arc::clone(&self.open);
        open.fetch_add(1, Ordering::SeqCst);
        let mut abort_rx = self.abort_tx.subscribe();
        async move {
            let _open = scopeguard::guard(open, |open| {
                open.fetch_sub(1, Ordering::SeqCst);
            });
            tokio::select! {
                result = conn => result,
                Ok(_) = abort_rx.wait_for(|aborted| *aborted) => Ok(()),
            }
        }
    }

    /// Drops every open connection, finished or not.
    pub(crate) fn abort(&self) {
        self.abort_tx.send_replace(true);
    }
}

#[async_trait]
impl Shutdownable for ConnectionTracker {
    fn name(&self) -> String {
        String::from("connections")
    }

    async fn shutdown(&self) {
        let graceful = self.graceful.lock().unwrap().take();
        if let Some(graceful) = graceful {
            graceful.shutdown().await;
        }
    }
}

/// The live log followers.  Shutting down closes every follower's response
/// and waits for the handlers to notice.
#[derive(Default)]
pub struct LogStreamTracker {
    streams: Mutex<BTreeMap<u64, ResponseWriter>>,
    next_id: AtomicU64,
    emptied: Notify,
}

impl std::fmt::Debug for LogStreamTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStreamTracker")
            .field("streams", &self.len())
            .finish_non_exhaustive()
    }
}

impl LogStreamTracker {
    pub fn new() -> Self {
        LogStreamTracker::default()
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records a follower writing to `writer`.  The follower stays tracked
    /// until the returned registration is dropped; it should stop following
    /// once [`ResponseWriter::closed`] resolves.
    pub fn register(
        self: &Arc<Self>,
        writer: &ResponseWriter,
    ) -> LogStreamRegistration {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.streams.lock().unwrap().insert(id, writer.clone());
        LogStreamRegistration { tracker: Arc::clone(self), id }
    }

    fn deregister(&self, id: u64) {
        let mut streams = self.streams.lock().unwrap();
        streams.remove(&id);
        if streams.is_empty() {
            self.emptied.notify_waiters();
        }
    }
}

#[async_trait]
impl Shutdownable for LogStreamTracker {
    fn name(&self) -> String {
        String::from("log streams")
    }

    async fn shutdown(&self) {
        loop {
            let emptied = self.emptied.notified();
            tokio::pin!(emptied);
            emptied.as_mut().enable();
            {
                let streams = self.streams.lock().unwrap();
                if streams.is_empty() {
                    return;
                }
                for writer in streams.values() {
                    writer.mark_closed();
                }
            }
            emptied.await;
        }
    }
}

/// Keeps a log follower registered with a [`LogStreamTracker`].
#[derive(Debug)]
pub struct LogStreamRegistration {
    tracker: Arc<LogStreamTracker>,
    id: u64,
}

impl Drop for LogStreamRegistration {
    fn drop(&mut self) {
        self.tracker.deregister(self.id);
    }
}

/// Resolves when the process receives SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

/// Resolves when the process receives Ctrl-C.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
