// Copyright 2023 Oxide Computer Company
//! Generic server-wide state and facilities

use super::body::Body;
use super::config::ConfigServer;
use super::config::ConfigTls;
use super::context::RequestContext;
use super::context::RequestInfo;
use super::error::HttpError;
use super::handler::RouteHandler;
use super::handler::RouteMiss;
use super::lock::AppLockManager;
use super::middleware::default_chain;
use super::middleware::Middleware;
use super::middleware::Next;
use super::response::ResponseWriter;
use super::router::HttpRouter;
use super::router::RouteMatch;
use super::router::VariableSet;
use super::shutdown::wait_for_signal;
use super::shutdown::ConnectionTracker;
use super::shutdown::ShutdownRegistry;
use super::shutdown::Shutdownable;
use super::store::AppStore;
use super::store::LockStore;
use super::store::MemoryStore;
use super::token::Authenticator;
use super::HEADER_REQUEST_ID;

use debug_ignore::DebugIgnore;
use futures::future::{FusedFuture, FutureExt, Shared};
use futures::lock::Mutex;
use futures::stream::{FuturesUnordered, StreamExt};
use http::HeaderValue;
use http::StatusCode;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper::Response;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use scopeguard::{guard, ScopeGuard};
use std::convert::TryFrom;
use std::future::Future;
use std::mem;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;
use waitgroup::WaitGroup;

use slog::Logger;

type GenericError = Box<dyn std::error::Error + Send + Sync>;

/// Endpoint-accessible context associated with a server.
///
/// Automatically implemented for all Send + Sync types.
pub trait ServerContext: Send + Sync + 'static {}

impl<T: 'static> ServerContext for T where T: Send + Sync {}

/// The collaborators the middleware chain talks to: who a token belongs to,
/// what an app looks like, and where app locks live.
#[derive(Clone)]
pub struct Backends {
    pub authenticator: Authenticator,
    pub apps: Arc<dyn AppStore>,
    pub lock_store: Arc<dyn LockStore>,
}

impl Backends {
    pub fn new(
        authenticator: Authenticator,
        apps: Arc<dyn AppStore>,
        lock_store: Arc<dyn LockStore>,
    ) -> Self {
        Backends { authenticator, apps, lock_store }
    }

    /// Backends that keep apps and locks in one in-process store.
    pub fn in_memory(
        authenticator: Authenticator,
        store: Arc<MemoryStore>,
    ) -> Self {
        Backends {
            authenticator,
            apps: Arc::clone(&store) as Arc<dyn AppStore>,
            lock_store: store,
        }
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("authenticator", &self.authenticator)
            .finish_non_exhaustive()
    }
}

/// Stores shared state used by the server.
pub struct ServerState<C: ServerContext> {
    /// caller-specific state
    pub private: C,
    /// static server configuration parameters
    pub config: ConfigServer,
    /// request router
    pub router: HttpRouter<C>,
    /// server-wide log handle
    pub log: Logger,
    /// bound local address for the server.
    pub local_addr: SocketAddr,
    pub backends: Backends,
    pub locks: AppLockManager,
    /// objects to shut down when the server closes
    pub shutdown: ShutdownRegistry,
    /// the stages every request runs through
    pub(crate) chain: DebugIgnore<Vec<Arc<dyn Middleware<C>>>>,
    pub(crate) connections: Arc<ConnectionTracker>,
    /// Identifies how to accept TLS connections
    pub(crate) tls_acceptor: Option<Arc<Mutex<TlsAcceptor>>>,
    /// Worker for the handler_waitgroup associated with this server, allowing
    /// graceful shutdown to wait for all handlers to complete.
    pub(crate) handler_waitgroup_worker: DebugIgnore<waitgroup::Worker>,
}

impl<C: ServerContext> ServerState<C> {
    pub fn using_tls(&self) -> bool {
        self.tls_acceptor.is_some()
    }
}

impl<C: ServerContext> std::fmt::Debug for ServerState<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("config", &self.config)
            .field("router", &self.router)
            .field("local_addr", &self.local_addr)
            .field("backends", &self.backends)
            .field("locks", &self.locks)
            .field("shutdown", &self.shutdown)
            .field("connections", &self.connections)
            .field("using_tls", &self.using_tls())
            .finish_non_exhaustive()
    }
}

pub struct HttpServerStarter<C: ServerContext> {
    app_state: Arc<ServerState<C>>,
    listener: TcpListener,
    handler_waitgroup: WaitGroup,
}

impl<C: ServerContext> HttpServerStarter<C> {
    /// Set up a server bound on `config.listen` that runs requests through
    /// the standard middleware chain.  When `config.tls` is set, the server
    /// speaks HTTPS.  You must invoke `start()` on the returned instance to
    /// actually start the server.
    pub fn new(
        config: &ConfigServer,
        router: HttpRouter<C>,
        private: C,
        log: &Logger,
        backends: Backends,
    ) -> Result<HttpServerStarter<C>, GenericError> {
        Self::new_with_chain(
            config,
            router,
            default_chain(),
            private,
            log,
            backends,
        )
    }

    /// Like `new()`, but with a caller-assembled middleware chain.
    pub fn new_with_chain(
        config: &ConfigServer,
        router: HttpRouter<C>,
        chain: Vec<Arc<dyn Middleware<C>>>,
        private: C,
        log: &Logger,
        backends: Backends,
    ) -> Result<HttpServerStarter<C>, GenericError> {
        let tls_acceptor = match &config.tls {
            Some(tls) => Some(Arc::new(Mutex::new(TlsAcceptor::from(
                Arc::new(rustls::ServerConfig::try_from(tls)?),
            )))),
            None => None,
        };

        let listener = {
            let listener = std::net::TcpListener::bind(config.listen)?;
            listener.set_nonblocking(true)?;
            // We use `from_std` instead of just calling `bind` here directly
            // to avoid invoking an async function.
            TcpListener::from_std(listener)?
        };
        let local_addr = listener.local_addr()?;

        let handler_waitgroup = WaitGroup::new();
        let locks = AppLockManager::new(
            Arc::clone(&backends.lock_store),
            config.lock_poll_interval(),
        );
        let app_state = Arc::new(ServerState {
            private,
            config: config.clone(),
            router,
            log: log.new(o!("local_addr" => local_addr)),
            local_addr,
            backends,
            locks,
            shutdown: ShutdownRegistry::new(),
            chain: DebugIgnore(chain),
            connections: Arc::new(ConnectionTracker::new()),
            tls_acceptor,
            handler_waitgroup_worker: DebugIgnore(handler_waitgroup.worker()),
        });

        for route in app_state.router.routes() {
            debug!(app_state.log, "registered endpoint";
                "version" => %route.version,
                "method" => &route.method,
                "path" => &route.path,
                "handler" => &route.handler,
            );
        }

        Ok(HttpServerStarter { app_state, listener, handler_waitgroup })
    }

    pub fn start(self) -> HttpServer<C> {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let log_close = self.app_state.log.new(o!());
        let local_addr = self.app_state.local_addr;
        let join_handle = tokio::spawn(accept_connections(
            Arc::clone(&self.app_state),
            self.listener,
            rx,
            log_close,
        ))
        .map(|r| {
            r.map_err(|e| format!("waiting for server: {e}"))?
                .map_err(|e| format!("server stopped: {e}"))
        });
        info!(self.app_state.log, "listening";
            "tls" => self.app_state.using_tls());

        let handler_waitgroup = self.handler_waitgroup;
        let join_handle = async move {
            // After the server stops accepting, we also want to wait for any
            // in-flight handlers to complete.
            () = join_handle.await?;
            () = handler_waitgroup.wait().await;
            Ok(())
        };

        HttpServer {
            app_state: self.app_state,
            local_addr,
            closer: CloseHandle { close_channel: Some(tx) },
            join_future: join_handle.boxed().shared(),
        }
    }
}

/// Create a TLS configuration from the server's config structure.
impl TryFrom<&ConfigTls> for rustls::ServerConfig {
    type Error = std::io::Error;

    fn try_from(config: &ConfigTls) -> std::io::Result<Self> {
        let open = |path: &std::path::Path| {
            std::fs::File::open(path)
                .map(std::io::BufReader::new)
                .map_err(|e| {
                    let path = path.display();
                    io_error(format!("failed to open {}: {}", path, e))
                })
        };
        let mut cert_reader = open(&config.cert_file)?;
        let mut key_reader = open(&config.key_file)?;

        let certs = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| {
                io_error(format!("failed to load certificate: {err}"))
            })?;
        let keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| {
                io_error(format!("failed to load private key: {err}"))
            })?;
        let mut keys_iter = keys.into_iter();
        let (Some(private_key), None) = (keys_iter.next(), keys_iter.next())
        else {
            return Err(io_error("expected a single private key".into()));
        };

        let mut cfg = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, private_key.into())
            .map_err(|err| {
                io_error(format!("bad certificate/key: {err}"))
            })?;
        cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(cfg)
    }
}

/// Accepts connections until told to stop.  TLS negotiations run
/// concurrently with accepting new connections, so one slow handshake does
/// not hold up everybody else.
async fn accept_connections<C: ServerContext>(
    server: Arc<ServerState<C>>,
    listener: TcpListener,
    mut close_signal: oneshot::Receiver<()>,
    log_close: Logger,
) -> std::io::Result<()> {
    let mut builder = auto::Builder::new(TokioExecutor::new());
    {
        let mut http1 = builder.http1();
        http1.timer(TokioTimer::new());
        if let Some(read_timeout) = server.config.read_timeout() {
            http1.header_read_timeout(read_timeout);
        }
    }

    let mut tls_negotiations = FuturesUnordered::new();
    loop {
        tokio::select! {
            _ = &mut close_signal => {
                info!(log_close, "received request to begin graceful shutdown");
                break;
            },
            Some(negotiation) = tls_negotiations.next(), if
                    !tls_negotiations.is_empty() => {
                match negotiation {
                    Ok((stream, addr)) => {
                        serve_connection(&server, &builder, stream, addr);
                    }
                    Err(e) => {
                        // If TLS negotiation fails, log the cause but keep
                        // accepting.  These failures may be a fatal TLS alert
                        // message, or a client disconnection during
                        // negotiation, or other issues.
                        warn!(server.log, "tls accept err: {}", e);
                    }
                }
            },
            accept_result = listener.accept() => {
                let (socket, addr) = match accept_result {
                    Ok(v) => v,
                    Err(e) => match e.kind() {
                        std::io::ErrorKind::ConnectionAborted => continue,
                        // The other errors that can be returned under POSIX
                        // are all programming errors or resource exhaustion.
                        // Stop accepting new connections.
                        _ => return Err(e),
                    },
                };

                match &server.tls_acceptor {
                    Some(tls_acceptor) => {
                        let acceptor = tls_acceptor.lock().await.clone();
                        tls_negotiations.push(async move {
                            acceptor.accept(socket).await.map(|s| (s, addr))
                        });
                    }
                    None => serve_connection(&server, &builder, socket, addr),
                }
            },
        }
    }
    Ok(())
}

fn serve_connection<C, S>(
    server: &Arc<ServerState<C>>,
    builder: &auto::Builder<TokioExecutor>,
    stream: S,
    remote_addr: SocketAddr,
) where
    C: ServerContext,
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    info!(server.log, "accepted connection"; "remote_addr" => %remote_addr);

    let service_server = Arc::clone(server);
    let service = service_fn(move |request| {
        http_request_handle_wrap(
            Arc::clone(&service_server),
            remote_addr,
            request,
        )
    });
    let builder = builder.clone();
    let connections = Arc::clone(&server.connections);
    let log = server.log.clone();
    tokio::spawn(async move {
        let io = TokioIo::new(stream);
        let conn = builder.serve_connection_with_upgrades(io, service);
        if let Err(e) = connections.watch(conn).await {
            debug!(log, "connection closed with error";
                "remote_addr" => %remote_addr,
                "error" => %e,
            );
        }
    });
}

type SharedBoxFuture<T> = Shared<Pin<Box<dyn Future<Output = T> + Send>>>;

/// Future returned by [`HttpServer::wait_for_shutdown()`].
pub struct ShutdownWaitFuture(SharedBoxFuture<Result<(), String>>);

impl Future for ShutdownWaitFuture {
    type Output = Result<(), String>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().0).poll(cx)
    }
}

impl FusedFuture for ShutdownWaitFuture {
    fn is_terminated(&self) -> bool {
        self.0.is_terminated()
    }
}

/// A running control-plane HTTP server.
///
/// The generic traits represent the following:
/// - C: Caller-supplied server context
pub struct HttpServer<C: ServerContext> {
    app_state: Arc<ServerState<C>>,
    local_addr: SocketAddr,
    closer: CloseHandle,
    join_future: SharedBoxFuture<Result<(), String>>,
}

// Handle used to trigger the shutdown of an [HttpServer].
struct CloseHandle {
    close_channel: Option<tokio::sync::oneshot::Sender<()>>,
}

impl<C: ServerContext> HttpServer<C> {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn app_private(&self) -> &C {
        &self.app_state.private
    }

    pub fn using_tls(&self) -> bool {
        self.app_state.using_tls()
    }

    /// Objects registered here are shut down when the server closes.
    pub fn shutdown_registry(&self) -> &ShutdownRegistry {
        &self.app_state.shutdown
    }

    pub fn locks(&self) -> &AppLockManager {
        &self.app_state.locks
    }

    /// Update TLS certificates for a running HTTPS server.
    pub async fn refresh_tls(&self, config: &ConfigTls) -> Result<(), String> {
        let acceptor = &self
            .app_state
            .tls_acceptor
            .as_ref()
            .ok_or_else(|| "Not configured for TLS".to_string())?;

        let tls_config = rustls::ServerConfig::try_from(config)
            .map_err(|e| e.to_string())?;
        *acceptor.lock().await = TlsAcceptor::from(Arc::new(tls_config));
        Ok(())
    }

    /// Returns a future which completes when the server has shut down.
    ///
    /// This function does not cause the server to shut down. It just waits for
    /// the shutdown to happen.
    ///
    /// To trigger a shutdown, Call [HttpServer::close] (which also awaits
    /// shutdown).
    pub fn wait_for_shutdown(&self) -> ShutdownWaitFuture {
        ShutdownWaitFuture(self.join_future.clone())
    }

    /// Signals the currently running server to stop and waits for it to exit.
    ///
    /// The server stops accepting connections, shuts down every registered
    /// object, then drains open connections.  Both steps share the
    /// `shutdown_timeout` deadline; connections still open at the deadline
    /// are dropped.  Finally this waits for in-flight handlers to return.
    pub async fn close(mut self) -> Result<(), String> {
        if let Some(close_channel) = self.closer.close_channel.take() {
            // If the accept loop already stopped, `join_future` reports why.
            let _ = close_channel.send(());
        }

        let log = self.app_state.log.clone();
        let deadline = self.app_state.config.shutdown_timeout();
        let until = Instant::now() + deadline;
        self.app_state.shutdown.shutdown_all(deadline, &log).await;

        let connections = Arc::clone(&self.app_state.connections);
        if tokio::time::timeout_at(until, connections.shutdown()).await.is_err()
        {
            warn!(log, "timed out draining connections";
                "open" => connections.open_connections());
            connections.abort();
        }

        // We _must_ explicitly drop our app state before awaiting join_future.
        // The app state has a `waitgroup::Worker` that every handler task
        // clones, and `join_future` will await all of them being dropped.
        // That means we must drop our "primary" clone of it, too!
        mem::drop(self.app_state);

        self.join_future.await
    }

    /// Runs until the process receives SIGINT or SIGTERM (or the server
    /// stops on its own), then closes the server gracefully.
    pub async fn run_until_signal(self) -> Result<(), String> {
        let stopped = self.wait_for_shutdown();
        tokio::select! {
            result = wait_for_signal() => {
                result.map_err(|e| format!("waiting for signal: {e}"))?;
                info!(self.app_state.log, "received signal, shutting down");
                self.close().await
            }
            result = stopped => result,
        }
    }
}

// For graceful termination, the `close()` function is preferred, as it can
// report errors and wait for termination to complete.  However, we impl
// `Drop` to attempt to shut down the server to handle less clean shutdowns
// (e.g., from failing tests).
impl Drop for CloseHandle {
    fn drop(&mut self) {
        if let Some(c) = self.close_channel.take() {
            // The other side of this channel is owned by a separate tokio task
            // that's running the accept loop.  We do not expect that to be
            // cancelled.  But it can happen if the executor itself is shutting
            // down and that task happens to get cleaned up before this one.
            let _ = c.send(());
        }
    }
}

impl<C: ServerContext> Future for HttpServer<C> {
    type Output = Result<(), String>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let server = Pin::into_inner(self);
        let join_future = Pin::new(&mut server.join_future);
        join_future.poll(cx)
    }
}

impl<C: ServerContext> FusedFuture for HttpServer<C> {
    fn is_terminated(&self) -> bool {
        self.join_future.is_terminated()
    }
}

/// Initial entry point for handling a new request to the HTTP server.  This is
/// invoked by hyper when a new request is received.
async fn http_request_handle_wrap<C: ServerContext>(
    server: Arc<ServerState<C>>,
    remote_addr: SocketAddr,
    request: Request<Incoming>,
) -> Result<Response<Body>, GenericError> {
    let start_time = std::time::Instant::now();
    let request_id = request_id_for(&server.config, &request);

    let mut request_log = server.log.new(o!(
        "remote_addr" => remote_addr,
        "req_id" => request_id.clone(),
        "method" => request.method().as_str().to_string(),
        "uri" => format!("{}", request.uri()),
    ));
    // If we have been asked to include any headers from the request in the
    // log messages, do so here:
    for name in server.config.log_headers.iter() {
        let v = request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok().map(str::to_string));

        if let Some(v) = v {
            // This is unfortunate in at least two ways: first, we would like to
            // just construct _one_ key value map, but OwnedKV is opaque and can
            // only be constructed with the o!() macro, so the only way to layer
            // on a dynamic set of additional properties is by creating a chain
            // of child loggers to add each one; second, we would like to be
            // able to include all header values under a single map-valued
            // "header" property, but slog only allows us a single-level
            // property hierarchy.  Alas!
            //
            // We also replace the hyphens with underscores to make it easier to
            // refer to the generated properties in dynamic languages used for
            // filtering like rhai.
            let k = format!("hdr_{}", name.to_lowercase().replace('-', "_"));
            request_log = request_log.new(o!(k => v));
        }
    }

    trace!(request_log, "incoming request");

    // In the case the client disconnects early, the scopeguard allows us
    // to perform extra housekeeping before this task is dropped.
    let on_disconnect = guard((), |_| {
        let latency_us = start_time.elapsed().as_micros();

        warn!(request_log, "request handling cancelled (client disconnected)";
            "latency_us" => latency_us,
        );
    });

    let response = http_request_handle(
        server,
        request,
        &request_id,
        request_log.new(o!()),
        remote_addr,
    )
    .await;

    // If `http_request_handle` completed, it means the request wasn't
    // cancelled and we can safely "defuse" the scopeguard.
    let _ = ScopeGuard::into_inner(on_disconnect);

    trace!(request_log, "response head sent";
        "response_code" => response.status().as_str(),
        "latency_us" => start_time.elapsed().as_micros(),
    );
    Ok(response)
}

async fn http_request_handle<C: ServerContext>(
    server: Arc<ServerState<C>>,
    request: Request<Incoming>,
    request_id: &str,
    request_log: Logger,
    remote_addr: SocketAddr,
) -> Response<Body> {
    let request_info = Arc::new(RequestInfo::new(&request, remote_addr));
    let (handler, variables) = route(&server.router, &request);
    let rqctx = RequestContext::new(
        Arc::clone(&server),
        request_info,
        variables,
        request_id.to_string(),
        request_log.clone(),
        Body::wrap(request.into_body()),
    );

    // The chain runs in its own task so that it completes even if the client
    // goes away and hyper drops this future.
    let (writer, head) = ResponseWriter::new();
    let worker = server.handler_waitgroup_worker.clone();
    tokio::spawn(async move {
        let chain = &rqctx.server.chain;
        Next::new(chain, &handler).run(&rqctx, &writer).await;
        writer.finish().await;

        // Drop our waitgroup worker, allowing graceful shutdown to
        // complete (if it's waiting on us).
        mem::drop(worker);
    });

    let head = match server.config.write_timeout() {
        Some(write_timeout) => {
            match tokio::time::timeout(write_timeout, head).await {
                Ok(head) => head,
                Err(_) => {
                    warn!(request_log, "timed out waiting for response";
                        "write_timeout_ms" => write_timeout.as_millis());
                    return HttpError::for_status(
                        StatusCode::SERVICE_UNAVAILABLE,
                    )
                    .into_response(request_id);
                }
            }
        }
        None => head.await,
    };

    match head {
        Ok(mut response) => {
            if let Ok(v) = HeaderValue::from_str(request_id) {
                response.headers_mut().insert(HEADER_REQUEST_ID, v);
            }
            response
        }
        // The writer was dropped without committing, which only happens if
        // the chain task itself panicked outside the recovery stage.
        Err(_) => {
            error!(request_log, "request handler exited without a response");
            HttpError::for_internal_error(String::from(
                "request handler exited without a response",
            ))
            .into_response(request_id)
        }
    }
}

/// Resolves the handler for `request`.  Misses get a built-in handler so
/// they flow through the middleware chain like everything else.
fn route<C: ServerContext, B>(
    router: &HttpRouter<C>,
    request: &Request<B>,
) -> (Arc<dyn RouteHandler<C>>, VariableSet) {
    match router.lookup(request.method(), request.uri().path()) {
        Ok(RouteMatch::Found { handler, variables, .. }) => {
            (handler, variables)
        }
        Ok(RouteMatch::MethodNotAllowed { allow }) => (
            Arc::new(RouteMiss::MethodNotAllowed(allow)),
            VariableSet::new(),
        ),
        Ok(RouteMatch::NotFound) => {
            (Arc::new(RouteMiss::NotFound), VariableSet::new())
        }
        Err(error) => {
            (Arc::new(RouteMiss::BadRequest(error)), VariableSet::new())
        }
    }
}

/// Uses the inbound request id when the server is configured to trust one,
/// and a fresh one otherwise.
fn request_id_for<B>(config: &ConfigServer, request: &Request<B>) -> String {
    config
        .request_id_header
        .as_deref()
        .and_then(|name| request.headers().get(name))
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_request_id)
}

// This function should probably be parametrized by some name of the service
// that is expected to be unique within an organization.  That way, it would be
// possible to determine from a given request id which service it was from.
fn generate_request_id() -> String {
    format!("{}", Uuid::new_v4())
}

fn io_error(err: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err)
}
