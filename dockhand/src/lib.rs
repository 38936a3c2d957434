// Copyright 2025 Oxide Computer Company

//! Dockhand is the HTTP core of a platform-as-a-service control plane.  It
//! owns everything between the socket and the handler that implements an API
//! operation:
//!
//! * A versioned router.  Clients may prefix any path with an API version
//!   (`/1.2/apps/myapp`); the router serves the newest handler registered at
//!   or below that version.
//!
//! * A fixed middleware chain (see [`middleware`]) that recovers from panics,
//!   logs every request, authenticates bearer tokens, and serializes mutating
//!   requests against one app with a cluster-wide app lock.
//!
//! * A permission engine (see [`permission`]) that answers "may this token do
//!   `app.update.env.set` on app `myapp`?" in time independent of the number
//!   of grants the token holds.
//!
//! * A streaming response writer.  Long operations (deploys, log follows)
//!   write newline-delimited JSON progress messages that reach the client as
//!   they happen, with keep-alive lines while nothing else is written.
//!
//! * Graceful shutdown: registered objects, open connections and in-flight
//!   handlers all get a bounded chance to finish.
//!
//! Persistent state (apps, locks, tokens) lives behind traits.  The crate
//! ships in-memory implementations that are suitable for embedding and tests.
//!
//! ## Usage
//!
//! ```no_run
//! use dockhand::ApiVersion;
//! use dockhand::AuthorizedHandler;
//! use dockhand::Authenticator;
//! use dockhand::Backends;
//! use dockhand::ConfigLogging;
//! use dockhand::ConfigLoggingLevel;
//! use dockhand::ConfigServer;
//! use dockhand::HttpHandlerResult;
//! use dockhand::HttpRouter;
//! use dockhand::HttpServerStarter;
//! use dockhand::MemoryStore;
//! use dockhand::RequestContext;
//! use dockhand::ResponseWriter;
//! use dockhand::Token;
//! use dockhand::TokenTable;
//! use http::Method;
//! use std::sync::Arc;
//!
//! async fn app_info(
//!     rqctx: RequestContext<()>,
//!     writer: ResponseWriter,
//!     _token: Token,
//! ) -> HttpHandlerResult {
//!     let app = rqctx.app().expect("app resolved by the middleware");
//!     writer.write_json(&app).await
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let log = ConfigLogging::StderrTerminal {
//!         level: ConfigLoggingLevel::Info,
//!     }
//!     .to_logger("minimal-example")
//!     .map_err(|e| e.to_string())?;
//!
//!     let mut router = HttpRouter::new();
//!     router.add(
//!         ApiVersion::DEFAULT,
//!         Method::GET,
//!         "/apps/{app}",
//!         AuthorizedHandler::new("app_info", app_info),
//!     );
//!
//!     let tokens = Arc::new(TokenTable::new("api-tokens"));
//!     let backends = Backends::in_memory(
//!         Authenticator::new(tokens),
//!         Arc::new(MemoryStore::new()),
//!     );
//!     let config = ConfigServer::default();
//!     let server =
//!         HttpServerStarter::new(&config, router, (), &log, backends)
//!             .map_err(|error| format!("failed to start server: {}", error))?
//!             .start();
//!
//!     server.run_until_signal().await
//! }
//! ```
//!
//! ## Handlers
//!
//! A handler is an async function of the [`RequestContext`] and a
//! [`ResponseWriter`].  It writes its response through the writer and
//! returns `Ok(())`, or returns an [`HttpError`] that the chain turns into a
//! response.  Handlers that need an authenticated caller are wrapped in an
//! [`AuthorizedHandler`], which passes them the caller's [`Token`]; plain
//! functions use [`Handler`].
//!
//! Every handler is registered with a name.  Names show up in the logs and
//! decide whether the app lock applies (see
//! [`ConfigServer::lock_exempt_handlers`]) and how often the response is
//! flushed (see [`ConfigServer::flush_latency_ms`]).
//!
//! ## Paths
//!
//! Path patterns are `/`-separated literal segments and `{name}` variables:
//!
//! ```text
//! /apps/{app}/env
//! ```
//!
//! A variable named `app` is special: when present, the middleware resolves
//! the app before the handler runs (so the handler can call
//! [`RequestContext::app`]) and takes the app's lock for requests that are
//! not `GET`.
//!
//! ## Errors
//!
//! Error responses are a single line of plain text.  A handler that fails
//! after it has started streaming can't change the status any more; the
//! error is appended to the stream instead (as an `{"Error": ...}` line for
//! JSON streams).
//!
//! ## Request ids
//!
//! Every response carries an `x-request-id` header whose value also appears
//! in every log line for that request.

#[macro_use]
extern crate slog;

mod body;
mod config;
mod context;
mod error;
mod handler;
mod lock;
mod logging;
pub mod middleware;
pub mod permission;
mod response;
mod router;
mod server;
pub mod shutdown;
mod store;
mod stream;
pub mod test_util;
mod token;

pub use body::Body;
pub use config::ConfigServer;
pub use config::ConfigTls;
pub use config::DEFAULT_LOCK_EXEMPT_HANDLERS;
pub use context::RequestContext;
pub use context::RequestInfo;
pub use context::MASKED_VALUE;
pub use error::ErrorKind;
pub use error::HttpError;
pub use error::CONTENT_TYPE_TEXT;
pub use error::MESSAGE_FORBIDDEN;
pub use error::MESSAGE_TOKEN_REQUIRED;
pub use handler::AuthorizedHandler;
pub use handler::Handler;
pub use handler::HttpHandlerResult;
pub use handler::RouteHandler;
pub use lock::AppLockGuard;
pub use lock::AppLockManager;
pub use lock::LockError;
pub use logging::ConfigLogging;
pub use logging::ConfigLoggingIfExists;
pub use logging::ConfigLoggingLevel;
pub use response::FlushPolicy;
pub use response::ResponseWriter;
pub use response::CONTENT_TYPE_JSON;
pub use router::ApiVersion;
pub use router::HttpRouter;
pub use router::RouteDescription;
pub use server::Backends;
pub use server::ServerContext;
pub use server::ServerState;
pub use server::ShutdownWaitFuture;
pub use server::{HttpServer, HttpServerStarter};
pub use store::App;
pub use store::AppLock;
pub use store::AppStore;
pub use store::LockStore;
pub use store::MemoryStore;
pub use store::StoreError;
pub use store::TryLock;
pub use stream::JsonStreamWriter;
pub use stream::KeepAlive;
pub use stream::StreamDecoder;
pub use stream::StreamError;
pub use stream::StreamMessage;
pub use stream::CONTENT_TYPE_JSON_STREAM;
pub use token::parse_bearer;
pub use token::AuthError;
pub use token::AuthScheme;
pub use token::Authenticator;
pub use token::Principal;
pub use token::Token;
pub use token::TokenTable;

pub use http::Method;

/// Response header carrying the id of the request.
pub const HEADER_REQUEST_ID: &str = "x-request-id";
