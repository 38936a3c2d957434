// Copyright 2024 Oxide Computer Company

//! The middleware chain every request runs through
//!
//! Routing picks a handler, but nothing runs it directly.  The server hands
//! the handler to the chain, and the chain's stages wrap one another from the
//! outside in:
//!
//! 1. [`Recovery`]: turns a panic anywhere inside into a 500
//! 2. [`AccessLog`]: logs status and latency once the inner stages finish
//! 3. [`ContextClearer`]: empties the request locals on every exit path
//! 4. [`FlushingWriter`]: makes writes reach the client as they happen
//! 5. [`RequestIdHeader`]: echoes the request id under a configured header
//! 6. [`ErrorHandler`]: renders whatever error the inner stages recorded
//! 7. [`VersionHeaders`]: advertises the oldest supported clients
//! 8. [`Authenticate`]: resolves the bearer token into a principal
//! 9. [`AppLock`]: serializes mutating requests against one app
//! 10. [`DelayedRunner`]: finally runs the handler
//!
//! Stages can see which handler will run (see [`Next::handler_name`]) before
//! it does.  That is how the app lock skips exempt handlers and how the
//! flushing writer picks a per-handler latency.
//!
//! Stages don't return errors.  A stage that fails records the error on the
//! request context and returns without running the rest of the chain; the
//! error handler then turns it into a response.

use crate::context::RequestContext;
use crate::error::HttpError;
use crate::error::CONTENT_TYPE_TEXT;
use crate::handler::RouteHandler;
use crate::response::FlushPolicy;
use crate::response::ResponseWriter;
use crate::server::ServerContext;
use crate::stream::StreamMessage;
use crate::stream::CONTENT_TYPE_JSON_STREAM;
use crate::token::parse_bearer;
use crate::token::AuthError;
use crate::token::Token;

use async_trait::async_trait;
use futures::FutureExt;
use http::header;
use http::HeaderName;
use http::HeaderValue;
use http::Method;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

/// Minimum version of the main command-line client this server supports.
pub const SUPPORTED_CLIENT_MIN: &str = "1.0.1";
/// Minimum version of the service-author client this server supports.
pub const SUPPORTED_SERVICE_CLIENT_MIN: &str = "1.0.0";
/// Minimum version of the admin client this server supports.
pub const SUPPORTED_ADMIN_CLIENT_MIN: &str = "1.0.0";

pub const HEADER_SUPPORTED_CLIENT_MIN: &str = "supported-client-min";
pub const HEADER_SUPPORTED_SERVICE_CLIENT_MIN: &str =
    "supported-serviceclient-min";
pub const HEADER_SUPPORTED_ADMIN_CLIENT_MIN: &str = "supported-adminclient-min";

/// One stage of the chain.
#[async_trait]
pub trait Middleware<Context: ServerContext>: Send + Sync + 'static {
    /// A short name for logs.
    fn name(&self) -> &'static str;

    /// Does this stage's work, calling `next.run()` to run the rest of the
    /// chain (or not, to stop the request here).
    async fn handle(
        &self,
        rqctx: &RequestContext<Context>,
        writer: &ResponseWriter,
        next: Next<'_, Context>,
    );
}

/// The rest of the chain, plus the handler it will eventually run.
pub struct Next<'a, Context: ServerContext> {
    stages: &'a [Arc<dyn Middleware<Context>>],
    handler: &'a Arc<dyn RouteHandler<Context>>,
}

impl<'a, Context: ServerContext> Next<'a, Context> {
    pub fn new(
        stages: &'a [Arc<dyn Middleware<Context>>],
        handler: &'a Arc<dyn RouteHandler<Context>>,
    ) -> Self {
        Next { stages, handler }
    }

    /// Name of the handler this request was routed to.
    pub fn handler_name(&self) -> &str {
        self.handler.name()
    }

    pub fn handler(&self) -> &Arc<dyn RouteHandler<Context>> {
        self.handler
    }

    /// Runs the remaining stages.  Past the last stage this does nothing;
    /// invoking the handler is the job of [`DelayedRunner`].
    pub async fn run(
        self,
        rqctx: &RequestContext<Context>,
        writer: &ResponseWriter,
    ) {
        if let Some((stage, rest)) = self.stages.split_first() {
            let next = Next { stages: rest, handler: self.handler };
            stage.handle(rqctx, writer, next).await;
        }
    }
}

/// Builds the standard chain, outermost stage first.
pub fn default_chain<Context: ServerContext>(
) -> Vec<Arc<dyn Middleware<Context>>> {
    vec![
        Arc::new(Recovery),
        Arc::new(AccessLog),
        Arc::new(ContextClearer),
        Arc::new(FlushingWriter),
        Arc::new(RequestIdHeader),
        Arc::new(ErrorHandler),
        Arc::new(VersionHeaders),
        Arc::new(Authenticate),
        Arc::new(AppLock),
        Arc::new(DelayedRunner),
    ]
}

/// Catches panics from the inner stages and the handler.
#[derive(Debug)]
pub struct Recovery;

#[async_trait]
impl<Context: ServerContext> Middleware<Context> for Recovery {
    fn name(&self) -> &'static str {
        "recovery"
    }

    async fn handle(
        &self,
        rqctx: &RequestContext<Context>,
        writer: &ResponseWriter,
        next: Next<'_, Context>,
    ) {
        let result =
            AssertUnwindSafe(next.run(rqctx, writer)).catch_unwind().await;
        if let Err(payload) = result {
            let message = panic_message(payload.as_ref());
            error!(rqctx.log, "handler panicked"; "panic" => &message);
            let error = HttpError::for_internal_error(format!(
                "handler panicked: {}",
                message
            ));
            write_error(rqctx, writer, &error).await;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("<non-string panic payload>")
    }
}

/// Logs every request once the inner stages are done with it.  A panic is
/// logged with the status Recovery will answer with and then passed on.
#[derive(Debug)]
pub struct AccessLog;

#[async_trait]
impl<Context: ServerContext> Middleware<Context> for AccessLog {
    fn name(&self) -> &'static str {
        "access-log"
    }

    async fn handle(
        &self,
        rqctx: &RequestContext<Context>,
        writer: &ResponseWriter,
        next: Next<'_, Context>,
    ) {
        let start_time = Instant::now();
        let result =
            AssertUnwindSafe(next.run(rqctx, writer)).catch_unwind().await;
        let status = match &result {
            Ok(()) => writer.status().await,
            Err(_) if writer.committed().await => writer.status().await,
            // What Recovery is about to send.
            Err(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
        };
        info!(rqctx.log, "request completed";
            "path" => rqctx.request.uri().path(),
            "response_code" => status.as_u16(),
            "latency_us" => start_time.elapsed().as_micros(),
        );
        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }
}

/// Empties the request-scoped locals when the request leaves the chain,
/// whether it returns, fails, panics or is cancelled.
#[derive(Debug)]
pub struct ContextClearer;

#[async_trait]
impl<Context: ServerContext> Middleware<Context> for ContextClearer {
    fn name(&self) -> &'static str {
        "context-clearer"
    }

    async fn handle(
        &self,
        rqctx: &RequestContext<Context>,
        writer: &ResponseWriter,
        next: Next<'_, Context>,
    ) {
        let _clear = scopeguard::guard((), |_| rqctx.clear());
        next.run(rqctx, writer).await;
    }
}

/// Switches the writer from buffering to flushing, so streamed responses
/// reach the client as they are written.  Handlers configured with a flush
/// latency get their writes batched up to that latency instead.
#[derive(Debug)]
pub struct FlushingWriter;

#[async_trait]
impl<Context: ServerContext> Middleware<Context> for FlushingWriter {
    fn name(&self) -> &'static str {
        "flushing-writer"
    }

    async fn handle(
        &self,
        rqctx: &RequestContext<Context>,
        writer: &ResponseWriter,
        next: Next<'_, Context>,
    ) {
        let config = &rqctx.server.config;
        let policy = match config.flush_latency(next.handler_name()) {
            Some(latency) => FlushPolicy::MaxLatency(latency),
            None => FlushPolicy::EveryWrite,
        };
        writer.set_flush_policy(policy).await;
        next.run(rqctx, writer).await;
        if writer.wrote() {
            if let Err(error) = writer.flush().await {
                debug!(rqctx.log, "final flush failed";
                    "error" => %error.internal_message);
            }
        }
    }
}

/// Echoes the request id under the configured `request_id_header`.
#[derive(Debug)]
pub struct RequestIdHeader;

#[async_trait]
impl<Context: ServerContext> Middleware<Context> for RequestIdHeader {
    fn name(&self) -> &'static str {
        "request-id-header"
    }

    async fn handle(
        &self,
        rqctx: &RequestContext<Context>,
        writer: &ResponseWriter,
        next: Next<'_, Context>,
    ) {
        if let Some(name) = &rqctx.server.config.request_id_header {
            let name = HeaderName::from_bytes(name.as_bytes());
            let value = HeaderValue::from_str(&rqctx.request_id);
            match (name, value) {
                (Ok(name), Ok(value)) => writer.set_header(name, value).await,
                _ => warn!(rqctx.log, "unable to set request id header"),
            }
        }
        next.run(rqctx, writer).await;
    }
}

/// Renders the error recorded by the inner stages, if any.
#[derive(Debug)]
pub struct ErrorHandler;

#[async_trait]
impl<Context: ServerContext> Middleware<Context> for ErrorHandler {
    fn name(&self) -> &'static str {
        "error-handler"
    }

    async fn handle(
        &self,
        rqctx: &RequestContext<Context>,
        writer: &ResponseWriter,
        next: Next<'_, Context>,
    ) {
        next.run(rqctx, writer).await;
        if let Some(error) = rqctx.take_error() {
            write_error(rqctx, writer, &error).await;
        }
    }
}

/// Writes `error` to the response.
///
/// If nothing was written yet, the error replaces the response: its status,
/// `text/plain` and the message.  Once body bytes are out the status can't
/// change, so the message is appended instead, as an `Error` line on a JSON
/// stream or as a plain line otherwise.  `X-Verbosity: 1` (or more) selects
/// the internal message.
pub(crate) async fn write_error<Context: ServerContext>(
    rqctx: &RequestContext<Context>,
    writer: &ResponseWriter,
    error: &HttpError,
) {
    let message = error.message_for_verbosity(rqctx.request.verbosity());
    if writer.wrote() {
        let streaming = writer.content_type().await.as_deref()
            == Some(CONTENT_TYPE_JSON_STREAM);
        let line = if streaming {
            StreamMessage::error(message).to_line()
        } else {
            Ok(format!("{}\n", message).into())
        };
        if let Ok(line) = line {
            // A write failure means the client is gone; nobody to tell.
            let _ = writer.write(line).await;
        }
    } else {
        writer
            .set_header(
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            )
            .await;
        let body = format!("{}\n", message);
        if !writer
            .send_complete(error.status_code, CONTENT_TYPE_TEXT, body)
            .await
        {
            debug!(rqctx.log, "response already committed; error not sent");
        }
    }
    error!(
        rqctx.log,
        "failure running HTTP request {} {} ({}): {}",
        rqctx.request.method(),
        rqctx.request.uri().path(),
        error.status_code.as_u16(),
        error.internal_message,
    );
}

/// Advertises the oldest client versions this server works with.
#[derive(Debug)]
pub struct VersionHeaders;

#[async_trait]
impl<Context: ServerContext> Middleware<Context> for VersionHeaders {
    fn name(&self) -> &'static str {
        "version-headers"
    }

    async fn handle(
        &self,
        rqctx: &RequestContext<Context>,
        writer: &ResponseWriter,
        next: Next<'_, Context>,
    ) {
        for (name, value) in [
            (HEADER_SUPPORTED_CLIENT_MIN, SUPPORTED_CLIENT_MIN),
            (HEADER_SUPPORTED_SERVICE_CLIENT_MIN, SUPPORTED_SERVICE_CLIENT_MIN),
            (HEADER_SUPPORTED_ADMIN_CLIENT_MIN, SUPPORTED_ADMIN_CLIENT_MIN),
        ] {
            writer
                .set_header(
                    HeaderName::from_static(name),
                    HeaderValue::from_static(value),
                )
                .await;
        }
        next.run(rqctx, writer).await;
    }
}

/// Resolves the `Authorization` header into a principal.
///
/// No header, or a token no scheme recognizes, leaves the request anonymous;
/// handlers that need a principal reject it later.  Any other failure of the
/// auth backends stops the request with 401.  App tokens may only touch
/// their own app, and for everyone else the `{app}` the request names is
/// loaded up front (404 if it doesn't exist) so permission checks can use it.
#[derive(Debug)]
pub struct Authenticate;

#[async_trait]
impl<Context: ServerContext> Middleware<Context> for Authenticate {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    async fn handle(
        &self,
        rqctx: &RequestContext<Context>,
        writer: &ResponseWriter,
        next: Next<'_, Context>,
    ) {
        let value = rqctx
            .request
            .header_str(header::AUTHORIZATION)
            .and_then(parse_bearer);
        if let Some(value) = value {
            match authenticate(rqctx, value).await {
                Ok(Some(token)) => rqctx.set_principal(token),
                Ok(None) => {}
                Err(error) => {
                    rqctx.set_error(error);
                    return;
                }
            }
        }
        next.run(rqctx, writer).await;
    }
}

async fn authenticate<Context: ServerContext>(
    rqctx: &RequestContext<Context>,
    value: &str,
) -> Result<Option<Token>, HttpError> {
    let backends = &rqctx.server.backends;
    let token = match backends.authenticator.validate(value).await {
        Ok(token) => token,
        Err(AuthError::InvalidToken) => {
            debug!(rqctx.log, "ignored invalid token";
                "path" => rqctx.request.uri().path());
            return Ok(None);
        }
        Err(error) => return Err(error.into()),
    };

    let Some(app_name) = rqctx.app_name() else {
        return Ok(Some(token));
    };
    match token.bound_app() {
        Some(token_app) if token_app != app_name => {
            Err(HttpError::for_forbidden(format!(
                "app token mismatch, token for {:?}, request for {:?}",
                token_app, app_name
            )))
        }
        Some(_) => Ok(Some(token)),
        None => match backends.apps.get_app(app_name).await? {
            Some(app) => {
                rqctx.set_app(app);
                Ok(Some(token))
            }
            None => Err(HttpError::for_not_found(String::from(
                "App not found",
            ))),
        },
    }
}

/// Holds the app's lock while a mutating request runs.
///
/// GET requests, handlers named in `lock_exempt_handlers` and routes without
/// an `{app}` variable pass straight through.  Everything else waits up to
/// `lock_wait` for the lock and fails with 409 if it stays held.  A handler
/// that calls [`RequestContext::keep_lock_after_return`] takes over the lock
/// and must release it itself.
#[derive(Debug)]
pub struct AppLock;

#[async_trait]
impl<Context: ServerContext> Middleware<Context> for AppLock {
    fn name(&self) -> &'static str {
        "app-lock"
    }

    async fn handle(
        &self,
        rqctx: &RequestContext<Context>,
        writer: &ResponseWriter,
        next: Next<'_, Context>,
    ) {
        let config = &rqctx.server.config;
        let method = rqctx.request.method();
        let app = match rqctx.app_name() {
            Some(app)
                if *method != Method::GET
                    && !config.is_lock_exempt(next.handler_name()) =>
            {
                app
            }
            _ => return next.run(rqctx, writer).await,
        };

        let owner = rqctx
            .principal()
            .map(|token| token.owner_name().to_string())
            .unwrap_or_default();
        let reason = format!("{} {}", method, rqctx.request.uri().path());
        let locks = &rqctx.server.locks;
        let guard = match locks
            .acquire_with_wait(app, &owner, &reason, config.lock_wait())
            .await
        {
            Ok(guard) => guard,
            Err(error) => {
                rqctx.set_error(error.into());
                return;
            }
        };

        next.run(rqctx, writer).await;

        if rqctx.lock_kept() {
            let app = guard.keep();
            debug!(rqctx.log, "app lock kept after return"; "app" => app);
        } else if let Err(error) = guard.release().await {
            warn!(rqctx.log, "failed to release app lock";
                "app" => app, "error" => %error);
        }
    }
}

/// Runs the handler, recording its error for the error handler.
#[derive(Debug)]
pub struct DelayedRunner;

#[async_trait]
impl<Context: ServerContext> Middleware<Context> for DelayedRunner {
    fn name(&self) -> &'static str {
        "delayed-runner"
    }

    async fn handle(
        &self,
        rqctx: &RequestContext<Context>,
        writer: &ResponseWriter,
        next: Next<'_, Context>,
    ) {
        let result = next.handler().handle(rqctx.clone(), writer.clone()).await;
        if let Err(error) = result {
            rqctx.set_error(error);
        }
    }
}
