// Copyright 2023 Oxide Computer Company
//! Interface for implementing HTTP endpoint handler functions.
//!
//! A handler is an async function that takes the request context and the
//! response writer.  It writes its response through the writer (so that it
//! can stream) and returns `Ok(())`, or returns an `HttpError` that the
//! error middleware turns into a response.  Handlers are registered by name;
//! the middleware chain looks at the name to decide, for example, whether the
//! handler is exempt from the app lock.
//!
//! [`Handler`] wraps a plain function.  [`AuthorizedHandler`] wraps a function
//! that needs an authenticated principal: when the request carried no valid
//! token, the function is never invoked and the request fails with 401.

use crate::context::RequestContext;
use crate::error::HttpError;
use crate::response::ResponseWriter;
use crate::server::ServerContext;
use crate::token::Token;

use async_trait::async_trait;
use http::header;
use http::HeaderValue;
use http::StatusCode;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Type alias for the result returned by HTTP handler functions.
pub type HttpHandlerResult = Result<(), HttpError>;

/// `RouteHandler` abstracts a handler function in a way that allows callers
/// to invoke the handler without knowing the handler's function signature.
///
/// The "Route" in `RouteHandler` refers to the fact that this structure is
/// used to record that a specific handler has been attached to a specific
/// HTTP route.
#[async_trait]
pub trait RouteHandler<Context: ServerContext>: Debug + Send + Sync {
    /// Returns the name this handler was registered with.  This is not
    /// guaranteed to be unique, and may be empty.
    fn name(&self) -> &str;

    /// Handle an incoming HTTP request.
    async fn handle(
        &self,
        rqctx: RequestContext<Context>,
        writer: ResponseWriter,
    ) -> HttpHandlerResult;
}

/// A route handler backed by an async function of the request context and
/// the response writer.
pub struct Handler<Context, HandlerType> {
    handler: HandlerType,
    name: String,
    phantom: PhantomData<fn(Context)>,
}

impl<Context, HandlerType, FutureType> Handler<Context, HandlerType>
where
    Context: ServerContext,
    HandlerType: Fn(RequestContext<Context>, ResponseWriter) -> FutureType
        + Send
        + Sync
        + 'static,
    FutureType: Future<Output = HttpHandlerResult> + Send + 'static,
{
    pub fn new(
        name: &str,
        handler: HandlerType,
    ) -> Arc<dyn RouteHandler<Context>> {
        Arc::new(Handler {
            handler,
            name: name.to_string(),
            phantom: PhantomData,
        })
    }
}

impl<Context, HandlerType> Debug for Handler<Context, HandlerType> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "handler: {}", self.name)
    }
}

#[async_trait]
impl<Context, HandlerType, FutureType> RouteHandler<Context>
    for Handler<Context, HandlerType>
where
    Context: ServerContext,
    HandlerType: Fn(RequestContext<Context>, ResponseWriter) -> FutureType
        + Send
        + Sync
        + 'static,
    FutureType: Future<Output = HttpHandlerResult> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        rqctx: RequestContext<Context>,
        writer: ResponseWriter,
    ) -> HttpHandlerResult {
        (self.handler)(rqctx, writer).await
    }
}

/// A route handler whose function receives the authenticated token.
pub struct AuthorizedHandler<Context, HandlerType> {
    handler: HandlerType,
    name: String,
    phantom: PhantomData<fn(Context)>,
}

impl<Context, HandlerType, FutureType> AuthorizedHandler<Context, HandlerType>
where
    Context: ServerContext,
    HandlerType: Fn(
            RequestContext<Context>,
            ResponseWriter,
            Token,
        ) -> FutureType
        + Send
        + Sync
        + 'static,
    FutureType: Future<Output = HttpHandlerResult> + Send + 'static,
{
    pub fn new(
        name: &str,
        handler: HandlerType,
    ) -> Arc<dyn RouteHandler<Context>> {
        Arc::new(AuthorizedHandler {
            handler,
            name: name.to_string(),
            phantom: PhantomData,
        })
    }
}

impl<Context, HandlerType> Debug for AuthorizedHandler<Context, HandlerType> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "authorized handler: {}", self.name)
    }
}

#[async_trait]
impl<Context, HandlerType, FutureType> RouteHandler<Context>
    for AuthorizedHandler<Context, HandlerType>
where
    Context: ServerContext,
    HandlerType: Fn(
            RequestContext<Context>,
            ResponseWriter,
            Token,
        ) -> FutureType
        + Send
        + Sync
        + 'static,
    FutureType: Future<Output = HttpHandlerResult> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        rqctx: RequestContext<Context>,
        writer: ResponseWriter,
    ) -> HttpHandlerResult {
        let token =
            rqctx.principal().ok_or_else(HttpError::for_token_required)?;
        (self.handler)(rqctx, writer, token).await
    }
}

/// What the router concluded when it found no handler.  The server runs
/// these through the middleware chain like any other request so that misses
/// get the same logging and headers.
#[derive(Debug)]
pub(crate) enum RouteMiss {
    NotFound,
    MethodNotAllowed(Vec<String>),
    BadRequest(HttpError),
}

#[async_trait]
impl<Context: ServerContext> RouteHandler<Context> for RouteMiss {
    fn name(&self) -> &str {
        ""
    }

    async fn handle(
        &self,
        _rqctx: RequestContext<Context>,
        writer: ResponseWriter,
    ) -> HttpHandlerResult {
        match self {
            // Unknown routes get an empty body.
            RouteMiss::NotFound => {
                writer.write_status(StatusCode::NOT_FOUND).await;
                Ok(())
            }
            RouteMiss::MethodNotAllowed(allow) => {
                if let Ok(value) = HeaderValue::from_str(&allow.join(", ")) {
                    writer.set_header(header::ALLOW, value).await;
                }
                Err(HttpError::for_status(StatusCode::METHOD_NOT_ALLOWED))
            }
            RouteMiss::BadRequest(error) => Err(error.clone()),
        }
    }
}
