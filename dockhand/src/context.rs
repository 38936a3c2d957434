// Copyright 2023 Oxide Computer Company
//! Per-request state shared by the middleware chain and the handler

use crate::body::Body;
use crate::error::HttpError;
use crate::router::VariableSet;
use crate::server::ServerContext;
use crate::server::ServerState;
use crate::store::App;
use crate::token::Token;

use bytes::Bytes;
use http::header;
use serde::de::DeserializeOwned;
use serde_json::Value;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

/// Stands in for the values of fields excluded from
/// [`RequestContext::input_fields`].
pub const MASKED_VALUE: &str = "*****";

const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded";

/// Handle for various interfaces useful during request processing.
///
/// A `RequestContext` is cheap to clone.  Clones share the request locals,
/// so a handler can hand one to a background task that outlives the request
/// (e.g. a streamer that keeps the app lock).
pub struct RequestContext<Context: ServerContext> {
    /// shared server state
    pub server: Arc<ServerState<Context>>,
    /// basic request information (method, URI, etc.)
    pub request: Arc<RequestInfo>,
    /// HTTP request routing variables
    pub path_variables: Arc<VariableSet>,
    /// unique id assigned to this request
    pub request_id: String,
    /// logger for this specific request
    pub log: Logger,

    locals: Arc<RequestLocals>,
}

impl<Context: ServerContext> Clone for RequestContext<Context> {
    fn clone(&self) -> Self {
        RequestContext {
            server: Arc::clone(&self.server),
            request: Arc::clone(&self.request),
            path_variables: Arc::clone(&self.path_variables),
            request_id: self.request_id.clone(),
            log: self.log.clone(),
            locals: Arc::clone(&self.locals),
        }
    }
}

impl<Context: ServerContext> std::fmt::Debug for RequestContext<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request", &self.request)
            .field("path_variables", &self.path_variables)
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

// This is deliberately as close to compatible with `hyper::Request` as
// reasonable.
#[derive(Debug)]
pub struct RequestInfo {
    method: http::Method,
    uri: http::Uri,
    version: http::Version,
    headers: http::HeaderMap<http::HeaderValue>,
    remote_addr: std::net::SocketAddr,
}

impl RequestInfo {
    pub(crate) fn new<B>(
        request: &hyper::Request<B>,
        remote_addr: std::net::SocketAddr,
    ) -> Self {
        RequestInfo {
            method: request.method().clone(),
            uri: request.uri().clone(),
            version: request.version(),
            headers: request.headers().clone(),
            remote_addr,
        }
    }

    pub fn method(&self) -> &http::Method {
        &self.method
    }

    pub fn uri(&self) -> &http::Uri {
        &self.uri
    }

    pub fn version(&self) -> http::Version {
        self.version
    }

    pub fn headers(&self) -> &http::HeaderMap<http::HeaderValue> {
        &self.headers
    }

    pub fn remote_addr(&self) -> std::net::SocketAddr {
        self.remote_addr
    }

    /// Returns a header's value, if present and valid UTF-8.
    pub fn header_str(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The media type of the request body, lowercased and without
    /// parameters (e.g. `application/json`).
    pub fn content_type(&self) -> Option<String> {
        // RFC 7231 §3.1.1.1: media types are case insensitive and may be
        // followed by whitespace and/or a parameter (e.g., charset).
        self.header_str(header::CONTENT_TYPE).map(|content_type| {
            let end = content_type.find(';').unwrap_or(content_type.len());
            content_type[..end].trim().to_lowercase()
        })
    }

    /// The `X-Verbosity` header as a number; missing or malformed means 0.
    pub fn verbosity(&self) -> u32 {
        self.header_str("x-verbosity")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Typed request-scoped slots.  Each request gets a fresh set and the
/// context clearer empties it when the request exits.
#[derive(Default)]
struct RequestLocals {
    principal: Mutex<Option<Token>>,
    app: Mutex<Option<App>>,
    error: Mutex<Option<HttpError>>,
    body: tokio::sync::Mutex<BodySlot>,
    keep_lock: AtomicBool,
}

#[derive(Default)]
enum BodySlot {
    Pending(Body),
    Read(Bytes),
    /// cleared, or the request never had a body to read
    #[default]
    Gone,
}

impl<Context: ServerContext> RequestContext<Context> {
    pub(crate) fn new(
        server: Arc<ServerState<Context>>,
        request: Arc<RequestInfo>,
        path_variables: VariableSet,
        request_id: String,
        log: Logger,
        body: Body,
    ) -> Self {
        let locals = RequestLocals {
            body: tokio::sync::Mutex::new(BodySlot::Pending(body)),
            ..Default::default()
        };
        RequestContext {
            server,
            request,
            path_variables: Arc::new(path_variables),
            request_id,
            log,
            locals: Arc::new(locals),
        }
    }

    /// Returns the server context state.
    pub fn context(&self) -> &Context {
        &self.server.private
    }

    /// Returns the value bound to path variable `name`.
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_variables.get(name).map(String::as_str)
    }

    /// The app this request is about, when the route has an `{app}` variable.
    pub fn app_name(&self) -> Option<&str> {
        self.path_param("app")
    }

    /// The authenticated token, if the request carried a valid one.
    pub fn principal(&self) -> Option<Token> {
        self.locals.principal.lock().unwrap().clone()
    }

    pub(crate) fn set_principal(&self, token: Token) {
        *self.locals.principal.lock().unwrap() = Some(token);
    }

    /// The app resolved during authentication, if any.
    pub fn app(&self) -> Option<App> {
        self.locals.app.lock().unwrap().clone()
    }

    pub(crate) fn set_app(&self, app: App) {
        *self.locals.app.lock().unwrap() = Some(app);
    }

    /// Records an error for the error middleware.  A second error replaces
    /// the first.
    pub fn set_error(&self, error: HttpError) {
        *self.locals.error.lock().unwrap() = Some(error);
    }

    pub fn take_error(&self) -> Option<HttpError> {
        self.locals.error.lock().unwrap().take()
    }

    pub fn has_error(&self) -> bool {
        self.locals.error.lock().unwrap().is_some()
    }

    /// Asks the app-lock middleware not to release the lock when the handler
    /// returns.  Whoever sets this owns the release.
    pub fn keep_lock_after_return(&self) {
        self.locals.keep_lock.store(true, Ordering::SeqCst);
    }

    pub(crate) fn lock_kept(&self) -> bool {
        self.locals.keep_lock.load(Ordering::SeqCst)
    }

    /// Empties every request-scoped slot.
    pub fn clear(&self) {
        self.locals.principal.lock().unwrap().take();
        self.locals.app.lock().unwrap().take();
        self.locals.error.lock().unwrap().take();
        self.locals.keep_lock.store(false, Ordering::SeqCst);
        if let Ok(mut body) = self.locals.body.try_lock() {
            *body = BodySlot::Gone;
        }
    }

    /// Returns the maximum request body size.
    pub fn request_body_max_bytes(&self) -> usize {
        self.server.config.request_body_max_bytes
    }

    /// Reads the whole request body.  The body is read once and cached, so
    /// handlers and helpers may call this any number of times.
    pub async fn body_bytes(&self) -> Result<Bytes, HttpError> {
        let mut slot = self.locals.body.lock().await;
        match std::mem::take(&mut *slot) {
            BodySlot::Pending(body) => {
                let bytes =
                    body.collect_capped(self.request_body_max_bytes()).await?;
                *slot = BodySlot::Read(bytes.clone());
                Ok(bytes)
            }
            BodySlot::Read(bytes) => {
                *slot = BodySlot::Read(bytes.clone());
                Ok(bytes)
            }
            BodySlot::Gone => Ok(Bytes::new()),
        }
    }

    /// Deserializes the query string.
    pub fn query<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        let raw_query_string = self.request.uri().query().unwrap_or("");
        serde_urlencoded::from_str(raw_query_string).map_err(|e| {
            HttpError::for_bad_request(format!(
                "unable to parse query string: {}",
                e
            ))
        })
    }

    /// Deserializes the body as JSON regardless of its content type.
    pub async fn json_body<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        let body = self.body_bytes().await?;
        parse_json(&body)
    }

    /// Decodes the request input into `T`: a JSON body when the content type
    /// is `application/json` (an empty body reads as `{}`), otherwise the
    /// query string plus any url-encoded form body.  Unknown fields are
    /// ignored unless `T` says otherwise.
    pub async fn parse_input<T: DeserializeOwned>(
        &self,
    ) -> Result<T, HttpError> {
        if self.is_json() {
            let body = self.body_bytes().await?;
            if body.is_empty() {
                return parse_json(b"{}");
            }
            return parse_json(&body);
        }

        let pairs = self.form_pairs().await?;
        let encoded = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&pairs)
            .finish();
        let ud = serde_urlencoded::Deserializer::new(form_urlencoded::parse(
            encoded.as_bytes(),
        ));
        serde_path_to_error::deserialize(ud).map_err(|e| {
            HttpError::for_bad_request(format!("unable to decode form: {}", e))
        })
    }

    /// All values submitted for `field`, from the query string, a form body,
    /// or the top level of a JSON body (array elements become separate
    /// values).  `None` when the field was not submitted at all.
    pub async fn input_values(&self, field: &str) -> Option<Vec<String>> {
        let mut values = None;
        for (key, value) in self.form_pairs().await.unwrap_or_default() {
            if key == field {
                values.get_or_insert_with(Vec::new).push(value);
            }
        }
        if let Some(Value::Object(map)) = self.json_object().await {
            if let Some(value) = map.get(field) {
                let values = values.get_or_insert_with(Vec::new);
                match value {
                    Value::Array(items) => {
                        values.extend(items.iter().map(json_to_string))
                    }
                    other => values.push(json_to_string(other)),
                }
            }
        }
        values
    }

    /// The first value submitted for `field`, or the empty string.
    pub async fn input_value(&self, field: &str) -> String {
        self.input_values(field)
            .await
            .and_then(|values| values.into_iter().next())
            .unwrap_or_default()
    }

    /// Every submitted field with its values, for audit logging.  Fields
    /// named in `exclude` are reported with the value `*****`.  Nested JSON
    /// objects are flattened to dotted keys.
    pub async fn input_fields(
        &self,
        exclude: &[&str],
    ) -> BTreeMap<String, Vec<String>> {
        let exclude: BTreeSet<&str> = exclude.iter().copied().collect();
        let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in self.form_pairs().await.unwrap_or_default() {
            fields.entry(key).or_default().push(value);
        }
        if let Some(value) = self.json_object().await {
            flatten_json(String::new(), &value, &mut fields);
        }
        for (key, values) in fields.iter_mut() {
            if exclude.contains(key.as_str()) {
                *values = vec![MASKED_VALUE.to_string()];
            }
        }
        fields
    }

    fn is_json(&self) -> bool {
        self.request.content_type().as_deref()
            == Some(crate::response::CONTENT_TYPE_JSON)
    }

    /// Query pairs followed by the pairs of a url-encoded body.
    async fn form_pairs(&self) -> Result<Vec<(String, String)>, HttpError> {
        let query = self.request.uri().query().unwrap_or("");
        let mut pairs: Vec<(String, String)> = form_urlencoded::parse(
            query.as_bytes(),
        )
        .into_owned()
        .collect();
        if self.request.content_type().as_deref() == Some(CONTENT_TYPE_FORM) {
            let body = self.body_bytes().await?;
            pairs.extend(form_urlencoded::parse(&body).into_owned());
        }
        Ok(pairs)
    }

    async fn json_object(&self) -> Option<Value> {
        if !self.is_json() {
            return None;
        }
        let body = self.body_bytes().await.ok()?;
        match serde_json::from_slice(&body) {
            Ok(value @ Value::Object(_)) => Some(value),
            _ => None,
        }
    }
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, HttpError> {
    let jd = &mut serde_json::Deserializer::from_slice(body);
    serde_path_to_error::deserialize(jd).map_err(|e| {
        HttpError::for_bad_request(format!(
            "unable to parse as json: {:?} - {}",
            String::from_utf8_lossy(body),
            e
        ))
    })
}

fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn flatten_json(
    prefix: String,
    value: &Value,
    fields: &mut BTreeMap<String, Vec<String>>,
) {
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                let key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_json(key, value, fields);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten_json(prefix.clone(), item, fields);
            }
        }
        other => fields.entry(prefix).or_default().push(json_to_string(other)),
    }
}
