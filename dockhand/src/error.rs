// Copyright 2024 Oxide Computer Company

//! Generic server error handling facilities
//!
//! Error handling in the control plane
//! -----------------------------------
//!
//! Every request that reaches the middleware chain concludes with a response,
//! and the decision about which status code to use is made in exactly one
//! place: the error-handling middleware.  Handlers, the authenticator and the
//! lock middleware never write an error response themselves.  Instead they
//! record an [`HttpError`] in the request-scoped error slot (or return one from
//! the handler function, which amounts to the same thing) and let the
//! middleware decide how to present it.
//!
//! That decision depends on whether the response has already started.  If no
//! bytes were written, the error becomes the status line plus a short
//! `text/plain` body.  If the handler was streaming (say, a deploy that already
//! reported progress), the status code has been sent and cannot change, so the
//! error is appended to the stream instead.  See `middleware::ErrorHandler`.
//!
//! Errors from layers that don't know about HTTP (the lock store, the auth
//! schemes, role validation) are `thiserror` enums defined next to the code
//! that produces them.  Each provides a `From` conversion into `HttpError` so
//! that handler code can use `?` freely.

use http::StatusCode;
use std::error::Error;
use std::fmt;

/// Content type of error bodies.
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

/// Message used for every denied permission check.
pub const MESSAGE_FORBIDDEN: &str =
    "You don't have permission to do this action";

/// Message used when a handler requires a principal and none was presented.
pub const MESSAGE_TOKEN_REQUIRED: &str =
    "You must provide a valid Authorization header";

/// The kinds of failure the control plane distinguishes.  Each kind maps to
/// exactly one status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// bad input shape, missing required field, bad enum value
    Validation,
    /// missing or invalid token
    Unauthenticated,
    /// authenticated, but the permission check failed
    Unauthorized,
    /// referenced entity does not exist
    NotFound,
    /// lock contention or duplicate resource name
    Conflict,
    /// e.g., apps being swapped must be compatible
    PreconditionFailed,
    /// unexpected collaborator failure
    Internal,
}

impl ErrorKind {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// `HttpError` represents an error generated as part of handling an API
/// request.  By the time one of these reaches the error-handling middleware,
/// it's turned into either:
///
///   * a status code (400-level for client errors, 500-level for server
///     errors) plus a plain-text body containing the external message, or
///   * a final error event appended to a response that was already streaming.
///
/// Besides that, `HttpError`s also have an internal error message, which may
/// differ from the error message that gets reported to users.  For example, if
/// the request fails because the lock store is unreachable, the client may
/// just see "Internal Server Error", while the server log would include more
/// details.
#[derive(Clone, Debug)]
pub struct HttpError {
    /// HTTP status code for this error
    pub status_code: StatusCode,
    /// classification of this error, if it is one of the well-known kinds
    pub kind: Option<ErrorKind>,
    /// Error message to be sent to API client for this error
    pub external_message: String,
    /// Error message recorded in the log for this error
    pub internal_message: String,
}

impl From<hyper::Error> for HttpError {
    fn from(error: hyper::Error) -> Self {
        HttpError::for_bad_request(format!(
            "error processing request: {}",
            error
        ))
    }
}

impl From<http::Error> for HttpError {
    fn from(error: http::Error) -> Self {
        HttpError::for_internal_error(format!(
            "error building response: {}",
            error
        ))
    }
}

impl From<std::io::Error> for HttpError {
    fn from(error: std::io::Error) -> Self {
        HttpError::for_internal_error(format!("i/o error: {}", error))
    }
}

impl From<serde_json::Error> for HttpError {
    fn from(error: serde_json::Error) -> Self {
        HttpError::for_internal_error(format!(
            "failed to serialize response: {}",
            error
        ))
    }
}

impl HttpError {
    /// Generates an `HttpError` of the given kind with `message` used for both
    /// the internal and external message.
    pub fn for_kind(kind: ErrorKind, message: String) -> Self {
        HttpError {
            status_code: kind.status_code(),
            kind: Some(kind),
            internal_message: message.clone(),
            external_message: message,
        }
    }

    /// Generates a 400 "Bad Request" error with the given `message` used for
    /// both the internal and external message.
    pub fn for_bad_request(message: String) -> Self {
        HttpError::for_kind(ErrorKind::Validation, message)
    }

    /// Generates a 401 error for a token that was presented but rejected.
    pub fn for_unauthenticated(message: String) -> Self {
        HttpError::for_kind(ErrorKind::Unauthenticated, message)
    }

    /// Generates the 401 error used when a handler requires a principal and
    /// the request did not carry a usable token.
    pub fn for_token_required() -> Self {
        HttpError::for_unauthenticated(MESSAGE_TOKEN_REQUIRED.to_string())
    }

    /// Generates a 403 error.  Permission checks use
    /// [`HttpError::for_permission_denied`]; this variant exists for other
    /// refusals (e.g., token/app mismatch) that carry their own message.
    pub fn for_forbidden(message: String) -> Self {
        HttpError::for_kind(ErrorKind::Unauthorized, message)
    }

    /// Generates the 403 error for a failed permission check.
    pub fn for_permission_denied() -> Self {
        HttpError::for_forbidden(MESSAGE_FORBIDDEN.to_string())
    }

    /// Generates a 404 "Not Found" error.  The message is exposed so that
    /// clients can tell which entity was missing ("App not found").
    pub fn for_not_found(message: String) -> Self {
        HttpError::for_kind(ErrorKind::NotFound, message)
    }

    /// Generates a 409 "Conflict" error.
    pub fn for_conflict(message: String) -> Self {
        HttpError::for_kind(ErrorKind::Conflict, message)
    }

    /// Generates a 412 "Precondition Failed" error.
    pub fn for_precondition_failed(message: String) -> Self {
        HttpError::for_kind(ErrorKind::PreconditionFailed, message)
    }

    /// Generates a 500 "Internal Server Error" error with the given
    /// `internal_message` for the internal message.
    pub fn for_internal_error(internal_message: String) -> Self {
        let status_code = StatusCode::INTERNAL_SERVER_ERROR;
        HttpError {
            status_code,
            kind: Some(ErrorKind::Internal),
            external_message: canonical_reason(status_code),
            internal_message,
        }
    }

    /// Generates an `HttpError` for the given HTTP `status_code` where the
    /// internal and external messages for the error come from the standard
    /// label for this status code (e.g., "Service Unavailable").
    pub fn for_status(status_code: StatusCode) -> Self {
        let message = canonical_reason(status_code);
        HttpError {
            status_code,
            kind: None,
            internal_message: message.clone(),
            external_message: message,
        }
    }

    /// Returns the message to present to the client.  With a verbosity of 1 or
    /// more, clients get the internal message, which may include details about
    /// the failing collaborator.
    pub fn message_for_verbosity(&self, verbosity: u32) -> &str {
        if verbosity > 0 {
            &self.internal_message
        } else {
            &self.external_message
        }
    }

    /// Generates a complete (non-streamed) HTTP response for this error.  This
    /// is only used outside the middleware chain, e.g., when the handler task
    /// fails to produce a response head in time.
    pub fn into_response(
        self,
        request_id: &str,
    ) -> hyper::Response<crate::Body> {
        let mut response = hyper::Response::new(crate::Body::from(format!(
            "{}\n",
            self.external_message
        )));
        *response.status_mut() = self.status_code;
        let headers = response.headers_mut();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static(CONTENT_TYPE_TEXT),
        );
        headers.insert(
            http::header::X_CONTENT_TYPE_OPTIONS,
            http::HeaderValue::from_static("nosniff"),
        );
        if let Ok(v) = http::HeaderValue::from_str(request_id) {
            headers.insert(crate::HEADER_REQUEST_ID, v);
        }
        response
    }
}

fn canonical_reason(status_code: StatusCode) -> String {
    status_code.canonical_reason().unwrap_or("Unknown Error").to_string()
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HttpError({}): {}", self.status_code, self.external_message)
    }
}

impl Error for HttpError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}
