// Copyright 2024 Oxide Computer Company

//! Principals and the schemes that authenticate them

use crate::error::HttpError;
use crate::permission::PermissionSet;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

/// Who a token speaks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Principal {
    /// a human user, identified by email
    User { email: String },
    /// an app talking to the control plane about itself (e.g., a unit
    /// reporting its status)
    App { app: String },
    /// a token issued to a team; `creator` is the user who created it
    Team { team: String, creator: String },
}

/// An authenticated credential.  A token never changes once the auth scheme
/// has produced it.
#[derive(Clone, Debug)]
pub struct Token {
    value: String,
    principal: Principal,
    permissions: Arc<PermissionSet>,
}

impl Token {
    pub fn new(
        value: impl Into<String>,
        principal: Principal,
        permissions: PermissionSet,
    ) -> Self {
        Token {
            value: value.into(),
            principal,
            permissions: Arc::new(permissions),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// The name recorded as the owner of anything this token does, e.g. the
    /// holder of an app lock.
    pub fn owner_name(&self) -> &str {
        match &self.principal {
            Principal::User { email } => email,
            Principal::App { app } => app,
            Principal::Team { creator, .. } => creator,
        }
    }

    /// The app an app token is bound to.
    pub fn bound_app(&self) -> Option<&str> {
        match &self.principal {
            Principal::App { app } => Some(app),
            _ => None,
        }
    }

    pub fn is_app_token(&self) -> bool {
        matches!(self.principal, Principal::App { .. })
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum AuthError {
    /// The value is not a token this scheme knows.  The authenticator treats
    /// this as "no principal" rather than as a failure.
    #[error("invalid token")]
    InvalidToken,
    #[error("{0}")]
    Other(String),
}

impl From<AuthError> for HttpError {
    fn from(error: AuthError) -> Self {
        HttpError::for_unauthenticated(error.to_string())
    }
}

/// A way of turning a bearer value into a [`Token`]: the configured user
/// auth provider, long-lived API tokens, team tokens.
#[async_trait]
pub trait AuthScheme: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn auth(&self, value: &str) -> Result<Token, AuthError>;
}

/// Tries a primary scheme and then each fallback in order.
#[derive(Clone)]
pub struct Authenticator {
    primary: Arc<dyn AuthScheme>,
    fallbacks: Vec<Arc<dyn AuthScheme>>,
}

impl Authenticator {
    pub fn new(primary: Arc<dyn AuthScheme>) -> Self {
        Authenticator { primary, fallbacks: Vec::new() }
    }

    pub fn with_fallback(mut self, scheme: Arc<dyn AuthScheme>) -> Self {
        self.fallbacks.push(scheme);
        self
    }

    /// Returns the first token any scheme produces.  When every scheme
    /// rejects the value, the error from the last one is returned.
    pub async fn validate(&self, value: &str) -> Result<Token, AuthError> {
        let mut result = self.primary.auth(value).await;
        for scheme in &self.fallbacks {
            if result.is_ok() {
                break;
            }
            result = scheme.auth(value).await;
        }
        result
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = vec![self.primary.name()];
        names.extend(self.fallbacks.iter().map(|s| s.name()));
        f.debug_struct("Authenticator").field("schemes", &names).finish()
    }
}

/// An in-memory scheme that maps token values to tokens.
pub struct TokenTable {
    name: String,
    tokens: RwLock<HashMap<String, Token>>,
}

impl TokenTable {
    pub fn new(name: &str) -> Self {
        TokenTable {
            name: name.to_string(),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, token: Token) {
        self.tokens.write().unwrap().insert(token.value().to_string(), token);
    }

    pub fn revoke(&self, value: &str) -> bool {
        self.tokens.write().unwrap().remove(value).is_some()
    }
}

#[async_trait]
impl AuthScheme for TokenTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn auth(&self, value: &str) -> Result<Token, AuthError> {
        self.tokens
            .read()
            .unwrap()
            .get(value)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

/// Extracts the token value from an `Authorization` header value.  Accepts
/// `bearer <value>` in any letter case, or a bare value.
pub fn parse_bearer(header: &str) -> Option<&str> {
    let header = header.trim();
    let value = match header.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => {
            rest.trim()
        }
        _ => header,
    };
    (!value.is_empty()).then_some(value)
}
