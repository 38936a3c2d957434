// Copyright 2024 Oxide Computer Company

//! Permission evaluation
//!
//! A permission is a pair of a *scheme*, a dotted capability name such as
//! `app.update.env.set`, and a *context* that scopes it (the whole platform,
//! one team, one app, one pool, ...).  Schemes form a tree: a grant of
//! `app.update` implies every scheme below it, and the root scheme (written
//! `*` or as the empty string) implies everything.
//!
//! Grants are indexed by scheme in a [`PermissionSet`].  A check walks the
//! ancestors of the *required* scheme and looks each one up, so its cost
//! depends on the depth of the scheme, not on how many grants a principal
//! holds.

use crate::error::HttpError;
use crate::store::App;
use crate::token::Token;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;

/// Well-known scheme names used by the core and its handlers.
pub mod scheme {
    pub const ALL: &str = "";
    pub const APP: &str = "app";
    pub const APP_CREATE: &str = "app.create";
    pub const APP_DELETE: &str = "app.delete";
    pub const APP_READ: &str = "app.read";
    pub const APP_READ_ENV: &str = "app.read.env";
    pub const APP_READ_LOG: &str = "app.read.log";
    pub const APP_UPDATE: &str = "app.update";
    pub const APP_UPDATE_ENV: &str = "app.update.env";
    pub const APP_UPDATE_ENV_SET: &str = "app.update.env.set";
    pub const APP_UPDATE_ENV_UNSET: &str = "app.update.env.unset";
    pub const APP_UPDATE_SWAP: &str = "app.update.swap";
    pub const APP_UPDATE_RESTART: &str = "app.update.restart";
    pub const APP_UPDATE_LOG: &str = "app.update.log";
    pub const APP_UPDATE_UNIT_ADD: &str = "app.update.unit.add";
    pub const APP_UPDATE_UNIT_REMOVE: &str = "app.update.unit.remove";
    pub const APP_UPDATE_UNIT_REGISTER: &str = "app.update.unit.register";
    pub const APP_UPDATE_UNIT_STATUS: &str = "app.update.unit.status";
    pub const APP_DEPLOY: &str = "app.deploy";
    pub const APP_RUN: &str = "app.run";
    pub const APP_ADMIN_UNLOCK: &str = "app.admin.unlock";
    pub const TEAM: &str = "team";
    pub const TEAM_CREATE: &str = "team.create";
    pub const TEAM_READ: &str = "team.read";
    pub const TEAM_UPDATE: &str = "team.update";
    pub const TEAM_DELETE: &str = "team.delete";
    pub const TEAM_TOKEN_READ: &str = "team.token.read";
    pub const TEAM_TOKEN_CREATE: &str = "team.token.create";
    pub const POOL: &str = "pool";
    pub const POOL_READ: &str = "pool.read";
    pub const POOL_UPDATE: &str = "pool.update";
    pub const NODE: &str = "node";
    pub const NODE_READ: &str = "node.read";
    pub const NODE_CREATE: &str = "node.create";
    pub const SERVICE: &str = "service";
    pub const SERVICE_READ: &str = "service.read";
    pub const SERVICE_INSTANCE: &str = "service-instance";
    pub const SERVICE_INSTANCE_READ: &str = "service-instance.read";
    pub const SERVICE_INSTANCE_UPDATE_BIND: &str =
        "service-instance.update.bind";
    pub const SERVICE_INSTANCE_UPDATE_UNBIND: &str =
        "service-instance.update.unbind";
    pub const ROLE: &str = "role";
    pub const ROLE_UPDATE: &str = "role.update";
    pub const USER: &str = "user";
    pub const USER_READ: &str = "user.read";
    pub const VOLUME: &str = "volume";
    pub const ROUTER: &str = "router";
    pub const CLUSTER: &str = "cluster";
    pub const WEBHOOK: &str = "webhook";
}

/// The kinds of scope a grant can have.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ContextType {
    Global,
    Team,
    App,
    Pool,
    Service,
    ServiceInstance,
    Node,
    Role,
    Volume,
    Router,
    Cluster,
    User,
    Webhook,
}

impl ContextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Global => "global",
            ContextType::Team => "team",
            ContextType::App => "app",
            ContextType::Pool => "pool",
            ContextType::Service => "service",
            ContextType::ServiceInstance => "service-instance",
            ContextType::Node => "node",
            ContextType::Role => "role",
            ContextType::Volume => "volume",
            ContextType::Router => "router",
            ContextType::Cluster => "cluster",
            ContextType::User => "user",
            ContextType::Webhook => "webhook",
        }
    }
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The scope of a grant or of a required permission.  The global context
/// always has an empty value.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct PermissionContext {
    pub ctx_type: ContextType,
    pub value: String,
}

impl PermissionContext {
    pub fn global() -> Self {
        PermissionContext {
            ctx_type: ContextType::Global,
            value: String::new(),
        }
    }

    pub fn new(ctx_type: ContextType, value: impl Into<String>) -> Self {
        if ctx_type == ContextType::Global {
            return PermissionContext::global();
        }
        PermissionContext { ctx_type, value: value.into() }
    }
}

/// A single grant: `scheme` within `context`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Permission {
    pub scheme: String,
    pub context: PermissionContext,
}

impl Permission {
    pub fn new(scheme: &str, context: PermissionContext) -> Self {
        Permission { scheme: normalize_scheme(scheme).to_string(), context }
    }
}

fn normalize_scheme(scheme: &str) -> &str {
    if scheme == "*" {
        ""
    } else {
        scheme
    }
}

/// Returns true if scheme `a` equals scheme `b` or is a dotted prefix of it
/// aligned on a segment boundary.  The root scheme is an ancestor of all.
pub fn is_ancestor(a: &str, b: &str) -> bool {
    let a = normalize_scheme(a);
    let b = normalize_scheme(b);
    a.is_empty()
        || a == b
        || (b.len() > a.len()
            && b.starts_with(a)
            && b.as_bytes()[a.len()] == b'.')
}

/// Returns true if a grant in context `granted` covers a request in context
/// `required`.
pub fn dominates(
    granted: &PermissionContext,
    required: &PermissionContext,
) -> bool {
    granted.ctx_type == ContextType::Global || granted == required
}

/// Iterates over `scheme` and its ancestors, deepest first, ending with the
/// root.
fn ancestors(scheme: &str) -> impl Iterator<Item = &str> {
    let scheme = normalize_scheme(scheme);
    let mut next = Some(scheme);
    std::iter::from_fn(move || {
        let current = next?;
        next = if current.is_empty() {
            None
        } else {
            Some(current.rfind('.').map(|i| &current[..i]).unwrap_or(""))
        };
        Some(current)
    })
}

#[derive(Clone, Debug, Default)]
struct Grants {
    global: bool,
    contexts: HashSet<PermissionContext>,
}

/// The grants held by one principal, indexed by scheme.
#[derive(Clone, Debug, Default)]
pub struct PermissionSet {
    by_scheme: HashMap<String, Grants>,
}

impl PermissionSet {
    pub fn new() -> Self {
        PermissionSet::default()
    }

    pub fn insert(&mut self, permission: Permission) {
        let grants = self
            .by_scheme
            .entry(normalize_scheme(&permission.scheme).to_string())
            .or_default();
        if permission.context.ctx_type == ContextType::Global {
            grants.global = true;
        } else {
            grants.contexts.insert(permission.context);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_scheme.is_empty()
    }

    /// Lists every grant, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.by_scheme.iter().flat_map(|(scheme, grants)| {
            grants
                .global
                .then(|| Permission {
                    scheme: scheme.clone(),
                    context: PermissionContext::global(),
                })
                .into_iter()
                .chain(grants.contexts.iter().map(|ctx| Permission {
                    scheme: scheme.clone(),
                    context: ctx.clone(),
                }))
        })
    }

    /// Returns true if some grant covers `required` in at least one of
    /// `contexts`.  An empty context list is treated as a request for the
    /// global context.
    pub fn satisfies(
        &self,
        required: &str,
        contexts: &[PermissionContext],
    ) -> bool {
        let global = [PermissionContext::global()];
        let contexts = if contexts.is_empty() { &global[..] } else { contexts };
        ancestors(required).any(|scheme| match self.by_scheme.get(scheme) {
            None => false,
            Some(grants) => {
                grants.global
                    || contexts.iter().any(|c| grants.contexts.contains(c))
            }
        })
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        let mut set = PermissionSet::new();
        for permission in iter {
            set.insert(permission);
        }
        set
    }
}

/// Returns true if `token` holds `scheme` in at least one of `contexts`.
pub fn satisfies(
    token: &Token,
    scheme: &str,
    contexts: &[PermissionContext],
) -> bool {
    token.permissions().satisfies(scheme, contexts)
}

/// Like [`satisfies`], but produces the 403 error used for denied checks.
pub fn check(
    token: &Token,
    scheme: &str,
    contexts: &[PermissionContext],
) -> Result<(), HttpError> {
    if satisfies(token, scheme, contexts) {
        Ok(())
    } else {
        Err(HttpError::for_permission_denied())
    }
}

/// The contexts in which an app-scoped permission is checked: each owning
/// team, the app itself and its pool.
pub fn contexts_for_app(app: &App) -> Vec<PermissionContext> {
    let mut contexts: Vec<PermissionContext> = app
        .teams
        .iter()
        .map(|team| PermissionContext::new(ContextType::Team, team.as_str()))
        .collect();
    contexts.push(PermissionContext::new(ContextType::App, app.name.as_str()));
    contexts.push(PermissionContext::new(ContextType::Pool, app.pool.as_str()));
    contexts
}

/// Returns the contexts in which `token` holds `scheme`, restricted to
/// `ctx_types` when that list is non-empty.  A global grant shows up as the
/// global context; callers use it to mean "no filter".
pub fn contexts_for_permission(
    token: &Token,
    scheme: &str,
    ctx_types: &[ContextType],
) -> Vec<PermissionContext> {
    let mut contexts = Vec::new();
    let wanted = |ctx_type: ContextType| {
        ctx_types.is_empty()
            || ctx_type == ContextType::Global
            || ctx_types.contains(&ctx_type)
    };
    for permission in token.permissions().iter() {
        if !is_ancestor(&permission.scheme, scheme) {
            continue;
        }
        if wanted(permission.context.ctx_type)
            && !contexts.contains(&permission.context)
        {
            contexts.push(permission.context);
        }
    }
    contexts
}

/// The scheme tree: which schemes exist and in which context types each may
/// be granted.
#[derive(Clone, Debug)]
pub struct SchemeRegistry {
    schemes: BTreeMap<String, Vec<ContextType>>,
}

impl SchemeRegistry {
    /// Creates a registry that knows only the root scheme, which may be
    /// granted globally.
    pub fn new() -> Self {
        let mut schemes = BTreeMap::new();
        schemes.insert(String::new(), vec![ContextType::Global]);
        SchemeRegistry { schemes }
    }

    /// Registers `name`.  With an empty `contexts`, the scheme inherits the
    /// allowed contexts of its nearest registered ancestor.
    ///
    /// # Panics
    ///
    /// Panics if the parent of `name` has not been registered.
    pub fn register(&mut self, name: &str, contexts: &[ContextType]) {
        let parent = name.rfind('.').map(|i| &name[..i]).unwrap_or("");
        let inherited = match self.schemes.get(parent) {
            Some(inherited) => inherited.clone(),
            None => panic!(
                "permission scheme \"{}\": parent \"{}\" is not registered",
                name, parent
            ),
        };
        let allowed =
            if contexts.is_empty() { inherited } else { contexts.to_vec() };
        self.schemes.insert(name.to_string(), allowed);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemes.contains_key(normalize_scheme(name))
    }

    pub fn allowed_contexts(&self, name: &str) -> Option<&[ContextType]> {
        self.schemes.get(normalize_scheme(name)).map(|v| v.as_slice())
    }

    /// The schemes used by the control plane.
    pub fn standard() -> Self {
        use ContextType as C;
        let mut registry = SchemeRegistry::new();
        let entries: &[(&str, &[C])] = &[
            (scheme::APP, &[C::Global, C::Team, C::App, C::Pool]),
            (scheme::APP_CREATE, &[C::Global, C::Team]),
            (scheme::APP_DELETE, &[]),
            (scheme::APP_READ, &[]),
            (scheme::APP_READ_ENV, &[]),
            (scheme::APP_READ_LOG, &[]),
            (scheme::APP_UPDATE, &[]),
            (scheme::APP_UPDATE_ENV, &[]),
            (scheme::APP_UPDATE_ENV_SET, &[]),
            (scheme::APP_UPDATE_ENV_UNSET, &[]),
            (scheme::APP_UPDATE_SWAP, &[]),
            (scheme::APP_UPDATE_RESTART, &[]),
            (scheme::APP_UPDATE_LOG, &[]),
            ("app.update.unit", &[]),
            (scheme::APP_UPDATE_UNIT_ADD, &[]),
            (scheme::APP_UPDATE_UNIT_REMOVE, &[]),
            (scheme::APP_UPDATE_UNIT_REGISTER, &[]),
            (scheme::APP_UPDATE_UNIT_STATUS, &[]),
            (scheme::APP_DEPLOY, &[]),
            (scheme::APP_RUN, &[]),
            ("app.admin", &[C::Global, C::Pool]),
            (scheme::APP_ADMIN_UNLOCK, &[]),
            (scheme::TEAM, &[C::Global, C::Team]),
            (scheme::TEAM_CREATE, &[C::Global]),
            (scheme::TEAM_READ, &[]),
            (scheme::TEAM_UPDATE, &[]),
            (scheme::TEAM_DELETE, &[]),
            ("team.token", &[]),
            (scheme::TEAM_TOKEN_READ, &[]),
            (scheme::TEAM_TOKEN_CREATE, &[]),
            (scheme::POOL, &[C::Global, C::Pool]),
            (scheme::POOL_READ, &[]),
            (scheme::POOL_UPDATE, &[]),
            (scheme::NODE, &[C::Global, C::Pool]),
            (scheme::NODE_READ, &[]),
            (scheme::NODE_CREATE, &[]),
            (scheme::SERVICE, &[C::Global, C::Service, C::Team]),
            (scheme::SERVICE_READ, &[]),
            (
                scheme::SERVICE_INSTANCE,
                &[C::Global, C::ServiceInstance, C::Team],
            ),
            (scheme::SERVICE_INSTANCE_READ, &[]),
            ("service-instance.update", &[]),
            (scheme::SERVICE_INSTANCE_UPDATE_BIND, &[]),
            (scheme::SERVICE_INSTANCE_UPDATE_UNBIND, &[]),
            (scheme::ROLE, &[C::Global, C::Role]),
            (scheme::ROLE_UPDATE, &[]),
            (scheme::USER, &[C::Global, C::User]),
            (scheme::USER_READ, &[]),
            (scheme::VOLUME, &[C::Global, C::Volume, C::Team, C::Pool]),
            (scheme::ROUTER, &[C::Global, C::Router]),
            (scheme::CLUSTER, &[C::Global, C::Cluster]),
            (scheme::WEBHOOK, &[C::Global, C::Webhook, C::Team]),
        ];
        for (name, contexts) in entries {
            registry.register(name, contexts);
        }
        registry
    }
}

impl Default for SchemeRegistry {
    fn default() -> Self {
        SchemeRegistry::new()
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum RoleError {
    #[error("invalid role name")]
    InvalidRoleName,
    #[error("invalid permission name")]
    InvalidPermissionName,
    #[error("permission \"{0}\" not found")]
    PermissionNotFound(String),
    #[error(
        "permission \"{permission}\" not allowed with context of type \
         \"{ctx_type}\""
    )]
    PermissionNotAllowed { permission: String, ctx_type: ContextType },
}

impl From<RoleError> for HttpError {
    fn from(error: RoleError) -> Self {
        HttpError::for_bad_request(error.to_string())
    }
}

/// A named bundle of schemes granted together in a single context type.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Role {
    pub name: String,
    #[serde(rename = "context")]
    pub context_type: ContextType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scheme_names: Vec<String>,
}

impl Role {
    pub fn new(
        name: &str,
        context_type: ContextType,
    ) -> Result<Self, RoleError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RoleError::InvalidRoleName);
        }
        Ok(Role {
            name: name.to_string(),
            context_type,
            scheme_names: Vec::new(),
        })
    }

    /// Adds schemes to the role.  Every name must exist in `registry` and
    /// allow this role's context type; nothing is added unless all do.
    pub fn add_permissions(
        &mut self,
        registry: &SchemeRegistry,
        names: &[&str],
    ) -> Result<(), RoleError> {
        for name in names {
            if name.is_empty() {
                return Err(RoleError::InvalidPermissionName);
            }
            let allowed = registry.allowed_contexts(name).ok_or_else(|| {
                RoleError::PermissionNotFound(name.to_string())
            })?;
            if !allowed.contains(&self.context_type) {
                return Err(RoleError::PermissionNotAllowed {
                    permission: name.to_string(),
                    ctx_type: self.context_type,
                });
            }
        }
        for name in names {
            if !self.scheme_names.iter().any(|s| s == name) {
                self.scheme_names.push(name.to_string());
            }
        }
        Ok(())
    }

    pub fn remove_permissions(&mut self, names: &[&str]) {
        self.scheme_names.retain(|s| !names.contains(&s.as_str()));
    }

    /// Expands the role into grants scoped to `context_value`.
    pub fn permissions_for(&self, context_value: &str) -> Vec<Permission> {
        self.scheme_names
            .iter()
            .map(|name| {
                Permission::new(
                    name,
                    PermissionContext::new(self.context_type, context_value),
                )
            })
            .collect()
    }
}
