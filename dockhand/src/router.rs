// Copyright 2021 Oxide Computer Company
/*!
 * Routes incoming HTTP requests to handler functions
 */

use super::error::HttpError;
use super::handler::RouteHandler;

use crate::server::ServerContext;
use http::Method;
use percent_encoding::percent_decode_str;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/**
 * Key used in a node's method table for handlers registered with
 * `HttpRouter::add_all()`.
 */
const ANY_METHOD: &str = "*";

/**
 * An API version, written `major.minor` at the front of a request path (e.g.,
 * `/1.1/apps`).  Versions compare numerically, so `1.10` is newer than `1.9`.
 */
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    /** Version assumed for requests whose path carries no version prefix. */
    pub const DEFAULT: ApiVersion = ApiVersion { major: 1, minor: 0 };

    pub const fn new(major: u32, minor: u32) -> Self {
        ApiVersion { major, minor }
    }
}

impl Default for ApiVersion {
    fn default() -> Self {
        ApiVersion::DEFAULT
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ApiVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = match s.split_once('.') {
            Some((major, minor)) => (major, minor),
            None => (s, "0"),
        };
        let parse = |part: &str| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(format!("invalid API version: {:?}", s));
            }
            part.parse::<u32>()
                .map_err(|_| format!("invalid API version: {:?}", s))
        };
        Ok(ApiVersion { major: parse(major)?, minor: parse(minor)? })
    }
}

/**
 * `HttpRouter` maps an HTTP method and URI path to a handler, separately for
 * each API version.
 *
 * Routes are registered and looked up according to a path, like
 * `"/apps/{app}/env"`.  Paths are split into segments separated by one or
 * more '/' characters.  When registering a route, a path segment may be
 * either a literal string or a variable.  Variables are specified by wrapping
 * the segment in braces.  A variable written `{name:.*}` consumes the rest of
 * the path.
 *
 * Each version has its own trie where edges represent segments of the URI
 * path.  To register or look up the path `"/apps/myapp/env"`, we would start
 * at the root and traverse edges for `"apps"`, `"myapp"` (or the variable
 * edge, if no literal `"myapp"` exists), and `"env"`, arriving at a node with
 * a set of handlers, each associated with one HTTP method.
 *
 * A node may have both literal and variable edges.  Lookup tries the literal
 * edge first and falls back to the variable edge if the literal subtree has
 * no route for the rest of the path, so `"/apps/search"` wins over
 * `"/apps/{app}"` without hiding `"/apps/{app}/env"`.
 *
 * A request path may begin with a version segment (`/1.1/apps`).  Routes
 * registered at version V serve requests for any version >= V; the newest
 * registered version not newer than the request wins.  Paths without a
 * version segment are treated as version 1.0.
 *
 * We make (and enforce) a few simplifying assumptions:
 *
 * * If a given resource has a variable edge, all routes through this node
 *   must use the same name for that variable.  That is, you can't define
 *   routes for `"/apps/{app}"` and `"/apps/{name}/env"`.
 *
 * * A given path cannot use the same variable name twice.
 *
 * * A given resource may have at most one handler for a given HTTP method in
 *   a given version.
 *
 * * Routes are registered during server initialization.  After that, the
 *   router is read-only.
 */
pub struct HttpRouter<Context: ServerContext> {
    /** one trie per registered version */
    versions: BTreeMap<ApiVersion, HttpRouterNode<Context>>,
}

/**
 * Each node in the tree represents a group of HTTP resources having the same
 * handler functions, e.g. `"/apps/myapp/env"` and `"/apps/other/env"`.
 */
struct HttpRouterNode<Context: ServerContext> {
    /** Handlers for each of the HTTP methods defined for this node. */
    methods: BTreeMap<String, RouteEntry<Context>>,
    /** Outgoing edges for literal paths. */
    literals: BTreeMap<String, HttpRouterNode<Context>>,
    /** Outgoing edge for a variable segment (or the rest of the path). */
    variable: Option<HttpRouterVariable<Context>>,
}

enum HttpRouterVariable<Context: ServerContext> {
    /** matches exactly one segment */
    Single(String, Box<HttpRouterNode<Context>>),
    /** matches all remaining segments, possibly none */
    Rest(String, Box<HttpRouterNode<Context>>),
}

struct RouteEntry<Context: ServerContext> {
    /** the pattern this route was registered with */
    path: String,
    handler: Arc<dyn RouteHandler<Context>>,
}

/**
 * `PathSegment` represents a segment in a URI path when the router is being
 * configured.  Each segment may be either a literal string or a variable (the
 * latter indicated by being wrapped in braces).
 */
#[derive(Debug, PartialEq)]
pub enum PathSegment {
    /** a path segment for a literal string */
    Literal(String),
    /** a path segment for a variable */
    VarnameSegment(String),
    /** a path segment that matches all remaining components for a variable */
    VarnameWildcard(String),
}

impl PathSegment {
    /**
     * Given a `&str` representing a path segment from a route pattern, return
     * a PathSegment.
     */
    pub fn from(segment: &str) -> PathSegment {
        if segment.starts_with('{') || segment.ends_with('}') {
            assert!(
                segment.starts_with('{'),
                "{}",
                "HTTP URI path segment variable missing leading \"{\""
            );
            assert!(
                segment.ends_with('}'),
                "{}",
                "HTTP URI path segment variable missing trailing \"}\""
            );

            let var = &segment[1..segment.len() - 1];

            let (var, pat) = if let Some(index) = var.find(':') {
                (&var[..index], Some(&var[index + 1..]))
            } else {
                (var, None)
            };

            assert!(
                !var.is_empty(),
                "HTTP URI path segment variable name must not be empty",
            );

            if let Some(pat) = pat {
                assert!(
                    pat == ".*",
                    "Only the pattern '.*' is currently supported"
                );
                PathSegment::VarnameWildcard(var.to_string())
            } else {
                PathSegment::VarnameSegment(var.to_string())
            }
        } else {
            PathSegment::Literal(segment.to_string())
        }
    }
}

/** Values bound to the variables of the matched route. */
pub type VariableSet = BTreeMap<String, String>;

/**
 * `RouteMatch` is the result of `HttpRouter::lookup()`.
 */
pub enum RouteMatch<Context: ServerContext> {
    /** a handler for this method and path */
    Found {
        handler: Arc<dyn RouteHandler<Context>>,
        variables: VariableSet,
        /** the pattern the handler was registered with */
        path: String,
        /** the version the handler was registered at */
        version: ApiVersion,
    },
    /** the path exists, but not for this method */
    MethodNotAllowed { allow: Vec<String> },
    NotFound,
}

impl<Context: ServerContext> fmt::Debug for RouteMatch<Context> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteMatch::Found { handler, variables, path, version } => f
                .debug_struct("Found")
                .field("handler", &handler.name())
                .field("variables", variables)
                .field("path", path)
                .field("version", version)
                .finish(),
            RouteMatch::MethodNotAllowed { allow } => f
                .debug_struct("MethodNotAllowed")
                .field("allow", allow)
                .finish(),
            RouteMatch::NotFound => f.write_str("NotFound"),
        }
    }
}

/** One registered route, as reported by `HttpRouter::routes()`. */
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouteDescription {
    pub version: ApiVersion,
    /** HTTP method, or `"*"` for a route registered with `add_all()` */
    pub method: String,
    pub path: String,
    pub handler: String,
}

impl<Context: ServerContext> HttpRouterNode<Context> {
    fn new() -> Self {
        HttpRouterNode {
            methods: BTreeMap::new(),
            literals: BTreeMap::new(),
            variable: None,
        }
    }
}

impl<Context: ServerContext> Default for HttpRouter<Context> {
    fn default() -> Self {
        HttpRouter::new()
    }
}

impl<Context: ServerContext> fmt::Debug for HttpRouter<Context> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.routes()).finish()
    }
}

impl<Context: ServerContext> HttpRouter<Context> {
    /**
     * Returns a new `HttpRouter` with no routes configured.
     */
    pub fn new() -> Self {
        HttpRouter { versions: BTreeMap::new() }
    }

    /**
     * Configure a route for HTTP requests based on the HTTP `method` and
     * URI `path`, for requests at `version` or newer.  See the `HttpRouter`
     * docs for information about how `path` is processed.
     */
    pub fn add(
        &mut self,
        version: ApiVersion,
        method: Method,
        path: &str,
        handler: Arc<dyn RouteHandler<Context>>,
    ) {
        self.insert(version, method.as_str().to_uppercase(), path, handler);
    }

    /**
     * Like `add()`, but the handler serves every HTTP method that has no
     * route of its own at this path.
     */
    pub fn add_all(
        &mut self,
        version: ApiVersion,
        path: &str,
        handler: Arc<dyn RouteHandler<Context>>,
    ) {
        self.insert(version, ANY_METHOD.to_string(), path, handler);
    }

    fn insert(
        &mut self,
        version: ApiVersion,
        methodname: String,
        path: &str,
        handler: Arc<dyn RouteHandler<Context>>,
    ) {
        let all_segments = route_path_to_segments(path);
        let mut all_segments = all_segments.into_iter();
        let mut varnames: BTreeSet<String> = BTreeSet::new();

        let mut node: &mut HttpRouterNode<Context> =
            self.versions.entry(version).or_insert_with(HttpRouterNode::new);
        while let Some(raw_segment) = all_segments.next() {
            let segment = PathSegment::from(raw_segment);

            node = match segment {
                PathSegment::Literal(lit) => node
                    .literals
                    .entry(lit)
                    .or_insert_with(HttpRouterNode::new),

                PathSegment::VarnameSegment(new_varname) => {
                    insert_var(path, &mut varnames, &new_varname);

                    let edge = node.variable.get_or_insert_with(|| {
                        HttpRouterVariable::Single(
                            new_varname.clone(),
                            Box::new(HttpRouterNode::new()),
                        )
                    });
                    match edge {
                        HttpRouterVariable::Rest(varname, _) => panic!(
                            "URI path \"{}\": attempted to register route for \
                             variable path segment (variable name: \"{}\") \
                             when a route already exists for the remainder of \
                             the path as {}",
                            path, new_varname, varname,
                        ),
                        HttpRouterVariable::Single(varname, ref mut node) => {
                            check_varname(path, &new_varname, varname);
                            node
                        }
                    }
                }

                PathSegment::VarnameWildcard(new_varname) => {
                    /*
                     * We don't accept further path segments after the .*.
                     */
                    if all_segments.next().is_some() {
                        panic!(
                            "URI path \"{}\": attempted to match segments \
                             after the wildcard variable \"{}\"",
                            path, new_varname,
                        );
                    }

                    insert_var(path, &mut varnames, &new_varname);

                    let edge = node.variable.get_or_insert_with(|| {
                        HttpRouterVariable::Rest(
                            new_varname.clone(),
                            Box::new(HttpRouterNode::new()),
                        )
                    });
                    match edge {
                        HttpRouterVariable::Single(varname, _) => panic!(
                            "URI path \"{}\": attempted to register route for \
                             variable path regex (variable name: \"{}\") when \
                             a route already exists for a segment {}",
                            path, new_varname, varname,
                        ),
                        HttpRouterVariable::Rest(varname, ref mut node) => {
                            check_varname(path, &new_varname, varname);
                            node
                        }
                    }
                }
            };
        }

        if node.methods.contains_key(&methodname) {
            panic!(
                "URI path \"{}\": attempted to create duplicate route for \
                 method \"{}\" in version {}",
                path, methodname, version,
            );
        }

        node.methods
            .insert(methodname, RouteEntry { path: path.to_string(), handler });
    }

    /**
     * Look up the route handler for an HTTP request having method `method`
     * and URI path `path`.  The path may start with a version segment.
     *
     * Returns an error only for paths that cannot be decoded or that contain
     * dot-segments.
     */
    pub fn lookup(
        &self,
        method: &Method,
        path: &str,
    ) -> Result<RouteMatch<Context>, HttpError> {
        let mut segments = input_path_to_segments(path).map_err(|_| {
            HttpError::for_bad_request(String::from("invalid path encoding"))
        })?;
        let requested = match segments.first() {
            Some(first) if looks_like_version(first) => {
                let version = first.parse::<ApiVersion>().map_err(|_| {
                    HttpError::for_bad_request(format!(
                        "invalid API version: {:?}",
                        first
                    ))
                })?;
                segments.remove(0);
                version
            }
            _ => ApiVersion::DEFAULT,
        };

        let methodname = method.as_str().to_uppercase();
        let mut allow: BTreeSet<String> = BTreeSet::new();

        for (version, root) in self.versions.range(..=requested).rev() {
            let mut variables = VariableSet::new();
            let Some(node) = find_node(root, &segments, &mut variables) else {
                continue;
            };

            let entry = node
                .methods
                .get(&methodname)
                .or_else(|| node.methods.get(ANY_METHOD));
            if let Some(entry) = entry {
                return Ok(RouteMatch::Found {
                    handler: Arc::clone(&entry.handler),
                    variables,
                    path: entry.path.clone(),
                    version: *version,
                });
            }

            /*
             * An older version may still serve this method at the same path.
             * Remember what this one offers for the Allow header.
             */
            allow.extend(node.methods.keys().cloned());
        }

        if allow.is_empty() {
            Ok(RouteMatch::NotFound)
        } else {
            let allow = allow.into_iter().collect();
            Ok(RouteMatch::MethodNotAllowed { allow })
        }
    }

    /**
     * Lists every registered route, ordered by version and then path.
     */
    pub fn routes(&self) -> impl Iterator<Item = RouteDescription> + '_ {
        let mut routes = Vec::new();
        for (version, root) in &self.versions {
            collect_routes(*version, root, &mut routes);
        }
        routes.into_iter()
    }
}

/**
 * Walks the trie from `node` along `segments`, preferring literal edges and
 * backtracking to the variable edge.  Only nodes with at least one handler
 * count as a match, so a literal prefix of some other route does not hide a
 * variable route.
 */
fn find_node<'a, Context: ServerContext>(
    node: &'a HttpRouterNode<Context>,
    segments: &[String],
    variables: &mut VariableSet,
) -> Option<&'a HttpRouterNode<Context>> {
    let Some((segment, rest)) = segments.split_first() else {
        if !node.methods.is_empty() {
            return Some(node);
        }
        /*
         * The wildcard match consumes the implicit, empty path segment.
         */
        if let Some(HttpRouterVariable::Rest(varname, child)) = &node.variable
        {
            if !child.methods.is_empty() {
                variables.insert(varname.clone(), String::new());
                return Some(child);
            }
        }
        return None;
    };

    if let Some(child) = node.literals.get(segment) {
        if let Some(found) = find_node(child, rest, variables) {
            return Some(found);
        }
    }

    match &node.variable {
        None => None,
        Some(HttpRouterVariable::Single(varname, child)) => {
            let found = find_node(child, rest, variables)?;
            variables.insert(varname.clone(), segment.clone());
            Some(found)
        }
        Some(HttpRouterVariable::Rest(varname, child)) => {
            if child.methods.is_empty() {
                return None;
            }
            variables.insert(varname.clone(), segments.join("/"));
            Some(child)
        }
    }
}

fn collect_routes<Context: ServerContext>(
    version: ApiVersion,
    node: &HttpRouterNode<Context>,
    routes: &mut Vec<RouteDescription>,
) {
    for (method, entry) in &node.methods {
        routes.push(RouteDescription {
            version,
            method: method.clone(),
            path: entry.path.clone(),
            handler: entry.handler.name().to_string(),
        });
    }
    for child in node.literals.values() {
        collect_routes(version, child, routes);
    }
    match &node.variable {
        Some(HttpRouterVariable::Single(_, child))
        | Some(HttpRouterVariable::Rest(_, child)) => {
            collect_routes(version, child, routes)
        }
        None => {}
    }
}

/**
 * Insert a variable into the set after checking for duplicates.
 */
fn insert_var(path: &str, varnames: &mut BTreeSet<String>, new_varname: &str) {
    /*
     * Do not allow the same variable name to be used more than
     * once in the path.  This could be supported (with some caveats), but it
     * seems more likely to be a mistake.
     */
    if varnames.contains(new_varname) {
        panic!(
            "URI path \"{}\": variable name \"{}\" is used more than once",
            path, new_varname
        );
    }
    varnames.insert(new_varname.to_string());
}

/**
 * Don't allow people to use different names for the same part of the path.
 */
fn check_varname(path: &str, new_varname: &str, varname: &str) {
    if new_varname != varname {
        panic!(
            "URI path \"{}\": attempted to use variable name \"{}\", but a \
             different name (\"{}\") has already been used for this",
            path, new_varname, varname
        );
    }
}

/**
 * A leading segment made of digits and dots is a version prefix.  No route
 * segment in this API looks like that.
 */
fn looks_like_version(segment: &str) -> bool {
    segment.starts_with(|c: char| c.is_ascii_digit())
        && segment.bytes().all(|b| b.is_ascii_digit() || b == b'.')
}

/**
 * Helper function for taking a Uri path and producing a `Vec<String>` of
 * URL-decoded strings, each representing one segment of the path. The input
 * is percent-encoded. Empty segments i.e. due to consecutive "/" characters
 * or a leading "/" are omitted.
 *
 * Dot-segments ("." and "..") are rejected outright.  Handlers use path
 * variables as resource names, and a name like ".." is never something a
 * client should be able to smuggle through.
 */
fn input_path_to_segments(path: &str) -> Result<Vec<String>, String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment {
            "." | ".." => Err("dot-segments are not permitted".to_string()),
            _ => Ok(percent_decode_str(segment)
                .decode_utf8()
                .map_err(|e| e.to_string())?
                .to_string()),
        })
        .collect()
}

/**
 * Whereas in `input_path_to_segments()` we must accommodate any user input,
 * when processing paths specified by the program we can be more stringent
 * and fail via a panic! rather than an error.  Paths *must* begin with a
 * "/"; only the final segment may be empty i.e. the path may end with a "/".
 */
pub fn route_path_to_segments(path: &str) -> Vec<&str> {
    if !path.starts_with('/') {
        panic!("route paths must begin with a '/': '{}'", path);
    }
    let mut ret = path.split('/').skip(1).collect::<Vec<_>>();
    for segment in &ret[..ret.len() - 1] {
        if segment.is_empty() {
            panic!("path segments may not be empty: '{}'", path);
        }
    }

    // A trailing "/" is treated as identical to a path without one.
    if ret[ret.len() - 1].is_empty() {
        ret.pop();
    }
    ret
}
