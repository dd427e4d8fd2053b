//! Route table built by a script at load time.
//!
//! Routes are registered through the `rest.*` functions while the script
//! evaluates. Each route maps a method and a path pattern to the index of a
//! handler held by the script worker. Patterns use `:name` for a named
//! segment and a trailing `*name` for a catch-all.
//!
//! Once the script has finished loading the registry is sealed and the table
//! moves out to the HTTP side, where it is read without touching the worker.

use hyper::Method;
use lander_common::{LanderError, Result};
use matchit::Router;
use std::collections::HashMap;

/// Verbs covered by `rest.any`.
pub const ANY_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
];

/// A successful lookup: the handler to invoke and the named segments it captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub handler: usize,
    pub params: Vec<(String, String)>,
}

/// Method-aware route table.
#[derive(Default)]
pub struct RouteTable {
    routers: HashMap<Method, Router<usize>>,
    len: usize,
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a route.
    ///
    /// # Errors
    ///
    /// Returns `LanderError::InvalidArgument` if the pattern does not start
    /// with `/`, is malformed, or conflicts with a route already registered
    /// for the same method.
    pub fn insert(&mut self, method: Method, pattern: &str, handler: usize) -> Result<()> {
        self.insert_all(&[method], pattern, handler)
    }

    /// Adds `pattern` for every method in `methods`, or for none of them if
    /// any insertion fails.
    pub fn insert_all(&mut self, methods: &[Method], pattern: &str, handler: usize) -> Result<()> {
        if !pattern.starts_with('/') {
            return Err(LanderError::InvalidArgument(format!(
                "route path must start with '/': {:?}",
                pattern
            )));
        }

        let mut staged = Vec::with_capacity(methods.len());
        for method in methods {
            let mut router = self.routers.get(method).cloned().unwrap_or_default();
            router.insert(pattern, handler).map_err(|e| {
                LanderError::InvalidArgument(format!("cannot register {} {}: {}", method, pattern, e))
            })?;
            staged.push((method.clone(), router));
        }

        self.len += staged.len();
        self.routers.extend(staged);
        Ok(())
    }

    /// Resolves `method` and a percent-decoded `path` to a handler.
    pub fn lookup(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let matched = self.routers.get(method)?.at(path).ok()?;
        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Some(RouteMatch {
            handler: *matched.value,
            params,
        })
    }

    /// Number of (method, pattern) routes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Route table under construction, shared by the `rest.*` functions of one
/// script context.
#[derive(Default)]
pub struct RouteRegistry {
    table: RouteTable,
    sealed: bool,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `pattern` for every method in `methods`.
    ///
    /// # Errors
    ///
    /// Fails once the registry is sealed, or when the table rejects the route.
    pub fn register(&mut self, methods: &[Method], pattern: &str, handler: usize) -> Result<()> {
        if self.sealed {
            return Err(LanderError::InvalidArgument(
                "routes can only be registered while the script is loading".into(),
            ));
        }
        self.table.insert_all(methods, pattern, handler)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Closes the registry and hands out the finished table.
    pub fn seal(&mut self) -> RouteTable {
        self.sealed = true;
        std::mem::take(&mut self.table)
    }
}
