//! lander server
//!
//! This crate serves an HTTP API whose routes and logic are defined by a
//! JavaScript file, run with the Boa engine. The script can be edited while
//! the server runs: each change builds a fresh runtime generation that is
//! swapped in once every request still using the old one has finished.
//!
//! - [`runtime`]: one script generation (bindings, routes, script worker)
//! - [`lifecycle`]: the [`RuntimeManager`] and its swap-and-drain reload
//! - [`http_server`] / [`http_router`]: hyper front end and request dispatch
//! - [`watcher`]: debounced script change detection
//! - [`config`]: [`ServerConfig`]

pub mod config;
pub mod http_router;
pub mod http_server;
pub mod lifecycle;
pub mod runtime;
pub mod watcher;

pub use config::ServerConfig;
pub use http_server::HttpServer;
pub use lifecycle::RuntimeManager;
pub use runtime::{Runtime, RuntimeState, Stores};
pub use watcher::ScriptWatcher;
