//! Lander Common Types
//!
//! This crate holds the pieces shared by every other lander crate:
//!
//! - **Errors**: the [`LanderError`] taxonomy and the crate-wide [`Result`] alias
//! - **HTTP helpers**: [`HttpTransport`] for building JSON and error responses
//!
//! # Error taxonomy
//!
//! | Variant | Raised by | Surfaced as |
//! |---------|-----------|-------------|
//! | `Config` | startup | process exit |
//! | `Build` | runtime build / reload | log line, previous runtime keeps serving |
//! | `Request`, `RouteNotFound` | request intake | 4xx JSON body |
//! | `Handler` | script invocation | 500 JSON body |
//! | `Store`, `Io`, `Json` | document store persistence | error to the caller |

pub mod error;
pub mod http;

pub use error::{LanderError, Result};
pub use http::{ErrorBody, HttpTransport, HyperResponse};
