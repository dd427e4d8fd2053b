//! Request dispatch against one runtime generation.
//!
//! For each request, in order:
//!
//! 1. route lookup (no match → `404 {"error": "no route for GET /x"}`)
//! 2. body collection (failure → `400`, the script is not invoked)
//! 3. request view construction
//! 4. queued invocation on the script worker
//! 5. response marshalling
//!
//! Errors from any step are rendered as `{"error": "..."}` JSON bodies by
//! [`HttpTransport::to_http_error`].

use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::Request;
use lander_common::{HttpTransport, HyperResponse, LanderError, Result};
use std::fmt::Display;
use std::net::SocketAddr;

use crate::runtime::request::decoded_path;
use crate::runtime::{RequestView, Runtime};

/// Serves `req` with `runtime`, turning every failure into an error response.
pub async fn dispatch<B>(runtime: &Runtime, req: Request<B>, remote_addr: Option<SocketAddr>) -> HyperResponse
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    match try_dispatch(runtime, req, remote_addr).await {
        Ok(response) => response,
        Err(err) => {
            match &err {
                LanderError::RouteNotFound { .. } | LanderError::Request(_) => {
                    tracing::debug!("Rejected request: {}", err)
                }
                _ => tracing::warn!("Request failed: {}", err),
            }
            HttpTransport::to_http_error(&err)
        }
    }
}

/// Serves `req` with `runtime`.
///
/// # Errors
///
/// - `LanderError::RouteNotFound` when no route matches
/// - `LanderError::Request` when the body cannot be read
/// - `LanderError::Handler` when the script fails
pub async fn try_dispatch<B>(
    runtime: &Runtime,
    req: Request<B>,
    remote_addr: Option<SocketAddr>,
) -> Result<HyperResponse>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let (parts, body) = req.into_parts();

    let path = decoded_path(&parts.uri);
    let matched = runtime
        .lookup(&parts.method, &path)
        .ok_or_else(|| LanderError::RouteNotFound {
            method: parts.method.to_string(),
            path: path.clone(),
        })?;

    let body = body
        .collect()
        .await
        .map_err(|e| LanderError::Request(format!("Failed to read request body: {}", e)))?
        .to_bytes();

    let view = RequestView::new(
        &parts.method,
        &parts.uri,
        &parts.headers,
        &body,
        remote_addr,
        matched.params,
    );

    tracing::debug!(
        "Dispatching {} {} to handler #{} (generation {})",
        parts.method,
        path,
        matched.handler,
        runtime.generation()
    );

    runtime.call(matched.handler, view).await?.into_http()
}
