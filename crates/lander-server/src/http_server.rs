//! HTTP Server for lander
//!
//! This module provides the HTTP server using hyper for HTTP/1.1. Every
//! request is handed to the [`RuntimeManager`], which serves it with the live
//! runtime generation.
//!
//! # Architecture
//!
//! The HTTP server:
//! - Listens on a TCP socket for incoming HTTP connections
//! - Spawns a tokio task for each connection
//! - Stops accepting when its cancellation token fires
//! - Asks open connections to finish their current request and close, then
//!   waits up to the shutdown grace period for them
//! - Drops whatever connections are still open once the grace period ends,
//!   releasing their runtime leases
//!
//! # Example
//!
//! ```no_run
//! use lander_server::{HttpServer, RuntimeManager, ServerConfig, Stores};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::new("app.js");
//!     let manager = Arc::new(RuntimeManager::start(&config, Stores::in_memory()).await.unwrap());
//!     let server = HttpServer::new(manager);
//!     server.run(config.bind_addr, CancellationToken::new()).await.unwrap();
//! }
//! ```

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use lander_common::{HyperResponse, LanderError, Result};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::DEFAULT_SHUTDOWN_GRACE;
use crate::lifecycle::RuntimeManager;

/// HTTP server in front of a [`RuntimeManager`].
pub struct HttpServer {
    manager: Arc<RuntimeManager>,
    shutdown_grace: Duration,
}

impl HttpServer {
    /// Creates a new HTTP server serving the manager's live runtime.
    pub fn new(manager: Arc<RuntimeManager>) -> Self {
        Self {
            manager,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Sets how long in-flight requests may take to finish after shutdown
    /// starts.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Binds `addr` and serves until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `LanderError::Transport` if the address cannot be bound.
    pub async fn run(self, addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LanderError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        self.serve(listener, cancel).await
    }

    /// Serves connections from `listener` until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `LanderError::Transport` if the listener's address cannot be
    /// read. Accept errors are logged and the loop continues.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| LanderError::Transport(format!("Failed to get local address: {}", e)))?;
        tracing::info!("HTTP server listening on {}", local_addr);

        let tracker = TaskTracker::new();
        let force_close = CancellationToken::new();

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let manager = Arc::clone(&self.manager);
            let cancel = cancel.clone();
            let force_close = force_close.clone();
            tracker.spawn(Self::serve_connection(
                manager,
                stream,
                remote_addr,
                cancel,
                force_close,
            ));
        }

        drop(listener);
        tracker.close();
        tracing::info!(
            "HTTP server stopped accepting; waiting up to {:?} for {} connection(s)",
            self.shutdown_grace,
            tracker.len()
        );

        if tokio::time::timeout(self.shutdown_grace, tracker.wait()).await.is_err() {
            tracing::warn!(
                "Shutdown grace period elapsed with {} connection(s) still open; closing them",
                tracker.len()
            );
            force_close.cancel();
            tracker.wait().await;
        }
        Ok(())
    }

    async fn serve_connection(
        manager: Arc<RuntimeManager>,
        stream: tokio::net::TcpStream,
        remote_addr: SocketAddr,
        cancel: CancellationToken,
        force_close: CancellationToken,
    ) {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req: Request<Incoming>| {
            let manager = Arc::clone(&manager);
            async move { Ok::<HyperResponse, Infallible>(manager.handle(req, Some(remote_addr)).await) }
        });

        let conn = http1::Builder::new().serve_connection(io, service);
        tokio::pin!(conn);

        let mut shutting_down = false;
        loop {
            tokio::select! {
                res = conn.as_mut() => {
                    if let Err(err) = res {
                        tracing::error!("Error serving connection from {}: {}", remote_addr, err);
                    }
                    break;
                }
                _ = cancel.cancelled(), if !shutting_down => {
                    shutting_down = true;
                    conn.as_mut().graceful_shutdown();
                }
                _ = force_close.cancelled() => {
                    tracing::debug!("Dropping connection from {}", remote_addr);
                    break;
                }
            }
        }
    }
}
