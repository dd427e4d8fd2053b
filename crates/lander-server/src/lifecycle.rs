//! Runtime lifecycle: build, swap and drain.
//!
//! The [`RuntimeManager`] owns the live [`Runtime`] behind a
//! `tokio::sync::RwLock`. Every request holds the read side for its whole
//! lifetime, from route lookup until the response is built. A reload builds
//! the next generation first, then takes the write side, which waits until
//! every in-flight request has released its lease. The pointer is swapped
//! under the write lock and the previous runtime is retired afterwards.
//!
//! A failed build leaves the live runtime untouched.

use hyper::body::{Body, Bytes};
use hyper::Request;
use lander_common::{HyperResponse, Result};
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{timeout_at, Instant};

use crate::config::ServerConfig;
use crate::http_router;
use crate::runtime::{Runtime, Stores};

/// Owns the live runtime generation and replaces it on reload.
pub struct RuntimeManager {
    script_path: PathBuf,
    stores: Stores,
    current: RwLock<Arc<Runtime>>,
    /// Serializes reloads; holds the last generation number handed out.
    reload: Mutex<u64>,
}

impl RuntimeManager {
    /// Builds generation 1 from the configured script.
    ///
    /// # Errors
    ///
    /// Returns `LanderError::Config` if the script cannot be read and
    /// `LanderError::Build` if it fails to load. Both are fatal at startup.
    pub async fn start(config: &ServerConfig, stores: Stores) -> Result<Self> {
        Self::with_script(&config.script_path, stores).await
    }

    pub async fn with_script(script_path: impl AsRef<Path>, stores: Stores) -> Result<Self> {
        let script_path = script_path.as_ref().to_path_buf();
        let runtime = Runtime::build(&script_path, stores.clone(), 1).await?;
        tracing::info!(
            "Runtime generation 1 live ({} routes from {})",
            runtime.routes().len(),
            script_path.display()
        );

        Ok(Self {
            script_path,
            stores,
            current: RwLock::new(Arc::new(runtime)),
            reload: Mutex::new(1),
        })
    }

    /// Serves one request with the live runtime.
    ///
    /// The read lease is held until the response has been produced, so a
    /// concurrent reload waits for this request before retiring its runtime.
    pub async fn handle<B>(&self, req: Request<B>, remote_addr: Option<SocketAddr>) -> HyperResponse
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        let runtime = self.current.read().await;
        http_router::dispatch(&runtime, req, remote_addr).await
    }

    /// Rebuilds the runtime from the script file and swaps it in.
    ///
    /// Returns the new generation number.
    ///
    /// # Errors
    ///
    /// Returns the build error; the previous runtime keeps serving.
    pub async fn reload(&self) -> Result<u64> {
        let mut last = self.reload.lock().await;
        let generation = *last + 1;

        let runtime = Runtime::build(&self.script_path, self.stores.clone(), generation).await?;
        let routes = runtime.routes().len();

        let previous = {
            let mut current = self.current.write().await;
            std::mem::replace(&mut *current, Arc::new(runtime))
        };
        *last = generation;
        tracing::info!("Runtime generation {} live ({} routes)", generation, routes);

        previous.retire().await;
        Ok(generation)
    }

    /// Generation number of the live runtime.
    pub async fn generation(&self) -> u64 {
        self.current.read().await.generation()
    }

    /// The live runtime.
    ///
    /// Holding the returned `Arc` does not keep the runtime from being
    /// retired; calls against a retired runtime fail.
    pub async fn current(&self) -> Arc<Runtime> {
        Arc::clone(&*self.current.read().await)
    }

    /// Retires the live runtime once in-flight requests and any reload in
    /// progress have finished, waiting at most `grace`.
    ///
    /// Returns `false` if the grace period ran out first; the runtime is then
    /// left to be torn down with the process.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;

        let locked = timeout_at(deadline, async {
            let last = self.reload.lock().await;
            let current = self.current.write().await;
            (last, current)
        })
        .await;
        let Ok((_last, current)) = locked else {
            tracing::warn!(
                "Requests still running after {:?}; abandoning the live runtime",
                grace
            );
            return false;
        };

        if timeout_at(deadline, current.retire()).await.is_err() {
            tracing::warn!(
                "Runtime generation {} did not stop within {:?}",
                current.generation(),
                grace
            );
            return false;
        }
        true
    }
}
