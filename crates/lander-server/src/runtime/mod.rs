//! Runtime generations.
//!
//! A [`Runtime`] is one immutable build of a script: the route table it
//! registered and the worker that owns its JavaScript context. Runtimes are
//! built by the [`RuntimeManager`](crate::lifecycle::RuntimeManager) and move
//! through [`RuntimeState`] exactly once:
//!
//! ```text
//! Building ──▶ Live ──▶ Draining ──▶ Closed
//! ```

pub mod bindings;
pub mod conversions;
pub mod engine;
pub mod request;
pub mod response;
pub mod routes;


use hyper::Method;
use lander_common::{LanderError, Result};
use lander_store::{DocumentStore, KeyValueStore};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub use engine::ScriptEngine;
pub use request::{FieldValue, RequestView};
pub use response::{ResponseBody, ScriptResponse};
pub use routes::{RouteMatch, RouteTable};

/// Stores shared by every generation.
#[derive(Clone)]
pub struct Stores {
    pub documents: Arc<DocumentStore>,
    pub kv: Arc<KeyValueStore>,
}

impl Stores {
    pub fn new(documents: DocumentStore, kv: KeyValueStore) -> Self {
        Self {
            documents: Arc::new(documents),
            kv: Arc::new(kv),
        }
    }

    /// Memory-only stores.
    pub fn in_memory() -> Self {
        Self::new(DocumentStore::in_memory(), KeyValueStore::new())
    }
}

/// Lifecycle state of a runtime generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuntimeState {
    Building = 0,
    Live = 1,
    Draining = 2,
    Closed = 3,
}

impl RuntimeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RuntimeState::Building,
            1 => RuntimeState::Live,
            2 => RuntimeState::Draining,
            _ => RuntimeState::Closed,
        }
    }
}

/// One loaded script: its routes and its script worker.
pub struct Runtime {
    generation: u64,
    routes: RouteTable,
    engine: ScriptEngine,
    state: AtomicU8,
}

impl Runtime {
    /// Reads `script_path` and builds a runtime from it.
    ///
    /// # Errors
    ///
    /// Returns `LanderError::Config` if the script cannot be read and
    /// `LanderError::Build` if it fails to load.
    pub async fn build(script_path: impl AsRef<Path>, stores: Stores, generation: u64) -> Result<Self> {
        let script_path = script_path.as_ref();
        let source = tokio::fs::read_to_string(script_path).await.map_err(|e| {
            LanderError::Config(format!("Failed to load script {}: {}", script_path.display(), e))
        })?;
        Self::from_source(source, stores, generation).await
    }

    /// Builds a runtime from script source.
    pub async fn from_source(source: impl Into<String>, stores: Stores, generation: u64) -> Result<Self> {
        tracing::debug!("Building runtime generation {}", generation);
        let (engine, routes) = ScriptEngine::start(source.into(), stores, generation).await?;

        Ok(Self {
            generation,
            routes,
            engine,
            state: AtomicU8::new(RuntimeState::Live as u8),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> RuntimeState {
        RuntimeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn lookup(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        self.routes.lookup(method, path)
    }

    /// Runs handler `handler` with `request` on the script worker.
    pub async fn call(&self, handler: usize, request: RequestView) -> Result<ScriptResponse> {
        self.engine.call(handler, request).await
    }

    /// Tears the runtime down: `Draining`, worker stopped, `Closed`.
    ///
    /// Callers must ensure no request still holds this runtime.
    pub async fn retire(&self) {
        self.set_state(RuntimeState::Draining);
        self.engine.shutdown().await;
        self.set_state(RuntimeState::Closed);
        tracing::info!("Runtime generation {} retired", self.generation);
    }

    fn set_state(&self, state: RuntimeState) {
        self.state.store(state as u8, Ordering::Release);
    }
}
