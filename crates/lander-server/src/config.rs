//! Server configuration.

use lander_common::{LanderError, Result};
use lander_store::{DocumentStore, KeyValueStore};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::runtime::Stores;
use crate::watcher::DEFAULT_DEBOUNCE;

/// Default time in-flight requests get to finish at shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Default script file.
pub const DEFAULT_SCRIPT: &str = "app.js";

/// Settings for one `lander` process.
///
/// # Example
///
/// ```
/// use lander_server::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::new("routes.js")
///     .with_store_path("data/store.json")
///     .with_watch(true)
///     .with_debounce(Duration::from_millis(100));
/// assert!(config.watch);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub script_path: PathBuf,
    pub bind_addr: SocketAddr,
    /// Document store file; `None` keeps the store in memory.
    pub store_path: Option<PathBuf>,
    pub watch: bool,
    pub debounce: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SCRIPT)
    }
}

impl ServerConfig {
    pub fn new(script_path: impl Into<PathBuf>) -> Self {
        Self {
            script_path: script_path.into(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            store_path: None,
            watch: false,
            debounce: DEFAULT_DEBOUNCE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Sets the document store file. An empty path means memory-only.
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.store_path = if path.as_os_str().is_empty() { None } else { Some(path) };
        self
    }

    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Checks that the script exists and is a regular file.
    ///
    /// # Errors
    ///
    /// Returns `LanderError::Config` otherwise.
    pub fn validate(&self) -> Result<()> {
        check_script(&self.script_path)?;
        if self.debounce.is_zero() {
            return Err(LanderError::Config("debounce interval must be greater than zero".into()));
        }
        Ok(())
    }

    /// Opens the document store (from `store_path`, if any) and a fresh
    /// key/value store.
    ///
    /// # Errors
    ///
    /// Returns `LanderError::Store` if an existing store file cannot be read
    /// or parsed.
    pub fn open_stores(&self) -> Result<Stores> {
        let documents = match &self.store_path {
            Some(path) => DocumentStore::open(path)?,
            None => DocumentStore::in_memory(),
        };
        Ok(Stores::new(documents, KeyValueStore::new()))
    }
}

fn check_script(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        LanderError::Config(format!("Script path {} is not readable: {}", path.display(), e))
    })?;
    if !metadata.is_file() {
        return Err(LanderError::Config(format!(
            "Script path {} is not a file",
            path.display()
        )));
    }
    Ok(())
}
