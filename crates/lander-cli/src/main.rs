//! # lander
//!
//! Serves the HTTP routes a JavaScript file registers, with a document store,
//! a key-value store and optional hot reload when the file changes.
//!
//! ## Usage
//!
//! ```bash
//! # Serve app.js on 0.0.0.0:8080 with memory-only stores
//! lander
//!
//! # Persist documents and reload on save
//! lander -s api.js -a 127.0.0.1:3000 --db data.json --watch
//!
//! # Same, with the store path from the environment
//! LANDER_DB=data.json lander -s api.js -w
//! ```

use anyhow::Result;
use argh::FromArgs;
use lander_server::config::{DEFAULT_SCRIPT, DEFAULT_SHUTDOWN_GRACE};
use lander_server::watcher::DEFAULT_DEBOUNCE;
use lander_server::{HttpServer, RuntimeManager, ScriptWatcher, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Environment variable consulted when `--db` is not given.
const DB_ENV: &str = "LANDER_DB";

#[derive(FromArgs, Debug)]
/// serve HTTP routes defined by a JavaScript file
struct Args {
    /// path to the script that registers routes (default: app.js)
    #[argh(option, short = 's', default = "DEFAULT_SCRIPT.into()")]
    script: String,

    /// address to listen on (default: 0.0.0.0:8080)
    #[argh(option, short = 'a', default = "\"0.0.0.0:8080\".into()")]
    addr: String,

    /// JSON file backing the document store; falls back to $LANDER_DB,
    /// memory-only when neither is set
    #[argh(option)]
    db: Option<String>,

    /// reload the script whenever it changes on disk
    #[argh(switch, short = 'w')]
    watch: bool,
}

impl Args {
    /// Resolves the arguments (and `env_db`, the value of `LANDER_DB`) into
    /// a server configuration.
    fn into_config(self, env_db: Option<String>) -> Result<ServerConfig> {
        let addr: SocketAddr = self
            .addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address {}: {}", self.addr, e))?;

        let mut config = ServerConfig::new(&self.script)
            .with_bind_addr(addr)
            .with_watch(self.watch)
            .with_debounce(DEFAULT_DEBOUNCE)
            .with_shutdown_grace(DEFAULT_SHUTDOWN_GRACE);

        if let Some(db) = self.db.or(env_db) {
            config = config.with_store_path(db);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();

    // Default to INFO, RUST_LOG overrides
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = args.into_config(std::env::var(DB_ENV).ok())?;
    config.validate()?;
    run(config).await
}

async fn run(config: ServerConfig) -> Result<()> {
    tracing::info!("Loading script {}", config.script_path.display());
    match &config.store_path {
        Some(path) => tracing::info!("Document store file: {}", path.display()),
        None => tracing::info!("Document store is memory-only"),
    }

    let stores = config.open_stores()?;
    let manager = Arc::new(RuntimeManager::start(&config, stores).await?);

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let watch_task = if config.watch {
        Some(tokio::spawn(watch_script(
            Arc::clone(&manager),
            &config,
            cancel.child_token(),
        )))
    } else {
        None
    };

    let server = HttpServer::new(Arc::clone(&manager)).with_shutdown_grace(config.shutdown_grace);
    let served = server.run(config.bind_addr, cancel.clone()).await;

    // A bind failure leaves the watcher running; stop it either way.
    cancel.cancel();
    if let Some(task) = watch_task {
        if let Err(e) = task.await {
            tracing::warn!("Watcher task failed: {}", e);
        }
    }
    manager.shutdown(config.shutdown_grace).await;

    served?;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn watch_script(
    manager: Arc<RuntimeManager>,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> impl std::future::Future<Output = ()> + Send + 'static {
    let reload_manager = Arc::clone(&manager);
    let watcher = ScriptWatcher::new(&config.script_path, config.debounce, move || {
        let manager = Arc::clone(&reload_manager);
        async move {
            tracing::info!("Script change detected, reloading");
            match manager.reload().await {
                Ok(generation) => tracing::info!("Reloaded script as generation {}", generation),
                Err(e) => {
                    let live = manager.generation().await;
                    tracing::warn!("Reload failed, still serving generation {}: {}", live, e);
                }
            }
        }
    });

    async move {
        if let Err(e) = watcher.run(cancel).await {
            tracing::warn!("Script watching disabled: {}", e);
        }
        drop(manager);
    }
}

async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, shutting down"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Received SIGINT, shutting down");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, shutting down");
        }
    }

    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::from_args(&["lander"], args).unwrap()
    }

    #[test]
    fn test_cli_defaults() {
        let args = parse(&[]);
        assert_eq!(args.script, "app.js");
        assert_eq!(args.addr, "0.0.0.0:8080");
        assert_eq!(args.db, None);
        assert!(!args.watch);

        let config = args.into_config(None).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.store_path, None);
        assert!(!config.watch);
    }

    #[test]
    fn test_cli_short_flags() {
        let args = parse(&["-s", "api.js", "-a", "127.0.0.1:3000", "-w"]);
        assert_eq!(args.script, "api.js");
        assert_eq!(args.addr, "127.0.0.1:3000");
        assert!(args.watch);
    }

    #[test]
    fn test_db_flag_beats_environment() {
        let args = parse(&["--db", "flag.json"]);
        let config = args.into_config(Some("env.json".into())).unwrap();
        assert_eq!(config.store_path, Some("flag.json".into()));
    }

    #[test]
    fn test_db_from_environment() {
        let config = parse(&[]).into_config(Some("env.json".into())).unwrap();
        assert_eq!(config.store_path, Some("env.json".into()));
    }

    #[test]
    fn test_invalid_addr_rejected() {
        let err = parse(&["-a", "not-an-address"]).into_config(None).unwrap_err();
        assert!(err.to_string().contains("Invalid listen address"));
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(Args::from_args(&["lander"], &["--bogus"]).is_err());
    }
}
