//! Script change watcher.
//!
//! Watches the directory that contains the script rather than the file
//! itself, so editors that replace the file on save are still seen. Events are
//! filtered down to the script's file name and to create/modify kinds (a
//! rename shows up as a name modification). Each qualifying event restarts a
//! debounce timer; the callback runs only once the timer expires with no
//! further events.
//!
//! # Example
//!
//! ```no_run
//! use lander_server::watcher::{ScriptWatcher, DEFAULT_DEBOUNCE};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let cancel = CancellationToken::new();
//! let watcher = ScriptWatcher::new("app.js", DEFAULT_DEBOUNCE, || async {
//!     println!("script changed");
//! });
//! if let Err(e) = watcher.run(cancel).await {
//!     eprintln!("watching disabled: {}", e);
//! }
//! # }
//! ```

use lander_common::{LanderError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Quiet period required after the last event before the callback runs.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// Calls `on_change` whenever the script file settles after a change.
pub struct ScriptWatcher<F> {
    path: PathBuf,
    debounce: Duration,
    on_change: F,
}

impl<F, Fut> ScriptWatcher<F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    pub fn new(path: impl Into<PathBuf>, debounce: Duration, on_change: F) -> Self {
        Self {
            path: path.into(),
            debounce,
            on_change,
        }
    }

    /// Watches until `cancel` fires. A pending debounce timer is dropped
    /// without running the callback.
    ///
    /// # Errors
    ///
    /// Returns `LanderError::Watch` if the filesystem watcher cannot be set
    /// up. Errors reported by the watcher afterwards are logged and watching
    /// continues.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _watcher = watch_parent(&self.path, tx)?;
        tracing::info!("Watching {} for changes", self.path.display());

        debounce(rx, self.debounce, cancel, self.on_change).await;
        tracing::debug!("Stopped watching {}", self.path.display());
        Ok(())
    }
}

/// Runs `on_change` once per burst of events on `events`.
///
/// Every event (re)arms a timer of `interval`; the callback runs when the
/// timer expires. Returns when `cancel` fires or the sender side is dropped,
/// discarding any armed timer.
pub async fn debounce<F, Fut>(
    mut events: mpsc::UnboundedReceiver<()>,
    interval: Duration,
    cancel: CancellationToken,
    mut on_change: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut deadline: Option<Instant> = None;

    loop {
        let armed = deadline;
        let timer = async move {
            match armed {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            event = events.recv() => match event {
                Some(()) => deadline = Some(Instant::now() + interval),
                None => break,
            },

            _ = timer => {
                deadline = None;
                on_change().await;
            }
        }
    }
}

fn watch_parent(path: &Path, events: mpsc::UnboundedSender<()>) -> Result<RecommendedWatcher> {
    let file_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .ok_or_else(|| LanderError::Watch(format!("{} has no file name", path.display())))?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if is_relevant(&event, &file_name) {
                tracing::debug!("Script change detected: {:?}", event.kind);
                let _ = events.send(());
            }
        }
        Err(e) => tracing::warn!("File watcher error: {}", e),
    })
    .map_err(|e| LanderError::Watch(format!("Failed to create file watcher: {}", e)))?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| LanderError::Watch(format!("Failed to watch {}: {}", dir.display(), e)))?;

    Ok(watcher)
}

fn is_relevant(event: &Event, file_name: &OsString) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind, RenameMode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() -> std::future::Ready<()>) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&count);
        (count, move || {
            handle.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        })
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_event_filter() {
        let name = OsString::from("app.js");

        assert!(is_relevant(&event(EventKind::Create(CreateKind::File), "/srv/app.js"), &name));
        assert!(is_relevant(&event(EventKind::Modify(ModifyKind::Any), "/srv/app.js"), &name));
        assert!(is_relevant(
            &event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), "/srv/app.js"),
            &name
        ));

        assert!(!is_relevant(&event(EventKind::Modify(ModifyKind::Any), "/srv/other.js"), &name));
        assert!(!is_relevant(&event(EventKind::Access(AccessKind::Any), "/srv/app.js"), &name));
        assert!(!is_relevant(&event(EventKind::Remove(notify::event::RemoveKind::File), "/srv/app.js"), &name));
    }

    #[tokio::test]
    async fn test_burst_triggers_one_callback() {
        let (count, on_change) = counter();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(debounce(rx, Duration::from_millis(100), cancel.clone(), on_change));

        tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_separate_bursts_trigger_separately() {
        let (count, on_change) = counter();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(debounce(rx, Duration::from_millis(50), cancel.clone(), on_change));

        tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_drops_pending_timer() {
        let (count, on_change) = counter();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(debounce(rx, Duration::from_millis(100), cancel.clone(), on_change));

        tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        task.await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_directory_is_watch_error() {
        let (_, on_change) = counter();
        let watcher = ScriptWatcher::new("/no/such/dir/app.js", DEFAULT_DEBOUNCE, on_change);

        let result = watcher.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(LanderError::Watch(_))));
    }

    #[tokio::test]
    async fn test_file_write_triggers_callback() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("app.js");
        std::fs::write(&script, "// v1").unwrap();

        let (count, on_change) = counter();
        let cancel = CancellationToken::new();
        let watcher = ScriptWatcher::new(&script, Duration::from_millis(50), on_change);
        let task = tokio::spawn(watcher.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Unrelated files in the same directory are ignored.
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        std::fs::write(&script, "// v2").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
