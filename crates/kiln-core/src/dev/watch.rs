//! Source watcher.
//!
//! Wraps a notify watcher on the project root and forwards relevant file
//! events to the dev session. Establishing the native watcher is retried
//! with exponential backoff; when it keeps failing (at startup or after a
//! runtime error) the watcher degrades to polling instead of giving up.

use crate::error::{Error, Result};
use notify::event::{CreateKind, ModifyKind};
use notify::{Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Kind of a file change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    Renamed,
}

impl ChangeKind {
    /// Whether the change can alter which files exist.
    #[must_use]
    pub fn is_structural(self) -> bool {
        !matches!(self, ChangeKind::Modified)
    }
}

/// A single file change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Coalesced changes from one debounce window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Files modified in place.
    pub modified: BTreeSet<PathBuf>,
    /// Files created, removed, or renamed.
    pub structural: BTreeSet<PathBuf>,
}

impl ChangeSet {
    #[must_use]
    pub fn from_events(events: &[ChangeEvent]) -> Self {
        let mut set = ChangeSet::default();
        for event in events {
            set.push(event);
        }
        set
    }

    pub fn push(&mut self, event: &ChangeEvent) {
        if event.kind.is_structural() {
            self.modified.remove(&event.path);
            self.structural.insert(event.path.clone());
        } else if !self.structural.contains(&event.path) {
            self.modified.insert(event.path.clone());
        }
    }

    /// Fold `other` into this set.
    pub fn merge(&mut self, other: &ChangeSet) {
        for path in &other.structural {
            self.modified.remove(path);
            self.structural.insert(path.clone());
        }
        for path in &other.modified {
            if !self.structural.contains(path) {
                self.modified.insert(path.clone());
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.structural.is_empty()
    }

    /// Whether any file was created, removed, or renamed.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        !self.structural.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.modified.iter().chain(self.structural.iter())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modified.len() + self.structural.len()
    }

    /// Keep only paths for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&Path) -> bool) {
        self.modified.retain(|p| keep(p));
        self.structural.retain(|p| keep(p));
    }
}

/// Watcher settings.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub root: PathBuf,
    /// Paths whose events are dropped (the output directory).
    pub ignore: Vec<PathBuf>,
    /// Attempts to establish the native watcher before polling.
    pub attempts: u32,
    /// Delay before the second attempt; doubles each time.
    pub initial_backoff: Duration,
    pub poll_interval: Duration,
}

impl WatchOptions {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ignore: Vec::new(),
            attempts: 4,
            initial_backoff: Duration::from_millis(100),
            poll_interval: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub fn ignore(mut self, path: impl Into<PathBuf>) -> Self {
        self.ignore.push(path.into());
        self
    }

    /// Whether events for `path` should be dropped.
    #[must_use]
    pub fn is_ignored(&self, path: &Path) -> bool {
        if self.ignore.iter().any(|p| path.starts_with(p)) {
            return true;
        }
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components().any(|c| {
            let s = c.as_os_str().to_string_lossy();
            s.starts_with('.') || s == "target"
        })
    }
}

/// Which notify backend is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchBackend {
    Native,
    Polling,
}

/// The watcher is only held; dropping it stops notify.
#[allow(dead_code)]
enum Backend {
    Native(RecommendedWatcher),
    Polling(PollWatcher),
}

impl Backend {
    fn kind(&self) -> WatchBackend {
        match self {
            Backend::Native(_) => WatchBackend::Native,
            Backend::Polling(_) => WatchBackend::Polling,
        }
    }
}

type RawEvents = std_mpsc::Sender<notify::Result<Event>>;

/// A running watcher. Dropping it stops watching.
pub struct SourceWatcher {
    backend: WatchBackend,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SourceWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceWatcher")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl SourceWatcher {
    /// Start watching `options.root`, sending batches of changes to `tx`.
    ///
    /// Fails with [`Error::WatchIo`] only if neither the native watcher
    /// nor the polling fallback can be established.
    pub fn spawn(options: WatchOptions, tx: mpsc::UnboundedSender<Vec<ChangeEvent>>) -> Result<Self> {
        let (raw_tx, raw_rx) = std_mpsc::channel();
        let backend = establish(&options, &raw_tx)?;
        let kind = backend.kind();
        info!(root = %options.root.display(), backend = ?kind, "watching for changes");

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("kiln-watch".to_string())
            .spawn(move || supervise(options, backend, raw_tx, raw_rx, tx, stop_flag))
            .map_err(|e| Error::other(format!("failed to spawn watcher thread: {e}")))?;

        Ok(Self {
            backend: kind,
            stop,
            thread: Some(thread),
        })
    }

    /// Backend in use when the watcher started.
    #[must_use]
    pub fn backend(&self) -> WatchBackend {
        self.backend
    }

    /// Stop watching and wait for the supervisor thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SourceWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Native watcher with retries, else polling.
fn establish(options: &WatchOptions, raw_tx: &RawEvents) -> Result<Backend> {
    let mut delay = options.initial_backoff;
    for attempt in 1..=options.attempts {
        match native(options, raw_tx) {
            Ok(watcher) => return Ok(Backend::Native(watcher)),
            Err(e) => {
                warn!(attempt, error = %e, "native watcher unavailable");
                if attempt < options.attempts {
                    std::thread::sleep(delay);
                    delay *= 2;
                }
            }
        }
    }

    warn!(interval = ?options.poll_interval, "falling back to polling watcher");
    let mut watcher = PollWatcher::new(
        raw_tx.clone(),
        Config::default().with_poll_interval(options.poll_interval),
    )
    .map_err(|source| Error::WatchIo {
        path: options.root.clone(),
        source,
    })?;
    watcher
        .watch(&options.root, RecursiveMode::Recursive)
        .map_err(|source| Error::WatchIo {
            path: options.root.clone(),
            source,
        })?;
    Ok(Backend::Polling(watcher))
}

fn native(options: &WatchOptions, raw_tx: &RawEvents) -> notify::Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(raw_tx.clone(), Config::default())?;
    watcher.watch(&options.root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

/// Owns the backend, forwards events, and re-establishes after errors.
fn supervise(
    options: WatchOptions,
    mut backend: Backend,
    raw_tx: RawEvents,
    raw_rx: std_mpsc::Receiver<notify::Result<Event>>,
    tx: mpsc::UnboundedSender<Vec<ChangeEvent>>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::SeqCst) {
        let event = match raw_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => event,
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        };

        match event {
            Ok(event) => {
                let changes = changes_from(&options, &event);
                if changes.is_empty() {
                    continue;
                }
                debug!(count = changes.len(), "file events");
                if tx.send(changes).is_err() {
                    debug!("change receiver closed, stopping watcher");
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, backend = ?backend.kind(), "watch error, re-establishing");
                drop(backend);
                match establish(&options, &raw_tx) {
                    Ok(fresh) => {
                        info!(backend = ?fresh.kind(), "watcher re-established");
                        backend = fresh;
                    }
                    Err(e) => {
                        error!(error = %e, "watcher lost; changes will not be picked up");
                        return;
                    }
                }
            }
        }
    }
    drop(backend);
}

/// Map a notify event to the changes the session cares about.
fn changes_from(options: &WatchOptions, event: &Event) -> Vec<ChangeEvent> {
    let Some(kind) = classify(&event.kind) else {
        return Vec::new();
    };
    event
        .paths
        .iter()
        .filter(|p| !options.is_ignored(p))
        .map(|p| ChangeEvent::new(p.clone(), kind))
        .collect()
}

fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(CreateKind::Folder) => None,
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Renamed),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{DataChange, MetadataKind, RemoveKind, RenameMode};

    #[test]
    fn test_classify_event_kinds() {
        assert_eq!(
            classify(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Created)
        );
        assert_eq!(classify(&EventKind::Create(CreateKind::Folder)), None);
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(ChangeKind::Modified)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::Both))),
            Some(ChangeKind::Renamed)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))),
            None
        );
        assert_eq!(
            classify(&EventKind::Remove(RemoveKind::File)),
            Some(ChangeKind::Removed)
        );
    }

    #[test]
    fn test_ignored_paths() {
        let options = WatchOptions::new("/p").ignore("/p/dist");
        assert!(options.is_ignored(Path::new("/p/dist/app.js")));
        assert!(options.is_ignored(Path::new("/p/.git/index")));
        assert!(options.is_ignored(Path::new("/p/src/.app.js.swp")));
        assert!(!options.is_ignored(Path::new("/p/src/app.js")));
        assert!(!options.is_ignored(Path::new("/p/node_modules/lib/index.js")));
    }

    #[test]
    fn test_change_set_structural_wins() {
        let set = ChangeSet::from_events(&[
            ChangeEvent::new("/p/a.js", ChangeKind::Modified),
            ChangeEvent::new("/p/a.js", ChangeKind::Removed),
            ChangeEvent::new("/p/b.js", ChangeKind::Modified),
            ChangeEvent::new("/p/b.js", ChangeKind::Modified),
        ]);
        assert!(set.is_structural());
        assert_eq!(set.len(), 2);
        assert!(set.structural.contains(Path::new("/p/a.js")));
        assert!(set.modified.contains(Path::new("/p/b.js")));
    }

    #[test]
    fn test_retain() {
        let mut set = ChangeSet::from_events(&[
            ChangeEvent::new("/p/src/a.js", ChangeKind::Modified),
            ChangeEvent::new("/p/README.md", ChangeKind::Created),
        ]);
        set.retain(|p| p.starts_with("/p/src"));
        assert_eq!(set.len(), 1);
        assert!(!set.is_structural());
    }

    #[tokio::test]
    async fn test_reports_file_writes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = SourceWatcher::spawn(WatchOptions::new(&root), tx).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let file = root.join("app.js");
        std::fs::write(&file, "export const x = 1;").unwrap();

        let got = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(batch) = rx.recv().await {
                if batch.iter().any(|c| c.path.ends_with("app.js")) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(got);
        watcher.stop();
    }

    #[tokio::test]
    async fn test_polling_backend_stays_alive() {
        let dir = tempfile::tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut options = WatchOptions::new(&root);
        options.attempts = 0;
        options.poll_interval = Duration::from_millis(50);
        let watcher = SourceWatcher::spawn(options, tx).unwrap();
        assert_eq!(watcher.backend(), WatchBackend::Polling);

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(root.join("polled.js"), "export const y = 2;").unwrap();

        let got = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(batch) = rx.recv().await {
                if batch.iter().any(|c| c.path.ends_with("polled.js")) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(got);
        watcher.stop();
    }
}
