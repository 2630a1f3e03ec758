//! Dev session.
//!
//! Holds the build being served, runs rebuilds on file changes, and
//! broadcasts live updates. Transport-agnostic: the HTTP layer only reads
//! [`DevSession::current`] and forwards [`DevSession::subscribe`] messages.
//!
//! State machine:
//!
//! ```text
//! Idle -> Building -> Serving -> Rebuilding -> Serving -> ... -> Stopped
//! ```
//!
//! A failed rebuild keeps the last good build in place and is reported as
//! an `error` message; the changes it covered stay pending so the next
//! rebuild re-examines them.

use crate::dev::hmr::{classify, LiveUpdate};
use crate::dev::watch::{ChangeEvent, ChangeSet};
use crate::emit::BuildSnapshot;
use crate::error::{Error, Result};
use crate::identity::FileKind;
use crate::pipeline::{Build, Bundler, RebuildReport};
use rustc_hash::FxHashSet as HashSet;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

/// Capacity of each client's live-update queue.
pub const UPDATE_CAPACITY: usize = 64;

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Building,
    Serving,
    Rebuilding,
    Stopped,
}

/// Last rebuild failure, as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionError {
    pub code: String,
    pub message: String,
}

impl From<&Error> for SessionError {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Point-in-time view for status endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub hash: Option<String>,
    pub modules: usize,
    pub artifacts: usize,
    pub last_error: Option<SessionError>,
}

/// The serving state of `kiln dev`.
pub struct DevSession {
    bundler: Bundler,
    state: RwLock<SessionState>,
    current: RwLock<Option<Arc<Build>>>,
    previous: RwLock<Option<Arc<Build>>>,
    last_error: RwLock<Option<SessionError>>,
    /// Changes covered by a failed rebuild.
    pending: Mutex<ChangeSet>,
    updates: broadcast::Sender<LiveUpdate>,
}

impl std::fmt::Debug for DevSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevSession")
            .field("state", &self.state())
            .field("bundler", &self.bundler)
            .finish_non_exhaustive()
    }
}

impl DevSession {
    #[must_use]
    pub fn new(bundler: Bundler) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            bundler,
            state: RwLock::new(SessionState::Idle),
            current: RwLock::new(None),
            previous: RwLock::new(None),
            last_error: RwLock::new(None),
            pending: Mutex::new(ChangeSet::default()),
            updates,
        }
    }

    #[must_use]
    pub fn bundler(&self) -> &Bundler {
        &self.bundler
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *guard != SessionState::Stopped {
            debug!(from = ?*guard, to = ?state, "session state");
            *guard = state;
        }
    }

    /// Initial build. Errors here are fatal to the session.
    pub fn start(&self) -> Result<Arc<Build>> {
        self.set_state(SessionState::Building);
        match self.bundler.build() {
            Ok(build) => {
                let build = Arc::new(build);
                *self.current.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(Arc::clone(&build));
                self.set_state(SessionState::Serving);
                Ok(build)
            }
            Err(e) => {
                self.set_state(SessionState::Idle);
                Err(e)
            }
        }
    }

    /// Build being served.
    #[must_use]
    pub fn current(&self) -> Option<Arc<Build>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Build replaced by the latest successful rebuild.
    #[must_use]
    pub fn previous(&self) -> Option<Arc<Build>> {
        self.previous
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot being served.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<BuildSnapshot>> {
        self.current().map(|b| Arc::clone(&b.snapshot))
    }

    #[must_use]
    pub fn last_error(&self) -> Option<SessionError> {
        self.last_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        let current = self.current();
        SessionStatus {
            state: self.state(),
            hash: current.as_ref().map(|b| b.snapshot.hash.clone()),
            modules: current.as_ref().map_or(0, |b| b.graph.len()),
            artifacts: current.as_ref().map_or(0, |b| b.snapshot.len()),
            last_error: self.last_error(),
        }
    }

    /// Receive live updates from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LiveUpdate> {
        self.updates.subscribe()
    }

    /// First message for a newly connected client.
    #[must_use]
    pub fn greeting(&self) -> LiveUpdate {
        if let Some(err) = self.last_error() {
            return LiveUpdate::Error {
                code: err.code,
                message: err.message,
            };
        }
        LiveUpdate::Connected {
            hash: self.current().map(|b| b.snapshot.hash.clone()).unwrap_or_default(),
        }
    }

    fn broadcast(&self, update: LiveUpdate) {
        // No receivers is not an error; nobody is connected yet.
        let receivers = self.updates.send(update).unwrap_or(0);
        debug!(receivers, "live update sent");
    }

    /// Drop changes no build output depends on.
    ///
    /// Modified files count only when the graph tracks them (as a module or
    /// an inlined file) or they are the HTML template. Created and removed
    /// source files (or directories) outside the vendor root count too,
    /// since they may change how a specifier resolves.
    fn relevant(&self, build: &Build, mut changes: ChangeSet) -> ChangeSet {
        let template = self.template_path();
        let vendor = self.bundler.config().vendor_path();
        changes
            .modified
            .retain(|p| build.graph.tracks(p) || is_template(&template, p));
        changes.structural.retain(|p| {
            build.graph.tracks(p)
                || is_template(&template, p)
                || (!p.starts_with(&vendor)
                    && (p.extension().is_none() || FileKind::from_path(p) != FileKind::Other))
        });
        changes
    }

    fn template_path(&self) -> Option<PathBuf> {
        let config = self.bundler.config();
        config.template.as_ref().map(|t| config.absolute(t))
    }

    /// Rebuild after `changes`.
    ///
    /// Returns `Ok(None)` when nothing relevant changed. On failure the
    /// served build is left untouched, the error is broadcast, and the
    /// changes are retried with the next rebuild.
    pub fn rebuild(&self, changes: ChangeSet) -> Result<Option<RebuildReport>> {
        let Some(current) = self.current() else {
            return Err(Error::other("rebuild requested before the initial build"));
        };

        let changes = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let mut merged = std::mem::take(&mut *pending);
            merged.merge(&changes);
            merged
        };
        let changes = self.relevant(&current, changes);
        if changes.is_empty() {
            debug!("no relevant changes");
            return Ok(None);
        }

        self.set_state(SessionState::Rebuilding);
        let template = self.template_path();
        let template_changed = changes.paths().any(|p| is_template(&template, p));

        let result = if changes.is_structural() {
            info!(files = changes.len(), "files added or removed, rebuilding");
            self.bundler.rebuild_full(&current)
        } else {
            info!(files = changes.len(), "files changed, rebuilding");
            let changed: HashSet<PathBuf> = changes.modified.iter().cloned().collect();
            self.bundler.rebuild(&current, &changed)
        };

        match result {
            Ok((build, report)) => {
                let build = Arc::new(build);
                let update = classify(&current, &build, template_changed);
                *self.previous.write().unwrap_or_else(PoisonError::into_inner) = Some(current);
                *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(build);
                *self.last_error.write().unwrap_or_else(PoisonError::into_inner) = None;
                self.set_state(SessionState::Serving);
                if let Some(update) = update {
                    self.broadcast(update);
                }
                Ok(Some(report))
            }
            Err(e) => {
                error!(code = e.code(), error = %e, "rebuild failed, serving previous build");
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .merge(&changes);
                *self.last_error.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(SessionError::from(&e));
                self.broadcast(LiveUpdate::error(&e));
                self.set_state(SessionState::Serving);
                Err(e)
            }
        }
    }

    /// Consume watcher batches until the channel closes or the session stops.
    ///
    /// Batches arriving within `debounce` of each other are coalesced. One
    /// rebuild runs at a time; changes arriving meanwhile queue up for the
    /// next cycle.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Vec<ChangeEvent>>, debounce: Duration) {
        while let Some(first) = rx.recv().await {
            if self.state() == SessionState::Stopped {
                break;
            }
            let mut events = first;
            loop {
                match tokio::time::timeout(debounce, rx.recv()).await {
                    Ok(Some(more)) => events.extend(more),
                    Ok(None) | Err(_) => break,
                }
            }

            let changes = ChangeSet::from_events(&events);
            let session = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || session.rebuild(changes)).await {
                Ok(Ok(Some(report))) => debug!(
                    transformed = report.transformed.len(),
                    reused = report.reused,
                    "rebuild applied"
                ),
                Ok(Ok(None) | Err(_)) => {}
                Err(e) => error!(error = %e, "rebuild task panicked"),
            }
        }
        self.stop();
    }

    /// Enter `Stopped`. Later state changes are ignored.
    pub fn stop(&self) {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *guard != SessionState::Stopped {
            info!("dev session stopped");
            *guard = SessionState::Stopped;
        }
    }
}

fn is_template(template: &Option<PathBuf>, path: &Path) -> bool {
    template.as_deref() == Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildConfig, EntryPoint};
    use crate::dev::watch::ChangeKind;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        session: Arc<DevSession>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let root = dunce::canonicalize(dir.path()).unwrap();
            let fixture = Self {
                _dir: dir,
                session: {
                    let mut config = BuildConfig::new(&root);
                    config.entries = vec![EntryPoint {
                        name: "app".into(),
                        import: "./src/index.js".into(),
                    }];
                    config.shared_styles.clear();
                    write(&root, "src/index.js", "require('./app.css');\nmodule.exports = 1;\n");
                    write(&root, "src/app.css", "body { color: red; }\n");
                    Arc::new(DevSession::new(Bundler::new(config).unwrap()))
                },
                root,
            };
            fixture.session.start().unwrap();
            fixture
        }

        fn modified(&self, path: &str, content: &str) -> ChangeSet {
            write(&self.root, path, content);
            ChangeSet::from_events(&[ChangeEvent::new(self.root.join(path), ChangeKind::Modified)])
        }
    }

    fn write(root: &Path, path: &str, content: &str) {
        let full = root.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }

    #[test]
    fn test_start_serves_initial_build() {
        let f = Fixture::new();
        assert_eq!(f.session.state(), SessionState::Serving);
        assert!(f.session.snapshot().unwrap().html().is_some());
        assert!(matches!(f.session.greeting(), LiveUpdate::Connected { .. }));
    }

    #[test]
    fn test_failed_initial_build_returns_to_idle() {
        let dir = tempdir().unwrap();
        let mut config = BuildConfig::new(dunce::canonicalize(dir.path()).unwrap());
        config.entries = vec![EntryPoint {
            name: "app".into(),
            import: "./src/missing.js".into(),
        }];
        let session = DevSession::new(Bundler::new(config).unwrap());
        assert!(session.start().is_err());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.current().is_none());
    }

    #[test]
    fn test_rebuild_swaps_snapshot_and_broadcasts() {
        let f = Fixture::new();
        let mut rx = f.session.subscribe();
        let before = f.session.snapshot().unwrap().hash.clone();

        let report = f
            .session
            .rebuild(f.modified("src/app.css", "body { color: blue; }\n"))
            .unwrap()
            .unwrap();
        assert!(!report.full);
        assert_eq!(report.transformed.len(), 1);

        assert_ne!(f.session.snapshot().unwrap().hash, before);
        assert_eq!(f.session.previous().unwrap().snapshot.hash, before);
        assert!(matches!(rx.try_recv().unwrap(), LiveUpdate::Update { .. }));
    }

    #[test]
    fn test_failed_rebuild_keeps_last_good_build() {
        let f = Fixture::new();
        let mut rx = f.session.subscribe();
        let before = f.session.snapshot().unwrap().hash.clone();

        let result = f
            .session
            .rebuild(f.modified("src/index.js", "require('./nope');\n"));
        assert!(matches!(result, Err(Error::UnresolvedImport { .. })));
        assert_eq!(f.session.state(), SessionState::Serving);
        assert_eq!(f.session.snapshot().unwrap().hash, before);
        assert_eq!(f.session.last_error().unwrap().code, "UNRESOLVED_IMPORT");
        assert!(matches!(rx.try_recv().unwrap(), LiveUpdate::Error { .. }));
        assert!(matches!(f.session.greeting(), LiveUpdate::Error { .. }));

        // An unrelated edit still re-examines the failing file.
        let result = f.session.rebuild(f.modified("src/app.css", "body { color: green; }\n"));
        assert!(result.is_err());

        // Fixing it recovers.
        f.session
            .rebuild(f.modified("src/index.js", "require('./app.css');\n"))
            .unwrap();
        assert!(f.session.last_error().is_none());
        assert_ne!(f.session.snapshot().unwrap().hash, before);
    }

    #[test]
    fn test_untracked_changes_are_ignored() {
        let f = Fixture::new();
        let changes = f.modified("notes.txt", "hello");
        assert!(f.session.rebuild(changes).unwrap().is_none());
    }

    #[test]
    fn test_created_file_triggers_full_rebuild() {
        let f = Fixture::new();
        write(&f.root, "src/extra.js", "module.exports = 2;\n");
        let changes = ChangeSet::from_events(&[ChangeEvent::new(
            f.root.join("src/extra.js"),
            ChangeKind::Created,
        )]);
        let report = f.session.rebuild(changes).unwrap().unwrap();
        assert!(report.full);
    }

    #[tokio::test]
    async fn test_run_coalesces_and_stops_when_channel_closes() {
        let f = Fixture::new();
        let mut rx = f.session.subscribe();
        let (tx, events) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Arc::clone(&f.session).run(events, Duration::from_millis(20)));

        write(&f.root, "src/app.css", "body { color: blue; }\n");
        let path = f.root.join("src/app.css");
        tx.send(vec![ChangeEvent::new(path.clone(), ChangeKind::Modified)]).unwrap();
        tx.send(vec![ChangeEvent::new(path, ChangeKind::Modified)]).unwrap();

        let update = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(update, LiveUpdate::Update { .. }));

        drop(tx);
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.session.state(), SessionState::Stopped);
        // Both events were coalesced into a single rebuild.
        assert!(rx.try_recv().is_err());
    }
}
