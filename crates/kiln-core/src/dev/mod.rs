//! Development mode: file watching, the dev session, and live updates.

pub mod hmr;
pub mod session;
pub mod watch;

pub use hmr::{classify, ChunkPatch, LiveUpdate, ModulePatch, StylePatch, CLIENT_RUNTIME};
pub use session::{DevSession, SessionError, SessionState, SessionStatus, UPDATE_CAPACITY};
pub use watch::{ChangeEvent, ChangeKind, ChangeSet, SourceWatcher, WatchBackend, WatchOptions};
