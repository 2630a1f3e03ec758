#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

//! Static-asset bundling pipeline.
//!
//! ## Architecture
//!
//! 1. **Resolution** - map import specifiers to [`FileIdentity`] values
//! 2. **Substitution** - mode-gated specifier rewrites ahead of resolution
//! 3. **Transform** - per-kind transform chains, dispatched once per file
//! 4. **Graph** - worklist-driven, parallel, incremental module graph
//! 5. **Chunks** - vendor chunk plus one chunk per entry
//! 6. **Emit** - content-addressed artifacts, source maps, and the HTML shell
//! 7. **Dev** - in-memory serving state, watcher, live updates

pub mod chunks;
pub mod config;
pub mod dev;
pub mod digest;
pub mod emit;
pub mod error;
pub mod graph;
pub mod identity;
pub mod pipeline;
pub mod resolve;
pub mod scan;
pub mod sourcemap;
pub mod substitute;
pub mod transform;

pub use chunks::{Chunk, ChunkGraph, ChunkId, ChunkKind};
pub use config::{BuildConfig, EntryPoint, FilenameTemplates, Mode};
pub use dev::{DevSession, LiveUpdate, SessionState, SourceWatcher, WatchOptions};
pub use emit::{ArtifactKind, BuildSnapshot, Emitter, OutputArtifact};
pub use error::{Error, Result};
pub use graph::{GraphBuilder, Module, ModuleGraph, ModuleId};
pub use identity::{FileIdentity, FileKind};
pub use pipeline::{Build, Bundler, RebuildReport};
pub use resolve::Resolver;
pub use substitute::{EnvSubstitution, Substitution};
pub use transform::{Dispatcher, RuleTable, Transform};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
