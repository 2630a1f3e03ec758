//! Build pipeline.
//!
//! [`Bundler`] owns the resolver, dispatcher, and substitution hook for one
//! configuration and runs the stages in order: graph expansion, then (once
//! the graph is complete) chunk splitting, then emission.

use crate::chunks::ChunkGraph;
use crate::config::BuildConfig;
use crate::emit::{BuildSnapshot, Emitter};
use crate::error::Result;
use crate::graph::{Expansion, GraphBuilder, ModuleGraph};
use crate::resolve::Resolver;
use crate::substitute::EnvSubstitution;
use crate::transform::{Dispatcher, RuleTable};
use rustc_hash::FxHashSet as HashSet;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Everything one build produced.
#[derive(Debug, Clone)]
pub struct Build {
    pub graph: ModuleGraph,
    pub chunks: ChunkGraph,
    pub snapshot: Arc<BuildSnapshot>,
}

/// What a build did relative to the previous one.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    /// Whether every module was re-read and re-transformed.
    pub full: bool,
    /// Modules transformed in this build, in discovery order.
    pub transformed: Vec<PathBuf>,
    /// Modules reused from the previous graph.
    pub reused: usize,
    /// Modules new to the graph.
    pub added: Vec<PathBuf>,
    /// Modules no longer reachable.
    pub removed: Vec<PathBuf>,
    pub duration_ms: u64,
}

/// Runs builds for one configuration.
pub struct Bundler {
    config: BuildConfig,
    resolver: Resolver,
    dispatcher: Dispatcher,
    substitution: EnvSubstitution,
}

impl std::fmt::Debug for Bundler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundler")
            .field("root", &self.config.root)
            .field("mode", &self.config.mode)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Bundler {
    /// Bundler with the stock rule table.
    pub fn new(config: BuildConfig) -> Result<Self> {
        let rules = RuleTable::standard(&config);
        Self::with_rules(config, rules)
    }

    /// Bundler with a caller-supplied rule table.
    pub fn with_rules(config: BuildConfig, rules: RuleTable) -> Result<Self> {
        config.validate()?;
        let substitution = EnvSubstitution::from_config(&config)?;
        let resolver = Resolver::new(config.module_root_paths(), config.extensions.clone());
        Ok(Self {
            resolver,
            dispatcher: Dispatcher::from_rules(rules),
            substitution,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    fn graph_builder(&self) -> GraphBuilder<'_> {
        GraphBuilder::new(&self.config, &self.resolver, &self.dispatcher, &self.substitution)
    }

    /// Full build from scratch.
    pub fn build(&self) -> Result<Build> {
        let started = Instant::now();
        self.resolver.clear();
        let expansion = self.graph_builder().build()?;
        let (build, report) = self.finish(expansion, None, started)?;
        tracing::info!(
            modules = build.graph.len(),
            chunks = build.chunks.len(),
            artifacts = build.snapshot.len(),
            duration_ms = report.duration_ms,
            "build complete"
        );
        Ok(build)
    }

    /// Full build, reported against `previous`.
    pub fn rebuild_full(&self, previous: &Build) -> Result<(Build, RebuildReport)> {
        let started = Instant::now();
        self.resolver.clear();
        let expansion = self.graph_builder().build()?;
        self.finish(expansion, Some(previous), started)
    }

    /// Incremental build after `changed` files were modified in place.
    pub fn rebuild(
        &self,
        previous: &Build,
        changed: &HashSet<PathBuf>,
    ) -> Result<(Build, RebuildReport)> {
        let started = Instant::now();
        let expansion = self.graph_builder().rebuild(&previous.graph, changed)?;
        let (build, mut report) = self.finish(expansion, Some(previous), started)?;
        report.full = false;
        tracing::info!(
            transformed = report.transformed.len(),
            reused = report.reused,
            added = report.added.len(),
            removed = report.removed.len(),
            duration_ms = report.duration_ms,
            "rebuild complete"
        );
        Ok((build, report))
    }

    /// Write a build's snapshot to the configured output directory.
    pub fn write(&self, build: &Build) -> Result<PathBuf> {
        let dir = self.config.output_path();
        build.snapshot.write_to(&dir)?;
        Ok(dir)
    }

    fn finish(
        &self,
        expansion: Expansion,
        previous: Option<&Build>,
        started: Instant,
    ) -> Result<(Build, RebuildReport)> {
        let Expansion { graph, transformed } = expansion;

        // The graph is complete here; splitting never sees a partial graph.
        let chunks = ChunkGraph::split(
            &graph,
            &self.config.vendor_path(),
            &self.config.vendor_chunk_name,
        );
        let snapshot = Emitter::new(&self.config).emit(&graph, &chunks)?;

        let mut report = RebuildReport {
            full: true,
            reused: graph.len().saturating_sub(transformed.len()),
            transformed: transformed.iter().map(|i| i.path().to_path_buf()).collect(),
            ..Default::default()
        };
        if let Some(previous) = previous {
            report.added = graph
                .iter()
                .filter(|(_, m)| previous.graph.id_of(&m.identity).is_none())
                .map(|(_, m)| m.identity.path().to_path_buf())
                .collect();
            report.removed = previous
                .graph
                .iter()
                .filter(|(_, m)| graph.id_of(&m.identity).is_none())
                .map(|(_, m)| m.identity.path().to_path_buf())
                .collect();
        }
        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        Ok((
            Build {
                graph,
                chunks,
                snapshot: Arc::new(snapshot),
            },
            report,
        ))
    }
}
