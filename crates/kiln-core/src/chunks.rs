//! Chunk splitting.
//!
//! Partitions the reachable modules of a [`ModuleGraph`] into chunks:
//!
//! - a vendor chunk holding every module under the vendor root (omitted
//!   when empty), listed first;
//! - one chunk per entry, in declared order, holding the remaining modules
//!   reachable from that entry. A module reachable from several entries
//!   belongs to the first declared one.
//!
//! Modules inside a chunk keep the graph's topological order, so a chunk's
//! script and stylesheet are concatenated dependencies-first.

use crate::graph::{ModuleGraph, ModuleId};
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use std::path::Path;

/// Unique identifier for a chunk.
pub type ChunkId = usize;

/// Why a chunk exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    /// Third-party modules shared by all entries.
    Vendor,
    /// Application modules of one entry.
    Entry,
}

/// A group of modules emitted together.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: ChunkId,
    /// `[name]` in filename templates.
    pub name: String,
    pub kind: ChunkKind,
    /// Modules in topological order.
    pub modules: Vec<ModuleId>,
    /// Module executed when the chunk loads (entry chunks only).
    pub entry: Option<ModuleId>,
    /// Chunks that must load first.
    pub dependencies: Vec<ChunkId>,
}

/// Result of splitting.
#[derive(Debug, Clone, Default)]
pub struct ChunkGraph {
    chunks: Vec<Chunk>,
    module_to_chunk: HashMap<ModuleId, ChunkId>,
}

impl ChunkGraph {
    /// Split `graph`. Modules under `vendor_root` go to the vendor chunk.
    #[must_use]
    pub fn split(graph: &ModuleGraph, vendor_root: &Path, vendor_name: &str) -> Self {
        let mut chunk_graph = ChunkGraph::default();
        let order = graph.toposort();

        let mut reachable = vec![false; graph.len()];
        for (_, entry) in graph.entries() {
            for id in graph.reachable_from(*entry) {
                reachable[id] = true;
            }
        }

        let is_vendor = |id: ModuleId| {
            graph
                .get(id)
                .is_some_and(|m| m.identity.is_under(vendor_root))
        };

        // Vendor chunk
        let vendor: Vec<ModuleId> = order
            .iter()
            .copied()
            .filter(|&id| reachable[id] && is_vendor(id))
            .collect();
        if !vendor.is_empty() {
            let id = chunk_graph.push(vendor_name.to_string(), ChunkKind::Vendor, None);
            for &module in &vendor {
                chunk_graph.module_to_chunk.insert(module, id);
            }
        }

        // Entry chunks, first declared entry wins
        for (name, entry) in graph.entries() {
            if chunk_graph.chunks.iter().any(|c| c.name == *name) {
                continue;
            }
            let id = chunk_graph.push(name.clone(), ChunkKind::Entry, Some(*entry));
            for module in graph.reachable_from(*entry) {
                if !is_vendor(module) {
                    chunk_graph.module_to_chunk.entry(module).or_insert(id);
                }
            }
        }

        // Fill module lists in topological order
        for &module in &order {
            if let Some(&chunk) = chunk_graph.module_to_chunk.get(&module) {
                chunk_graph.chunks[chunk].modules.push(module);
            }
        }

        chunk_graph.link(graph);
        chunk_graph
    }

    fn push(&mut self, name: String, kind: ChunkKind, entry: Option<ModuleId>) -> ChunkId {
        let id = self.chunks.len();
        self.chunks.push(Chunk {
            id,
            name,
            kind,
            modules: Vec::new(),
            entry,
            dependencies: Vec::new(),
        });
        id
    }

    /// Record chunk-to-chunk edges from cross-chunk imports.
    fn link(&mut self, graph: &ModuleGraph) {
        for chunk in &mut self.chunks {
            let mut deps = Vec::new();
            for &module in &chunk.modules {
                let Some(m) = graph.get(module) else { continue };
                for dep in &m.dependencies {
                    if let Some(&target) = self.module_to_chunk.get(dep) {
                        if target != chunk.id && !deps.contains(&target) {
                            deps.push(target);
                        }
                    }
                }
            }
            deps.sort_unstable();
            chunk.dependencies = deps;
        }
    }

    #[must_use]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    #[must_use]
    pub fn get(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(id)
    }

    #[must_use]
    pub fn chunk_of(&self, module: ModuleId) -> Option<ChunkId> {
        self.module_to_chunk.get(&module).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks in load order: every chunk after the chunks it depends on.
    ///
    /// Creation order already satisfies this (vendor first, then entries in
    /// declared order, since a later entry can only reach modules that an
    /// earlier entry claimed, never the reverse).
    pub fn load_order(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Module;
    use crate::identity::FileIdentity;

    fn add(graph: &mut ModuleGraph, path: &str, dependencies: Vec<ModuleId>) -> ModuleId {
        graph.add(Module {
            identity: FileIdentity::new(path),
            source_digest: String::new(),
            outputs: Vec::new(),
            imports: Vec::new(),
            dependencies,
            watch_files: Vec::new(),
        })
    }

    /// app -> {util, lodash}, admin -> {util, admin-only, lodash}
    fn two_entry_graph() -> ModuleGraph {
        let mut g = ModuleGraph::new();
        let app = add(&mut g, "/p/src/app.js", vec![2, 3]);
        let admin = add(&mut g, "/p/src/admin.js", vec![2, 4, 3]);
        add(&mut g, "/p/src/util.js", vec![]);
        add(&mut g, "/p/node_modules/lodash/index.js", vec![]);
        add(&mut g, "/p/src/admin-only.js", vec![]);
        add(&mut g, "/p/src/orphan.js", vec![]);
        g.add_entry("app", app);
        g.add_entry("admin", admin);
        g
    }

    #[test]
    fn test_partition_is_total_and_disjoint() {
        let g = two_entry_graph();
        let chunks = ChunkGraph::split(&g, Path::new("/p/node_modules"), "vendors");

        let mut seen = vec![0usize; g.len()];
        for chunk in chunks.chunks() {
            for &m in &chunk.modules {
                seen[m] += 1;
            }
        }
        // Every reachable module exactly once; the orphan nowhere
        assert_eq!(seen, vec![1, 1, 1, 1, 1, 0]);
    }

    #[test]
    fn test_vendor_first_then_entries_in_order() {
        let g = two_entry_graph();
        let chunks = ChunkGraph::split(&g, Path::new("/p/node_modules"), "vendors");
        let names: Vec<_> = chunks.chunks().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["vendors", "app", "admin"]);
        assert_eq!(chunks.chunks()[0].kind, ChunkKind::Vendor);
        assert_eq!(chunks.chunks()[0].modules, vec![3]);
    }

    #[test]
    fn test_shared_module_goes_to_first_entry() {
        let g = two_entry_graph();
        let chunks = ChunkGraph::split(&g, Path::new("/p/node_modules"), "vendors");
        assert_eq!(chunks.chunk_of(2), Some(1));
        assert_eq!(chunks.chunk_of(4), Some(2));
        // admin depends on app's chunk and the vendor chunk
        assert_eq!(chunks.chunks()[2].dependencies, vec![0, 1]);
        assert_eq!(chunks.chunks()[1].dependencies, vec![0]);
    }

    #[test]
    fn test_no_vendor_chunk_when_empty() {
        let mut g = ModuleGraph::new();
        let app = add(&mut g, "/p/src/app.js", vec![1]);
        add(&mut g, "/p/src/util.js", vec![]);
        g.add_entry("app", app);
        let chunks = ChunkGraph::split(&g, Path::new("/p/node_modules"), "vendors");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks.chunks()[0].name, "app");
        // dependencies first
        assert_eq!(chunks.chunks()[0].modules, vec![1, 0]);
    }
}
