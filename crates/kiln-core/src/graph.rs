//! Module dependency graph.
//!
//! [`GraphBuilder`] expands the graph from the entry points with a shared
//! worklist: each resolved [`FileIdentity`] is reserved exactly once, then
//! read, transformed, and its discovered specifiers substituted and resolved
//! into new worklist items. Independent files are processed in parallel on
//! the rayon pool. Once the worklist drains, modules are numbered by a
//! breadth-first walk from the entries in declared order, so ids (and every
//! ordering derived from them) do not depend on thread scheduling.

use crate::config::BuildConfig;
use crate::digest::content_digest;
use crate::error::{Error, Result};
use crate::identity::FileIdentity;
use crate::resolve::Resolver;
use crate::substitute::EnvSubstitution;
use crate::transform::{Dispatcher, ModuleOutput};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// Index of a module in discovery order.
pub type ModuleId = usize;

/// An import edge as written in the importer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImport {
    /// Specifier as reported by the transform chain.
    pub specifier: String,
    pub target: FileIdentity,
}

/// A module in the dependency graph.
#[derive(Debug, Clone)]
pub struct Module {
    pub identity: FileIdentity,
    /// Digest of the source bytes the outputs were produced from.
    pub source_digest: String,
    /// Transform outputs; primary output first.
    pub outputs: Vec<ModuleOutput>,
    /// Import edges in discovery order.
    pub imports: Vec<ResolvedImport>,
    /// Deduplicated dependency ids, in import order.
    pub dependencies: Vec<ModuleId>,
    /// Non-module files inlined into the outputs.
    pub watch_files: Vec<PathBuf>,
}

impl Module {
    /// Whether a change to `path` invalidates this module's outputs.
    #[must_use]
    pub fn depends_on_file(&self, path: &Path) -> bool {
        self.identity.path() == path || self.watch_files.iter().any(|f| f == path)
    }
}

/// The module dependency graph.
#[derive(Debug, Default, Clone)]
pub struct ModuleGraph {
    /// All modules, indexed by ID.
    modules: Vec<Module>,
    by_identity: HashMap<FileIdentity, ModuleId>,
    /// Entry names in declared order.
    entries: Vec<(String, ModuleId)>,
}

impl ModuleGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module, returning its ID.
    pub fn add(&mut self, module: Module) -> ModuleId {
        let id = self.modules.len();
        self.by_identity.insert(module.identity.clone(), id);
        self.modules.push(module);
        id
    }

    /// Register a named entry.
    pub fn add_entry(&mut self, name: impl Into<String>, id: ModuleId) {
        self.entries.push((name.into(), id));
    }

    #[must_use]
    pub fn get(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(id)
    }

    #[must_use]
    pub fn id_of(&self, identity: &FileIdentity) -> Option<ModuleId> {
        self.by_identity.get(identity).copied()
    }

    #[must_use]
    pub fn get_by_identity(&self, identity: &FileIdentity) -> Option<&Module> {
        self.id_of(identity).and_then(|id| self.get(id))
    }

    /// Look up a module by path, ignoring kind.
    #[must_use]
    pub fn get_by_path(&self, path: &Path) -> Option<(ModuleId, &Module)> {
        self.get_by_identity(&FileIdentity::new(path))
            .map(|m| (self.by_identity[&m.identity], m))
    }

    /// Target of `specifier` as imported by `from`.
    #[must_use]
    pub fn resolve_import(&self, from: ModuleId, specifier: &str) -> Option<ModuleId> {
        self.get(from)?
            .imports
            .iter()
            .find(|i| i.specifier == specifier)
            .and_then(|i| self.id_of(&i.target))
    }

    #[must_use]
    pub fn entries(&self) -> &[(String, ModuleId)] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, &Module)> {
        self.modules.iter().enumerate()
    }

    /// Whether `path` is a module or a file inlined into one.
    #[must_use]
    pub fn tracks(&self, path: &Path) -> bool {
        self.modules.iter().any(|m| m.depends_on_file(path))
    }

    /// Modules reachable from `start`, in breadth-first order.
    #[must_use]
    pub fn reachable_from(&self, start: ModuleId) -> Vec<ModuleId> {
        let mut seen = vec![false; self.modules.len()];
        let mut order = Vec::new();
        let mut queue = VecDeque::from([start]);
        if let Some(flag) = seen.get_mut(start) {
            *flag = true;
        }
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for &dep in &self.modules[id].dependencies {
                if !seen[dep] {
                    seen[dep] = true;
                    queue.push_back(dep);
                }
            }
        }
        order
    }

    /// Modules in topological order (dependencies before dependents).
    ///
    /// Ties go to the lower id, so the order is fixed for a given graph.
    /// Modules left on a cycle are appended in id order.
    #[must_use]
    pub fn toposort(&self) -> Vec<ModuleId> {
        let n = self.modules.len();
        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<ModuleId>> = vec![Vec::new(); n];

        for (id, module) in self.modules.iter().enumerate() {
            for &dep in &module.dependencies {
                if dep == id {
                    continue;
                }
                dependents[dep].push(id);
                in_degree[id] += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<ModuleId>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(id, _)| Reverse(id))
            .collect();

        let mut order = Vec::with_capacity(n);
        let mut placed = vec![false; n];
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            placed[id] = true;
            for &next in &dependents[id] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        // Circular imports are legal; keep the remainder in discovery order.
        order.extend((0..n).filter(|&id| !placed[id]));
        order
    }
}

/// Result of expanding the graph.
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    pub graph: ModuleGraph,
    /// Modules read and transformed (not reused), in discovery order.
    pub transformed: Vec<FileIdentity>,
}

/// Prior graph and changed paths for an incremental rebuild.
struct Reuse<'p> {
    previous: &'p ModuleGraph,
    changed: &'p HashSet<PathBuf>,
}

struct Processed {
    module: Module,
    transformed: bool,
}

/// State shared by the workers of one expansion.
struct Worklist {
    /// Reserved identities, with the importer that first reached each.
    reserved: Mutex<HashMap<FileIdentity, Option<FileIdentity>>>,
    done: Mutex<HashMap<FileIdentity, Processed>>,
    error: Mutex<Option<Error>>,
    failed: AtomicBool,
}

impl Worklist {
    fn new() -> Self {
        Self {
            reserved: Mutex::new(HashMap::default()),
            done: Mutex::new(HashMap::default()),
            error: Mutex::new(None),
            failed: AtomicBool::new(false),
        }
    }

    /// Atomically claim `identity`. Returns false if already claimed.
    fn reserve(&self, identity: &FileIdentity, importer: Option<&FileIdentity>) -> bool {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        if reserved.contains_key(identity) {
            return false;
        }
        reserved.insert(identity.clone(), importer.cloned());
        true
    }

    /// Record the first failure; later ones are dropped.
    fn fail(&self, mut error: Error) {
        if let Error::UnresolvedImport { from, chain, .. } = &mut error {
            *chain = self.chain_to(from);
        }
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
        self.failed.store(true, Ordering::SeqCst);
    }

    /// Importer chain from an entry down to `path`.
    fn chain_to(&self, path: &Path) -> Vec<PathBuf> {
        let reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        let mut chain = vec![path.to_path_buf()];
        let mut current = FileIdentity::new(path);
        while let Some(Some(parent)) = reserved.get(&current) {
            if chain.iter().any(|p| p == parent.path()) {
                break;
            }
            chain.push(parent.path().to_path_buf());
            current = parent.clone();
        }
        chain.reverse();
        chain
    }
}

/// Builds a [`ModuleGraph`] from the configured entries.
pub struct GraphBuilder<'a> {
    config: &'a BuildConfig,
    resolver: &'a Resolver,
    dispatcher: &'a Dispatcher,
    substitution: &'a EnvSubstitution,
}

impl<'a> GraphBuilder<'a> {
    #[must_use]
    pub fn new(
        config: &'a BuildConfig,
        resolver: &'a Resolver,
        dispatcher: &'a Dispatcher,
        substitution: &'a EnvSubstitution,
    ) -> Self {
        Self {
            config,
            resolver,
            dispatcher,
            substitution,
        }
    }

    /// Full build: every reachable file is read and transformed.
    pub fn build(&self) -> Result<Expansion> {
        self.expand(None)
    }

    /// Incremental build. Modules of `previous` whose file (and inlined
    /// files) did not change are reused without re-transforming; modules no
    /// longer reachable are dropped.
    pub fn rebuild(&self, previous: &ModuleGraph, changed: &HashSet<PathBuf>) -> Result<Expansion> {
        self.expand(Some(&Reuse { previous, changed }))
    }

    fn expand(&self, reuse: Option<&Reuse<'_>>) -> Result<Expansion> {
        let entries = self.resolve_entries()?;
        let worklist = Worklist::new();

        rayon::scope(|scope| {
            for (_, identity) in &entries {
                if worklist.reserve(identity, None) {
                    let identity = identity.clone();
                    let worklist = &worklist;
                    scope.spawn(move |scope| self.visit(scope, worklist, reuse, identity));
                }
            }
        });

        if let Some(error) = worklist
            .error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(error);
        }

        let done = worklist
            .done
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        number_modules(&entries, done, self.config.max_depth)
    }

    fn visit<'s>(
        &'s self,
        scope: &rayon::Scope<'s>,
        worklist: &'s Worklist,
        reuse: Option<&'s Reuse<'s>>,
        identity: FileIdentity,
    ) {
        if worklist.failed.load(Ordering::SeqCst) {
            return;
        }

        let processed = match self.process(&identity, reuse) {
            Ok(processed) => processed,
            Err(error) => {
                worklist.fail(error);
                return;
            }
        };

        let targets: Vec<FileIdentity> = processed
            .module
            .imports
            .iter()
            .map(|i| i.target.clone())
            .collect();
        worklist
            .done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity.clone(), processed);

        for target in targets {
            if worklist.reserve(&target, Some(&identity)) {
                scope.spawn(move |scope| self.visit(scope, worklist, reuse, target));
            }
        }
    }

    /// Read, transform, and resolve one file, or reuse its prior result.
    fn process(&self, identity: &FileIdentity, reuse: Option<&Reuse<'_>>) -> Result<Processed> {
        let path = identity.path();
        let prior = reuse.and_then(|r| {
            r.previous
                .get_by_identity(identity)
                .map(|module| (module, r.changed))
        });

        if let Some((module, changed)) = prior {
            if !changed.iter().any(|p| module.depends_on_file(p)) {
                return Ok(reused(module));
            }
        }

        let content = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        let digest = content_digest(&content);

        if let Some((module, changed)) = prior {
            let inlined_changed = module.watch_files.iter().any(|f| changed.contains(f));
            if module.source_digest == digest && !inlined_changed {
                tracing::trace!(path = %path.display(), "unchanged content, reusing");
                return Ok(reused(module));
            }
            self.resolver.invalidate_from(path);
        }

        tracing::debug!(path = %path.display(), kind = %identity.kind(), "transform");
        let result = self
            .dispatcher
            .transform(identity, content, self.config.mode, &self.config.root)?;

        let imports = result
            .dependencies
            .into_iter()
            .map(|specifier| {
                let request = self.substitution.rewrite(self.config.mode, &specifier);
                match self.resolver.resolve(&request, path) {
                    Some(target) => Ok(ResolvedImport { specifier, target }),
                    None => Err(Error::UnresolvedImport {
                        specifier,
                        from: path.to_path_buf(),
                        chain: Vec::new(),
                    }),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Processed {
            module: Module {
                identity: identity.clone(),
                source_digest: digest,
                outputs: result.outputs,
                imports,
                dependencies: Vec::new(),
                watch_files: result.watch_files,
            },
            transformed: true,
        })
    }

    fn resolve_entries(&self) -> Result<Vec<(String, FileIdentity)>> {
        self.config
            .entries
            .iter()
            .map(|entry| {
                let request = self.substitution.rewrite(self.config.mode, &entry.import);
                self.resolver
                    .resolve_entry(&request, &self.config.root)
                    .map(|identity| (entry.name.clone(), identity))
                    .ok_or_else(|| Error::EntryNotFound {
                        specifier: entry.import.clone(),
                        message: format!("no file found from {}", self.config.root.display()),
                    })
            })
            .collect()
    }
}

fn reused(module: &Module) -> Processed {
    Processed {
        module: Module {
            dependencies: Vec::new(),
            ..module.clone()
        },
        transformed: false,
    }
}

/// Assign ids breadth-first from the entries and link dependency ids.
///
/// The walk also measures each module's shortest import distance from an
/// entry; a module further than `max_depth` fails with `CycleExceeded`.
fn number_modules(
    entries: &[(String, FileIdentity)],
    mut done: HashMap<FileIdentity, Processed>,
    max_depth: usize,
) -> Result<Expansion> {
    let mut graph = ModuleGraph::new();
    let mut transformed = Vec::new();
    let mut queue = VecDeque::new();

    let mut place = |graph: &mut ModuleGraph,
                     identity: &FileIdentity,
                     depth: usize,
                     queue: &mut VecDeque<(ModuleId, usize)>|
     -> Result<ModuleId> {
        if let Some(id) = graph.id_of(identity) {
            return Ok(id);
        }
        if depth > max_depth {
            return Err(Error::CycleExceeded {
                file: identity.path().to_path_buf(),
                depth: max_depth,
            });
        }
        let processed = done
            .remove(identity)
            .ok_or_else(|| Error::other(format!("module {identity} was never processed")))?;
        if processed.transformed {
            transformed.push(identity.clone());
        }
        let id = graph.add(processed.module);
        queue.push_back((id, depth));
        Ok(id)
    };

    for (name, identity) in entries {
        let id = place(&mut graph, identity, 0, &mut queue)?;
        graph.add_entry(name.clone(), id);
    }

    while let Some((id, depth)) = queue.pop_front() {
        let targets: Vec<FileIdentity> = graph.modules[id]
            .imports
            .iter()
            .map(|i| i.target.clone())
            .collect();
        let mut dependencies = Vec::with_capacity(targets.len());
        for target in &targets {
            let dep = place(&mut graph, target, depth + 1, &mut queue)?;
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }
        graph.modules[id].dependencies = dependencies;
    }

    Ok(Expansion { graph, transformed })
}
