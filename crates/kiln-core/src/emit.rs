//! Output emission.
//!
//! Turns a [`ModuleGraph`] and its [`ChunkGraph`] into a [`BuildSnapshot`]:
//! standalone assets, one script and one stylesheet per chunk, a source map
//! per script, the HTML shell, and `asset-manifest.json`. Every hashed filename is derived from
//! the exact bytes it names. The snapshot is assembled fully in memory;
//! [`BuildSnapshot::write_to`] stages it beside the output directory and
//! swaps it into place so a failed build never leaves partial output.

use crate::chunks::{ChunkGraph, ChunkKind};
use crate::config::{BuildConfig, Mode};
use crate::digest::{content_digest, name_content, render_template, TemplateVars};
use crate::error::{Error, Result};
use crate::graph::{Module, ModuleGraph, ModuleId};
use crate::identity::FileKind;
use crate::sourcemap::SourceMapBuilder;
use crate::transform::markup::{js_string, minify_html};
use crate::transform::script::minify_script;
use crate::transform::style::rewrite_urls;
use crate::transform::OutputKind;
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Name of the HTML shell artifact.
pub const HTML_FILE: &str = "index.html";

/// Name of the manifest artifact.
pub const MANIFEST_FILE: &str = "asset-manifest.json";

/// Module registry prepended to every script chunk.
///
/// `define(id, deps, factory)` registers a module; `require(id)` runs it
/// once and returns its exports. `apply(id)` re-runs a module that accepted
/// hot updates and reports whether it did.
pub const MODULE_RUNTIME: &str = r#"(function (global) {
  if (global.__kiln__) return;
  var definitions = {};
  var cache = {};
  var hot = {};
  function hotContext(id) {
    var state = hot[id] || (hot[id] = { accepted: false, disposers: [], data: {} });
    return {
      data: state.data,
      accept: function () { state.accepted = true; },
      dispose: function (cb) { state.disposers.push(cb); }
    };
  }
  function load(id) {
    if (cache[id]) return cache[id].exports;
    var def = definitions[id];
    if (!def) throw new Error("kiln: unknown module " + id);
    var module = { id: id, exports: {}, hot: hotContext(id) };
    cache[id] = module;
    def.factory.call(module.exports, module, module.exports, function (specifier) {
      var target = def.deps[specifier];
      if (target === undefined) throw new Error("kiln: cannot find '" + specifier + "' from " + id);
      return load(target);
    });
    return module.exports;
  }
  function apply(id) {
    var state = hot[id];
    if (!state || !state.accepted) return false;
    state.disposers.forEach(function (cb) { cb(state.data); });
    state.disposers = [];
    state.accepted = false;
    delete cache[id];
    load(id);
    return true;
  }
  global.__kiln__ = {
    define: function (id, deps, factory) { definitions[id] = { deps: deps, factory: factory }; },
    require: load,
    apply: apply
  };
})(typeof window !== "undefined" ? window : globalThis);
"#;

const DEFAULT_SHELL: &str = "<!DOCTYPE html>
<html>
<head>
  <meta charset=\"utf-8\">
  <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">
  <title>kiln</title>
</head>
<body>
</body>
</html>
";

/// What an artifact is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Script,
    Style,
    Asset,
    Html,
    Manifest,
    SourceMap,
}

/// One emitted file.
#[derive(Debug, Clone)]
pub struct OutputArtifact {
    /// Path relative to the output directory, `/`-separated.
    pub filename: String,
    pub kind: ArtifactKind,
    pub bytes: Arc<[u8]>,
    /// Full digest of `bytes`.
    pub digest: String,
    /// Owning chunk, for scripts and stylesheets.
    pub chunk: Option<String>,
}

impl OutputArtifact {
    #[must_use]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// MIME type for serving.
    #[must_use]
    pub fn content_type(&self) -> &'static str {
        match self.kind {
            ArtifactKind::Script => "application/javascript; charset=utf-8",
            ArtifactKind::Style => "text/css; charset=utf-8",
            ArtifactKind::Html => "text/html; charset=utf-8",
            ArtifactKind::Manifest | ArtifactKind::SourceMap => "application/json",
            ArtifactKind::Asset => content_type_for(&self.filename),
        }
    }
}

fn content_type_for(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "eot" => "application/vnd.ms-fontobject",
        _ => "application/octet-stream",
    }
}

/// Files emitted for one chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkOutput {
    pub name: String,
    pub kind: ChunkKind,
    pub script: Option<String>,
    pub style: Option<String>,
    /// Module ids in chunk order.
    pub modules: Vec<String>,
}

/// Per-module emission record, kept for live updates.
#[derive(Debug, Clone)]
pub struct EmittedModule {
    pub kind: FileKind,
    /// The `__kiln__.define(...)` statement for this module.
    pub definition: String,
    /// Digest of everything the module contributed.
    pub digest: String,
    pub chunk: String,
}

/// A module's `define` statement and, for script sources, where its body
/// lines came from.
struct Definition {
    text: String,
    mapped: Option<MappedBody>,
}

struct MappedBody {
    source: String,
    /// Source line of each body line.
    lines: Vec<u32>,
}

/// A complete, immutable build result.
#[derive(Debug, Clone)]
pub struct BuildSnapshot {
    pub mode: Mode,
    /// Digest over every artifact name and digest.
    pub hash: String,
    artifacts: BTreeMap<String, OutputArtifact>,
    chunks: Vec<ChunkOutput>,
    modules: BTreeMap<String, EmittedModule>,
}

impl BuildSnapshot {
    #[must_use]
    pub fn get(&self, filename: &str) -> Option<&OutputArtifact> {
        self.artifacts.get(filename.trim_start_matches('/'))
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &OutputArtifact> {
        self.artifacts.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Chunks in load order.
    #[must_use]
    pub fn chunks(&self) -> &[ChunkOutput] {
        &self.chunks
    }

    #[must_use]
    pub fn chunk(&self, name: &str) -> Option<&ChunkOutput> {
        self.chunks.iter().find(|c| c.name == name)
    }

    /// Emitted modules keyed by runtime id.
    #[must_use]
    pub fn modules(&self) -> &BTreeMap<String, EmittedModule> {
        &self.modules
    }

    /// The HTML shell.
    #[must_use]
    pub fn html(&self) -> Option<&OutputArtifact> {
        self.get(HTML_FILE)
    }

    /// Total bytes across artifacts.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.artifacts.values().map(OutputArtifact::size).sum()
    }

    /// Write every artifact under `dir`, replacing its previous contents.
    ///
    /// Artifacts are written to a staging directory next to `dir` first; the
    /// existing output is only replaced once all writes succeeded.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let parent = dir
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;

        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("dist")
            .to_string();
        let pid = std::process::id();
        let staging = parent.join(format!(".{name}.staging.{pid}"));
        let backup = parent.join(format!(".{name}.old.{pid}"));

        if staging.exists() {
            std::fs::remove_dir_all(&staging).map_err(|e| Error::io(&staging, e))?;
        }
        if let Err(e) = self.write_all(&staging) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        let had_previous = dir.exists();
        if had_previous {
            std::fs::rename(dir, &backup).map_err(|e| {
                let _ = std::fs::remove_dir_all(&staging);
                Error::io(dir, e)
            })?;
        }
        if let Err(e) = std::fs::rename(&staging, dir) {
            if had_previous {
                let _ = std::fs::rename(&backup, dir);
            }
            let _ = std::fs::remove_dir_all(&staging);
            return Err(Error::io(dir, e));
        }
        if had_previous {
            if let Err(e) = std::fs::remove_dir_all(&backup) {
                tracing::warn!(path = %backup.display(), error = %e, "failed to remove previous output");
            }
        }

        tracing::debug!(dir = %dir.display(), files = self.artifacts.len(), "wrote build output");
        Ok(())
    }

    fn write_all(&self, staging: &Path) -> Result<()> {
        std::fs::create_dir_all(staging).map_err(|e| Error::io(staging, e))?;
        for artifact in self.artifacts.values() {
            let path = staging.join(&artifact.filename);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            std::fs::write(&path, &artifact.bytes).map_err(|e| Error::io(&path, e))?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct Manifest<'a> {
    files: BTreeMap<String, &'a str>,
    entrypoints: Vec<&'a str>,
}

/// Produces a [`BuildSnapshot`] from a finished graph and chunk split.
pub struct Emitter<'a> {
    config: &'a BuildConfig,
}

impl<'a> Emitter<'a> {
    #[must_use]
    pub fn new(config: &'a BuildConfig) -> Self {
        Self { config }
    }

    pub fn emit(&self, graph: &ModuleGraph, chunks: &ChunkGraph) -> Result<BuildSnapshot> {
        let root = &self.config.root;
        let width = self.config.digest_width;
        let mut artifacts: BTreeMap<String, OutputArtifact> = BTreeMap::new();
        let mut manifest_files: BTreeMap<String, String> = BTreeMap::new();

        // Standalone assets first; stylesheets and stubs refer to their names.
        let mut asset_urls: HashMap<ModuleId, String> = HashMap::default();
        for chunk in chunks.chunks() {
            for &id in &chunk.modules {
                let Some(module) = graph.get(id) else { continue };
                for output in module.outputs.iter().filter(|o| o.kind == OutputKind::Asset) {
                    let template = if module.identity.kind() == FileKind::Font {
                        &self.config.filenames.font
                    } else {
                        &self.config.filenames.image
                    };
                    let (stem, ext) = split_hint(&output.hint);
                    let (filename, digest) =
                        asset_name(template, stem, ext, &output.bytes, width, &artifacts)?;
                    asset_urls.entry(id).or_insert_with(|| filename.clone());
                    manifest_files.insert(
                        module.identity.relative_id(root).trim_start_matches("./").to_string(),
                        filename.clone(),
                    );
                    artifacts.insert(
                        filename.clone(),
                        OutputArtifact {
                            filename,
                            kind: ArtifactKind::Asset,
                            bytes: Arc::from(output.bytes.as_slice()),
                            digest,
                            chunk: None,
                        },
                    );
                }
            }
        }

        let style_dir = template_dir(&self.config.filenames.style);
        let mut chunk_outputs = Vec::with_capacity(chunks.len());
        let mut modules = BTreeMap::new();

        for chunk in chunks.load_order() {
            // Stylesheet
            let mut css = String::new();
            for &id in &chunk.modules {
                let Some(module) = graph.get(id) else { continue };
                for output in module.outputs.iter().filter(|o| o.kind == OutputKind::Style) {
                    let text = String::from_utf8_lossy(&output.bytes);
                    let rewritten = rewrite_urls(&text, |spec| {
                        graph
                            .resolve_import(id, spec)
                            .and_then(|dep| asset_urls.get(&dep))
                            .map(|url| relative_url(&style_dir, url))
                    });
                    css.push_str(&rewritten);
                    if !css.ends_with('\n') {
                        css.push('\n');
                    }
                }
            }
            let style = if css.is_empty() {
                None
            } else {
                let (filename, digest) =
                    name_content(&self.config.filenames.style, &chunk.name, "css", css.as_bytes(), width);
                manifest_files.insert(format!("{}.css", chunk.name), filename.clone());
                artifacts.insert(
                    filename.clone(),
                    OutputArtifact {
                        filename: filename.clone(),
                        kind: ArtifactKind::Style,
                        bytes: Arc::from(css.into_bytes()),
                        digest,
                        chunk: Some(chunk.name.clone()),
                    },
                );
                Some(filename)
            };

            // Script
            let mut js = if self.config.mode.minify() {
                minify_script(MODULE_RUNTIME).code
            } else {
                MODULE_RUNTIME.to_string()
            };
            let mut line = line_count(&js);
            let mut map = SourceMapBuilder::new();
            let mut ids = Vec::with_capacity(chunk.modules.len());
            for &id in &chunk.modules {
                let Some(module) = graph.get(id) else { continue };
                let runtime_id = module.identity.relative_id(root);
                let definition = self.define(module, asset_urls.get(&id));
                if let Some(body) = &definition.mapped {
                    let source = map.add_source(&runtime_id, &body.source);
                    for (offset, &source_line) in body.lines.iter().enumerate() {
                        map.add_line_mapping(line + 1 + offset as u32, source, source_line);
                    }
                }
                js.push_str(&definition.text);
                line += line_count(&definition.text);
                modules.insert(
                    runtime_id.clone(),
                    EmittedModule {
                        kind: module.identity.kind(),
                        digest: module_digest(module, &definition.text),
                        definition: definition.text,
                        chunk: chunk.name.clone(),
                    },
                );
                ids.push(runtime_id);
            }
            if let Some(entry) = chunk.entry.and_then(|id| graph.get(id)) {
                js.push_str(&format!(
                    "__kiln__.require({});\n",
                    js_string(&entry.identity.relative_id(root))
                ));
            }

            let script = if chunk.kind == ChunkKind::Entry || !chunk.modules.is_empty() {
                // The name digests the code without the map comment
                let (filename, _) =
                    name_content(&self.config.filenames.script, &chunk.name, "js", js.as_bytes(), width);
                if self.config.source_maps && !map.is_empty() {
                    let map_name = format!("{filename}.map");
                    let basename = filename.rsplit('/').next().unwrap_or(filename.as_str());
                    let bytes = map.generate(basename)?;
                    js.push_str(&format!("//# sourceMappingURL={basename}.map\n"));
                    manifest_files.insert(format!("{}.js.map", chunk.name), map_name.clone());
                    artifacts.insert(
                        map_name.clone(),
                        OutputArtifact {
                            filename: map_name,
                            kind: ArtifactKind::SourceMap,
                            digest: content_digest(&bytes),
                            bytes: Arc::from(bytes),
                            chunk: Some(chunk.name.clone()),
                        },
                    );
                }
                manifest_files.insert(format!("{}.js", chunk.name), filename.clone());
                artifacts.insert(
                    filename.clone(),
                    OutputArtifact {
                        filename: filename.clone(),
                        kind: ArtifactKind::Script,
                        digest: content_digest(js.as_bytes()),
                        bytes: Arc::from(js.into_bytes()),
                        chunk: Some(chunk.name.clone()),
                    },
                );
                Some(filename)
            } else {
                None
            };

            chunk_outputs.push(ChunkOutput {
                name: chunk.name.clone(),
                kind: chunk.kind,
                script,
                style,
                modules: ids,
            });
        }

        // HTML shell
        let html = self.render_shell(&chunk_outputs)?;
        artifacts.insert(
            HTML_FILE.to_string(),
            OutputArtifact {
                filename: HTML_FILE.to_string(),
                kind: ArtifactKind::Html,
                digest: content_digest(html.as_bytes()),
                bytes: Arc::from(html.into_bytes()),
                chunk: None,
            },
        );

        // Manifest
        let entrypoints: Vec<&str> = chunk_outputs
            .iter()
            .flat_map(|c| [c.style.as_deref(), c.script.as_deref()])
            .flatten()
            .collect();
        let manifest = Manifest {
            files: manifest_files
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str()))
                .collect(),
            entrypoints,
        };
        let manifest = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| Error::other(format!("failed to serialize manifest: {e}")))?;
        artifacts.insert(
            MANIFEST_FILE.to_string(),
            OutputArtifact {
                filename: MANIFEST_FILE.to_string(),
                kind: ArtifactKind::Manifest,
                digest: content_digest(&manifest),
                bytes: Arc::from(manifest),
                chunk: None,
            },
        );

        let mut summary = String::new();
        for artifact in artifacts.values() {
            summary.push_str(&artifact.filename);
            summary.push('\0');
            summary.push_str(&artifact.digest);
            summary.push('\n');
        }

        Ok(BuildSnapshot {
            mode: self.config.mode,
            hash: content_digest(summary.as_bytes()),
            artifacts,
            chunks: chunk_outputs,
            modules,
        })
    }

    /// `__kiln__.define(...)` statement for one module.
    fn define(&self, module: &Module, asset_url: Option<&String>) -> Definition {
        let root = &self.config.root;
        let mut deps = String::from("{");
        for (i, import) in module.imports.iter().enumerate() {
            if i > 0 {
                deps.push_str(", ");
            }
            deps.push_str(&js_string(&import.specifier));
            deps.push_str(": ");
            deps.push_str(&js_string(&import.target.relative_id(root)));
        }
        deps.push('}');

        let script = module
            .outputs
            .iter()
            .find(|o| o.kind == OutputKind::Script)
            .map(|o| String::from_utf8_lossy(&o.bytes).into_owned());
        let (body, mapped) = match (script, asset_url) {
            (Some(code), _) => {
                let (body, lines) = if self.config.mode.minify() {
                    let minified = minify_script(&code);
                    (minified.code, minified.lines)
                } else {
                    let body = code.trim_end().to_string();
                    let lines = (0..line_count(&body) + 1).collect();
                    (body, lines)
                };
                let mapped = (module.identity.kind() == FileKind::Script && !body.trim().is_empty())
                    .then(|| MappedBody { source: code, lines });
                (body, mapped)
            }
            (None, Some(url)) => (format!("module.exports = {};", js_string(url)), None),
            (None, None) => (String::new(), None),
        };

        Definition {
            text: format!(
                "__kiln__.define({}, {deps}, function (module, exports, require) {{\n{}\n}});\n",
                js_string(&module.identity.relative_id(root)),
                body.trim_end()
            ),
            mapped,
        }
    }

    fn render_shell(&self, chunks: &[ChunkOutput]) -> Result<String> {
        let template = match self.config.template_path() {
            Some(path) => std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?,
            None => DEFAULT_SHELL.to_string(),
        };

        let links: String = chunks
            .iter()
            .filter_map(|c| c.style.as_deref())
            .map(|href| format!("<link href=\"{href}\" rel=\"stylesheet\">"))
            .collect();
        let scripts: String = chunks
            .iter()
            .filter_map(|c| c.script.as_deref())
            .map(|src| format!("<script src=\"{src}\"></script>"))
            .collect();

        let html = inject_before(&template, "</head>", &links, false);
        let html = inject_before(&html, "</body>", &scripts, true);

        Ok(if self.config.mode.minify() {
            minify_html(&html)
        } else {
            html
        })
    }
}

/// Insert `snippet` before the last `tag` (case-insensitive), or at the
/// start/end of the document when the tag is missing.
fn inject_before(html: &str, tag: &str, snippet: &str, append_if_missing: bool) -> String {
    if snippet.is_empty() {
        return html.to_string();
    }
    let lower = html.to_ascii_lowercase();
    match lower.rfind(tag) {
        Some(at) => format!("{}{snippet}{}", &html[..at], &html[at..]),
        None if append_if_missing => format!("{html}{snippet}"),
        None => format!("{snippet}{html}"),
    }
}

fn line_count(text: &str) -> u32 {
    text.bytes().filter(|&b| b == b'\n').count() as u32
}

/// Name an asset, widening its digest when an asset with different bytes
/// already holds the name.
fn asset_name(
    template: &str,
    stem: &str,
    ext: &str,
    bytes: &[u8],
    default_width: usize,
    taken: &BTreeMap<String, OutputArtifact>,
) -> Result<(String, String)> {
    let digest = content_digest(bytes);
    for min_width in [0, 8, 16, 32, 64] {
        let filename = render_template(
            template,
            &TemplateVars {
                name: stem,
                ext,
                digest: &digest,
                default_width,
                min_width,
            },
        );
        match taken.get(&filename) {
            Some(existing) if existing.digest != digest => {
                tracing::debug!(file = %filename, "asset name taken, widening digest");
            }
            _ => return Ok((filename, digest)),
        }
    }
    Err(Error::Config(format!(
        "assets with different content are both named by '{template}'; add [contenthash] to it"
    )))
}

fn split_hint(hint: &str) -> (&str, &str) {
    match hint.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (hint, "bin"),
    }
}

/// Directory part of a filename template, e.g. `css` for `css/[name].css`.
fn template_dir(template: &str) -> String {
    let rendered = render_template(
        template,
        &TemplateVars {
            name: "x",
            ext: "x",
            digest: "",
            default_width: 0,
            min_width: 0,
        },
    );
    Path::new(&rendered)
        .parent()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default()
}

/// URL of `target` (output-relative) as seen from `from_dir`.
fn relative_url(from_dir: &str, target: &str) -> String {
    let depth = from_dir.split('/').filter(|s| !s.is_empty()).count();
    let mut url = "../".repeat(depth);
    url.push_str(target);
    url
}

fn module_digest(module: &Module, definition: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(definition.as_bytes());
    for output in &module.outputs {
        hasher.update(&output.bytes);
    }
    hasher.finalize().to_hex().to_string()
}
