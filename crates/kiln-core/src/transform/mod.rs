//! Transform chains.
//!
//! A [`Transform`] turns the content of one file into new content, side
//! files, and further specifiers to resolve. A [`RuleTable`] lists
//! `(kinds, chain)` pairs; the [`Dispatcher`] resolves it once into a fixed
//! kind-to-chain map and threads content through each chain in order: the
//! output content of stage *i* is the input of stage *i + 1*.
//!
//! ## Example
//!
//! ```ignore
//! use kiln_core::transform::{Transform, TransformContext, StageOutput, TransformFailure};
//!
//! struct Banner;
//!
//! impl Transform for Banner {
//!     fn name(&self) -> &str { "banner" }
//!
//!     fn transform(&self, content: Vec<u8>, _ctx: &TransformContext<'_>)
//!         -> Result<StageOutput, TransformFailure>
//!     {
//!         let mut out = b"/* built by kiln */\n".to_vec();
//!         out.extend(content);
//!         Ok(StageOutput::content(out))
//!     }
//! }
//! ```

pub mod file;
pub mod markup;
pub mod sass;
pub mod script;
pub mod style;

use crate::config::{BuildConfig, Mode};
use crate::error::{Error, Result};
use crate::identity::{FileIdentity, FileKind};
use rustc_hash::FxHashMap as HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What an output of a module contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    /// Concatenated into the chunk's script artifact.
    Script,
    /// Concatenated into the chunk's stylesheet artifact.
    Style,
    /// Emitted as a standalone, individually named file.
    Asset,
}

impl OutputKind {
    /// Default kind of a file's primary output.
    #[must_use]
    pub fn for_file(kind: FileKind) -> Self {
        match kind {
            FileKind::Script | FileKind::Markup => OutputKind::Script,
            FileKind::Css | FileKind::Sass => OutputKind::Style,
            FileKind::Image | FileKind::Font | FileKind::Other => OutputKind::Asset,
        }
    }
}

/// One output produced for a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleOutput {
    /// Filename hint (`logo.png`, `app.css`).
    pub hint: String,
    pub kind: OutputKind,
    pub bytes: Vec<u8>,
}

/// Result of a single stage.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    /// Content handed to the next stage.
    pub content: Vec<u8>,
    /// Retag the primary output.
    pub kind: Option<OutputKind>,
    /// Drop the primary output (the module contributes nothing itself).
    pub discard: bool,
    /// Side files emitted by this stage.
    pub emitted: Vec<ModuleOutput>,
    /// Further specifiers to resolve, relative to the file.
    pub dependencies: Vec<String>,
    /// Files inlined into the output that are not graph modules.
    pub watch_files: Vec<PathBuf>,
}

impl StageOutput {
    /// Pass `content` on with nothing else to report.
    #[must_use]
    pub fn content(content: Vec<u8>) -> Self {
        Self {
            content,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: OutputKind) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn with_watch_files(mut self, files: Vec<PathBuf>) -> Self {
        self.watch_files = files;
        self
    }

    #[must_use]
    pub fn discarded(mut self) -> Self {
        self.discard = true;
        self
    }
}

/// Failure reported by a stage. The dispatcher adds file and stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformFailure {
    pub message: String,
}

impl TransformFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for TransformFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<String> for TransformFailure {
    fn from(message: String) -> Self {
        Self { message }
    }
}

/// Context passed to every stage.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    pub identity: &'a FileIdentity,
    pub mode: Mode,
    pub root: &'a Path,
}

impl TransformContext<'_> {
    /// Whether minifying stages should do work.
    #[must_use]
    pub fn minify(&self) -> bool {
        self.mode.minify()
    }

    /// Directory containing the file being transformed.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.identity.path().parent().unwrap_or(self.root)
    }
}

/// The transform capability.
pub trait Transform: Send + Sync {
    /// Stage name for error messages.
    fn name(&self) -> &str;

    /// Transform `content`. Returning an error aborts the build.
    fn transform(
        &self,
        content: Vec<u8>,
        ctx: &TransformContext<'_>,
    ) -> std::result::Result<StageOutput, TransformFailure>;
}

/// An ordered transform chain.
pub type Chain = Arc<[Arc<dyn Transform>]>;

/// A `(kinds, chain)` pair.
pub struct Rule {
    pub kinds: Vec<FileKind>,
    pub chain: Vec<Arc<dyn Transform>>,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.chain.iter().map(|t| t.name()).collect();
        f.debug_struct("Rule")
            .field("kinds", &self.kinds)
            .field("chain", &names)
            .finish()
    }
}

/// Ordered rule list; the first rule matching a kind wins.
#[derive(Debug, Default)]
pub struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule.
    #[must_use]
    pub fn rule(mut self, kinds: &[FileKind], chain: Vec<Arc<dyn Transform>>) -> Self {
        self.rules.push(Rule {
            kinds: kinds.to_vec(),
            chain,
        });
        self
    }

    /// The stock rule table.
    #[must_use]
    pub fn standard(config: &BuildConfig) -> Self {
        let module_roots = config.module_root_paths();
        Self::new()
            .rule(&[FileKind::Markup], vec![Arc::new(markup::MarkupTransform)])
            .rule(
                &[FileKind::Css],
                vec![Arc::new(style::CssUrls), Arc::new(style::CssProcess)],
            )
            .rule(
                &[FileKind::Sass],
                vec![
                    Arc::new(sass::SharedStyles::new(config.shared_style_paths())),
                    Arc::new(sass::SassCompile::new(module_roots)),
                    Arc::new(style::CssUrls),
                    Arc::new(style::CssProcess),
                ],
            )
            .rule(&[FileKind::Image, FileKind::Font], vec![Arc::new(file::FileEmit)])
            .rule(&[FileKind::Script], vec![Arc::new(script::ScriptImports)])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Combined result of a chain.
#[derive(Debug, Clone, Default)]
pub struct TransformResult {
    /// Primary output first (unless discarded), then side files in stage order.
    pub outputs: Vec<ModuleOutput>,
    /// Specifiers to resolve, deduplicated in discovery order.
    pub dependencies: Vec<String>,
    pub watch_files: Vec<PathBuf>,
}

/// Kind-to-chain dispatcher, resolved once from a [`RuleTable`].
pub struct Dispatcher {
    chains: HashMap<FileKind, Chain>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.chains.keys().collect();
        kinds.sort();
        f.debug_struct("Dispatcher").field("kinds", &kinds).finish()
    }
}

impl Dispatcher {
    /// Resolve `table` into a fixed mapping.
    #[must_use]
    pub fn from_rules(table: RuleTable) -> Self {
        let mut chains: HashMap<FileKind, Chain> = HashMap::default();
        for rule in table.rules {
            let chain: Chain = rule.chain.into();
            for kind in rule.kinds {
                chains.entry(kind).or_insert_with(|| Arc::clone(&chain));
            }
        }
        Self { chains }
    }

    /// Chain registered for `kind`.
    #[must_use]
    pub fn chain(&self, kind: FileKind) -> Option<&Chain> {
        self.chains.get(&kind)
    }

    /// Run the chain for `identity` over `content`.
    pub fn transform(
        &self,
        identity: &FileIdentity,
        content: Vec<u8>,
        mode: Mode,
        root: &Path,
    ) -> Result<TransformResult> {
        let chain = self.chain(identity.kind()).ok_or_else(|| Error::Transform {
            file: identity.path().to_path_buf(),
            stage: 0,
            transform: "dispatch".to_string(),
            message: format!("no transform chain registered for {} files", identity.kind()),
        })?;

        let ctx = TransformContext {
            identity,
            mode,
            root,
        };

        let mut content = content;
        let mut kind = OutputKind::for_file(identity.kind());
        let mut discard = false;
        let mut side_files = Vec::new();
        let mut result = TransformResult::default();

        for (stage, transform) in chain.iter().enumerate() {
            let out = transform
                .transform(content, &ctx)
                .map_err(|failure| Error::Transform {
                    file: identity.path().to_path_buf(),
                    stage,
                    transform: transform.name().to_string(),
                    message: failure.message,
                })?;

            content = out.content;
            if let Some(k) = out.kind {
                kind = k;
            }
            discard |= out.discard;
            side_files.extend(out.emitted);
            for dep in out.dependencies {
                if !result.dependencies.contains(&dep) {
                    result.dependencies.push(dep);
                }
            }
            for file in out.watch_files {
                if !result.watch_files.contains(&file) {
                    result.watch_files.push(file);
                }
            }
        }

        if !discard {
            result.outputs.push(ModuleOutput {
                hint: output_hint(identity, kind),
                kind,
                bytes: content,
            });
        }
        result.outputs.extend(side_files);
        Ok(result)
    }
}

fn output_hint(identity: &FileIdentity, kind: OutputKind) -> String {
    match kind {
        OutputKind::Script => format!("{}.js", identity.stem()),
        OutputKind::Style => format!("{}.css", identity.stem()),
        OutputKind::Asset => format!("{}.{}", identity.stem(), identity.extension()),
    }
}
