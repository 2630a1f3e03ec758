//! Sass handlers.
//!
//! [`SharedStyles`] injects the configured global partials into every
//! non-partial Sass file and reports them as dependencies. [`SassCompile`]
//! compiles with grass; partials (`_name.scss`) produce no output of their
//! own. Files that grass inlines are reported as watch files so editing an
//! imported partial re-transforms the sheets that include it.

use super::{StageOutput, Transform, TransformContext, TransformFailure};
use regex_lite::Regex;
use rustc_hash::FxHashSet as HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Whether `path` names a Sass partial.
fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('_'))
}

fn is_indented(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("sass"))
}

/// Prepends `@import` of shared partials.
#[derive(Debug, Clone, Default)]
pub struct SharedStyles {
    partials: Vec<PathBuf>,
}

impl SharedStyles {
    #[must_use]
    pub fn new(partials: Vec<PathBuf>) -> Self {
        Self { partials }
    }
}

impl Transform for SharedStyles {
    fn name(&self) -> &str {
        "shared-styles"
    }

    fn transform(
        &self,
        content: Vec<u8>,
        ctx: &TransformContext<'_>,
    ) -> Result<StageOutput, TransformFailure> {
        let path = ctx.identity.path();
        if self.partials.is_empty() || is_partial(path) {
            return Ok(StageOutput::content(content));
        }

        let terminator = if is_indented(path) { "\n" } else { ";\n" };
        let mut prefixed = Vec::with_capacity(content.len() + self.partials.len() * 64);
        let mut dependencies = Vec::with_capacity(self.partials.len());
        for partial in &self.partials {
            let spec = partial.to_string_lossy().replace('\\', "/");
            prefixed.extend_from_slice(format!("@import \"{spec}\"{terminator}").as_bytes());
            dependencies.push(spec);
        }
        prefixed.extend(content);

        Ok(StageOutput::content(prefixed).with_dependencies(dependencies))
    }
}

/// Compiles Sass to CSS with grass.
#[derive(Debug, Clone, Default)]
pub struct SassCompile {
    load_paths: Vec<PathBuf>,
}

impl SassCompile {
    #[must_use]
    pub fn new(load_paths: Vec<PathBuf>) -> Self {
        Self { load_paths }
    }
}

impl Transform for SassCompile {
    fn name(&self) -> &str {
        "sass"
    }

    fn transform(
        &self,
        content: Vec<u8>,
        ctx: &TransformContext<'_>,
    ) -> Result<StageOutput, TransformFailure> {
        if is_partial(ctx.identity.path()) {
            return Ok(StageOutput::content(Vec::new()).discarded());
        }

        let source = String::from_utf8(content).map_err(|e| {
            TransformFailure::new(format!("{} is not valid UTF-8: {e}", ctx.identity))
        })?;

        let mut options = grass::Options::default().style(if ctx.minify() {
            grass::OutputStyle::Compressed
        } else {
            grass::OutputStyle::Expanded
        });
        options = options.load_path(ctx.dir());
        for path in &self.load_paths {
            options = options.load_path(path);
        }

        let mut inlined = Vec::new();
        let mut seen = HashSet::default();
        collect_imports(&source, ctx.dir(), &self.load_paths, &mut seen, &mut inlined);

        let css = grass::from_string(source, &options)
            .map_err(|e| TransformFailure::new(format!("Sass compile error: {e}")))?;

        Ok(StageOutput::content(css.into_bytes()).with_watch_files(inlined))
    }
}

fn import_statement() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"@(?:import|use|forward)\s+([^;\n]+)")
            .unwrap_or_else(|e| unreachable!("sass import pattern: {e}"))
    })
}

fn quoted() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"["']([^"']+)["']"#).unwrap_or_else(|e| unreachable!("quoted pattern: {e}"))
    })
}

/// Walk `@import`/`@use`/`@forward` targets transitively.
fn collect_imports(
    source: &str,
    dir: &Path,
    load_paths: &[PathBuf],
    seen: &mut HashSet<PathBuf>,
    out: &mut Vec<PathBuf>,
) {
    for stmt in import_statement().captures_iter(source) {
        for target in quoted().captures_iter(&stmt[1]) {
            let spec = &target[1];
            let Some(found) = resolve_sass(spec, dir, load_paths) else {
                continue;
            };
            if !seen.insert(found.clone()) {
                continue;
            }
            out.push(found.clone());
            if let Ok(nested) = std::fs::read_to_string(&found) {
                let nested_dir = found.parent().unwrap_or(dir).to_path_buf();
                collect_imports(&nested, &nested_dir, load_paths, seen, out);
            }
        }
    }
}

/// Sass load rules: exact, `.scss`/`.sass`/`.css`, `_partial`, `index`.
fn resolve_sass(spec: &str, dir: &Path, load_paths: &[PathBuf]) -> Option<PathBuf> {
    if spec.starts_with("sass:") || spec.contains("://") {
        return None;
    }
    let spec = spec.strip_prefix('~').unwrap_or(spec);
    let bases = std::iter::once(dir).chain(load_paths.iter().map(PathBuf::as_path));

    for base in bases {
        let target = base.join(spec);
        let file_name = target.file_name()?.to_string_lossy().into_owned();
        let parent = target.parent().unwrap_or(base);

        let mut candidates = vec![target.clone()];
        for ext in ["scss", "sass", "css"] {
            candidates.push(parent.join(format!("{file_name}.{ext}")));
            candidates.push(parent.join(format!("_{file_name}.{ext}")));
        }
        for ext in ["scss", "sass"] {
            candidates.push(target.join(format!("_index.{ext}")));
            candidates.push(target.join(format!("index.{ext}")));
        }

        if let Some(found) = candidates.into_iter().find(|c| c.is_file()) {
            return Some(dunce::canonicalize(&found).unwrap_or(found));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::identity::FileIdentity;
    use tempfile::tempdir;

    fn ctx<'a>(identity: &'a FileIdentity, root: &'a Path, mode: Mode) -> TransformContext<'a> {
        TransformContext {
            identity,
            mode,
            root,
        }
    }

    #[test]
    fn test_shared_styles_prepends_and_reports() {
        let root = Path::new("/p");
        let identity = FileIdentity::new("/p/src/app/app.scss");
        let shared = SharedStyles::new(vec![
            PathBuf::from("/p/src/styles_global/_colors.scss"),
            PathBuf::from("/p/src/styles_global/_mixins.scss"),
        ]);
        let out = shared
            .transform(b".a { color: $brand; }".to_vec(), &ctx(&identity, root, Mode::Development))
            .unwrap();
        let text = String::from_utf8(out.content).unwrap();
        assert!(text.starts_with("@import \"/p/src/styles_global/_colors.scss\";\n"));
        assert!(text.ends_with(".a { color: $brand; }"));
        assert_eq!(out.dependencies.len(), 2);
    }

    #[test]
    fn test_shared_styles_skip_partials() {
        let root = Path::new("/p");
        let identity = FileIdentity::new("/p/src/styles_global/_colors.scss");
        let shared = SharedStyles::new(vec![PathBuf::from("/p/src/styles_global/_mixins.scss")]);
        let out = shared
            .transform(b"$brand: red;".to_vec(), &ctx(&identity, root, Mode::Development))
            .unwrap();
        assert_eq!(out.content, b"$brand: red;");
        assert!(out.dependencies.is_empty());
    }

    #[test]
    fn test_compile_with_partial_import() {
        let dir = tempdir().unwrap();
        let styles = dir.path().join("src/styles");
        std::fs::create_dir_all(&styles).unwrap();
        std::fs::write(styles.join("_vars.scss"), "$brand: #ff0000;").unwrap();
        let main = styles.join("main.scss");
        let source = "@import 'vars';\n.button { .icon { color: $brand; } }\n";
        std::fs::write(&main, source).unwrap();

        let identity = FileIdentity::canonical(&main).unwrap();
        let out = SassCompile::default()
            .transform(source.as_bytes().to_vec(), &ctx(&identity, dir.path(), Mode::Development))
            .unwrap();
        let css = String::from_utf8(out.content).unwrap();
        assert!(css.contains(".button .icon"));
        assert!(css.contains("#ff0000") || css.contains("red"));
        assert_eq!(out.watch_files.len(), 1);
        assert!(out.watch_files[0].ends_with("_vars.scss"));
    }

    #[test]
    fn test_partial_output_is_discarded() {
        let identity = FileIdentity::new("/p/src/_mixins.scss");
        let out = SassCompile::default()
            .transform(b"@mixin a { }".to_vec(), &ctx(&identity, Path::new("/p"), Mode::Development))
            .unwrap();
        assert!(out.discard);
        assert!(out.content.is_empty());
    }

    #[test]
    fn test_compile_error_is_failure() {
        let identity = FileIdentity::new("/p/src/broken.scss");
        let result = SassCompile::default().transform(
            b".a { color: $undefined; }".to_vec(),
            &ctx(&identity, Path::new("/p"), Mode::Development),
        );
        assert!(result.unwrap_err().message.contains("Sass"));
    }
}
