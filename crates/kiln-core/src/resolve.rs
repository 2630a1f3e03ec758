//! Import specifier resolution.
//!
//! Resolves import specifiers to [`FileIdentity`] values.
//!
//! ## Specifier Types
//!
//! - Relative: `./utils`, `../lib/foo` (against the importing file's directory)
//! - Absolute: `/abs/path/to/module`
//! - Bare: `lodash`, `app/service` (searched in each module root, in order)
//!
//! Every candidate is tried as-is, then with each configured extension
//! appended, then as a directory (`package.json` `module`/`main`, then
//! `index` plus extensions).

use crate::identity::FileIdentity;
use rustc_hash::FxHashMap as HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

type CacheKey = (String, PathBuf);

/// Import resolver.
#[derive(Debug)]
pub struct Resolver {
    /// Module root directories, searched in declared order for bare specifiers.
    module_roots: Vec<PathBuf>,
    /// Extension probe order, each including the leading dot.
    extensions: Vec<String>,
    /// Cached resolutions keyed by `(specifier, from_file)`.
    cache: RwLock<HashMap<CacheKey, Option<FileIdentity>>>,
}

impl Resolver {
    /// Create a resolver with the given search paths and extension order.
    #[must_use]
    pub fn new(module_roots: Vec<PathBuf>, extensions: Vec<String>) -> Self {
        Self {
            module_roots,
            extensions,
            cache: RwLock::new(HashMap::default()),
        }
    }

    /// Resolve `specifier` as written in `from`.
    ///
    /// Returns `None` when no candidate exists on disk.
    pub fn resolve(&self, specifier: &str, from: &Path) -> Option<FileIdentity> {
        let key = (specifier.to_string(), from.to_path_buf());
        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&key)
        {
            return cached.clone();
        }

        let result = self.resolve_uncached(specifier, from);

        self.cache
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key, result.clone());

        result
    }

    /// Resolve an entry specifier relative to the project root.
    pub fn resolve_entry(&self, specifier: &str, root: &Path) -> Option<FileIdentity> {
        // Entry specifiers behave as if written in a file at the root.
        self.resolve(specifier, &root.join("<entry>"))
    }

    /// Drop cached resolutions requested from `from`.
    pub fn invalidate_from(&self, from: &Path) {
        self.cache
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|(_, f), _| f != from);
    }

    /// Drop all cached resolutions.
    pub fn clear(&self) {
        self.cache
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    /// Number of cached entries.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn resolve_uncached(&self, specifier: &str, from: &Path) -> Option<FileIdentity> {
        let request = strip_query(specifier);
        if request.is_empty() {
            return None;
        }

        if is_path_specifier(request) {
            let target = if Path::new(request).is_absolute() {
                PathBuf::from(request)
            } else {
                from.parent().unwrap_or(Path::new(".")).join(request)
            };
            return self.resolve_file_or_directory(&target);
        }

        self.module_roots
            .iter()
            .find_map(|root| self.resolve_file_or_directory(&root.join(request)))
    }

    /// Resolve a path that might be a file or directory.
    fn resolve_file_or_directory(&self, target: &Path) -> Option<FileIdentity> {
        if let Some(found) = self.probe_file(target) {
            return Some(found);
        }

        if target.is_dir() {
            if let Some(entry) = package_entry(target) {
                if let Some(found) = self.probe_file(&target.join(entry)) {
                    return Some(found);
                }
            }
            return self.probe_file(&target.join("index"));
        }

        None
    }

    /// Test `target` directly, then with each extension appended.
    fn probe_file(&self, target: &Path) -> Option<FileIdentity> {
        if target.is_file() {
            return FileIdentity::canonical(target).ok();
        }

        self.extensions.iter().find_map(|ext| {
            let mut candidate = target.as_os_str().to_os_string();
            candidate.push(ext);
            let candidate = PathBuf::from(candidate);
            if candidate.is_file() {
                FileIdentity::canonical(&candidate).ok()
            } else {
                None
            }
        })
    }
}

/// Whether a specifier names a path rather than a module-root lookup.
#[must_use]
pub fn is_path_specifier(specifier: &str) -> bool {
    specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier == "."
        || specifier == ".."
        || Path::new(specifier).is_absolute()
}

/// Drop `?query` and `#fragment` suffixes (`font.woff?v=3`, `icons.svg#x`).
fn strip_query(specifier: &str) -> &str {
    let end = specifier.find(['?', '#']).unwrap_or(specifier.len());
    &specifier[..end]
}

/// Read the `module` or `main` field of a directory's `package.json`.
fn package_entry(dir: &Path) -> Option<String> {
    let content = std::fs::read_to_string(dir.join("package.json")).ok()?;
    let json: serde_json::Value = serde_json::from_str(&content).ok()?;
    ["module", "main"]
        .iter()
        .find_map(|field| json.get(*field).and_then(|v| v.as_str()))
        .map(|s| s.trim_start_matches("./").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FileKind;
    use tempfile::tempdir;

    fn resolver(root: &Path) -> Resolver {
        Resolver::new(
            vec![root.join("node_modules"), root.join("src")],
            vec![".js".to_string(), ".ts".to_string()],
        )
    }

    #[test]
    fn test_relative_probes_extensions_in_order() {
        let dir = tempdir().unwrap();
        let app = dir.path().join("src/app");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(app.join("index.js"), "import './a';").unwrap();
        std::fs::write(app.join("a.ts"), "export const a = 1;").unwrap();

        let r = resolver(dir.path());
        let found = r.resolve("./a", &app.join("index.js")).unwrap();
        assert!(found.path().ends_with("src/app/a.ts"));
        assert_eq!(found.kind(), FileKind::Script);

        // .js wins over .ts when both exist
        std::fs::write(app.join("a.js"), "").unwrap();
        r.clear();
        let found = r.resolve("./a", &app.join("index.js")).unwrap();
        assert!(found.path().ends_with("src/app/a.js"));
    }

    #[test]
    fn test_exact_file_wins_over_extension() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("styles.scss"), "").unwrap();

        let r = resolver(dir.path());
        let found = r.resolve("./styles.scss", &src.join("index.js")).unwrap();
        assert_eq!(found.kind(), FileKind::Sass);
    }

    #[test]
    fn test_module_roots_in_declared_order() {
        let dir = tempdir().unwrap();
        let nm = dir.path().join("node_modules/shared");
        let src = dir.path().join("src/shared");
        std::fs::create_dir_all(&nm).unwrap();
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(nm.join("index.js"), "").unwrap();
        std::fs::write(src.join("index.js"), "").unwrap();
        std::fs::write(dir.path().join("src/service.ts"), "").unwrap();

        let r = resolver(dir.path());
        let from = dir.path().join("src/app/index.js");
        let found = r.resolve("shared", &from).unwrap();
        assert!(found.path().ends_with("node_modules/shared/index.js"));

        // Falls through to the second root
        let found = r.resolve("service", &from).unwrap();
        assert!(found.path().ends_with("src/service.ts"));
    }

    #[test]
    fn test_package_main_field() {
        let dir = tempdir().unwrap();
        let pkg = dir.path().join("node_modules/lib");
        std::fs::create_dir_all(pkg.join("dist")).unwrap();
        std::fs::write(pkg.join("package.json"), r#"{"main": "./dist/lib"}"#).unwrap();
        std::fs::write(pkg.join("dist/lib.js"), "").unwrap();

        let r = resolver(dir.path());
        let found = r.resolve("lib", &dir.path().join("src/index.js")).unwrap();
        assert!(found.path().ends_with("node_modules/lib/dist/lib.js"));
    }

    #[test]
    fn test_query_and_fragment_are_ignored() {
        let dir = tempdir().unwrap();
        let fonts = dir.path().join("src/fonts");
        std::fs::create_dir_all(&fonts).unwrap();
        std::fs::write(fonts.join("icons.woff"), b"\0").unwrap();

        let r = resolver(dir.path());
        let from = dir.path().join("src/main.css");
        let found = r.resolve("./fonts/icons.woff?v=3#iefix", &from).unwrap();
        assert_eq!(found.kind(), FileKind::Font);
    }

    #[test]
    fn test_not_found_is_cached_and_invalidated() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        let from = src.join("index.js");

        let r = resolver(dir.path());
        assert!(r.resolve("./late", &from).is_none());
        assert_eq!(r.cached_len(), 1);

        std::fs::write(src.join("late.js"), "").unwrap();
        // Still the cached miss until the importer is invalidated
        assert!(r.resolve("./late", &from).is_none());
        r.invalidate_from(&from);
        assert!(r.resolve("./late", &from).is_some());
    }

    #[test]
    fn test_is_path_specifier() {
        assert!(is_path_specifier("./a"));
        assert!(is_path_specifier("../a"));
        assert!(is_path_specifier("/abs/a"));
        assert!(!is_path_specifier("lodash"));
        assert!(!is_path_specifier("environments/environment"));
    }
}
