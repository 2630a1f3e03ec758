//! File identities and kinds.
//!
//! A [`FileIdentity`] is a canonical absolute path plus the [`FileKind`]
//! derived from its extension. It is the key for graph nodes and caches.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Kind of a source file, derived from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// JavaScript or TypeScript source.
    Script,
    /// Plain CSS.
    Css,
    /// Sass/SCSS.
    Sass,
    /// HTML markup.
    Markup,
    /// Images (gif, png, jpg, svg).
    Image,
    /// Fonts (eot, ttf, woff, woff2).
    Font,
    /// Anything else.
    Other,
}

impl FileKind {
    /// All kinds, in rule-table lookup order.
    pub const ALL: [FileKind; 7] = [
        FileKind::Script,
        FileKind::Css,
        FileKind::Sass,
        FileKind::Markup,
        FileKind::Image,
        FileKind::Font,
        FileKind::Other,
    ];

    /// Determine the kind from a file extension (without the dot).
    #[must_use]
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "js" | "mjs" | "cjs" | "ts" => FileKind::Script,
            "css" => FileKind::Css,
            "scss" | "sass" => FileKind::Sass,
            "html" | "htm" => FileKind::Markup,
            "gif" | "png" | "jpg" | "jpeg" | "svg" => FileKind::Image,
            "eot" | "ttf" | "woff" | "woff2" => FileKind::Font,
            _ => FileKind::Other,
        }
    }

    /// Determine the kind of a path.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map_or(FileKind::Other, Self::from_extension)
    }

    /// Whether modules of this kind end up in the chunk stylesheet.
    #[must_use]
    pub fn is_style(self) -> bool {
        matches!(self, FileKind::Css | FileKind::Sass)
    }

    /// Whether modules of this kind are emitted as standalone assets.
    #[must_use]
    pub fn is_asset(self) -> bool {
        matches!(self, FileKind::Image | FileKind::Font)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Script => "script",
            FileKind::Css => "css",
            FileKind::Sass => "sass",
            FileKind::Markup => "markup",
            FileKind::Image => "image",
            FileKind::Font => "font",
            FileKind::Other => "other",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical identity of a resolved file.
///
/// Cheap to clone: the path is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileIdentity {
    path: Arc<Path>,
    kind: FileKind,
}

impl FileIdentity {
    /// Build an identity from an already-canonical absolute path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path: PathBuf = path.into();
        let kind = FileKind::from_path(&path);
        Self {
            path: Arc::from(path),
            kind,
        }
    }

    /// Canonicalize `path` and build its identity.
    pub fn canonical(path: &Path) -> std::io::Result<Self> {
        dunce::canonicalize(path).map(Self::new)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// File stem, used as the `[name]` of standalone assets.
    #[must_use]
    pub fn stem(&self) -> &str {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("module")
    }

    /// Extension without the dot, used as `[ext]`.
    #[must_use]
    pub fn extension(&self) -> &str {
        self.path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("bin")
    }

    /// Whether this file lies under `root`.
    #[must_use]
    pub fn is_under(&self, root: &Path) -> bool {
        self.path.starts_with(root)
    }

    /// Project-relative id with forward slashes, used as the runtime module id.
    #[must_use]
    pub fn relative_id(&self, root: &Path) -> String {
        let rel = self.path.strip_prefix(root).unwrap_or(&self.path);
        let mut id = String::from("./");
        id.push_str(&rel.to_string_lossy().replace('\\', "/"));
        id
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(FileKind::from_extension("ts"), FileKind::Script);
        assert_eq!(FileKind::from_extension("SCSS"), FileKind::Sass);
        assert_eq!(FileKind::from_extension("JPG"), FileKind::Image);
        assert_eq!(FileKind::from_extension("woff2"), FileKind::Font);
        assert_eq!(FileKind::from_extension("html"), FileKind::Markup);
        assert_eq!(FileKind::from_extension("wasm"), FileKind::Other);
    }

    #[test]
    fn test_identity_kind_and_names() {
        let id = FileIdentity::new("/proj/src/images/logo.png");
        assert_eq!(id.kind(), FileKind::Image);
        assert_eq!(id.stem(), "logo");
        assert_eq!(id.extension(), "png");
        assert!(id.kind().is_asset());
    }

    #[test]
    fn test_relative_id() {
        let id = FileIdentity::new("/proj/src/app/index.js");
        assert_eq!(id.relative_id(Path::new("/proj")), "./src/app/index.js");
        assert!(id.is_under(Path::new("/proj/src")));
        assert!(!id.is_under(Path::new("/proj/node_modules")));
    }
}
