use std::path::PathBuf;
use thiserror::Error;

/// Core error type for kiln builds.
#[derive(Error, Debug)]
pub enum Error {
    /// A specifier could not be located on disk.
    #[error("Cannot resolve '{specifier}' from '{}'{}", from.display(), format_chain(chain))]
    UnresolvedImport {
        specifier: String,
        from: PathBuf,
        /// Importer chain from an entry point down to `from`.
        chain: Vec<PathBuf>,
    },

    /// A transform stage failed.
    #[error("Transform failed for {} at stage {stage} ({transform}): {message}", file.display())]
    Transform {
        file: PathBuf,
        stage: usize,
        transform: String,
        message: String,
    },

    /// The recursion guard tripped while expanding the module graph.
    #[error("Dependency depth exceeded {depth} at {}", file.display())]
    CycleExceeded { file: PathBuf, depth: usize },

    /// The watcher lost the ability to observe a path.
    #[error("Watch error on {}: {source}", path.display())]
    WatchIo {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("Cannot find entry point '{specifier}': {message}")]
    EntryNotFound { specifier: String, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to read config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The dev server could not bind or serve.
    #[error("Server error: {0}")]
    Server(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnresolvedImport { .. } => "UNRESOLVED_IMPORT",
            Self::Transform { .. } => "TRANSFORM_ERROR",
            Self::CycleExceeded { .. } => "CYCLE_EXCEEDED",
            Self::WatchIo { .. } => "WATCH_IO_ERROR",
            Self::EntryNotFound { .. } => "ENTRY_NOT_FOUND",
            Self::Config(_) | Self::ConfigParse { .. } => "CONFIG_ERROR",
            Self::Io { .. } => "IO_ERROR",
            Self::Server(_) => "SERVER_ERROR",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// File the error is attributed to, if any.
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::UnresolvedImport { from, .. } => Some(from),
            Self::Transform { file, .. } | Self::CycleExceeded { file, .. } => Some(file),
            Self::WatchIo { path, .. } | Self::ConfigParse { path, .. } | Self::Io { path, .. } => {
                Some(path)
            }
            _ => None,
        }
    }

    /// Whether the error ends a build (as opposed to a watcher fault).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::WatchIo { .. })
    }

    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

fn format_chain(chain: &[PathBuf]) -> String {
    if chain.is_empty() {
        return String::new();
    }
    let hops: Vec<String> = chain.iter().map(|p| p.display().to_string()).collect();
    format!(" (via {})", hops.join(" -> "))
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_screaming_snake_case() {
        let errors = [
            Error::UnresolvedImport {
                specifier: "./missing".into(),
                from: PathBuf::from("/src/a.js"),
                chain: Vec::new(),
            },
            Error::Transform {
                file: PathBuf::from("/src/a.css"),
                stage: 1,
                transform: "css-process".into(),
                message: "bad".into(),
            },
            Error::CycleExceeded {
                file: PathBuf::from("/src/a.js"),
                depth: 4,
            },
            Error::Config("x".into()),
        ];
        for err in &errors {
            let code = err.code();
            assert!(code.chars().all(|c| c.is_ascii_uppercase() || c == '_'), "{code}");
        }
    }

    #[test]
    fn test_unresolved_display_includes_chain() {
        let err = Error::UnresolvedImport {
            specifier: "./missing".into(),
            from: PathBuf::from("/src/b.js"),
            chain: vec![PathBuf::from("/src/index.js"), PathBuf::from("/src/b.js")],
        };
        let msg = err.to_string();
        assert!(msg.contains("./missing"));
        assert!(msg.contains("/src/index.js -> /src/b.js"));
    }

    #[test]
    fn test_transform_error_is_fatal() {
        let err = Error::Transform {
            file: PathBuf::from("/a.scss"),
            stage: 2,
            transform: "sass".into(),
            message: "expected ;".into(),
        };
        assert!(err.is_fatal());
        assert_eq!(err.path(), Some(std::path::Path::new("/a.scss")));
    }
}
