//! Build configuration.
//!
//! Loaded from `kiln.json` in the project root. Every field has a default,
//! so a project without a config file builds `./src/app/index.js` into
//! `dist/` with the stock rule table.
//!
//! ```json
//! {
//!   "entries": [{ "name": "app", "import": "./src/app/index.js" }],
//!   "outputDir": "dist",
//!   "moduleRoots": ["node_modules", "src"],
//!   "extensions": [".js", ".ts"],
//!   "substitutions": [
//!     { "pattern": "(^|/)environments/environment(\\.ts)?$",
//!       "replacement": "./src/environments/environment.prod.ts" }
//!   ],
//!   "server": { "port": 8080 }
//! }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file name looked up in the project root.
pub const CONFIG_FILE: &str = "kiln.json";

/// Build mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Development,
    Production,
}

impl Mode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Development => "development",
            Mode::Production => "production",
        }
    }

    /// Whether minifying transform stages run.
    #[must_use]
    pub fn minify(self) -> bool {
        self == Mode::Production
    }

    /// Parse a `--mode` value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Mode::Development),
            "production" | "prod" => Some(Mode::Production),
            _ => None,
        }
    }
}

/// A named entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    /// Chunk name (`[name]` in templates).
    pub name: String,
    /// Specifier, relative to the project root.
    pub import: String,
}

/// A specifier rewrite applied before resolution in production mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstitutionConfig {
    /// Regular expression tested against the raw specifier.
    pub pattern: String,
    /// Replacement specifier; `./` paths are anchored at the project root.
    pub replacement: String,
}

/// Output filename templates.
///
/// Placeholders: `[name]`, `[ext]`, `[hash]`, `[contenthash]`, and the
/// width-limited forms `[hash:N]` / `[contenthash:N]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilenameTemplates {
    pub script: String,
    pub style: String,
    pub image: String,
    pub font: String,
}

impl Default for FilenameTemplates {
    fn default() -> Self {
        Self {
            script: "[name].bundle.[contenthash:4].js".to_string(),
            style: "[name].[contenthash:4].css".to_string(),
            image: "images/[name].[contenthash:4].[ext]".to_string(),
            font: "fonts/[name].[contenthash:4].[ext]".to_string(),
        }
    }
}

/// Dev server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Event coalescing window for the watcher.
    pub debounce_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            debounce_ms: 50,
        }
    }
}

/// Full build configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BuildConfig {
    /// Project root. Not read from the file; set by the loader.
    #[serde(skip)]
    pub root: PathBuf,
    #[serde(skip)]
    pub mode: Mode,
    pub entries: Vec<EntryPoint>,
    pub output_dir: PathBuf,
    /// HTML shell template, relative to the root. Optional on disk.
    pub template: Option<PathBuf>,
    pub module_roots: Vec<PathBuf>,
    pub extensions: Vec<String>,
    pub vendor_root: PathBuf,
    pub vendor_chunk_name: String,
    pub filenames: FilenameTemplates,
    pub digest_width: usize,
    pub substitutions: Vec<SubstitutionConfig>,
    /// Partials injected into every Sass file.
    pub shared_styles: Vec<PathBuf>,
    /// Longest shortest-path import distance allowed from an entry.
    pub max_depth: usize,
    /// Emit a `.map` beside every script chunk.
    pub source_maps: bool,
    pub server: ServerConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            mode: Mode::default(),
            entries: vec![EntryPoint {
                name: "app".to_string(),
                import: "./src/app/index.js".to_string(),
            }],
            output_dir: PathBuf::from("dist"),
            template: Some(PathBuf::from("src/index.html")),
            module_roots: vec![PathBuf::from("node_modules"), PathBuf::from("src")],
            extensions: vec![".js".to_string(), ".ts".to_string()],
            vendor_root: PathBuf::from("node_modules"),
            vendor_chunk_name: "vendors".to_string(),
            filenames: FilenameTemplates::default(),
            digest_width: 4,
            substitutions: vec![SubstitutionConfig {
                pattern: r"(^|/)environments/environment(\.ts)?$".to_string(),
                replacement: "./src/environments/environment.prod.ts".to_string(),
            }],
            shared_styles: vec![
                PathBuf::from("src/styles_global/_colors.scss"),
                PathBuf::from("src/styles_global/_mixins.scss"),
                PathBuf::from("src/styles_global/_utils.scss"),
            ],
            max_depth: 4096,
            source_maps: true,
            server: ServerConfig::default(),
        }
    }
}

impl BuildConfig {
    /// Defaults rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Load `kiln.json` from `root` (or `explicit`), falling back to defaults.
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<Self> {
        let root = dunce::canonicalize(root).map_err(|e| Error::io(root, e))?;

        let path = match explicit {
            Some(p) if p.is_absolute() => Some(p.to_path_buf()),
            Some(p) => Some(root.join(p)),
            None => Some(root.join(CONFIG_FILE)).filter(|p| p.is_file()),
        };

        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
                serde_json::from_str::<BuildConfig>(&content)
                    .map_err(|source| Error::ConfigParse { path, source })?
            }
            None => BuildConfig::default(),
        };

        config.root = root;
        config.validate()?;
        Ok(config)
    }

    /// Set the build mode.
    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Override the output directory.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Check invariants the pipeline relies on.
    pub fn validate(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(Error::Config("at least one entry is required".into()));
        }
        let mut names = std::collections::HashSet::new();
        for entry in &self.entries {
            if entry.name.is_empty() {
                return Err(Error::Config("entry names must not be empty".into()));
            }
            if entry.name == self.vendor_chunk_name {
                return Err(Error::Config(format!(
                    "entry '{}' collides with the vendor chunk name",
                    entry.name
                )));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(Error::Config(format!("duplicate entry name '{}'", entry.name)));
            }
        }
        if self.digest_width == 0 || self.digest_width > 64 {
            return Err(Error::Config("digestWidth must be between 1 and 64".into()));
        }
        for ext in &self.extensions {
            if !ext.starts_with('.') {
                return Err(Error::Config(format!("extension '{ext}' must start with '.'")));
            }
        }
        for template in [
            &self.filenames.script,
            &self.filenames.style,
            &self.filenames.image,
            &self.filenames.font,
        ] {
            crate::digest::validate_template(template).map_err(Error::Config)?;
        }
        for sub in &self.substitutions {
            regex_lite::Regex::new(&sub.pattern).map_err(|e| {
                Error::Config(format!("invalid substitution pattern '{}': {e}", sub.pattern))
            })?;
        }
        Ok(())
    }

    /// Resolve a root-relative path.
    #[must_use]
    pub fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    #[must_use]
    pub fn output_path(&self) -> PathBuf {
        self.absolute(&self.output_dir)
    }

    #[must_use]
    pub fn vendor_path(&self) -> PathBuf {
        let path = self.absolute(&self.vendor_root);
        dunce::canonicalize(&path).unwrap_or(path)
    }

    /// Module root directories in declared order.
    #[must_use]
    pub fn module_root_paths(&self) -> Vec<PathBuf> {
        self.module_roots.iter().map(|p| self.absolute(p)).collect()
    }

    /// Shared Sass partials that exist on disk.
    #[must_use]
    pub fn shared_style_paths(&self) -> Vec<PathBuf> {
        self.shared_styles
            .iter()
            .map(|p| self.absolute(p))
            .filter(|p| p.is_file())
            .collect()
    }

    #[must_use]
    pub fn template_path(&self) -> Option<PathBuf> {
        self.template
            .as_ref()
            .map(|p| self.absolute(p))
            .filter(|p| p.is_file())
    }
}
