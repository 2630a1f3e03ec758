//! Stylesheet handlers.
//!
//! [`CssUrls`] reports `@import` and `url()` references as dependencies and
//! removes `@import` rules (the imported sheet becomes its own module).
//! [`CssProcess`] normalizes with lightningcss, minifying in production.

use super::{StageOutput, Transform, TransformContext, TransformFailure};
use crate::resolve::is_path_specifier;
use lightningcss::printer::PrinterOptions;
use lightningcss::stylesheet::{MinifyOptions, ParserOptions, StyleSheet};
use regex_lite::{Captures, Regex};
use std::sync::OnceLock;

fn import_rule() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"@import\s+(?:url\(\s*)?["']?([^"')\s;]+)["']?\s*\)?[^;]*;"#)
            .unwrap_or_else(|e| unreachable!("import pattern: {e}"))
    })
}

fn url_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"url\(\s*["']?([^"')]+?)["']?\s*\)"#)
            .unwrap_or_else(|e| unreachable!("url pattern: {e}"))
    })
}

/// Turn a raw `url()`/`@import` reference into a resolvable specifier.
///
/// Returns `None` for references that stay as written: data URIs, remote
/// URLs, server-absolute paths, and fragments. `~pkg/x` names a module-root
/// lookup; bare paths are relative to the stylesheet.
#[must_use]
pub fn normalize_css_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty()
        || raw.starts_with('#')
        || raw.starts_with('/')
        || raw.starts_with("data:")
        || raw.contains("://")
    {
        return None;
    }
    if let Some(module) = raw.strip_prefix('~') {
        return Some(module.to_string());
    }
    if is_path_specifier(raw) {
        Some(raw.to_string())
    } else {
        Some(format!("./{raw}"))
    }
}

/// Replace every local `url()` reference for which `lookup` returns a value.
pub fn rewrite_urls(css: &str, mut lookup: impl FnMut(&str) -> Option<String>) -> String {
    url_token()
        .replace_all(css, |caps: &Captures<'_>| {
            let raw = &caps[1];
            match normalize_css_url(raw).and_then(|spec| lookup(&spec)) {
                Some(url) => format!("url(\"{url}\")"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Reports stylesheet references.
#[derive(Debug, Default, Clone, Copy)]
pub struct CssUrls;

impl Transform for CssUrls {
    fn name(&self) -> &str {
        "css-urls"
    }

    fn transform(
        &self,
        content: Vec<u8>,
        ctx: &TransformContext<'_>,
    ) -> Result<StageOutput, TransformFailure> {
        let source = String::from_utf8(content).map_err(|e| {
            TransformFailure::new(format!("{} is not valid UTF-8: {e}", ctx.identity))
        })?;

        let mut dependencies = Vec::new();
        let mut push = |spec: String| {
            if !dependencies.contains(&spec) {
                dependencies.push(spec);
            }
        };

        let stripped = import_rule().replace_all(&source, |caps: &Captures<'_>| {
            match normalize_css_url(&caps[1]) {
                Some(spec) => {
                    push(spec);
                    String::new()
                }
                None => caps[0].to_string(),
            }
        });

        for caps in url_token().captures_iter(&stripped) {
            if let Some(spec) = normalize_css_url(&caps[1]) {
                push(spec);
            }
        }

        let stripped = stripped.into_owned();
        Ok(StageOutput::content(stripped.into_bytes()).with_dependencies(dependencies))
    }
}

/// Parses and prints CSS through lightningcss.
#[derive(Debug, Default, Clone, Copy)]
pub struct CssProcess;

impl Transform for CssProcess {
    fn name(&self) -> &str {
        "css-process"
    }

    fn transform(
        &self,
        content: Vec<u8>,
        ctx: &TransformContext<'_>,
    ) -> Result<StageOutput, TransformFailure> {
        let source = std::str::from_utf8(&content).map_err(|e| {
            TransformFailure::new(format!("{} is not valid UTF-8: {e}", ctx.identity))
        })?;
        let mut stylesheet = StyleSheet::parse(source, ParserOptions::default())
            .map_err(|e| TransformFailure::new(format!("CSS parse error: {e}")))?;

        let minify = ctx.minify();
        if minify {
            stylesheet
                .minify(MinifyOptions::default())
                .map_err(|e| TransformFailure::new(format!("CSS minify error: {e}")))?;
        }

        let output = stylesheet
            .to_css(PrinterOptions {
                minify,
                ..PrinterOptions::default()
            })
            .map_err(|e| TransformFailure::new(format!("CSS print error: {e}")))?;

        let mut code = output.code;
        if !code.ends_with('\n') {
            code.push('\n');
        }
        Ok(StageOutput::content(code.into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::identity::FileIdentity;
    use std::path::Path;

    fn run(t: &dyn Transform, source: &str, mode: Mode) -> Result<StageOutput, TransformFailure> {
        let identity = FileIdentity::new("/p/src/styles.css");
        let ctx = TransformContext {
            identity: &identity,
            mode,
            root: Path::new("/p"),
        };
        t.transform(source.as_bytes().to_vec(), &ctx)
    }

    #[test]
    fn test_normalize_css_url() {
        assert_eq!(normalize_css_url("images/a.png").as_deref(), Some("./images/a.png"));
        assert_eq!(normalize_css_url("../a.png").as_deref(), Some("../a.png"));
        assert_eq!(normalize_css_url("~normalize.css").as_deref(), Some("normalize.css"));
        assert_eq!(normalize_css_url("data:image/png;base64,AAA"), None);
        assert_eq!(normalize_css_url("https://cdn.test/a.png"), None);
        assert_eq!(normalize_css_url("/static/a.png"), None);
        assert_eq!(normalize_css_url("#mask"), None);
    }

    #[test]
    fn test_css_urls_reports_and_strips_imports() {
        let source = r#"@import "~normalize.css";
@import url('./base.css');
.logo { background: url(images/logo.png); }
.icon { background: url("./images/logo.png"); }
.remote { background: url(https://cdn.test/x.png); }
"#;
        let out = run(&CssUrls, source, Mode::Development).unwrap();
        assert_eq!(
            out.dependencies,
            vec!["normalize.css", "./base.css", "./images/logo.png"]
        );
        let css = String::from_utf8(out.content).unwrap();
        assert!(!css.contains("@import"));
        assert!(css.contains(".logo"));
    }

    #[test]
    fn test_css_process_minifies_in_production() {
        let source = ".a {\n  color: red;\n}\n\n.b { margin: 0px; }\n";
        let dev = run(&CssProcess, source, Mode::Development).unwrap();
        let prod = run(&CssProcess, source, Mode::Production).unwrap();
        assert!(dev.content.len() > prod.content.len());
        let prod = String::from_utf8(prod.content).unwrap();
        assert!(prod.contains(".a{color:red}"));
    }

    #[test]
    fn test_rewrite_urls() {
        let css = ".a{background:url(images/logo.png)}.b{background:url(data:x)}";
        let out = rewrite_urls(css, |spec| {
            (spec == "./images/logo.png").then(|| "images/logo.1a2b.png".to_string())
        });
        assert_eq!(
            out,
            ".a{background:url(\"images/logo.1a2b.png\")}.b{background:url(data:x)}"
        );
    }
}
