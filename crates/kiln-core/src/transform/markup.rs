//! Markup handler.
//!
//! Turns an HTML fragment into a script module exporting the markup as a
//! string. Local `<img src>` references become `require()` calls so the
//! exported string carries emitted asset URLs. Production builds strip
//! comments and inter-tag whitespace.

use super::{OutputKind, StageOutput, Transform, TransformContext, TransformFailure};
use crate::transform::style::normalize_css_url;
use regex_lite::Regex;
use std::sync::OnceLock;

fn img_src() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(<img\b[^>]*?\bsrc\s*=\s*)(["'])([^"']*)(["'])"#)
            .unwrap_or_else(|e| unreachable!("img pattern: {e}"))
    })
}

fn comment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<!--.*?-->").unwrap_or_else(|e| unreachable!("comment pattern: {e}"))
    })
}

fn between_tags() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r">\s+<").unwrap_or_else(|e| unreachable!("whitespace pattern: {e}"))
    })
}

/// Collapse comments and inter-tag whitespace.
#[must_use]
pub fn minify_html(html: &str) -> String {
    let without_comments = comment().replace_all(html, "");
    let collapsed = between_tags().replace_all(&without_comments, "><");
    collapsed.trim().to_string()
}

/// Encode `s` as a double-quoted JS string literal.
pub(crate) fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| String::from("\"\""))
}

/// HTML fragment to script module.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkupTransform;

impl Transform for MarkupTransform {
    fn name(&self) -> &str {
        "markup"
    }

    fn transform(
        &self,
        content: Vec<u8>,
        ctx: &TransformContext<'_>,
    ) -> Result<StageOutput, TransformFailure> {
        let source = String::from_utf8(content).map_err(|e| {
            TransformFailure::new(format!("{} is not valid UTF-8: {e}", ctx.identity))
        })?;
        let html = if ctx.minify() {
            minify_html(&source)
        } else {
            source
        };

        let mut dependencies: Vec<String> = Vec::new();
        let mut parts: Vec<String> = Vec::new();
        let mut last = 0;

        for caps in img_src().captures_iter(&html) {
            let Some(spec) = normalize_css_url(&caps[3]) else {
                continue;
            };
            let Some(value) = caps.get(3) else {
                continue;
            };
            parts.push(js_string(&html[last..value.start()]));
            parts.push(format!("require({})", js_string(&spec)));
            last = value.end();
            if !dependencies.contains(&spec) {
                dependencies.push(spec);
            }
        }
        parts.push(js_string(&html[last..]));

        let code = format!("module.exports = {};\n", parts.join(" + "));
        Ok(StageOutput::content(code.into_bytes())
            .with_kind(OutputKind::Script)
            .with_dependencies(dependencies))
    }
}
