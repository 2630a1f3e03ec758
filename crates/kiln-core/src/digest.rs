//! Content digests and filename templating.
//!
//! Digests are BLAKE3 over the exact output bytes, hex encoded. Filenames
//! substitute a truncated digest into a template such as
//! `[name].[contenthash:4].css`.

/// Compute the BLAKE3 hash of a byte slice, returning the hex-encoded digest.
#[must_use]
pub fn content_digest(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Values available to a filename template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub name: &'a str,
    pub ext: &'a str,
    /// Full hex digest.
    pub digest: &'a str,
    /// Width used by `[hash]` / `[contenthash]` without an explicit width.
    pub default_width: usize,
    /// Lower bound on every digest width, explicit or not.
    pub min_width: usize,
}

const PLACEHOLDERS: &[&str] = &["name", "ext", "hash", "contenthash"];

/// Render a filename template.
#[must_use]
pub fn render_template(template: &str, vars: &TemplateVars<'_>) -> String {
    let mut out = String::with_capacity(template.len() + vars.default_width);
    let mut rest = template;

    while let Some(open) = rest.find('[') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find(']') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let token = &after[..close];
        match expand(token, vars) {
            Some(value) => out.push_str(&value),
            None => {
                out.push('[');
                out.push_str(token);
                out.push(']');
            }
        }
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    out
}

fn expand(token: &str, vars: &TemplateVars<'_>) -> Option<String> {
    let (key, width) = match token.split_once(':') {
        Some((key, width)) => (key, Some(width.parse::<usize>().ok()?)),
        None => (token, None),
    };
    match key {
        "name" => Some(vars.name.to_string()),
        "ext" => Some(vars.ext.to_string()),
        "hash" | "contenthash" => {
            let width = width
                .unwrap_or(vars.default_width)
                .max(vars.min_width)
                .min(vars.digest.len());
            Some(vars.digest[..width].to_string())
        }
        _ => None,
    }
}

/// Reject templates with unknown placeholders or malformed widths.
pub fn validate_template(template: &str) -> Result<(), String> {
    let mut rest = template;
    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let close = after
            .find(']')
            .ok_or_else(|| format!("unterminated placeholder in '{template}'"))?;
        let token = &after[..close];
        let (key, width) = match token.split_once(':') {
            Some((key, width)) => (key, Some(width)),
            None => (token, None),
        };
        if !PLACEHOLDERS.contains(&key) {
            return Err(format!("unknown placeholder '[{token}]' in '{template}'"));
        }
        if let Some(width) = width {
            let ok = matches!(key, "hash" | "contenthash")
                && width.parse::<usize>().is_ok_and(|w| w > 0);
            if !ok {
                return Err(format!("invalid width in '[{token}]' of '{template}'"));
            }
        }
        rest = &after[close + 1..];
    }
    Ok(())
}

/// Digest `bytes` and render `template` for them. Returns `(filename, digest)`.
#[must_use]
pub fn name_content(
    template: &str,
    name: &str,
    ext: &str,
    bytes: &[u8],
    default_width: usize,
) -> (String, String) {
    let digest = content_digest(bytes);
    let filename = render_template(
        template,
        &TemplateVars {
            name,
            ext,
            digest: &digest,
            default_width,
            min_width: 0,
        },
    );
    (filename, digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_digest_known_value() {
        assert_eq!(
            content_digest(b"hello world"),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_render_with_widths() {
        let vars = TemplateVars {
            name: "app",
            ext: "js",
            digest: "d74981efa70a0c88",
            default_width: 8,
            min_width: 0,
        };
        assert_eq!(
            render_template("[name].bundle.[contenthash:4].js", &vars),
            "app.bundle.d749.js"
        );
        assert_eq!(render_template("[name].[hash].[ext]", &vars), "app.d74981ef.js");
        assert_eq!(render_template("static/[name]", &vars), "static/app");
    }

    #[test]
    fn test_unknown_placeholder_left_verbatim() {
        let vars = TemplateVars {
            name: "a",
            ext: "css",
            digest: "abcdef",
            default_width: 4,
            min_width: 0,
        };
        assert_eq!(render_template("[id].[name].css", &vars), "[id].a.css");
    }

    #[test]
    fn test_min_width_widens_explicit_widths() {
        let vars = TemplateVars {
            name: "logo",
            ext: "png",
            digest: "d74981efa70a0c88",
            default_width: 4,
            min_width: 8,
        };
        assert_eq!(
            render_template("images/[name].[contenthash:4].[ext]", &vars),
            "images/logo.d74981ef.png"
        );
        assert_eq!(render_template("[name].[hash:12].[ext]", &vars), "logo.d74981efa70a.png");
    }

    #[test]
    fn test_validate_template() {
        assert!(validate_template("[name].[contenthash:4].css").is_ok());
        assert!(validate_template("images/[name].[hash].[ext]").is_ok());
        assert!(validate_template("[chunkhash].js").is_err());
        assert!(validate_template("[name:3].js").is_err());
        assert!(validate_template("[hash:0].js").is_err());
        assert!(validate_template("[name.js").is_err());
    }

    #[test]
    fn test_one_byte_change_changes_filename() {
        let (a, _) = name_content("[name].[contenthash:8].js", "app", "js", b"let x = 1;", 4);
        let (b, _) = name_content("[name].[contenthash:8].js", "app", "js", b"let x = 2;", 4);
        let (c, _) = name_content("[name].[contenthash:8].js", "app", "js", b"let x = 1;", 4);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}
