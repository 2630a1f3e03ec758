//! Mode-specific specifier substitution.
//!
//! In production builds, specifiers matching a configured pattern are
//! replaced by a fixed alternate specifier before resolution, e.g. the
//! development `environments/environment.ts` is swapped for
//! `environment.prod.ts`. A rewrite is applied at most once: the replacement
//! is never fed back through the rules.

use crate::config::{BuildConfig, Mode};
use crate::error::{Error, Result};
use regex_lite::Regex;
use std::borrow::Cow;

/// A single rewrite rule.
#[derive(Debug, Clone)]
pub struct Substitution {
    pattern: Regex,
    replacement: String,
}

impl Substitution {
    /// Build a rule from a pattern and its replacement specifier.
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid substitution pattern '{pattern}': {e}")))?;
        Ok(Self {
            pattern,
            replacement: replacement.into(),
        })
    }

    #[must_use]
    pub fn matches(&self, specifier: &str) -> bool {
        self.pattern.is_match(specifier)
    }

    #[must_use]
    pub fn replacement(&self) -> &str {
        &self.replacement
    }
}

/// The substitution hook, gated on one build mode.
#[derive(Debug, Clone)]
pub struct EnvSubstitution {
    active_in: Mode,
    rules: Vec<Substitution>,
}

impl EnvSubstitution {
    /// Rules active only in `active_in`.
    #[must_use]
    pub fn new(active_in: Mode, rules: Vec<Substitution>) -> Self {
        Self { active_in, rules }
    }

    /// Rules from config; root-relative replacements are made absolute.
    pub fn from_config(config: &BuildConfig) -> Result<Self> {
        let rules = config
            .substitutions
            .iter()
            .map(|sub| {
                let replacement = if sub.replacement.starts_with("./") {
                    config
                        .root
                        .join(&sub.replacement[2..])
                        .to_string_lossy()
                        .into_owned()
                } else {
                    sub.replacement.clone()
                };
                Substitution::new(&sub.pattern, replacement)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(Mode::Production, rules))
    }

    /// A hook that never rewrites.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Mode::Production, Vec::new())
    }

    /// Rewrite `specifier` for `mode`. The first matching rule wins.
    #[must_use]
    pub fn rewrite<'a>(&self, mode: Mode, specifier: &'a str) -> Cow<'a, str> {
        if mode != self.active_in {
            return Cow::Borrowed(specifier);
        }
        match self.rules.iter().find(|rule| rule.matches(specifier)) {
            Some(rule) => Cow::Owned(rule.replacement.clone()),
            None => Cow::Borrowed(specifier),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn env_rules() -> EnvSubstitution {
        EnvSubstitution::new(
            Mode::Production,
            vec![Substitution::new(
                r"(^|/)environments/environment(\.ts)?$",
                "/proj/src/environments/environment.prod.ts",
            )
            .unwrap()],
        )
    }

    #[test]
    fn test_rewrites_only_in_active_mode() {
        let subs = env_rules();
        let spec = "../environments/environment";
        assert_eq!(subs.rewrite(Mode::Development, spec), spec);
        assert_eq!(
            subs.rewrite(Mode::Production, spec),
            "/proj/src/environments/environment.prod.ts"
        );
        assert_eq!(
            subs.rewrite(Mode::Production, "environments/environment.ts"),
            "/proj/src/environments/environment.prod.ts"
        );
    }

    #[test]
    fn test_non_matching_specifier_is_borrowed() {
        let subs = env_rules();
        assert!(matches!(
            subs.rewrite(Mode::Production, "./app.component"),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn test_substitutions_do_not_chain() {
        let subs = EnvSubstitution::new(
            Mode::Production,
            vec![
                Substitution::new("^a$", "b").unwrap(),
                Substitution::new("^b$", "c").unwrap(),
            ],
        );
        assert_eq!(subs.rewrite(Mode::Production, "a"), "b");
        assert_eq!(subs.rewrite(Mode::Production, "b"), "c");
    }

    #[test]
    fn test_from_config_anchors_replacement() {
        let config = BuildConfig::new(PathBuf::from("/proj"));
        let subs = EnvSubstitution::from_config(&config).unwrap();
        let rewritten = subs.rewrite(Mode::Production, "./environments/environment");
        assert_eq!(
            PathBuf::from(rewritten.as_ref()),
            PathBuf::from("/proj/src/environments/environment.prod.ts")
        );
    }
}
