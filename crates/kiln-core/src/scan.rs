//! Import specifier scanner.
//!
//! Finds `import`/`export ... from`/`require()`/`import()` specifiers in
//! script sources without full parsing. Comments and ordinary string
//! literals are skipped so commented-out imports are not reported.

use std::collections::HashSet;

/// How a specifier was referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    /// `import x from "..."` / `import "..."`
    Static,
    /// `export ... from "..."`
    ReExport,
    /// `require("...")`
    Require,
    /// `import("...")`
    Dynamic,
}

/// Import specifier found in source code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedImport {
    /// Specifier exactly as written.
    pub specifier: String,
    pub kind: ImportKind,
    /// Line number (1-indexed, best-effort).
    pub line: u32,
}

/// Scan source code for import specifiers.
///
/// Returns imports in first-appearance order, deduplicated by specifier.
#[must_use]
pub fn scan_imports(source: &str) -> Vec<ScannedImport> {
    let mut scanner = Scanner {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        results: Vec::new(),
        seen: HashSet::new(),
    };
    scanner.scan_code(false);
    scanner.results
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    results: Vec<ScannedImport>,
    seen: HashSet<String>,
}

impl Scanner {
    /// Scan code until end of input, or with `nested` until the `}` closing
    /// a template interpolation.
    fn scan_code(&mut self, nested: bool) {
        let mut braces = 0usize;
        while let Some(c) = self.peek() {
            match c {
                '\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                '/' if self.peek_at(1) == Some('/') => self.skip_line_comment(),
                '/' if self.peek_at(1) == Some('*') => self.skip_block_comment(),
                '"' | '\'' => {
                    self.read_string();
                }
                '`' => self.skip_template(),
                '{' if nested => {
                    braces += 1;
                    self.pos += 1;
                }
                '}' if nested => {
                    self.pos += 1;
                    if braces == 0 {
                        return;
                    }
                    braces -= 1;
                }
                _ => {
                    let found = if self.at_keyword("import") {
                        self.scan_import()
                    } else if self.at_keyword("export") {
                        self.scan_export()
                    } else if self.at_keyword("require") {
                        self.scan_require()
                    } else {
                        self.pos += 1;
                        None
                    };
                    if let Some((specifier, kind, line)) = found {
                        self.record(specifier, kind, line);
                    }
                }
            }
        }
    }

    fn record(&mut self, specifier: String, kind: ImportKind, line: u32) {
        if !specifier.is_empty() && self.seen.insert(specifier.clone()) {
            self.results.push(ScannedImport {
                specifier,
                kind,
                line,
            });
        }
    }

    /// Skip a template literal; code inside `${ }` is scanned.
    fn skip_template(&mut self) {
        self.pos += 1;
        while let Some(c) = self.peek() {
            match c {
                '`' => {
                    self.pos += 1;
                    return;
                }
                '\\' => {
                    self.pos += 1;
                    if self.peek().is_some() {
                        self.advance();
                    }
                }
                '$' if self.peek_at(1) == Some('{') => {
                    self.pos += 2;
                    self.scan_code(true);
                }
                _ => self.advance(),
            }
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) {
        if self.peek() == Some('\n') {
            self.line += 1;
        }
        self.pos += 1;
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn skip_line_comment(&mut self) {
        while self.peek().is_some_and(|c| c != '\n') {
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) {
        self.pos += 2;
        while let Some(c) = self.peek() {
            if c == '*' && self.peek_at(1) == Some('/') {
                self.pos += 2;
                return;
            }
            self.advance();
        }
    }

    /// Check for `keyword` at the cursor with word boundaries on both sides.
    fn at_keyword(&self, keyword: &str) -> bool {
        let is_ident = |c: char| c.is_alphanumeric() || c == '_' || c == '$';
        if self.pos > 0 && (is_ident(self.chars[self.pos - 1]) || self.chars[self.pos - 1] == '.') {
            return false;
        }
        let len = keyword.chars().count();
        if self.pos + len > self.chars.len() {
            return false;
        }
        if !keyword
            .chars()
            .zip(&self.chars[self.pos..self.pos + len])
            .all(|(a, &b)| a == b)
        {
            return false;
        }
        !self.chars.get(self.pos + len).is_some_and(|&c| is_ident(c))
    }

    /// Read a quoted string at the cursor, returning its contents.
    fn read_string(&mut self) -> Option<String> {
        let quote = self.peek()?;
        if !matches!(quote, '"' | '\'' | '`') {
            return None;
        }
        self.pos += 1;
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c == quote {
                self.pos += 1;
                return Some(out);
            }
            if c == '\\' {
                self.pos += 1;
                if let Some(escaped) = self.peek() {
                    out.push(escaped);
                    self.pos += 1;
                }
                continue;
            }
            if c == '\n' && quote != '`' {
                return None;
            }
            if quote == '`' && c == '$' && self.peek_at(1) == Some('{') {
                return None;
            }
            out.push(c);
            self.advance();
        }
        None
    }

    /// `import ... from "x"`, `import "x"`, or `import("x")`.
    fn scan_import(&mut self) -> Option<(String, ImportKind, u32)> {
        let (start, start_line) = (self.pos, self.line);
        self.pos += "import".len();
        self.skip_whitespace();

        match self.peek() {
            Some('(') => {
                self.pos += 1;
                self.skip_whitespace();
                let line = self.line;
                let spec = self.read_string();
                if spec.is_none() {
                    self.pos = start + 1;
                    self.line = start_line;
                }
                spec.map(|s| (s, ImportKind::Dynamic, line))
            }
            Some('"' | '\'') => {
                let line = self.line;
                self.read_string().map(|s| (s, ImportKind::Static, line))
            }
            // `import.meta` and friends
            Some('.') => None,
            _ => self.scan_from_clause(ImportKind::Static),
        }
    }

    /// `export ... from "x"`.
    fn scan_export(&mut self) -> Option<(String, ImportKind, u32)> {
        self.pos += "export".len();
        self.scan_from_clause(ImportKind::ReExport)
    }

    /// Walk forward to a `from "x"` clause, stopping at a statement end.
    ///
    /// When there is no clause the cursor is put back where it started, so
    /// the declaration that follows is scanned as ordinary code.
    fn scan_from_clause(&mut self, kind: ImportKind) -> Option<(String, ImportKind, u32)> {
        let (start, start_line) = (self.pos, self.line);
        let found = self.find_from_clause(kind);
        if found.is_none() {
            self.pos = start;
            self.line = start_line;
        }
        found
    }

    fn find_from_clause(&mut self, kind: ImportKind) -> Option<(String, ImportKind, u32)> {
        let limit = (self.pos + 2000).min(self.chars.len());
        let mut depth = 0usize;
        while self.pos < limit {
            match self.peek()? {
                '{' => depth += 1,
                '}' => depth = depth.saturating_sub(1),
                ';' if depth == 0 => return None,
                '(' | '=' if depth == 0 => return None,
                '"' | '\'' | '`' => return None,
                _ => {}
            }
            if self.at_keyword("from") {
                self.pos += "from".len();
                self.skip_whitespace();
                let line = self.line;
                return self.read_string().map(|s| (s, kind, line));
            }
            self.advance();
        }
        None
    }

    /// `require("x")`.
    fn scan_require(&mut self) -> Option<(String, ImportKind, u32)> {
        self.pos += "require".len();
        self.skip_whitespace();
        if self.peek() != Some('(') {
            return None;
        }
        self.pos += 1;
        self.skip_whitespace();
        let (at, line) = (self.pos, self.line);
        let Some(spec) = self.read_string() else {
            self.pos = at;
            self.line = line;
            return None;
        };
        self.skip_whitespace();
        if self.peek() == Some(')') {
            self.pos += 1;
        }
        Some((spec, ImportKind::Require, line))
    }
}
