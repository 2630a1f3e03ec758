//! Script handler and production script minifier.

use super::{StageOutput, Transform, TransformContext, TransformFailure};
use crate::scan::scan_imports;

/// Reports `import`/`require` specifiers; content passes through.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptImports;

impl Transform for ScriptImports {
    fn name(&self) -> &str {
        "script-imports"
    }

    fn transform(
        &self,
        content: Vec<u8>,
        ctx: &TransformContext<'_>,
    ) -> Result<StageOutput, TransformFailure> {
        let source = std::str::from_utf8(&content).map_err(|e| {
            TransformFailure::new(format!("{} is not valid UTF-8: {e}", ctx.identity))
        })?;
        let dependencies = scan_imports(source)
            .into_iter()
            .map(|import| import.specifier)
            .collect();
        Ok(StageOutput::content(content).with_dependencies(dependencies))
    }
}

/// Minified script plus, for each output line, the zero-based source line
/// it starts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinifiedScript {
    pub code: String,
    pub lines: Vec<u32>,
}

/// Strip comments and redundant whitespace from a script.
///
/// Line breaks between statements are kept so automatic semicolon
/// insertion sees the same program; string, template and regular
/// expression literals are copied verbatim.
#[must_use]
pub fn minify_script(source: &str) -> MinifiedScript {
    let mut m = Minifier {
        chars: source.chars().collect(),
        pos: 0,
        code: String::with_capacity(source.len()),
        lines: Vec::new(),
        line: String::new(),
        line_start: None,
        source_line: 0,
        space: false,
        last: None,
    };
    m.run(false);
    m.end_line();
    MinifiedScript {
        code: m.code,
        lines: m.lines,
    }
}

struct Minifier {
    chars: Vec<char>,
    pos: usize,
    code: String,
    lines: Vec<u32>,
    /// Output line being built.
    line: String,
    /// Source line the current output line started on.
    line_start: Option<u32>,
    source_line: u32,
    /// Whitespace seen since the last emitted character.
    space: bool,
    /// Last significant character emitted, across lines.
    last: Option<char>,
}

fn is_ident(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || !c.is_ascii()
}

impl Minifier {
    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    /// Minify code until the end, or with `nested` until the `}` closing a
    /// template interpolation (which is emitted).
    fn run(&mut self, nested: bool) {
        let mut braces = 0usize;
        while let Some(c) = self.peek_at(0) {
            match c {
                '\n' => {
                    self.end_line();
                    self.source_line += 1;
                    self.pos += 1;
                }
                c if c.is_whitespace() => {
                    self.space = true;
                    self.pos += 1;
                }
                '/' if self.peek_at(1) == Some('/') => {
                    while self.peek_at(0).is_some_and(|c| c != '\n') {
                        self.pos += 1;
                    }
                }
                '/' if self.peek_at(1) == Some('*') => self.block_comment(),
                '/' if self.regex_allowed() => self.regex(),
                '"' | '\'' => self.string(c),
                '`' => self.template(),
                '{' if nested => {
                    braces += 1;
                    self.emit(c);
                    self.pos += 1;
                }
                '}' if nested => {
                    self.emit(c);
                    self.pos += 1;
                    if braces == 0 {
                        return;
                    }
                    braces -= 1;
                }
                _ => {
                    self.emit(c);
                    self.pos += 1;
                }
            }
        }
    }

    /// Push a significant character, keeping one space where needed.
    fn emit(&mut self, c: char) {
        if self.space {
            if let Some(prev) = self.line.chars().next_back() {
                let keep = (is_ident(prev) && is_ident(c))
                    || (prev == c && matches!(c, '+' | '-' | '/'));
                if keep {
                    self.line.push(' ');
                }
            }
            self.space = false;
        }
        if self.line_start.is_none() {
            self.line_start = Some(self.source_line);
        }
        self.line.push(c);
        self.last = Some(c);
    }

    /// Push a literal character verbatim.
    fn raw(&mut self, c: char) {
        if c == '\n' {
            self.code.push_str(&self.line);
            self.code.push('\n');
            self.lines.push(self.line_start.unwrap_or(self.source_line));
            self.line.clear();
            self.source_line += 1;
            self.line_start = Some(self.source_line);
        } else {
            self.line.push(c);
        }
    }

    fn end_line(&mut self) {
        if !self.line.is_empty() {
            self.code.push_str(&self.line);
            self.code.push('\n');
            self.lines.push(self.line_start.unwrap_or(self.source_line));
        }
        self.line.clear();
        self.line_start = None;
        self.space = false;
    }

    fn block_comment(&mut self) {
        self.pos += 2;
        let mut newline = false;
        while let Some(c) = self.peek_at(0) {
            if c == '*' && self.peek_at(1) == Some('/') {
                self.pos += 2;
                break;
            }
            if c == '\n' {
                newline = true;
                self.source_line += 1;
            }
            self.pos += 1;
        }
        if newline {
            // Counts as a line break for semicolon insertion
            self.end_line();
        } else {
            self.space = true;
        }
    }

    /// Whether a `/` here starts a regular expression rather than division.
    fn regex_allowed(&self) -> bool {
        match self.last {
            None => true,
            Some(c) if "(,=:[!&|?{};+-*%<>~^".contains(c) => true,
            Some(c) if is_ident(c) => {
                let word: String = self
                    .line
                    .chars()
                    .rev()
                    .take_while(|&c| is_ident(c))
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
                matches!(
                    word.as_str(),
                    "return" | "typeof" | "case" | "do" | "else" | "in" | "of" | "void" | "throw" | "delete" | "new" | "yield" | "await"
                )
            }
            _ => false,
        }
    }

    fn regex(&mut self) {
        self.emit('/');
        self.pos += 1;
        let mut class = false;
        while let Some(c) = self.peek_at(0) {
            if c == '\n' {
                return;
            }
            self.raw(c);
            self.pos += 1;
            match c {
                '\\' => {
                    if let Some(next) = self.peek_at(0).filter(|&n| n != '\n') {
                        self.raw(next);
                        self.pos += 1;
                    }
                }
                '[' => class = true,
                ']' => class = false,
                '/' if !class => break,
                _ => {}
            }
        }
        self.last = Some('/');
    }

    fn string(&mut self, quote: char) {
        self.emit(quote);
        self.pos += 1;
        while let Some(c) = self.peek_at(0) {
            if c == '\n' {
                return;
            }
            self.raw(c);
            self.pos += 1;
            if c == '\\' {
                if let Some(next) = self.peek_at(0) {
                    self.raw(next);
                    self.pos += 1;
                }
            } else if c == quote {
                break;
            }
        }
        self.last = Some(quote);
    }

    fn template(&mut self) {
        self.emit('`');
        self.pos += 1;
        while let Some(c) = self.peek_at(0) {
            match c {
                '`' => {
                    self.raw(c);
                    self.pos += 1;
                    break;
                }
                '\\' => {
                    self.raw(c);
                    self.pos += 1;
                    if let Some(next) = self.peek_at(0) {
                        self.raw(next);
                        self.pos += 1;
                    }
                }
                '$' if self.peek_at(1) == Some('{') => {
                    self.raw('$');
                    self.raw('{');
                    self.pos += 2;
                    self.last = Some('{');
                    self.space = false;
                    self.run(true);
                }
                _ => {
                    self.raw(c);
                    self.pos += 1;
                }
            }
        }
        self.last = Some('`');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::identity::FileIdentity;
    use std::path::Path;

    #[test]
    fn test_reports_specifiers_and_keeps_content() {
        let identity = FileIdentity::new("/p/src/index.js");
        let ctx = TransformContext {
            identity: &identity,
            mode: Mode::Development,
            root: Path::new("/p"),
        };
        let source = b"import './styles.scss';\nconst t = require('./t.html');\n".to_vec();
        let out = ScriptImports.transform(source.clone(), &ctx).unwrap();
        assert_eq!(out.content, source);
        assert_eq!(out.dependencies, vec!["./styles.scss", "./t.html"]);
    }

    #[test]
    fn test_invalid_utf8_fails() {
        let identity = FileIdentity::new("/p/src/index.js");
        let ctx = TransformContext {
            identity: &identity,
            mode: Mode::Development,
            root: Path::new("/p"),
        };
        assert!(ScriptImports.transform(vec![0xff, 0xfe], &ctx).is_err());
    }

    #[test]
    fn test_minify_strips_comments_and_indentation() {
        let source = "// header\nfunction add(a, b) {\n    /* sum */ return a + b;\n}\n\n\nconst x = add( 1 , 2 );\n";
        let out = minify_script(source);
        assert_eq!(out.code, "function add(a,b){\nreturn a+b;\n}\nconst x=add(1,2);\n");
        assert_eq!(out.lines, vec![1, 2, 3, 6]);
    }

    #[test]
    fn test_minify_keeps_literals() {
        let source = "const s = 'a  // b';\nconst t = `x  ${ y  +  1 }\n  z`;\nconst r = /\\/\\/  [/]/g;\nconst d = a / b / c;\n";
        let out = minify_script(source);
        assert_eq!(
            out.code,
            "const s='a  // b';\nconst t=`x  ${y+1}\n  z`;\nconst r=/\\/\\/  [/]/g;\nconst d=a/b/c;\n"
        );
        assert_eq!(out.lines, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_minify_keeps_separating_spaces() {
        let out = minify_script("let a = b + +c;\nreturn typeof x;\ni - -j\n");
        assert_eq!(out.code, "let a=b+ +c;\nreturn typeof x;\ni- -j\n");
    }
}
