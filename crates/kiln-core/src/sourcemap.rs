//! Line-level source maps (revision 3) for script chunks.
//!
//! Each mapped output line points at column 0 of one source line. That is
//! enough for devtools to show the original file and line for any frame.

use crate::error::{Error, Result};
use serde::Serialize;

const BASE64: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Append `value` as a base64 VLQ.
fn vlq_encode(value: i64, out: &mut String) {
    #[allow(clippy::cast_sign_loss)]
    let mut v = (if value < 0 {
        ((-value) << 1) | 1
    } else {
        value << 1
    }) as u64;
    loop {
        let mut digit = (v & 0x1f) as u8;
        v >>= 5;
        if v > 0 {
            digit |= 0x20;
        }
        out.push(char::from(BASE64[usize::from(digit)]));
        if v == 0 {
            break;
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RawSourceMap<'a> {
    version: u8,
    file: &'a str,
    sources: &'a [String],
    sources_content: &'a [String],
    names: [&'a str; 0],
    mappings: String,
}

/// Collects sources and line mappings while a chunk is assembled.
#[derive(Debug, Default)]
pub struct SourceMapBuilder {
    sources: Vec<String>,
    sources_content: Vec<String>,
    /// `(output_line, source, source_line)`, all zero-based.
    mappings: Vec<(u32, u32, u32)>,
}

impl SourceMapBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source and return its index.
    pub fn add_source(&mut self, name: &str, content: &str) -> u32 {
        let index = self.sources.len() as u32;
        self.sources.push(name.to_string());
        self.sources_content.push(content.to_string());
        index
    }

    pub fn add_line_mapping(&mut self, output_line: u32, source: u32, source_line: u32) {
        self.mappings.push((output_line, source, source_line));
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// The `mappings` field: one segment per mapped line.
    #[must_use]
    pub fn mappings(&self) -> String {
        let mut sorted = self.mappings.clone();
        sorted.sort_unstable();
        sorted.dedup_by_key(|m| m.0);

        let mut out = String::new();
        let mut line = 0u32;
        let mut prev_source = 0i64;
        let mut prev_source_line = 0i64;
        for (output_line, source, source_line) in sorted {
            while line < output_line {
                out.push(';');
                line += 1;
            }
            // output column, source, source line, source column
            vlq_encode(0, &mut out);
            vlq_encode(i64::from(source) - prev_source, &mut out);
            vlq_encode(i64::from(source_line) - prev_source_line, &mut out);
            vlq_encode(0, &mut out);
            prev_source = i64::from(source);
            prev_source_line = i64::from(source_line);
        }
        out
    }

    /// Serialize the map for the script named `file`.
    pub fn generate(&self, file: &str) -> Result<Vec<u8>> {
        let raw = RawSourceMap {
            version: 3,
            file,
            sources: &self.sources,
            sources_content: &self.sources_content,
            names: [],
            mappings: self.mappings(),
        };
        serde_json::to_vec(&raw).map_err(|e| Error::other(format!("failed to serialize source map: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlq() {
        let cases = [(0, "A"), (1, "C"), (-1, "D"), (15, "e"), (16, "gB"), (-17, "jB")];
        for (value, expected) in cases {
            let mut out = String::new();
            vlq_encode(value, &mut out);
            assert_eq!(out, expected, "{value}");
        }
    }

    #[test]
    fn test_mappings_skip_unmapped_lines() {
        let mut builder = SourceMapBuilder::new();
        let a = builder.add_source("./src/a.js", "one\ntwo\n");
        let b = builder.add_source("./src/b.js", "three\n");
        builder.add_line_mapping(1, a, 0);
        builder.add_line_mapping(2, a, 1);
        builder.add_line_mapping(4, b, 0);
        assert_eq!(builder.mappings(), ";AAAA;AACA;;ACDA");
    }

    #[test]
    fn test_generate_json() {
        let mut builder = SourceMapBuilder::new();
        let a = builder.add_source("./src/a.js", "let a;\n");
        builder.add_line_mapping(0, a, 0);
        let json: serde_json::Value =
            serde_json::from_slice(&builder.generate("app.bundle.abcd.js").unwrap()).unwrap();
        assert_eq!(json["version"], 3);
        assert_eq!(json["file"], "app.bundle.abcd.js");
        assert_eq!(json["sources"][0], "./src/a.js");
        assert_eq!(json["sourcesContent"][0], "let a;\n");
        assert_eq!(json["mappings"], "AAAA");
    }
}
