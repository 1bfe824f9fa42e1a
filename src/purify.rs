// SPDX-License-Identifier: PMPL-1.0-or-later

//! Function purification applied to every corpus and target function before
//! any similarity test: comment stripping, preprocessor-directive stripping,
//! non-ASCII removal, blank-line compaction and a minimum-size filter.

use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

static BLOCK_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
static LINE_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"//[^\n]*").unwrap());
static NON_ASCII: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\x00-\x7F]+").unwrap());
static PREPROCESSOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#.*").unwrap());

/// Purify one function body.
///
/// Returns `None` for functions below the size threshold (≤ 3 semicolons or
/// ≤ 5 lines longer than one character) unless `skip_loc_threshold` is set.
pub fn purify_function(code: &str, skip_loc_threshold: bool) -> Option<String> {
    let code = BLOCK_COMMENT.replace_all(code, "");
    let code = LINE_COMMENT.replace_all(&code, "");
    let code = NON_ASCII.replace_all(&code, "");
    let code = PREPROCESSOR.replace_all(&code, "");

    // Semicolons approximate the statement count.
    if !skip_loc_threshold && code.matches(';').count() <= 3 {
        return None;
    }

    let lines: Vec<&str> = code
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let loc = lines.iter().filter(|line| line.len() > 1).count();
    if !skip_loc_threshold && loc <= 5 {
        return None;
    }
    Some(lines.join("\n"))
}

/// Read a corpus file as UTF-8, falling back to Windows-1252 for the odd
/// legacy source file.
pub fn read_source_lossy(path: &Path) -> Result<String> {
    let raw = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    match String::from_utf8(raw) {
        Ok(text) => Ok(text),
        Err(err) => {
            let (cow, _, _) = encoding_rs::WINDOWS_1252.decode(err.as_bytes());
            Ok(cow.into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"int copy_data(char *dst, const char *src, int n) {
    int i = 0;
    while (i < n) {
        dst[i] = src[i];
        i++;
    }
    dst[n] = 0;
    return i;
}"#;

    #[test]
    fn keeps_real_function() {
        let out = purify_function(BODY, false).unwrap();
        assert!(out.contains("while (i < n)"));
        // Every line is trimmed and non-blank.
        assert!(out.lines().all(|l| !l.is_empty() && l == l.trim()));
    }

    #[test]
    fn strips_comments_and_preprocessor() {
        let code = format!(
            "/* header\n   comment */\n#ifdef FOO\n{}\n// trailing\n#endif\n",
            BODY
        );
        let out = purify_function(&code, false).unwrap();
        assert!(!out.contains("comment"));
        assert!(!out.contains("#ifdef"));
        assert!(!out.contains("trailing"));
    }

    #[test]
    fn strips_non_ascii() {
        let code = format!("{}\n// caf\u{e9}", BODY).replace("return i;", "return i; /* ok */ \u{2603}");
        let out = purify_function(&code, false).unwrap();
        assert!(out.is_ascii());
    }

    #[test]
    fn rejects_tiny_functions() {
        assert!(purify_function("int f() { return 0; }", false).is_none());
        assert!(purify_function("int f() { return 0; }", true).is_some());
    }

    #[test]
    fn deterministic() {
        assert_eq!(
            purify_function(BODY, false),
            purify_function(BODY, false)
        );
    }
}
