// SPDX-License-Identifier: PMPL-1.0-or-later

//! Hand-written C-style tokenizer for the token filter.
//!
//! Works line by line: string and char literals are collapsed to `""` / `''`
//! before splitting, non-ASCII bytes are dropped, lines closing a block
//! comment are skipped entirely. Punctuation is split with maximal munch
//! over the fixed multi-character operator set.

use regex::Regex;
use std::sync::LazyLock;

static END_BLOCK_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*/\s*$").unwrap());
static STRING_LITERAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"".*?""#).unwrap());
static CHAR_LITERAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"'.*?'").unwrap());

/// The fixed two-character operator set: `-> -- -= += ++ >= <= == != *= /=
/// %= &= ^= || && >> <<`.
fn is_double_operator(first: char, second: char) -> bool {
    matches!(
        (first, second),
        ('-', '>')
            | ('-', '-')
            | ('-', '=')
            | ('+', '=')
            | ('+', '+')
            | ('>', '=')
            | ('<', '=')
            | ('=', '=')
            | ('!', '=')
            | ('*', '=')
            | ('/', '=')
            | ('%', '=')
            | ('&', '=')
            | ('^', '=')
            | ('|', '|')
            | ('&', '&')
            | ('>', '>')
            | ('<', '<')
    )
}

fn is_shift_assign(first: char, second: char, third: char) -> bool {
    third == '=' && ((first == '<' && second == '<') || (first == '>' && second == '>'))
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Tokenize one purified function body into its ordered token sequence.
pub fn tokenize(code: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for line in code.split('\n') {
        if END_BLOCK_COMMENT.is_match(line) {
            continue;
        }
        let ascii: String = line.chars().filter(|c| c.is_ascii()).collect();
        let no_strings = STRING_LITERAL.replace_all(&ascii, "\"\"");
        let no_literals = CHAR_LITERAL.replace_all(&no_strings, "''");
        tokenize_line(&no_literals, &mut tokens);
    }
    tokens
}

fn tokenize_line(line: &str, tokens: &mut Vec<String>) {
    let chars: Vec<char> = line.chars().collect();
    let n = chars.len();
    let mut i = 0;
    while i < n {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if is_word_char(c) {
            let start = i;
            while i < n && is_word_char(chars[i]) {
                i += 1;
            }
            tokens.push(chars[start..i].iter().collect());
        } else if i + 2 < n && is_shift_assign(c, chars[i + 1], chars[i + 2]) {
            tokens.push(chars[i..i + 3].iter().collect());
            i += 3;
        } else if i + 1 < n && is_double_operator(c, chars[i + 1]) {
            tokens.push(chars[i..i + 2].iter().collect());
            i += 2;
        } else {
            tokens.push(c.to_string());
            i += 1;
        }
    }
}
