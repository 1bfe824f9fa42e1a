// SPDX-License-Identifier: PMPL-1.0-or-later

//! One-hot code fingerprints over a closed C/C++ vocabulary.
//!
//! The vector layout is part of the on-disk cache contract: 20 printf
//! conversion letters first, then 42 API names, 42 operator spellings and
//! 77 C++ keywords, in exactly this order (N = 181).

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

const APIS: [&str; 42] = [
    "alloc", "free", "mem", "copy", "new", "open", "close", "delete", "create", "release",
    "sizeof", "remove", "clear", "dequene", "enquene", "detach", "Attach", "str", "string",
    "lock", "mutex", "spin", "init", "register", "disable", "enable", "put", "get", "up",
    "down", "inc", "dec", "add", "sub", "set", "map", "stop", "start", "prepare", "suspend",
    "resume", "connect",
];

const FORMAT_LETTERS: [char; 20] = [
    'd', 'i', 'o', 'u', 'x', 'X', 'f', 'F', 'e', 'E', 'g', 'G', 'a', 'A', 'c', 'C', 's', 'S',
    'p', 'n',
];

const OPERATORS: [&str; 42] = [
    "bitand", "bitor", "xor", "not", "not_eq", "or", "or_eq", "and", "++", "--",
    "+", "-", "*", "/", "%", "=", "+=", "-=", "*=", "/=", "%=", "<<=",
    ">>=", "&=", "^=", "|=", "&&", "||", "!", "==", "!=", ">=", "<=", ">", "<", "&",
    "|", "<<", ">>", "~", "^", "->",
];

const KEYWORDS: [&str; 73] = [
    "asm", "auto", "alignas", "alignof", "bool", "break", "case",
    "catch", "char", "char16_t", "char32_t", "class", "const", "const_cast",
    "constexpr", "continue", "decltype", "default", "do", "double",
    "dynamic_cast", "else", "enum", "explicit", "export", "extern", "false", "float",
    "for", "friend", "goto", "if", "inline", "int", "long", "mutable", "namespace",
    "noexcept", "nullptr", "operator", "private", "protected", "public",
    "reinterpret_cast", "return", "short", "signed", "static",
    "static_assert", "static_cast", "struct", "switch", "template", "this",
    "thread_local", "throw", "true", "try", "typedef", "typeid", "typename", "union",
    "unsigned", "using", "virtual", "void", "volatile", "wchar_t", "while", "compl",
    "override", "final", "assert",
];

/// Total one-hot vector length.
pub const VECTOR_LEN: usize = FORMAT_LETTERS.len() + APIS.len() + OPERATORS.len() + KEYWORDS.len();

static FORMAT_CONVERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%[-+0 #]{0,5}\d*(?:\.\d+)?[lhL]?([diouxXfFeEgGaAcCsSpn])").unwrap()
});

/// Reassembles multi-character operators from punctuation delivered one
/// character at a time. Must be flushed whenever the next token is not an
/// operator character.
#[derive(Debug, Default)]
struct OperatorStateMachine {
    state: String,
}

impl OperatorStateMachine {
    fn flush(&mut self) -> Option<String> {
        if self.state.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.state))
        }
    }

    fn feed(&mut self, current: char) -> Option<String> {
        match self.state.len() {
            0 => {
                if current == '~' {
                    return Some("~".to_string());
                }
                if is_operator_start(current) {
                    self.state.push(current);
                }
                None
            }
            1 => {
                let prev = self.state.chars().next()?;
                let mut merged = self.state.clone();
                merged.push(current);
                if current == '=' {
                    self.state.clear();
                    Some(merged)
                } else if current == prev {
                    match current {
                        // && || ++ -- are complete.
                        '&' | '+' | '-' | '|' => {
                            self.state.clear();
                            Some(merged)
                        }
                        // << and >> may still grow to <<= / >>=.
                        '<' | '>' => {
                            self.state = merged;
                            None
                        }
                        _ => Some(self.restart_with(current)),
                    }
                } else if merged == "->" {
                    self.state.clear();
                    Some(merged)
                } else {
                    Some(self.restart_with(current))
                }
            }
            // state is "<<" or ">>"
            _ => {
                if current == '=' {
                    let mut merged = std::mem::take(&mut self.state);
                    merged.push(current);
                    Some(merged)
                } else {
                    Some(self.restart_with(current))
                }
            }
        }
    }

    fn restart_with(&mut self, current: char) -> String {
        std::mem::replace(&mut self.state, current.to_string())
    }
}

/// Single-character operator spellings that may start a longer operator.
fn is_operator_start(c: char) -> bool {
    matches!(
        c,
        '+' | '-' | '*' | '/' | '%' | '=' | '!' | '>' | '<' | '&' | '|' | '~' | '^'
    )
}

/// Punctuation the lexer hands to the state machine one character at a time.
fn is_operator_char(c: char) -> bool {
    matches!(
        c,
        '~' | '!' | '%' | '^' | '&' | '*' | '+' | '=' | '|' | '?' | ':' | '<' | '>' | '/' | '-'
    )
}

/// Deterministic source-text → one-hot vector extractor.
///
/// Stateless between invocations; the per-call lexer state lives on the
/// stack, so one instance may be shared across worker threads.
pub struct FeatureExtractor {
    word_index: HashMap<&'static str, usize>,
    format_index: HashMap<char, usize>,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureExtractor {
    pub fn new() -> Self {
        let mut format_index = HashMap::new();
        for (i, letter) in FORMAT_LETTERS.iter().enumerate() {
            format_index.insert(*letter, i);
        }
        let mut word_index = HashMap::new();
        let mut next = FORMAT_LETTERS.len();
        for word in APIS.iter().chain(OPERATORS.iter()).chain(KEYWORDS.iter()) {
            word_index.insert(*word, next);
            next += 1;
        }
        debug_assert_eq!(next, VECTOR_LEN);
        Self {
            word_index,
            format_index,
        }
    }

    pub fn vector_len(&self) -> usize {
        VECTOR_LEN
    }

    /// Extract the one-hot vector for one function body. Bit k is 1 iff at
    /// least one token of vocabulary kind k occurs in the source.
    pub fn extract(&self, code: &str) -> Vec<u8> {
        let mut bits = vec![0u8; VECTOR_LEN];
        let mut machine = OperatorStateMachine::default();
        let chars: Vec<char> = code.chars().collect();
        let n = chars.len();
        let mut i = 0;

        let mark_op = |bits: &mut Vec<u8>, op: Option<String>| {
            if let Some(op) = op {
                if let Some(&idx) = self.word_index.get(op.as_str()) {
                    bits[idx] = 1;
                }
            }
        };

        while i < n {
            let c = chars[i];
            if c == '/' && i + 1 < n && chars[i + 1] == '/' {
                mark_op(&mut bits, machine.flush());
                while i < n && chars[i] != '\n' {
                    i += 1;
                }
            } else if c == '/' && i + 1 < n && chars[i + 1] == '*' {
                mark_op(&mut bits, machine.flush());
                i += 2;
                while i + 1 < n && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i = (i + 2).min(n);
            } else if is_operator_char(c) {
                mark_op(&mut bits, machine.feed(c));
                i += 1;
            } else if c == '"' {
                mark_op(&mut bits, machine.flush());
                let start = i;
                i += 1;
                while i < n && chars[i] != '"' {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i = (i + 1).min(n);
                let literal: String = chars[start..i.min(n)].iter().collect();
                for caps in FORMAT_CONVERSION.captures_iter(&literal) {
                    if let Some(letter) = caps[1].chars().next() {
                        if let Some(&idx) = self.format_index.get(&letter) {
                            bits[idx] = 1;
                        }
                    }
                }
            } else if c == '\'' {
                // Char literals carry no printf conversions.
                mark_op(&mut bits, machine.flush());
                i += 1;
                while i < n && chars[i] != '\'' {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i = (i + 1).min(n);
            } else if c.is_ascii_alphabetic() || c == '_' {
                mark_op(&mut bits, machine.flush());
                let start = i;
                while i < n && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if let Some(&idx) = self.word_index.get(word.as_str()) {
                    bits[idx] = 1;
                }
            } else if c.is_ascii_digit() {
                mark_op(&mut bits, machine.flush());
                while i < n && (chars[i].is_ascii_alphanumeric() || chars[i] == '.' || chars[i] == '_')
                {
                    i += 1;
                }
                // Exponent sign belongs to the literal, not to the operators.
                if i < n
                    && (chars[i] == '+' || chars[i] == '-')
                    && matches!(chars[i - 1], 'e' | 'E')
                    && i + 1 < n
                    && chars[i + 1].is_ascii_digit()
                {
                    i += 1;
                    while i < n && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            } else {
                mark_op(&mut bits, machine.flush());
                i += 1;
            }
        }
        mark_op(&mut bits, machine.flush());
        bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new()
    }

    fn bit(ex: &FeatureExtractor, vector: &[u8], word: &str) -> u8 {
        vector[ex.word_index[word]]
    }

    fn fmt_bit(ex: &FeatureExtractor, vector: &[u8], letter: char) -> u8 {
        vector[ex.format_index[&letter]]
    }

    #[test]
    fn vector_length_is_fixed() {
        assert_eq!(VECTOR_LEN, 181);
        assert_eq!(extractor().extract("").len(), VECTOR_LEN);
    }

    #[test]
    fn deterministic_and_one_hot() {
        let ex = extractor();
        let code = "int main() { return alloc(1) + 2; }";
        let a = ex.extract(code);
        let b = ex.extract(code);
        assert_eq!(a, b);
        assert!(a.iter().all(|&bit| bit <= 1));
        assert!(a.iter().filter(|&&bit| bit == 1).count() <= VECTOR_LEN);
    }

    #[test]
    fn merges_double_operators() {
        let ex = extractor();
        let v = ex.extract("if (a && b) { p->q += 1; }");
        assert_eq!(bit(&ex, &v, "&&"), 1);
        assert_eq!(bit(&ex, &v, "->"), 1);
        assert_eq!(bit(&ex, &v, "+="), 1);
        // The lone components were consumed by the merged spellings.
        assert_eq!(bit(&ex, &v, "&"), 0);
        assert_eq!(bit(&ex, &v, "+"), 0);
    }

    #[test]
    fn whitespace_flushes_the_accumulator() {
        let ex = extractor();
        let split = ex.extract("a < < b");
        assert_eq!(bit(&ex, &split, "<"), 1);
        assert_eq!(bit(&ex, &split, "<<"), 0);

        let merged = ex.extract("a << b");
        assert_eq!(bit(&ex, &merged, "<<"), 1);
        assert_eq!(bit(&ex, &merged, "<"), 0);
    }

    #[test]
    fn shift_assign_accumulates_three_chars() {
        let ex = extractor();
        let v = ex.extract("x <<= 2; y >>= 3;");
        assert_eq!(bit(&ex, &v, "<<="), 1);
        assert_eq!(bit(&ex, &v, ">>="), 1);
        assert_eq!(bit(&ex, &v, "<<"), 0);
        assert_eq!(bit(&ex, &v, ">>"), 0);
    }

    #[test]
    fn tilde_is_emitted_immediately() {
        let ex = extractor();
        let v = ex.extract("mask = ~mask;");
        assert_eq!(bit(&ex, &v, "~"), 1);
    }

    #[test]
    fn format_letters_from_string_literals_only() {
        let ex = extractor();
        let v = ex.extract(r#"printf("%d %s %5.2f\n", a, b, c);"#);
        assert_eq!(fmt_bit(&ex, &v, 'd'), 1);
        assert_eq!(fmt_bit(&ex, &v, 's'), 1);
        assert_eq!(fmt_bit(&ex, &v, 'f'), 1);
        assert_eq!(fmt_bit(&ex, &v, 'x'), 0);

        // Identifiers named after a conversion letter must not set the bit.
        let w = ex.extract("int d = s;");
        assert_eq!(fmt_bit(&ex, &w, 'd'), 0);
        assert_eq!(fmt_bit(&ex, &w, 's'), 0);
    }

    #[test]
    fn length_modifier_is_skipped() {
        let ex = extractor();
        let v = ex.extract(r#"printf("%ld %hu");"#);
        assert_eq!(fmt_bit(&ex, &v, 'd'), 1);
        assert_eq!(fmt_bit(&ex, &v, 'u'), 1);
    }

    #[test]
    fn keywords_and_apis_recorded() {
        let ex = extractor();
        let v = ex.extract("static void f() { spin_lock(); }");
        assert_eq!(bit(&ex, &v, "static"), 1);
        assert_eq!(bit(&ex, &v, "void"), 1);
        // `spin_lock` is one identifier; only exact vocabulary words hit.
        assert_eq!(bit(&ex, &v, "spin"), 0);
        assert_eq!(bit(&ex, &v, "lock"), 0);

        let w = ex.extract("lock(); free(p);");
        assert_eq!(bit(&ex, &w, "lock"), 1);
        assert_eq!(bit(&ex, &w, "free"), 1);
    }

    #[test]
    fn repeating_present_operators_does_not_change_vector() {
        let ex = extractor();
        let base = ex.extract("a && b;");
        let repeated = ex.extract("a && b && c && d;");
        assert_eq!(base, repeated);
    }

    #[test]
    fn comments_do_not_contribute() {
        let ex = extractor();
        let v = ex.extract("x = 1; /* a && b */ // c || d\n");
        assert_eq!(bit(&ex, &v, "&&"), 0);
        assert_eq!(bit(&ex, &v, "||"), 0);
    }
}
