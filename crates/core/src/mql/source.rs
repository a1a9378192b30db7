//! Query sources and constant extraction.
//!
//! A normalized source hoists scalar literals out of a query and replaces
//! them with implicit parameters, so that `SELECT 1` and `SELECT 2`
//! compile to the same SQL and share a prepared-statement cache slot. The
//! implicit parameters are appended after the user's own parameters;
//! [`Source::first_extra`] reports where the boundary is.

use std::collections::BTreeSet;

use crate::mql::lexer::{tokenize, Token, TokenKind};

/// A value extracted from the source during normalization, to be bound as
/// an implicit parameter at execution time.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedArg {
    pub name: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct Source {
    original: String,
    normalized: Option<String>,
    first_extra: Option<usize>,
    extracted_args: Vec<ExtractedArg>,
}

impl Source {
    /// A plain source: compiled exactly as written.
    pub fn from_string(text: impl Into<String>) -> Self {
        Self {
            original: text.into(),
            normalized: None,
            first_extra: None,
            extracted_args: Vec::new(),
        }
    }

    /// A source with constant extraction applied where possible. Sources
    /// that fail to lex, scripts, and non-query statements are left as
    /// written.
    pub fn from_string_normalized(text: impl Into<String>) -> Self {
        let original: String = text.into();
        match normalize(&original) {
            Some((normalized, user_params, extracted_args)) => Self {
                original,
                normalized: Some(normalized),
                first_extra: Some(user_params),
                extracted_args,
            },
            None => Self::from_string(original),
        }
    }

    /// The text the compiler should parse.
    pub fn text(&self) -> &str {
        self.normalized.as_deref().unwrap_or(&self.original)
    }

    /// The text as the user wrote it.
    pub fn original_text(&self) -> &str {
        &self.original
    }

    pub fn is_normalized(&self) -> bool {
        self.normalized.is_some()
    }

    /// How many of the query's parameters originate from the user; any
    /// parameter at or past this index was injected by normalization.
    /// `None` when the source was not normalized.
    pub fn first_extra(&self) -> Option<usize> {
        self.first_extra
    }

    pub fn extracted_args(&self) -> &[ExtractedArg] {
        &self.extracted_args
    }

    /// A denormalized copy, for the syntax-error retry path.
    pub fn denormalized(&self) -> Source {
        Source::from_string(self.original.clone())
    }
}

/// Literal extraction over the token stream. Returns `None` when the text
/// is not a single normalizable query statement.
fn normalize(text: &str) -> Option<(String, usize, Vec<ExtractedArg>)> {
    let tokens = tokenize(text).ok()?;

    let first_word = tokens.iter().find_map(|t| match &t.kind {
        TokenKind::Ident(w) => Some(w.to_ascii_uppercase()),
        _ => None,
    })?;
    if !matches!(first_word.as_str(), "SELECT" | "INSERT" | "UPDATE" | "DELETE") {
        return None;
    }
    // Scripts keep their literals: per-statement caching does not apply.
    let semis = tokens
        .iter()
        .filter(|t| matches!(t.kind, TokenKind::Semicolon))
        .count();
    if semis > 1 || (semis == 1 && !matches!(tokens[tokens.len() - 2].kind, TokenKind::Semicolon)) {
        return None;
    }

    let user_params: BTreeSet<&str> = tokens
        .iter()
        .filter_map(|t| match &t.kind {
            TokenKind::Param(name) => Some(name.as_str()),
            _ => None,
        })
        .collect();

    let mut out = String::with_capacity(text.len());
    let mut extracted: Vec<ExtractedArg> = Vec::new();
    let mut cursor = 0usize;
    let mut limit_depth: Option<usize> = None;

    for (idx, token) in tokens.iter().enumerate() {
        // LIMIT clauses keep their literal: the implicit-limit machinery
        // inspects them structurally.
        if let TokenKind::Ident(w) = &token.kind {
            if w.eq_ignore_ascii_case("LIMIT") {
                limit_depth = Some(idx);
            }
        }
        let replacement = match &token.kind {
            TokenKind::IntLit(v) if limit_depth != Some(idx.wrapping_sub(1)) => {
                let name = format!("__p{}", extracted.len());
                let repl = format!("<std::int64>${name}");
                extracted.push(ExtractedArg {
                    name,
                    value: serde_json::json!(v),
                });
                Some(repl)
            }
            TokenKind::StrLit(v) => {
                let name = format!("__p{}", extracted.len());
                let repl = format!("<std::str>${name}");
                extracted.push(ExtractedArg {
                    name,
                    value: serde_json::json!(v),
                });
                Some(repl)
            }
            _ => None,
        };
        if let Some(repl) = replacement {
            out.push_str(&text[cursor..token.span.start as usize]);
            out.push_str(&repl);
            cursor = token.span.end as usize;
        }
    }
    if extracted.is_empty() {
        return None;
    }
    out.push_str(&text[cursor..]);
    Some((out, user_params.len(), extracted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_literals_are_extracted() {
        let src = Source::from_string_normalized("SELECT 1 + 2");
        assert!(src.is_normalized());
        assert_eq!(src.text(), "SELECT <std::int64>$__p0 + <std::int64>$__p1");
        assert_eq!(src.first_extra(), Some(0));
        assert_eq!(src.extracted_args().len(), 2);
        assert_eq!(src.original_text(), "SELECT 1 + 2");
    }

    #[test]
    fn user_params_count_into_first_extra() {
        let src = Source::from_string_normalized("SELECT <str>$who = 'admin'");
        assert_eq!(src.first_extra(), Some(1));
        assert_eq!(src.extracted_args().len(), 1);
    }

    #[test]
    fn ddl_is_left_alone() {
        let src = Source::from_string_normalized("CREATE TYPE X");
        assert!(!src.is_normalized());
        assert_eq!(src.first_extra(), None);
    }

    #[test]
    fn scripts_are_left_alone() {
        let src = Source::from_string_normalized("SELECT 1; SELECT 2;");
        assert!(!src.is_normalized());
    }

    #[test]
    fn limit_literal_is_preserved() {
        let src = Source::from_string_normalized("SELECT 'x' LIMIT 10");
        assert!(src.is_normalized());
        assert!(src.text().ends_with("LIMIT 10"));
    }

    #[test]
    fn denormalized_returns_the_original() {
        let src = Source::from_string_normalized("SELECT 42");
        let plain = src.denormalized();
        assert!(!plain.is_normalized());
        assert_eq!(plain.text(), "SELECT 42");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn equal_shapes_normalize_identically(a in 0i64..1_000_000, b in 0i64..1_000_000) {
                let sa = Source::from_string_normalized(format!("SELECT {a}"));
                let sb = Source::from_string_normalized(format!("SELECT {b}"));
                prop_assert_eq!(sa.text(), sb.text());
                prop_assert_eq!(sa.first_extra(), Some(0));
            }

            #[test]
            fn extracted_values_match_the_original(v in 0i64..1_000_000) {
                let src = Source::from_string_normalized(format!("SELECT {v} + {v}"));
                let values: Vec<_> = src
                    .extracted_args()
                    .iter()
                    .map(|arg| arg.value.as_i64().unwrap())
                    .collect();
                prop_assert_eq!(values, vec![v, v]);
            }
        }
    }
}
