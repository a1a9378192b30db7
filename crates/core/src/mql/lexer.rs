//! The MQL lexer. Hand-rolled: byte-offset spans, `#` line comments,
//! single-quoted strings with backslash escapes.

use crate::error::{Span, SyntaxError};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    IntLit(i64),
    FloatLit(f64),
    StrLit(String),
    /// `$name` or `$0`.
    Param(String),
    Assign,      // :=
    Arrow,       // ->
    DoubleColon, // ::
    Colon,
    Semicolon,
    Comma,
    Dot,
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Lt,
    Gt,
    Eq,
    Plus,
    Minus,
    Star,
    Slash,
    At,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    /// Case-insensitive keyword check.
    pub fn is_keyword(&self, kw: &str) -> bool {
        matches!(&self.kind, TokenKind::Ident(s) if s.eq_ignore_ascii_case(kw))
    }
}

pub fn tokenize(text: &str) -> Result<Vec<Token>, SyntaxError> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0usize;

    let err = |msg: &str, at: usize| {
        SyntaxError::new(msg.to_string(), Some(Span::new(at as u32, at as u32 + 1)))
    };

    while pos < bytes.len() {
        let start = pos;
        let ch = bytes[pos];
        match ch {
            b' ' | b'\t' | b'\r' | b'\n' => {
                pos += 1;
            }
            b'#' => {
                while pos < bytes.len() && bytes[pos] != b'\n' {
                    pos += 1;
                }
            }
            b'\'' => {
                pos += 1;
                let mut value = String::new();
                loop {
                    if pos >= bytes.len() {
                        return Err(err("unterminated string literal", start));
                    }
                    match bytes[pos] {
                        b'\'' => {
                            pos += 1;
                            break;
                        }
                        b'\\' => {
                            pos += 1;
                            if pos >= bytes.len() {
                                return Err(err("unterminated string literal", start));
                            }
                            value.push(match bytes[pos] {
                                b'n' => '\n',
                                b't' => '\t',
                                b'\\' => '\\',
                                b'\'' => '\'',
                                other => other as char,
                            });
                            pos += 1;
                        }
                        _ => {
                            let ch_start = pos;
                            while pos < bytes.len()
                                && bytes[pos] != b'\''
                                && bytes[pos] != b'\\'
                            {
                                pos += 1;
                            }
                            value.push_str(&text[ch_start..pos]);
                        }
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::StrLit(value),
                    span: Span::new(start as u32, pos as u32),
                });
            }
            b'$' => {
                pos += 1;
                let name_start = pos;
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_')
                {
                    pos += 1;
                }
                if pos == name_start {
                    return Err(err("expected parameter name after `$`", start));
                }
                tokens.push(Token {
                    kind: TokenKind::Param(text[name_start..pos].to_string()),
                    span: Span::new(start as u32, pos as u32),
                });
            }
            b'0'..=b'9' => {
                while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                    pos += 1;
                }
                let mut is_float = false;
                if pos + 1 < bytes.len() && bytes[pos] == b'.' && bytes[pos + 1].is_ascii_digit() {
                    is_float = true;
                    pos += 1;
                    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                        pos += 1;
                    }
                }
                let raw = &text[start..pos];
                let kind = if is_float {
                    TokenKind::FloatLit(
                        raw.parse()
                            .map_err(|_| err("invalid float literal", start))?,
                    )
                } else {
                    TokenKind::IntLit(
                        raw.parse()
                            .map_err(|_| err("integer literal out of range", start))?,
                    )
                };
                tokens.push(Token {
                    kind,
                    span: Span::new(start as u32, pos as u32),
                });
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_')
                {
                    pos += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(text[start..pos].to_string()),
                    span: Span::new(start as u32, pos as u32),
                });
            }
            b':' => {
                if pos + 1 < bytes.len() && bytes[pos + 1] == b'=' {
                    pos += 2;
                    tokens.push(Token {
                        kind: TokenKind::Assign,
                        span: Span::new(start as u32, pos as u32),
                    });
                } else if pos + 1 < bytes.len() && bytes[pos + 1] == b':' {
                    pos += 2;
                    tokens.push(Token {
                        kind: TokenKind::DoubleColon,
                        span: Span::new(start as u32, pos as u32),
                    });
                } else {
                    pos += 1;
                    tokens.push(Token {
                        kind: TokenKind::Colon,
                        span: Span::new(start as u32, pos as u32),
                    });
                }
            }
            b'-' => {
                if pos + 1 < bytes.len() && bytes[pos + 1] == b'>' {
                    pos += 2;
                    tokens.push(Token {
                        kind: TokenKind::Arrow,
                        span: Span::new(start as u32, pos as u32),
                    });
                } else {
                    pos += 1;
                    tokens.push(Token {
                        kind: TokenKind::Minus,
                        span: Span::new(start as u32, pos as u32),
                    });
                }
            }
            _ => {
                let kind = match ch {
                    b';' => TokenKind::Semicolon,
                    b',' => TokenKind::Comma,
                    b'.' => TokenKind::Dot,
                    b'{' => TokenKind::LBrace,
                    b'}' => TokenKind::RBrace,
                    b'(' => TokenKind::LParen,
                    b')' => TokenKind::RParen,
                    b'[' => TokenKind::LBracket,
                    b']' => TokenKind::RBracket,
                    b'<' => TokenKind::Lt,
                    b'>' => TokenKind::Gt,
                    b'=' => TokenKind::Eq,
                    b'+' => TokenKind::Plus,
                    b'*' => TokenKind::Star,
                    b'/' => TokenKind::Slash,
                    b'@' => TokenKind::At,
                    other => {
                        return Err(err(
                            &format!("unexpected character {:?}", other as char),
                            start,
                        ))
                    }
                };
                pos += 1;
                tokens.push(Token {
                    kind,
                    span: Span::new(start as u32, pos as u32),
                });
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        span: Span::new(bytes.len() as u32, bytes.len() as u32),
    });
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        tokenize(text).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_a_select() {
        assert_eq!(
            kinds("SELECT 1;"),
            vec![
                TokenKind::Ident("SELECT".into()),
                TokenKind::IntLit(1),
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_params_and_casts() {
        assert_eq!(
            kinds("<str>$name"),
            vec![
                TokenKind::Lt,
                TokenKind::Ident("str".into()),
                TokenKind::Gt,
                TokenKind::Param("name".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            kinds(r"'it\'s'"),
            vec![TokenKind::StrLit("it's".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("SELECT # trailing\n 2"),
            vec![
                TokenKind::Ident("SELECT".into()),
                TokenKind::IntLit(2),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn spans_are_byte_offsets() {
        let tokens = tokenize("ab 'c'").unwrap();
        assert_eq!(tokens[0].span, Span::new(0, 2));
        assert_eq!(tokens[1].span, Span::new(3, 6));
    }

    #[test]
    fn rejects_garbage() {
        assert!(tokenize("SELECT ^").is_err());
    }
}
