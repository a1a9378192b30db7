//! The compiler error taxonomy.
//!
//! A compile call either returns a valid result or raises exactly one of
//! these. `Query`/`Syntax` errors blame the user's input and carry the
//! source span of the offending statement where one exists;
//! `InternalServer` blames the compiler itself and is never the user's
//! fault.

use thiserror::Error;

use meridiandb_schema::SchemaError;
use meridiandb_wire::buffer::DecodeError;
use meridiandb_wire::descriptor::DescribeError;

pub type Result<T> = std::result::Result<T, CompilerError>;

/// A byte range into the compiled source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }
}

/// User input at fault: unknown module, incomplete migration, a config
/// command in the wrong scope, and so on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct QueryError {
    pub message: String,
    pub span: Option<Span>,
    pub hint: Option<String>,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            span: None,
            hint: None,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// A syntax error from the MQL front end.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SyntaxError {
    pub message: String,
    pub span: Option<Span>,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, span: Option<Span>) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

/// Savepoint/transaction protocol violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("already in transaction")]
    AlreadyInTransaction,
    #[error("cannot commit: not in transaction")]
    NotInTransaction,
    #[error("savepoints can only be used in transaction blocks")]
    SavepointOutsideBlock,
    #[error("there is no {0:?} savepoint")]
    NoSuchSavepoint(String),
    #[error("failed to look up transaction or savepoint with id={0}")]
    UnknownTxId(u64),
}

#[derive(Error, Debug)]
pub enum CompilerError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error("the query has cardinality {actual} which does not match the expected cardinality ONE")]
    ResultCardinalityMismatch { actual: &'static str },
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("{0}")]
    InternalServer(String),
    #[error("{0}")]
    Protocol(String),
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("schema definition error: {0}")]
    SchemaSyntax(SyntaxError),
    /// Host-side failures threaded through the compiler boundary.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CompilerError {
    pub fn internal(message: impl Into<String>) -> Self {
        CompilerError::InternalServer(message.into())
    }

    pub fn query(message: impl Into<String>) -> Self {
        CompilerError::Query(QueryError::new(message))
    }

    pub fn query_at(message: impl Into<String>, span: Span) -> Self {
        CompilerError::Query(QueryError::new(message).with_span(span))
    }

    pub fn is_syntax_error(&self) -> bool {
        matches!(self, CompilerError::Syntax(_) | CompilerError::SchemaSyntax(_))
    }

    /// The source span attached to the error, if any.
    pub fn span(&self) -> Option<Span> {
        match self {
            CompilerError::Query(e) => e.span,
            CompilerError::Syntax(e) | CompilerError::SchemaSyntax(e) => e.span,
            _ => None,
        }
    }
}

// Descriptor failures are structural invariant violations, not user input.
impl From<DescribeError> for CompilerError {
    fn from(err: DescribeError) -> Self {
        CompilerError::InternalServer(err.to_string())
    }
}

// Malformed wire payloads arrive only through host-supplied blobs
// (dump/restore), which makes truncation a protocol fault.
impl From<DecodeError> for CompilerError {
    fn from(err: DecodeError) -> Self {
        CompilerError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_error_carries_span_and_hint() {
        let err = CompilerError::Query(
            QueryError::new("cannot commit incomplete migration")
                .with_span(Span::new(3, 19))
                .with_hint("run POPULATE MIGRATION"),
        );
        assert_eq!(err.span(), Some(Span::new(3, 19)));
        assert_eq!(err.to_string(), "cannot commit incomplete migration");
    }

    #[test]
    fn syntax_errors_are_recognized_for_the_retry_path() {
        assert!(CompilerError::Syntax(SyntaxError::new("unexpected token", None)).is_syntax_error());
        assert!(!CompilerError::query("bad module").is_syntax_error());
    }
}
