//! The MQL front end: lexer, parser, sources, and DDL text generation.

pub mod ast;
pub mod codegen;
pub mod lexer;
pub mod parser;
pub mod source;

pub use codegen::{generate_source, quote_literal};
pub use parser::{parse, parse_block};
pub use source::Source;
