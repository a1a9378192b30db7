//! Backend DDL building blocks: statement blocks and function DDL.

use std::fmt::Write as _;

use itertools::Itertools;

use super::{quote_ident, quote_literal};

/// A group of backend statements rendered either as one transactional
/// PL/pgSQL block or as a list of standalone statements (for DDL the
/// backend refuses to run inside a transaction, like CREATE DATABASE).
#[derive(Debug, Clone)]
pub enum SqlBlock {
    Transactional { commands: Vec<String> },
    NonTransactional { commands: Vec<String> },
}

impl SqlBlock {
    /// A transactional PL top block.
    pub fn new_pl() -> Self {
        SqlBlock::Transactional {
            commands: Vec::new(),
        }
    }

    /// A plain list of non-transactional statements.
    pub fn new_plain() -> Self {
        SqlBlock::NonTransactional {
            commands: Vec::new(),
        }
    }

    pub fn is_transactional(&self) -> bool {
        matches!(self, SqlBlock::Transactional { .. })
    }

    pub fn add_command(&mut self, command: impl Into<String>) {
        let command = command.into();
        match self {
            SqlBlock::Transactional { commands } | SqlBlock::NonTransactional { commands } => {
                commands.push(command)
            }
        }
    }

    /// The statements as individual strings; only meaningful for
    /// non-transactional blocks.
    pub fn statements(&self) -> &[String] {
        match self {
            SqlBlock::Transactional { commands } | SqlBlock::NonTransactional { commands } => {
                commands
            }
        }
    }

    /// Render the whole block to one executable string.
    pub fn to_sql_string(&self) -> String {
        match self {
            SqlBlock::Transactional { commands } => {
                let mut out = String::from("DO LANGUAGE plpgsql $__block__$ BEGIN\n");
                for command in commands {
                    let command = command.trim_end().trim_end_matches(';');
                    let _ = writeln!(out, "{command};");
                }
                out.push_str("END; $__block__$");
                out
            }
            SqlBlock::NonTransactional { commands } => commands.iter().join(";\n"),
        }
    }
}

/// A backend helper function definition.
#[derive(Debug, Clone)]
pub struct Function {
    /// Schema-qualified name.
    pub name: (String, String),
    /// `(arg_name, arg_type)` pairs.
    pub args: Vec<(String, String)>,
    pub returns: String,
    pub body: String,
}

impl Function {
    /// Render CREATE [OR REPLACE] FUNCTION into `block`.
    pub fn generate(&self, block: &mut SqlBlock, or_replace: bool) {
        let args = self
            .args
            .iter()
            .map(|(name, ty)| format!("{} {}", quote_ident(name), ty))
            .join(", ");
        let stmt = format!(
            "CREATE {}FUNCTION {}.{}({args}) RETURNS {} LANGUAGE sql AS {}",
            if or_replace { "OR REPLACE " } else { "" },
            quote_ident(&self.name.0),
            quote_ident(&self.name.1),
            self.returns,
            quote_literal(&self.body),
        );
        block.add_command(stmt);
    }

    /// The invocation statement for this helper.
    pub fn call_statement(&self, argvals: &[String]) -> String {
        format!(
            "PERFORM {}.{}({})",
            quote_ident(&self.name.0),
            quote_ident(&self.name.1),
            argvals.iter().join(", "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pl_block_renders_terminated_commands() {
        let mut block = SqlBlock::new_pl();
        block.add_command("CREATE TABLE \"default::User\" (id uuid)");
        block.add_command("INSERT INTO x VALUES (1);");
        let sql = block.to_sql_string();
        assert!(sql.starts_with("DO LANGUAGE plpgsql"));
        assert!(sql.contains("CREATE TABLE \"default::User\" (id uuid);\n"));
        // Pre-terminated commands are not double-terminated.
        assert!(sql.contains("VALUES (1);\n"));
        assert!(!sql.contains("VALUES (1);;"));
    }

    #[test]
    fn plain_block_stays_a_statement_list() {
        let mut block = SqlBlock::new_plain();
        block.add_command("CREATE DATABASE foo");
        block.add_command("DROP DATABASE bar");
        assert!(!block.is_transactional());
        assert_eq!(block.statements().len(), 2);
        assert_eq!(
            block.to_sql_string(),
            "CREATE DATABASE foo;\nDROP DATABASE bar"
        );
    }

    #[test]
    fn function_ddl_quotes_everything() {
        let mut block = SqlBlock::new_pl();
        let f = Function {
            name: ("meridian".into(), "__rh_abc".into()),
            args: vec![("data".into(), "json".into())],
            returns: "json".into(),
            body: "SELECT 'it''s'".into(),
        };
        f.generate(&mut block, true);
        let sql = block.to_sql_string();
        assert!(sql.contains("CREATE OR REPLACE FUNCTION \"meridian\".\"__rh_abc\"(\"data\" json)"));
        assert_eq!(f.call_statement(&["'x'".into()]), "PERFORM \"meridian\".\"__rh_abc\"('x')");
    }
}
