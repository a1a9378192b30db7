//! Status lines for compiled statements, returned to the front end in the
//! command-complete message.

use crate::mql::ast::{
    ConfigSetOp, DdlStatement, MigrationStmt, QueryStmt, SessionStmt, Statement, TxStmt,
};

pub fn get_status(stmt: &Statement) -> Vec<u8> {
    let status: &str = match stmt {
        Statement::Query(q) => match q {
            QueryStmt::Select { .. } => "SELECT",
            QueryStmt::Insert { .. } => "INSERT",
            QueryStmt::Update { .. } => "UPDATE",
            QueryStmt::Delete { .. } => "DELETE",
        },
        Statement::Ddl(ddl) => match ddl {
            DdlStatement::CreateType { .. } => "CREATE TYPE",
            DdlStatement::AlterType { .. } => "ALTER TYPE",
            DdlStatement::DropType { .. } => "DROP TYPE",
            DdlStatement::CreateScalarType { .. } => "CREATE SCALAR TYPE",
            DdlStatement::DropScalarType { .. } => "DROP SCALAR TYPE",
            DdlStatement::CreateModule { .. } => "CREATE MODULE",
            DdlStatement::DropModule { .. } => "DROP MODULE",
            DdlStatement::CreateDatabase { .. } => "CREATE DATABASE",
            DdlStatement::DropDatabase { .. } => "DROP DATABASE",
            DdlStatement::CreateRole { .. } => "CREATE ROLE",
            DdlStatement::DropRole { .. } => "DROP ROLE",
            DdlStatement::CreateMigration { .. } => "CREATE MIGRATION",
        },
        Statement::Migration(m) => match m {
            MigrationStmt::StartMigration { .. } => "START MIGRATION",
            MigrationStmt::PopulateMigration { .. } => "POPULATE MIGRATION",
            MigrationStmt::DescribeCurrentMigration { .. } => "DESCRIBE",
            MigrationStmt::AlterCurrentMigrationRejectProposed { .. } => "ALTER MIGRATION",
            MigrationStmt::CommitMigration { .. } => "COMMIT MIGRATION",
            MigrationStmt::AbortMigration { .. } => "ABORT MIGRATION",
        },
        Statement::Transaction(tx) => match tx {
            TxStmt::Start { .. } => "START TRANSACTION",
            TxStmt::Commit { .. } => "COMMIT",
            TxStmt::Rollback { .. } => "ROLLBACK",
            TxStmt::DeclareSavepoint { .. } => "DECLARE SAVEPOINT",
            TxStmt::ReleaseSavepoint { .. } => "RELEASE SAVEPOINT",
            TxStmt::RollbackToSavepoint { .. } => "ROLLBACK TO SAVEPOINT",
        },
        Statement::Session(s) => match s {
            SessionStmt::SetModule { .. } | SessionStmt::SetAlias { .. } => "SET ALIAS",
            SessionStmt::ResetModule { .. }
            | SessionStmt::ResetAlias { .. }
            | SessionStmt::ResetAllAliases { .. } => "RESET ALIAS",
        },
        Statement::Config(c) => match &c.op {
            ConfigSetOp::Set { .. } => "CONFIGURE SET",
            ConfigSetOp::Reset { .. } => "CONFIGURE RESET",
        },
    };
    status.as_bytes().to_vec()
}
