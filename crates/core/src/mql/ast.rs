//! The MQL statement AST.
//!
//! A deliberately closed set of node kinds: the dispatcher routes on the
//! top-level [`Statement`] variants with an exhaustive match.

use crate::config::ConfigScope;
use crate::error::Span;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

/// A (possibly generic) type reference, e.g. `std::str` or `array<str>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeName {
    pub name: String,
    pub element: Option<Box<TypeName>>,
}

impl TypeName {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            element: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Lt,
    Gt,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShapeElementAst {
    pub name: String,
    pub nested: Option<Vec<ShapeElementAst>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal, Span),
    /// `$name`; always appears under a cast in well-typed queries.
    Param { name: String, span: Span },
    Cast {
        ty: TypeName,
        optional: bool,
        expr: Box<Expr>,
        span: Span,
    },
    Tuple(Vec<Expr>, Span),
    NamedTuple(Vec<(String, Expr)>, Span),
    Array(Vec<Expr>, Span),
    SetLit(Vec<Expr>, Span),
    /// A bare (possibly qualified) name: an object type reference.
    Path { name: String, span: Span },
    /// `Type { a, b: { c } }`.
    Shape {
        type_name: String,
        elements: Vec<ShapeElementAst>,
        span: Span,
    },
    FuncCall {
        name: String,
        args: Vec<Expr>,
        span: Span,
    },
    BinOp {
        op: BinOpKind,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Literal(_, span)
            | Expr::Tuple(_, span)
            | Expr::NamedTuple(_, span)
            | Expr::Array(_, span)
            | Expr::SetLit(_, span)
            | Expr::Param { span, .. }
            | Expr::Cast { span, .. }
            | Expr::Path { span, .. }
            | Expr::Shape { span, .. }
            | Expr::FuncCall { span, .. }
            | Expr::BinOp { span, .. } => *span,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryStmt {
    Select {
        expr: Expr,
        filter: Option<Expr>,
        limit: Option<Expr>,
        span: Span,
    },
    Insert {
        type_name: String,
        assignments: Vec<(String, Expr)>,
        span: Span,
    },
    Update {
        type_name: String,
        filter: Option<Expr>,
        assignments: Vec<(String, Expr)>,
        span: Span,
    },
    Delete {
        type_name: String,
        filter: Option<Expr>,
        span: Span,
    },
}

impl QueryStmt {
    pub fn span(&self) -> Span {
        match self {
            QueryStmt::Select { span, .. }
            | QueryStmt::Insert { span, .. }
            | QueryStmt::Update { span, .. }
            | QueryStmt::Delete { span, .. } => *span,
        }
    }

    pub fn is_dml(&self) -> bool {
        !matches!(self, QueryStmt::Select { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerDeclKind {
    Property,
    Link,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointerDecl {
    pub kind: PointerDeclKind,
    pub name: String,
    pub target: TypeName,
    pub required: bool,
    pub multi: bool,
}

/// A command inside an `ALTER TYPE { ... }` block.
#[derive(Debug, Clone, PartialEq)]
pub enum AlterTypeCmd {
    CreatePointer(PointerDecl),
    DropPointer { name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DdlStatement {
    CreateType {
        name: String,
        pointers: Vec<PointerDecl>,
        span: Span,
    },
    AlterType {
        name: String,
        rename_to: Option<String>,
        commands: Vec<AlterTypeCmd>,
        span: Span,
    },
    DropType { name: String, span: Span },
    CreateScalarType {
        name: String,
        extending: Option<TypeName>,
        enum_labels: Option<Vec<String>>,
        span: Span,
    },
    DropScalarType { name: String, span: Span },
    CreateModule { name: String, span: Span },
    DropModule { name: String, span: Span },
    CreateDatabase { name: String, span: Span },
    DropDatabase { name: String, span: Span },
    CreateRole {
        name: String,
        superuser: bool,
        span: Span,
    },
    DropRole { name: String, span: Span },
    CreateMigration {
        name: Option<String>,
        parent: Option<String>,
        body: Vec<DdlStatement>,
        span: Span,
    },
}

impl DdlStatement {
    pub fn span(&self) -> Span {
        match self {
            DdlStatement::CreateType { span, .. }
            | DdlStatement::AlterType { span, .. }
            | DdlStatement::DropType { span, .. }
            | DdlStatement::CreateScalarType { span, .. }
            | DdlStatement::DropScalarType { span, .. }
            | DdlStatement::CreateModule { span, .. }
            | DdlStatement::DropModule { span, .. }
            | DdlStatement::CreateDatabase { span, .. }
            | DdlStatement::DropDatabase { span, .. }
            | DdlStatement::CreateRole { span, .. }
            | DdlStatement::DropRole { span, .. }
            | DdlStatement::CreateMigration { span, .. } => *span,
        }
    }

    pub fn is_database_ddl(&self) -> bool {
        matches!(
            self,
            DdlStatement::CreateDatabase { .. } | DdlStatement::DropDatabase { .. }
        )
    }

    pub fn is_role_ddl(&self) -> bool {
        matches!(
            self,
            DdlStatement::CreateRole { .. } | DdlStatement::DropRole { .. }
        )
    }
}

/// Schema definition declarations, the SDL subset used by migration bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum SdlDeclaration {
    Module {
        name: String,
        declarations: Vec<SdlDeclaration>,
    },
    Type {
        name: String,
        pointers: Vec<PointerDecl>,
    },
    Scalar {
        name: String,
        extending: Option<TypeName>,
        enum_labels: Option<Vec<String>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeLanguage {
    Ddl,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MigrationStmt {
    StartMigration {
        target: Vec<SdlDeclaration>,
        span: Span,
    },
    PopulateMigration { span: Span },
    DescribeCurrentMigration {
        language: DescribeLanguage,
        span: Span,
    },
    AlterCurrentMigrationRejectProposed { span: Span },
    CommitMigration { span: Span },
    AbortMigration { span: Span },
}

impl MigrationStmt {
    pub fn span(&self) -> Span {
        match self {
            MigrationStmt::StartMigration { span, .. }
            | MigrationStmt::PopulateMigration { span }
            | MigrationStmt::DescribeCurrentMigration { span, .. }
            | MigrationStmt::AlterCurrentMigrationRejectProposed { span }
            | MigrationStmt::CommitMigration { span }
            | MigrationStmt::AbortMigration { span } => *span,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    Serializable,
    RepeatableRead,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::Serializable => "SERIALIZABLE",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn as_sql(&self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "READ ONLY",
            AccessMode::ReadWrite => "READ WRITE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TxStmt {
    Start {
        isolation: Option<IsolationLevel>,
        access: Option<AccessMode>,
        deferrable: Option<bool>,
        span: Span,
    },
    Commit { span: Span },
    Rollback { span: Span },
    DeclareSavepoint { name: String, span: Span },
    ReleaseSavepoint { name: String, span: Span },
    RollbackToSavepoint { name: String, span: Span },
}

impl TxStmt {
    pub fn span(&self) -> Span {
        match self {
            TxStmt::Start { span, .. }
            | TxStmt::Commit { span }
            | TxStmt::Rollback { span }
            | TxStmt::DeclareSavepoint { span, .. }
            | TxStmt::ReleaseSavepoint { span, .. }
            | TxStmt::RollbackToSavepoint { span, .. } => *span,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionStmt {
    SetModule { module: String, span: Span },
    SetAlias {
        alias: String,
        module: String,
        span: Span,
    },
    ResetModule { span: Span },
    ResetAlias { alias: String, span: Span },
    ResetAllAliases { span: Span },
}

impl SessionStmt {
    pub fn span(&self) -> Span {
        match self {
            SessionStmt::SetModule { span, .. }
            | SessionStmt::SetAlias { span, .. }
            | SessionStmt::ResetModule { span }
            | SessionStmt::ResetAlias { span, .. }
            | SessionStmt::ResetAllAliases { span } => *span,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSetOp {
    Set { name: String, value: Expr },
    Reset { name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigStmt {
    pub scope: ConfigScope,
    pub op: ConfigSetOp,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Query(QueryStmt),
    Ddl(DdlStatement),
    Migration(MigrationStmt),
    Transaction(TxStmt),
    Session(SessionStmt),
    Config(ConfigStmt),
}

impl Statement {
    pub fn span(&self) -> Span {
        match self {
            Statement::Query(s) => s.span(),
            Statement::Ddl(s) => s.span(),
            Statement::Migration(s) => s.span(),
            Statement::Transaction(s) => s.span(),
            Statement::Session(s) => s.span(),
            Statement::Config(s) => s.span,
        }
    }
}
