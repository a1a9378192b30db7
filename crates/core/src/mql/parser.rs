//! The MQL statement parser: recursive descent over the token stream.

use crate::config::ConfigScope;
use crate::error::{Span, SyntaxError};
use crate::mql::ast::*;
use crate::mql::lexer::{tokenize, Token, TokenKind};

type PResult<T> = Result<T, SyntaxError>;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(text: &str) -> PResult<Self> {
        Ok(Self {
            tokens: tokenize(text)?,
            pos: 0,
        })
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek2(&self) -> &Token {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)]
    }

    fn bump(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn prev_end(&self) -> u32 {
        if self.pos == 0 {
            0
        } else {
            self.tokens[self.pos - 1].span.end
        }
    }

    fn error(&self, msg: impl Into<String>) -> SyntaxError {
        SyntaxError::new(msg, Some(self.peek().span))
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        self.peek().is_keyword(kw)
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> PResult<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.error(format!("expected {kw}")))
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> PResult<()> {
        if self.eat(&kind) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn ident(&mut self) -> PResult<String> {
        match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.bump();
                Ok(name)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    /// `ident (:: ident)*`
    fn qualified_name(&mut self) -> PResult<String> {
        let mut name = self.ident()?;
        while self.eat(&TokenKind::DoubleColon) {
            name.push_str("::");
            name.push_str(&self.ident()?);
        }
        Ok(name)
    }

    fn type_name(&mut self) -> PResult<TypeName> {
        let name = self.qualified_name()?;
        let element = if self.eat(&TokenKind::Lt) {
            let inner = self.type_name()?;
            self.expect(TokenKind::Gt, "`>`")?;
            Some(Box::new(inner))
        } else {
            None
        };
        Ok(TypeName { name, element })
    }

    // ------------------------------------------------------------------
    // Statements

    pub fn parse_statement(&mut self) -> PResult<Statement> {
        let tok = self.peek().clone();
        let TokenKind::Ident(word) = &tok.kind else {
            return Err(self.error("expected a statement"));
        };
        match word.to_ascii_uppercase().as_str() {
            "SELECT" => self.parse_select(),
            "INSERT" => self.parse_insert(),
            "UPDATE" => self.parse_update(),
            "DELETE" => self.parse_delete(),
            "START" => self.parse_start(),
            "COMMIT" => self.parse_commit(),
            "ROLLBACK" => self.parse_rollback(),
            "DECLARE" => self.parse_declare_savepoint(),
            "RELEASE" => self.parse_release_savepoint(),
            "ABORT" => self.parse_abort_migration(),
            "POPULATE" => self.parse_populate_migration(),
            "DESCRIBE" => self.parse_describe_migration(),
            "ALTER" => self.parse_alter(),
            "SET" => self.parse_session_set(),
            "RESET" => self.parse_session_reset(),
            "CONFIGURE" => self.parse_configure(),
            "CREATE" => self.parse_create(),
            "DROP" => self.parse_drop(),
            other => Err(self.error(format!("unexpected keyword {other:?}"))),
        }
    }

    fn parse_select(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("SELECT")?;
        let expr = self.parse_expr()?;
        let filter = if self.eat_keyword("FILTER") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let limit = if self.eat_keyword("LIMIT") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Statement::Query(QueryStmt::Select {
            expr,
            filter,
            limit,
            span: Span::new(start, self.prev_end()),
        }))
    }

    fn parse_assignments(&mut self) -> PResult<Vec<(String, Expr)>> {
        self.expect(TokenKind::LBrace, "`{`")?;
        let mut assignments = Vec::new();
        while !self.eat(&TokenKind::RBrace) {
            let name = self.ident()?;
            self.expect(TokenKind::Assign, "`:=`")?;
            let value = self.parse_expr()?;
            assignments.push((name, value));
            if !self.eat(&TokenKind::Comma) {
                self.expect(TokenKind::RBrace, "`}`")?;
                break;
            }
        }
        Ok(assignments)
    }

    fn parse_insert(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("INSERT")?;
        let type_name = self.qualified_name()?;
        let assignments = if matches!(self.peek().kind, TokenKind::LBrace) {
            self.parse_assignments()?
        } else {
            Vec::new()
        };
        Ok(Statement::Query(QueryStmt::Insert {
            type_name,
            assignments,
            span: Span::new(start, self.prev_end()),
        }))
    }

    fn parse_update(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("UPDATE")?;
        let type_name = self.qualified_name()?;
        let filter = if self.eat_keyword("FILTER") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect_keyword("SET")?;
        let assignments = self.parse_assignments()?;
        Ok(Statement::Query(QueryStmt::Update {
            type_name,
            filter,
            assignments,
            span: Span::new(start, self.prev_end()),
        }))
    }

    fn parse_delete(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("DELETE")?;
        let type_name = self.qualified_name()?;
        let filter = if self.eat_keyword("FILTER") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Statement::Query(QueryStmt::Delete {
            type_name,
            filter,
            span: Span::new(start, self.prev_end()),
        }))
    }

    // ------------------------------------------------------------------
    // Transaction control and migrations

    fn parse_start(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("START")?;
        if self.eat_keyword("MIGRATION") {
            self.expect_keyword("TO")?;
            let target = self.parse_sdl_body()?;
            return Ok(Statement::Migration(MigrationStmt::StartMigration {
                target,
                span: Span::new(start, self.prev_end()),
            }));
        }
        self.expect_keyword("TRANSACTION")?;
        let mut isolation = None;
        let mut access = None;
        let mut deferrable = None;
        loop {
            if self.eat_keyword("ISOLATION") {
                if self.eat_keyword("SERIALIZABLE") {
                    isolation = Some(IsolationLevel::Serializable);
                } else if self.eat_keyword("REPEATABLE") {
                    self.expect_keyword("READ")?;
                    isolation = Some(IsolationLevel::RepeatableRead);
                } else {
                    return Err(self.error("expected isolation level"));
                }
            } else if self.eat_keyword("READ") {
                if self.eat_keyword("ONLY") {
                    access = Some(AccessMode::ReadOnly);
                } else {
                    self.expect_keyword("WRITE")?;
                    access = Some(AccessMode::ReadWrite);
                }
            } else if self.eat_keyword("DEFERRABLE") {
                deferrable = Some(true);
            } else if self.eat_keyword("NOT") {
                self.expect_keyword("DEFERRABLE")?;
                deferrable = Some(false);
            } else {
                break;
            }
            // Option separators are optional.
            self.eat(&TokenKind::Comma);
        }
        Ok(Statement::Transaction(TxStmt::Start {
            isolation,
            access,
            deferrable,
            span: Span::new(start, self.prev_end()),
        }))
    }

    fn parse_commit(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("COMMIT")?;
        if self.eat_keyword("MIGRATION") {
            return Ok(Statement::Migration(MigrationStmt::CommitMigration {
                span: Span::new(start, self.prev_end()),
            }));
        }
        Ok(Statement::Transaction(TxStmt::Commit {
            span: Span::new(start, self.prev_end()),
        }))
    }

    fn parse_rollback(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("ROLLBACK")?;
        if self.eat_keyword("TO") {
            self.expect_keyword("SAVEPOINT")?;
            let name = self.ident()?;
            return Ok(Statement::Transaction(TxStmt::RollbackToSavepoint {
                name,
                span: Span::new(start, self.prev_end()),
            }));
        }
        Ok(Statement::Transaction(TxStmt::Rollback {
            span: Span::new(start, self.prev_end()),
        }))
    }

    fn parse_declare_savepoint(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("DECLARE")?;
        self.expect_keyword("SAVEPOINT")?;
        let name = self.ident()?;
        Ok(Statement::Transaction(TxStmt::DeclareSavepoint {
            name,
            span: Span::new(start, self.prev_end()),
        }))
    }

    fn parse_release_savepoint(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("RELEASE")?;
        self.expect_keyword("SAVEPOINT")?;
        let name = self.ident()?;
        Ok(Statement::Transaction(TxStmt::ReleaseSavepoint {
            name,
            span: Span::new(start, self.prev_end()),
        }))
    }

    fn parse_abort_migration(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("ABORT")?;
        self.expect_keyword("MIGRATION")?;
        Ok(Statement::Migration(MigrationStmt::AbortMigration {
            span: Span::new(start, self.prev_end()),
        }))
    }

    fn parse_populate_migration(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("POPULATE")?;
        self.expect_keyword("MIGRATION")?;
        Ok(Statement::Migration(MigrationStmt::PopulateMigration {
            span: Span::new(start, self.prev_end()),
        }))
    }

    fn parse_describe_migration(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("DESCRIBE")?;
        self.expect_keyword("CURRENT")?;
        self.expect_keyword("MIGRATION")?;
        let language = if self.eat_keyword("AS") {
            if self.eat_keyword("JSON") {
                DescribeLanguage::Json
            } else {
                self.expect_keyword("DDL")?;
                DescribeLanguage::Ddl
            }
        } else {
            DescribeLanguage::Ddl
        };
        Ok(Statement::Migration(MigrationStmt::DescribeCurrentMigration {
            language,
            span: Span::new(start, self.prev_end()),
        }))
    }

    fn parse_alter(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("ALTER")?;
        if self.eat_keyword("CURRENT") {
            self.expect_keyword("MIGRATION")?;
            self.expect_keyword("REJECT")?;
            self.expect_keyword("PROPOSED")?;
            return Ok(Statement::Migration(
                MigrationStmt::AlterCurrentMigrationRejectProposed {
                    span: Span::new(start, self.prev_end()),
                },
            ));
        }
        self.expect_keyword("TYPE")?;
        let name = self.qualified_name()?;
        if self.eat_keyword("RENAME") {
            self.expect_keyword("TO")?;
            let new_name = self.qualified_name()?;
            return Ok(Statement::Ddl(DdlStatement::AlterType {
                name,
                rename_to: Some(new_name),
                commands: Vec::new(),
                span: Span::new(start, self.prev_end()),
            }));
        }
        self.expect(TokenKind::LBrace, "`{`")?;
        let mut commands = Vec::new();
        while !self.eat(&TokenKind::RBrace) {
            if self.eat_keyword("CREATE") {
                commands.push(AlterTypeCmd::CreatePointer(self.parse_pointer_decl()?));
            } else if self.eat_keyword("DROP") {
                if !self.eat_keyword("PROPERTY") {
                    self.expect_keyword("LINK")?;
                }
                commands.push(AlterTypeCmd::DropPointer { name: self.ident()? });
            } else {
                return Err(self.error("expected CREATE or DROP inside ALTER TYPE"));
            }
            self.expect(TokenKind::Semicolon, "`;`")?;
        }
        Ok(Statement::Ddl(DdlStatement::AlterType {
            name,
            rename_to: None,
            commands,
            span: Span::new(start, self.prev_end()),
        }))
    }

    // ------------------------------------------------------------------
    // Session state and configuration

    fn parse_session_set(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("SET")?;
        if self.eat_keyword("MODULE") {
            let module = self.ident()?;
            return Ok(Statement::Session(SessionStmt::SetModule {
                module,
                span: Span::new(start, self.prev_end()),
            }));
        }
        self.expect_keyword("ALIAS")?;
        let alias = self.ident()?;
        self.expect_keyword("AS")?;
        self.expect_keyword("MODULE")?;
        let module = self.ident()?;
        Ok(Statement::Session(SessionStmt::SetAlias {
            alias,
            module,
            span: Span::new(start, self.prev_end()),
        }))
    }

    fn parse_session_reset(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("RESET")?;
        if self.eat_keyword("MODULE") {
            return Ok(Statement::Session(SessionStmt::ResetModule {
                span: Span::new(start, self.prev_end()),
            }));
        }
        self.expect_keyword("ALIAS")?;
        if self.eat(&TokenKind::Star) {
            return Ok(Statement::Session(SessionStmt::ResetAllAliases {
                span: Span::new(start, self.prev_end()),
            }));
        }
        let alias = self.ident()?;
        Ok(Statement::Session(SessionStmt::ResetAlias {
            alias,
            span: Span::new(start, self.prev_end()),
        }))
    }

    fn parse_configure(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("CONFIGURE")?;
        let scope = if self.eat_keyword("SESSION") {
            ConfigScope::Session
        } else if self.eat_keyword("CURRENT") {
            self.expect_keyword("DATABASE")?;
            ConfigScope::Database
        } else {
            self.expect_keyword("SYSTEM")?;
            ConfigScope::System
        };
        let op = if self.eat_keyword("SET") {
            let name = self.ident()?;
            self.expect(TokenKind::Assign, "`:=`")?;
            let value = self.parse_expr()?;
            ConfigSetOp::Set { name, value }
        } else {
            self.expect_keyword("RESET")?;
            let name = self.ident()?;
            ConfigSetOp::Reset { name }
        };
        Ok(Statement::Config(ConfigStmt {
            scope,
            op,
            span: Span::new(start, self.prev_end()),
        }))
    }

    // ------------------------------------------------------------------
    // DDL

    fn parse_pointer_decl(&mut self) -> PResult<PointerDecl> {
        let required = self.eat_keyword("REQUIRED");
        let multi = self.eat_keyword("MULTI");
        let kind = if self.eat_keyword("PROPERTY") {
            PointerDeclKind::Property
        } else {
            self.expect_keyword("LINK")?;
            PointerDeclKind::Link
        };
        let name = self.ident()?;
        self.expect(TokenKind::Arrow, "`->`")?;
        let target = self.type_name()?;
        Ok(PointerDecl {
            kind,
            name,
            target,
            required,
            multi,
        })
    }

    fn parse_create(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("CREATE")?;
        let superuser = self.eat_keyword("SUPERUSER");
        if superuser || self.at_keyword("ROLE") {
            self.expect_keyword("ROLE")?;
            let name = self.ident()?;
            return Ok(Statement::Ddl(DdlStatement::CreateRole {
                name,
                superuser,
                span: Span::new(start, self.prev_end()),
            }));
        }
        if self.eat_keyword("TYPE") {
            let name = self.qualified_name()?;
            let mut pointers = Vec::new();
            if self.eat(&TokenKind::LBrace) {
                while !self.eat(&TokenKind::RBrace) {
                    self.expect_keyword("CREATE")?;
                    pointers.push(self.parse_pointer_decl()?);
                    self.expect(TokenKind::Semicolon, "`;`")?;
                }
            }
            return Ok(Statement::Ddl(DdlStatement::CreateType {
                name,
                pointers,
                span: Span::new(start, self.prev_end()),
            }));
        }
        if self.eat_keyword("SCALAR") {
            self.expect_keyword("TYPE")?;
            let name = self.qualified_name()?;
            let (extending, enum_labels) = self.parse_scalar_extends()?;
            return Ok(Statement::Ddl(DdlStatement::CreateScalarType {
                name,
                extending,
                enum_labels,
                span: Span::new(start, self.prev_end()),
            }));
        }
        if self.eat_keyword("MODULE") {
            let name = self.ident()?;
            return Ok(Statement::Ddl(DdlStatement::CreateModule {
                name,
                span: Span::new(start, self.prev_end()),
            }));
        }
        if self.eat_keyword("DATABASE") {
            let name = self.ident()?;
            return Ok(Statement::Ddl(DdlStatement::CreateDatabase {
                name,
                span: Span::new(start, self.prev_end()),
            }));
        }
        if self.eat_keyword("MIGRATION") {
            let name = if matches!(self.peek().kind, TokenKind::Ident(_)) && !self.at_keyword("ONTO")
            {
                Some(self.ident()?)
            } else {
                None
            };
            let parent = if self.eat_keyword("ONTO") {
                Some(self.qualified_name()?)
            } else {
                None
            };
            let mut body = Vec::new();
            if self.eat(&TokenKind::LBrace) {
                while !self.eat(&TokenKind::RBrace) {
                    match self.parse_statement()? {
                        Statement::Ddl(ddl) => body.push(ddl),
                        _ => return Err(self.error("migration bodies may only contain DDL")),
                    }
                    self.eat(&TokenKind::Semicolon);
                }
            }
            return Ok(Statement::Ddl(DdlStatement::CreateMigration {
                name,
                parent,
                body,
                span: Span::new(start, self.prev_end()),
            }));
        }
        Err(self.error("unsupported CREATE statement"))
    }

    fn parse_scalar_extends(
        &mut self,
    ) -> PResult<(Option<TypeName>, Option<Vec<String>>)> {
        if !self.eat_keyword("EXTENDING") {
            return Ok((None, None));
        }
        if self.at_keyword("ENUM") {
            self.bump();
            self.expect(TokenKind::Lt, "`<`")?;
            let mut labels = vec![self.ident()?];
            while self.eat(&TokenKind::Comma) {
                labels.push(self.ident()?);
            }
            self.expect(TokenKind::Gt, "`>`")?;
            Ok((None, Some(labels)))
        } else {
            Ok((Some(self.type_name()?), None))
        }
    }

    fn parse_drop(&mut self) -> PResult<Statement> {
        let start = self.peek().span.start;
        self.expect_keyword("DROP")?;
        if self.eat_keyword("TYPE") {
            let name = self.qualified_name()?;
            return Ok(Statement::Ddl(DdlStatement::DropType {
                name,
                span: Span::new(start, self.prev_end()),
            }));
        }
        if self.eat_keyword("SCALAR") {
            self.expect_keyword("TYPE")?;
            let name = self.qualified_name()?;
            return Ok(Statement::Ddl(DdlStatement::DropScalarType {
                name,
                span: Span::new(start, self.prev_end()),
            }));
        }
        if self.eat_keyword("MODULE") {
            let name = self.ident()?;
            return Ok(Statement::Ddl(DdlStatement::DropModule {
                name,
                span: Span::new(start, self.prev_end()),
            }));
        }
        if self.eat_keyword("DATABASE") {
            let name = self.ident()?;
            return Ok(Statement::Ddl(DdlStatement::DropDatabase {
                name,
                span: Span::new(start, self.prev_end()),
            }));
        }
        if self.eat_keyword("ROLE") {
            let name = self.ident()?;
            return Ok(Statement::Ddl(DdlStatement::DropRole {
                name,
                span: Span::new(start, self.prev_end()),
            }));
        }
        Err(self.error("unsupported DROP statement"))
    }

    // ------------------------------------------------------------------
    // SDL (migration bodies)

    fn parse_sdl_body(&mut self) -> PResult<Vec<SdlDeclaration>> {
        self.expect(TokenKind::LBrace, "`{`")?;
        let mut declarations = Vec::new();
        while !self.eat(&TokenKind::RBrace) {
            declarations.push(self.parse_sdl_declaration()?);
        }
        Ok(declarations)
    }

    fn parse_sdl_declaration(&mut self) -> PResult<SdlDeclaration> {
        if self.eat_keyword("MODULE") {
            let name = self.ident()?;
            let declarations = self.parse_sdl_body()?;
            return Ok(SdlDeclaration::Module { name, declarations });
        }
        if self.eat_keyword("SCALAR") {
            self.expect_keyword("TYPE")?;
            let name = self.ident()?;
            let (extending, enum_labels) = self.parse_scalar_extends()?;
            self.expect(TokenKind::Semicolon, "`;`")?;
            return Ok(SdlDeclaration::Scalar {
                name,
                extending,
                enum_labels,
            });
        }
        self.expect_keyword("TYPE")?;
        let name = self.ident()?;
        self.expect(TokenKind::LBrace, "`{`")?;
        let mut pointers = Vec::new();
        while !self.eat(&TokenKind::RBrace) {
            pointers.push(self.parse_pointer_decl()?);
            self.expect(TokenKind::Semicolon, "`;`")?;
        }
        // Trailing semicolon after a type block is optional.
        self.eat(&TokenKind::Semicolon);
        Ok(SdlDeclaration::Type { name, pointers })
    }

    // ------------------------------------------------------------------
    // Expressions

    pub fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let lhs = self.parse_additive()?;
        let op = match self.peek().kind {
            TokenKind::Eq => BinOpKind::Eq,
            TokenKind::Lt => BinOpKind::Lt,
            TokenKind::Gt => BinOpKind::Gt,
            _ => return Ok(lhs),
        };
        self.bump();
        let rhs = self.parse_additive()?;
        let span = Span::new(lhs.span().start, rhs.span().end);
        Ok(Expr::BinOp {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            span,
        })
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinOpKind::Add,
                TokenKind::Minus => BinOpKind::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_multiplicative()?;
            let span = Span::new(lhs.span().start, rhs.span().end);
            lhs = Expr::BinOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            };
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinOpKind::Mul,
                TokenKind::Slash => BinOpKind::Div,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            let span = Span::new(lhs.span().start, rhs.span().end);
            lhs = Expr::BinOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let start = self.peek().span.start;
        // `<type>expr` cast; `<optional type>$p` marks the param optional.
        if matches!(self.peek().kind, TokenKind::Lt)
            && matches!(self.peek2().kind, TokenKind::Ident(_))
        {
            self.bump();
            let optional = self.eat_keyword("OPTIONAL");
            let ty = self.type_name()?;
            self.expect(TokenKind::Gt, "`>`")?;
            let expr = self.parse_unary()?;
            let span = Span::new(start, self.prev_end());
            return Ok(Expr::Cast {
                ty,
                optional,
                expr: Box::new(expr),
                span,
            });
        }
        if self.eat(&TokenKind::Minus) {
            let inner = self.parse_unary()?;
            let span = Span::new(start, self.prev_end());
            return Ok(match inner {
                Expr::Literal(Literal::Int(v), _) => Expr::Literal(Literal::Int(-v), span),
                Expr::Literal(Literal::Float(v), _) => Expr::Literal(Literal::Float(-v), span),
                other => Expr::BinOp {
                    op: BinOpKind::Sub,
                    lhs: Box::new(Expr::Literal(Literal::Int(0), span)),
                    rhs: Box::new(other),
                    span,
                },
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let tok = self.peek().clone();
        let start = tok.span.start;
        match &tok.kind {
            TokenKind::IntLit(v) => {
                self.bump();
                Ok(Expr::Literal(Literal::Int(*v), tok.span))
            }
            TokenKind::FloatLit(v) => {
                self.bump();
                Ok(Expr::Literal(Literal::Float(*v), tok.span))
            }
            TokenKind::StrLit(v) => {
                self.bump();
                Ok(Expr::Literal(Literal::Str(v.clone()), tok.span))
            }
            TokenKind::Param(name) => {
                self.bump();
                Ok(Expr::Param {
                    name: name.clone(),
                    span: tok.span,
                })
            }
            TokenKind::LParen => {
                self.bump();
                // `(a := 1, ...)` named tuple, otherwise tuple/grouping.
                if matches!(self.peek().kind, TokenKind::Ident(_))
                    && matches!(self.peek2().kind, TokenKind::Assign)
                {
                    let mut fields = Vec::new();
                    loop {
                        let name = self.ident()?;
                        self.expect(TokenKind::Assign, "`:=`")?;
                        fields.push((name, self.parse_expr()?));
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(TokenKind::RParen, "`)`")?;
                    return Ok(Expr::NamedTuple(fields, Span::new(start, self.prev_end())));
                }
                let first = self.parse_expr()?;
                if self.eat(&TokenKind::Comma) {
                    let mut elements = vec![first];
                    while !matches!(self.peek().kind, TokenKind::RParen) {
                        elements.push(self.parse_expr()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(TokenKind::RParen, "`)`")?;
                    return Ok(Expr::Tuple(elements, Span::new(start, self.prev_end())));
                }
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(first)
            }
            TokenKind::LBracket => {
                self.bump();
                let mut elements = Vec::new();
                while !self.eat(&TokenKind::RBracket) {
                    elements.push(self.parse_expr()?);
                    if !self.eat(&TokenKind::Comma) {
                        self.expect(TokenKind::RBracket, "`]`")?;
                        break;
                    }
                }
                Ok(Expr::Array(elements, Span::new(start, self.prev_end())))
            }
            TokenKind::LBrace => {
                self.bump();
                let mut elements = Vec::new();
                while !self.eat(&TokenKind::RBrace) {
                    elements.push(self.parse_expr()?);
                    if !self.eat(&TokenKind::Comma) {
                        self.expect(TokenKind::RBrace, "`}`")?;
                        break;
                    }
                }
                Ok(Expr::SetLit(elements, Span::new(start, self.prev_end())))
            }
            TokenKind::Dot => {
                self.bump();
                let name = self.ident()?;
                Ok(Expr::Path {
                    name: format!(".{name}"),
                    span: Span::new(start, self.prev_end()),
                })
            }
            TokenKind::Ident(word) => {
                if word.eq_ignore_ascii_case("true") || word.eq_ignore_ascii_case("false") {
                    self.bump();
                    return Ok(Expr::Literal(
                        Literal::Bool(word.eq_ignore_ascii_case("true")),
                        tok.span,
                    ));
                }
                let name = self.qualified_name()?;
                if self.eat(&TokenKind::LParen) {
                    let mut args = Vec::new();
                    while !self.eat(&TokenKind::RParen) {
                        args.push(self.parse_expr()?);
                        if !self.eat(&TokenKind::Comma) {
                            self.expect(TokenKind::RParen, "`)`")?;
                            break;
                        }
                    }
                    return Ok(Expr::FuncCall {
                        name,
                        args,
                        span: Span::new(start, self.prev_end()),
                    });
                }
                if matches!(self.peek().kind, TokenKind::LBrace) {
                    let elements = self.parse_shape_elements()?;
                    return Ok(Expr::Shape {
                        type_name: name,
                        elements,
                        span: Span::new(start, self.prev_end()),
                    });
                }
                Ok(Expr::Path {
                    name,
                    span: Span::new(start, self.prev_end()),
                })
            }
            _ => Err(self.error("expected an expression")),
        }
    }

    fn parse_shape_elements(&mut self) -> PResult<Vec<ShapeElementAst>> {
        self.expect(TokenKind::LBrace, "`{`")?;
        let mut elements = Vec::new();
        while !self.eat(&TokenKind::RBrace) {
            let name = self.ident()?;
            let nested = if self.eat(&TokenKind::Colon) {
                Some(self.parse_shape_elements()?)
            } else {
                None
            };
            elements.push(ShapeElementAst { name, nested });
            if !self.eat(&TokenKind::Comma) {
                self.expect(TokenKind::RBrace, "`}`")?;
                break;
            }
        }
        Ok(elements)
    }
}

/// Parse a script into its statements.
pub fn parse_block(text: &str) -> Result<Vec<Statement>, SyntaxError> {
    let mut parser = Parser::new(text)?;
    let mut statements = Vec::new();
    loop {
        while parser.eat(&TokenKind::Semicolon) {}
        if parser.at_eof() {
            break;
        }
        statements.push(parser.parse_statement()?);
        if !parser.at_eof() {
            parser.expect(TokenKind::Semicolon, "`;` between statements")?;
        }
    }
    Ok(statements)
}

/// Parse exactly one statement.
pub fn parse(text: &str) -> Result<Statement, SyntaxError> {
    let mut statements = parse_block(text)?;
    match statements.len() {
        1 => Ok(statements.remove(0)),
        n => Err(SyntaxError::new(
            format!("expected one statement, got {n}"),
            None,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_select_literal() {
        let stmt = parse("SELECT 1").unwrap();
        let Statement::Query(QueryStmt::Select { expr, .. }) = stmt else {
            panic!("expected select");
        };
        assert!(matches!(expr, Expr::Literal(Literal::Int(1), _)));
    }

    #[test]
    fn parses_shape_select() {
        let stmt = parse("SELECT User { name, friends: { name } }").unwrap();
        let Statement::Query(QueryStmt::Select { expr: Expr::Shape { type_name, elements, .. }, .. }) = stmt
        else {
            panic!("expected shape select");
        };
        assert_eq!(type_name, "User");
        assert_eq!(elements.len(), 2);
        assert!(elements[1].nested.is_some());
    }

    #[test]
    fn parses_insert_with_params() {
        let stmt = parse("INSERT default::User { name := <str>$name, age := <optional int64>$age }")
            .unwrap();
        let Statement::Query(QueryStmt::Insert { type_name, assignments, .. }) = stmt else {
            panic!("expected insert");
        };
        assert_eq!(type_name, "default::User");
        assert_eq!(assignments.len(), 2);
        let Expr::Cast { optional, .. } = &assignments[1].1 else {
            panic!("expected cast");
        };
        assert!(*optional);
    }

    #[test]
    fn parses_transaction_options() {
        let stmt = parse("START TRANSACTION ISOLATION SERIALIZABLE, READ ONLY, DEFERRABLE").unwrap();
        let Statement::Transaction(TxStmt::Start { isolation, access, deferrable, .. }) = stmt
        else {
            panic!("expected start transaction");
        };
        assert_eq!(isolation, Some(IsolationLevel::Serializable));
        assert_eq!(access, Some(AccessMode::ReadOnly));
        assert_eq!(deferrable, Some(true));
    }

    #[test]
    fn parses_savepoints() {
        assert!(matches!(
            parse("DECLARE SAVEPOINT s1").unwrap(),
            Statement::Transaction(TxStmt::DeclareSavepoint { .. })
        ));
        assert!(matches!(
            parse("ROLLBACK TO SAVEPOINT s1").unwrap(),
            Statement::Transaction(TxStmt::RollbackToSavepoint { .. })
        ));
    }

    #[test]
    fn parses_migration_commands() {
        let stmt = parse(
            "START MIGRATION TO { module default { type User { required property name -> str; } } }",
        )
        .unwrap();
        let Statement::Migration(MigrationStmt::StartMigration { target, .. }) = stmt else {
            panic!("expected start migration");
        };
        let SdlDeclaration::Module { name, declarations } = &target[0] else {
            panic!("expected module decl");
        };
        assert_eq!(name, "default");
        assert_eq!(declarations.len(), 1);

        assert!(matches!(
            parse("DESCRIBE CURRENT MIGRATION AS JSON").unwrap(),
            Statement::Migration(MigrationStmt::DescribeCurrentMigration {
                language: DescribeLanguage::Json,
                ..
            })
        ));
        assert!(matches!(
            parse("ALTER CURRENT MIGRATION REJECT PROPOSED").unwrap(),
            Statement::Migration(MigrationStmt::AlterCurrentMigrationRejectProposed { .. })
        ));
    }

    #[test]
    fn parses_configure() {
        let stmt = parse("CONFIGURE SYSTEM SET listen_port := 5656").unwrap();
        let Statement::Config(ConfigStmt { scope, op, .. }) = stmt else {
            panic!("expected configure");
        };
        assert_eq!(scope, crate::config::ConfigScope::System);
        assert!(matches!(op, ConfigSetOp::Set { .. }));

        assert!(matches!(
            parse("CONFIGURE CURRENT DATABASE RESET query_work_mem").unwrap(),
            Statement::Config(ConfigStmt {
                scope: crate::config::ConfigScope::Database,
                op: ConfigSetOp::Reset { .. },
                ..
            })
        ));
    }

    #[test]
    fn parses_ddl() {
        let stmt = parse(
            "CREATE TYPE default::User { CREATE REQUIRED PROPERTY name -> std::str; CREATE MULTI LINK friends -> default::User; }",
        )
        .unwrap();
        let Statement::Ddl(DdlStatement::CreateType { pointers, .. }) = stmt else {
            panic!("expected create type");
        };
        assert_eq!(pointers.len(), 2);
        assert!(pointers[0].required);
        assert!(pointers[1].multi);
        assert_eq!(pointers[1].kind, PointerDeclKind::Link);
    }

    #[test]
    fn parses_scripts() {
        let stmts = parse_block("START TRANSACTION; SELECT 1; COMMIT;").unwrap();
        assert_eq!(stmts.len(), 3);
    }

    #[test]
    fn single_statement_parse_rejects_scripts() {
        assert!(parse("SELECT 1; SELECT 2").is_err());
    }

    #[test]
    fn statement_spans_cover_the_source() {
        let text = "SELECT 1 + 2";
        let stmt = parse(text).unwrap();
        let span = stmt.span();
        assert_eq!(&text[span.start as usize..span.end as usize], text);
    }
}
